use serde_json::Value;
use shared::error::{ErrorCode, ResponseEnvelope};
use thiserror::Error;

/// Classified failure of a gateway call. The gateway never retries; callers
/// decide what a failure means for them.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("network error: {message}")]
    Network { message: String },
    #[error("authentication rejected ({status}): {message}")]
    Auth {
        status: u16,
        message: String,
        code: Option<ErrorCode>,
        payload: Option<Value>,
    },
    #[error("request rejected ({status}): {message}")]
    Validation {
        status: u16,
        message: String,
        code: Option<ErrorCode>,
        payload: Option<Value>,
    },
    #[error("server error ({status}): {message}")]
    Server {
        status: u16,
        message: String,
        payload: Option<Value>,
    },
    #[error("invalid response body ({status}): {message}")]
    Parse { status: u16, message: String },
    #[error("request gateway is shut down")]
    Closed,
}

impl RequestError {
    pub fn network(message: impl Into<String>) -> Self {
        RequestError::Network {
            message: message.into(),
        }
    }

    /// Classifies a non-success status using the parsed JSON body.
    pub fn from_status(status: u16, payload: Value) -> Self {
        let envelope = ResponseEnvelope::from_value(&payload);
        let message = envelope
            .message
            .clone()
            .unwrap_or_else(|| default_status_message(status).to_string());
        match status {
            401 => RequestError::Auth {
                status,
                message,
                code: envelope.code,
                payload: Some(payload),
            },
            400..=499 => RequestError::Validation {
                status,
                message,
                code: envelope.code,
                payload: Some(payload),
            },
            _ => RequestError::Server {
                status,
                message,
                payload: Some(payload),
            },
        }
    }

    /// Classifies a 2xx body that reports `success: false`.
    pub fn from_rejected_envelope(status: u16, payload: Value) -> Self {
        let envelope = ResponseEnvelope::from_value(&payload);
        let message = envelope
            .message
            .clone()
            .unwrap_or_else(|| "request was not successful".to_string());
        match envelope.code {
            Some(code) if code.invalidates_credential() => RequestError::Auth {
                status,
                message,
                code: Some(code),
                payload: Some(payload),
            },
            code => RequestError::Validation {
                status,
                message,
                code,
                payload: Some(payload),
            },
        }
    }

    pub fn is_auth_error(&self) -> bool {
        matches!(self, RequestError::Auth { .. })
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, RequestError::Network { .. })
    }

    /// Network, server and parse failures say nothing about the request or
    /// the credential and may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RequestError::Network { .. } | RequestError::Server { .. } | RequestError::Parse { .. }
        )
    }

    /// True when the server explicitly reported the credential as invalid or
    /// unknown. Transient failures never qualify.
    pub fn invalidates_session(&self) -> bool {
        match self {
            RequestError::Auth { .. } => true,
            RequestError::Validation { code, .. } => {
                code.is_some_and(ErrorCode::invalidates_credential)
            }
            _ => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::Auth { status, .. }
            | RequestError::Validation { status, .. }
            | RequestError::Server { status, .. }
            | RequestError::Parse { status, .. } => Some(*status),
            RequestError::Network { .. } | RequestError::Closed => None,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RequestError::Auth { code, .. } | RequestError::Validation { code, .. } => *code,
            _ => None,
        }
    }

    /// The `message` the server put in its body, if any.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            RequestError::Auth { message, .. }
            | RequestError::Validation { message, .. }
            | RequestError::Server { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            RequestError::Auth { payload, .. }
            | RequestError::Validation { payload, .. }
            | RequestError::Server { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }
}

fn default_status_message(status: u16) -> &'static str {
    match status {
        401 => "unauthorized",
        403 => "forbidden",
        404 => "not found",
        429 => "rate limited",
        500..=599 => "server failure",
        _ => "request failed",
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("push transport is not connected")]
    NotConnected,
    #[error("push transport connect failed: {0}")]
    Connect(String),
    #[error("push transport send failed: {0}")]
    Send(String),
    #[error("invalid push frame: {0}")]
    Encode(String),
}
