use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    InvalidCredential,
    CredentialNotFound,
    Forbidden,
    NotFound,
    Validation,
    RateLimited,
    Internal,
    Unknown,
}

impl ErrorCode {
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "unauthorized" => ErrorCode::Unauthorized,
            "invalid_credential" => ErrorCode::InvalidCredential,
            "credential_not_found" => ErrorCode::CredentialNotFound,
            "forbidden" => ErrorCode::Forbidden,
            "not_found" => ErrorCode::NotFound,
            "validation" => ErrorCode::Validation,
            "rate_limited" => ErrorCode::RateLimited,
            "internal" => ErrorCode::Internal,
            _ => ErrorCode::Unknown,
        }
    }

    /// Codes with which the server states outright that the credential is no
    /// longer usable.
    pub fn invalidates_credential(self) -> bool {
        matches!(
            self,
            ErrorCode::Unauthorized | ErrorCode::InvalidCredential | ErrorCode::CredentialNotFound
        )
    }
}

/// Common shape of every JSON response: `{ success, message?, code?, ...payload }`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_code"
    )]
    pub code: Option<ErrorCode>,
}

fn default_success() -> bool {
    true
}

fn deserialize_code<'de, D>(deserializer: D) -> Result<Option<ErrorCode>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().map(ErrorCode::from_wire))
}

impl ResponseEnvelope {
    /// Reads the envelope fields out of an arbitrary JSON document, one field
    /// at a time so a malformed `message` or `code` never changes the
    /// verdict. Documents that are not objects are a bare successful payload.
    pub fn from_value(value: &Value) -> Self {
        let success = value
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        let code = value.get("code").and_then(|code| match code {
            Value::String(raw) => Some(ErrorCode::from_wire(raw)),
            Value::Null => None,
            _ => Some(ErrorCode::Unknown),
        });
        Self {
            success,
            message,
            code,
        }
    }
}
