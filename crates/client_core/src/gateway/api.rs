//! Typed wrappers for the endpoints the sync layer talks to.

use serde_json::json;
use shared::{
    domain::{ChannelId, ChatMessage, MessageId, UserProfile},
    protocol::{
        LoginRequest, LoginResponse, MessagesResponse, SendMessageRequest, SendMessageResponse,
        TypingRequest, VerifyResponse,
    },
};

use super::{RequestGateway, RequestOptions};
use crate::error::RequestError;

pub const VERIFY_ENDPOINT: &str = "/api/auth/verify";
pub const LOGIN_ENDPOINT: &str = "/api/auth/login";
pub const LOGOUT_ENDPOINT: &str = "/api/auth/logout";
pub const MESSAGES_ENDPOINT: &str = "/api/messages";
pub const TYPING_ENDPOINT: &str = "/api/typing";

/// Which slice of a channel's history to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageWindow {
    Latest,
    Since(MessageId),
    Before(MessageId),
}

fn encode<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, RequestError> {
    serde_json::to_value(value).map_err(|err| RequestError::Parse {
        status: 0,
        message: format!("failed to encode request body: {err}"),
    })
}

impl RequestGateway {
    /// Re-checks the current credential. Never cached: a stale "valid" answer
    /// would defeat the purpose.
    pub async fn verify_credential(&self) -> Result<UserProfile, RequestError> {
        let response: VerifyResponse = self
            .call_json(VERIFY_ENDPOINT, RequestOptions::get().bypass_cache())
            .await?;
        Ok(response.user)
    }

    pub async fn sign_in(
        &self,
        username: &str,
        password: &str,
    ) -> Result<LoginResponse, RequestError> {
        let body = encode(&LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        })?;
        self.call_json(LOGIN_ENDPOINT, RequestOptions::post(body))
            .await
    }

    pub async fn sign_out(&self) -> Result<(), RequestError> {
        self.call(LOGOUT_ENDPOINT, RequestOptions::post(json!({})))
            .await
            .map(|_| ())
    }

    pub async fn fetch_messages(
        &self,
        channel_id: ChannelId,
        window: MessageWindow,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, RequestError> {
        let mut options = RequestOptions::get()
            .query("channel_id", channel_id)
            .query("limit", limit);
        options = match window {
            MessageWindow::Latest => options,
            MessageWindow::Since(id) => options.query("since_message_id", id),
            MessageWindow::Before(id) => options.query("before", id),
        };
        let response: MessagesResponse = self.call_json(MESSAGES_ENDPOINT, options).await?;
        Ok(response.messages)
    }

    /// Same endpoint as [`Self::fetch_messages`] but always goes to the server;
    /// a cached answer would hide messages newer than the watermark.
    pub async fn poll_messages(
        &self,
        channel_id: ChannelId,
        since: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, RequestError> {
        let mut options = RequestOptions::get()
            .query("channel_id", channel_id)
            .query("limit", limit)
            .bypass_cache();
        if let Some(id) = since {
            options = options.query("since_message_id", id);
        }
        let response: MessagesResponse = self.call_json(MESSAGES_ENDPOINT, options).await?;
        Ok(response.messages)
    }

    pub async fn post_message(
        &self,
        channel_id: ChannelId,
        content: &str,
    ) -> Result<ChatMessage, RequestError> {
        let body = encode(&SendMessageRequest {
            channel_id,
            content: content.to_string(),
        })?;
        let response: SendMessageResponse = self
            .call_json(MESSAGES_ENDPOINT, RequestOptions::post(body))
            .await?;
        Ok(response.message)
    }

    pub async fn announce_typing(
        &self,
        channel_id: ChannelId,
        typing: bool,
    ) -> Result<(), RequestError> {
        let body = encode(&TypingRequest { channel_id, typing })?;
        self.call(TYPING_ENDPOINT, RequestOptions::post(body))
            .await
            .map(|_| ())
    }
}
