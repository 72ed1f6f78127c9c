use serde::{Deserialize, Serialize};

use crate::domain::{ChannelId, ChatMessage, MessageId, UserId, UserProfile};

/// Events the server pushes over the live connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushEvent {
    NewMessage(ChatMessage),
    MessageEdited(ChatMessage),
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    UserTyping {
        channel_id: ChannelId,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
    },
    UserStopTyping {
        channel_id: ChannelId,
        user_id: UserId,
    },
    UserOnline {
        channel_id: ChannelId,
        user_id: UserId,
    },
    UserOffline {
        channel_id: ChannelId,
        user_id: UserId,
    },
}

impl PushEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            PushEvent::NewMessage(message) | PushEvent::MessageEdited(message) => {
                message.channel_id
            }
            PushEvent::MessageDeleted { channel_id, .. }
            | PushEvent::UserTyping { channel_id, .. }
            | PushEvent::UserStopTyping { channel_id, .. }
            | PushEvent::UserOnline { channel_id, .. }
            | PushEvent::UserOffline { channel_id, .. } => *channel_id,
        }
    }
}

/// Commands the client sends over the live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PushCommand {
    JoinChannel { channel_id: ChannelId },
    LeaveChannel { channel_id: ChannelId },
    SendMessage { channel_id: ChannelId, content: String },
    TypingStart { channel_id: ChannelId },
    TypingStop { channel_id: ChannelId },
}

impl PushCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PushCommand::JoinChannel { .. } => "join_channel",
            PushCommand::LeaveChannel { .. } => "leave_channel",
            PushCommand::SendMessage { .. } => "send_message",
            PushCommand::TypingStart { .. } => "typing_start",
            PushCommand::TypingStop { .. } => "typing_stop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub user: UserProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
    pub user: UserProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub channel_id: ChannelId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message: ChatMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingRequest {
    pub channel_id: ChannelId,
    pub typing: bool,
}
