use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatTarget, FriendRequestStatus, Message};

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A message was routed to this connection (own messages come back with `is_self`)
    NewMessage(MessagePayload),

    /// Reply to `load-messages`
    HistoryMessages(HistoryPage),

    /// Someone sent this user a friend request
    FriendRequest(PendingRequest),

    /// Acknowledges a `send-friend-request`
    FriendRequestSent { id: i64, to: Uuid },

    /// Acknowledges a `respond-to-friend-request`
    FriendRequestResolved { id: i64, status: FriendRequestStatus },

    /// A request this user sent was accepted
    FriendRequestAccepted { friend: FriendSummary },

    /// Full snapshot of who is online, sent on every presence change
    UpdateUserList(Vec<OnlineUser>),

    /// Acknowledges an `update-avatar`
    AvatarUpdated { avatar: String },

    /// A dispatch failure that has no typed reply
    Error { message: String },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::NewMessage(_) => "new-message",
            Self::HistoryMessages(_) => "history-messages",
            Self::FriendRequest(_) => "friend-request",
            Self::FriendRequestSent { .. } => "friend-request-sent",
            Self::FriendRequestResolved { .. } => "friend-request-resolved",
            Self::FriendRequestAccepted { .. } => "friend-request-accepted",
            Self::UpdateUserList(_) => "update-user-list",
            Self::AvatarUpdated { .. } => "avatar-updated",
            Self::Error { .. } => "error",
        }
    }
}

/// Events sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    SendMessage { to: ChatTarget, content: String },

    LoadMessages {
        chat_id: ChatTarget,
        #[serde(default = "default_page")]
        page: u32,
        #[serde(default = "default_limit")]
        limit: u32,
    },

    SendFriendRequest { user_id: Uuid },

    RespondToFriendRequest { request_id: i64, accept: bool },

    UpdateAvatar { avatar: String },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify { .. } => "identify",
            Self::SendMessage { .. } => "send-message",
            Self::LoadMessages { .. } => "load-messages",
            Self::SendFriendRequest { .. } => "send-friend-request",
            Self::RespondToFriendRequest { .. } => "respond-to-friend-request",
            Self::UpdateAvatar { .. } => "update-avatar",
        }
    }
}

pub fn default_page() -> u32 {
    1
}

pub fn default_limit() -> u32 {
    20
}

/// A message as clients see it, from the point of view of one viewer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: i64,
    pub from: Uuid,
    pub from_username: String,
    pub to: ChatTarget,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub is_read: bool,
}

impl MessagePayload {
    pub fn new(message: &Message, from_username: &str, viewer: Uuid) -> Self {
        Self {
            id: message.id,
            from: message.sender_id,
            from_username: from_username.to_string(),
            to: message.target(),
            content: message.content.clone(),
            timestamp: message.created_at,
            is_self: message.sender_id == viewer,
            is_read: message.is_read,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub chat_id: ChatTarget,
    pub messages: Vec<MessagePayload>,
    pub page: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub id: i64,
    pub from: Uuid,
    pub from_username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendSummary {
    pub id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OnlineUser {
    pub id: Uuid,
    pub username: String,
}
