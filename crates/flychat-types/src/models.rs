use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved chat id that addresses the group conversation.
pub const GROUP_TOKEN: &str = "all";

/// A registered account. Never serialized directly: the password hash stays
/// server-side, use [`UserProfile`] for anything that leaves the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub password_hash: String,
    pub avatar: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn profile(&self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username.clone(),
            avatar: self.avatar.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub username: String,
    pub avatar: String,
    pub created_at: DateTime<Utc>,
}

/// Destination of a message or the conversation a history page belongs to.
/// Serialized as `"all"` for the group chat and as the peer's UUID otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ChatTarget {
    Group,
    User(Uuid),
}

impl ChatTarget {
    pub fn is_group(&self) -> bool {
        matches!(self, Self::Group)
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::Group => None,
            Self::User(id) => Some(*id),
        }
    }
}

impl fmt::Display for ChatTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Group => f.write_str(GROUP_TOKEN),
            Self::User(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for ChatTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == GROUP_TOKEN {
            return Ok(Self::Group);
        }
        s.parse::<Uuid>()
            .map(Self::User)
            .map_err(|_| format!("invalid chat id '{}'", s))
    }
}

impl TryFrom<String> for ChatTarget {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChatTarget> for String {
    fn from(target: ChatTarget) -> Self {
        target.to_string()
    }
}

/// A persisted chat message. Only `is_read` ever changes after insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub sender_id: Uuid,
    /// `None` for group messages.
    pub receiver_id: Option<Uuid>,
    pub content: String,
    pub is_group: bool,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn target(&self) -> ChatTarget {
        match self.receiver_id {
            Some(id) if !self.is_group => ChatTarget::User(id),
            _ => ChatTarget::Group,
        }
    }
}

/// Message fields chosen by the router; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl NewMessage {
    pub fn is_group(&self) -> bool {
        self.receiver_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Rejected,
}

impl FriendRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for FriendRequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown friend request status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FriendRequest {
    pub id: i64,
    #[serde(rename = "from")]
    pub from_id: Uuid,
    #[serde(rename = "to")]
    pub to_id: Uuid,
    pub status: FriendRequestStatus,
    pub created_at: DateTime<Utc>,
}

/// Undirected friendship. The pair is stored normalised so that
/// `user_a < user_b`, which makes the unordered pair a unique key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Friendship {
    pub user_a: Uuid,
    pub user_b: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Friendship {
    pub fn new(x: Uuid, y: Uuid, created_at: DateTime<Utc>) -> Self {
        let (user_a, user_b) = if x <= y { (x, y) } else { (y, x) };
        Self {
            user_a,
            user_b,
            created_at,
        }
    }

    pub fn involves(&self, user_id: Uuid) -> bool {
        self.user_a == user_id || self.user_b == user_id
    }

    /// The other side of the friendship, seen from `user_id`.
    pub fn partner_of(&self, user_id: Uuid) -> Uuid {
        if self.user_a == user_id {
            self.user_b
        } else {
            self.user_a
        }
    }
}
