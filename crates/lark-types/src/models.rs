use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Chat-viewing presence, distinct from merely having an open connection.
/// `Online` means the user is actively viewing a chat; `Active` means
/// connected but not viewing; `Offline` means no open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Online,
    Active,
    Offline,
}

/// Per-identity status record kept by the presence registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatPresence {
    pub status: ChatStatus,
    pub last_seen: DateTime<Utc>,
    /// The conversation the user is viewing, if they signalled one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewing: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypingStatus {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    FriendRequest,
    FriendAccepted,
}

impl NotificationKind {
    /// Stable string encoding used in the notifications table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::FriendRequest => "friend_request",
            Self::FriendAccepted => "friend_accepted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message" => Some(Self::Message),
            "friend_request" => Some(Self::FriendRequest),
            "friend_accepted" => Some(Self::FriendAccepted),
            _ => None,
        }
    }
}

/// A persisted chat message as presented to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageView {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Uuid,
    pub content: String,
    pub attachments: Vec<String>,
    pub sent_at: DateTime<Utc>,
    pub is_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// An unread notification as presented to clients, with the referenced
/// message populated when it still exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub related_id: Uuid,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageView>,
}
