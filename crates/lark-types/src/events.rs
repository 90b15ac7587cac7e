use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatPresence, ChatStatus, NotificationView, TypingStatus};

/// Commands sent FROM client TO server over the chat WebSocket.
///
/// Payloads are validated here at the boundary; a frame that does not
/// deserialize into one of these variants is answered with an `error`
/// event rather than dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Enter the chat-active state (the user opened a conversation).
    JoinChat {
        #[serde(default)]
        friend_id: Option<Uuid>,
    },

    /// Leave the chat-active state while staying connected.
    LeaveChat,

    /// Send a message to another user.
    Message {
        recipient_id: Uuid,
        content: String,
        #[serde(default)]
        attachments: Vec<String>,
        /// Client-side id echoed back so optimistic UI state can reconcile.
        #[serde(default)]
        temp_id: Option<String>,
    },

    /// Mark a batch of received messages as read.
    Read { message_ids: Vec<Uuid> },

    /// Typing indicator, forwarded without persistence.
    Typing {
        #[serde(default)]
        recipient_id: Option<Uuid>,
        status: TypingStatus,
    },

    /// Delete a sent message.
    Delete { message_id: Uuid },

    /// Fetch the caller's unread notifications.
    GetNotifications,

    /// Mark a batch of the caller's notifications as read.
    MarkNotificationsRead {
        #[serde(default)]
        notification_ids: Vec<Uuid>,
    },
}

/// Events sent FROM server TO client.
///
/// Serialize-only: the server never parses its own events. `read` is
/// deliberately two variants with the same wire tag — the receipt shape
/// goes to the original sender, the confirmation shape to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection accepted and identity attached.
    Ready { user_id: Uuid, user_name: String },

    /// A persisted message, delivered to the recipient's personal channel
    /// (`is_own_message: false`) and echoed to the sender (`true`, with the
    /// client temp id).
    Message {
        id: Uuid,
        sender_id: Uuid,
        sender_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_avatar: Option<String>,
        recipient_id: Uuid,
        content: String,
        attachments: Vec<String>,
        is_read: bool,
        sent_at: DateTime<Utc>,
        is_own_message: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },

    /// Read receipt to the original sender of a message.
    #[serde(rename = "read")]
    ReadReceipt {
        message_id: Uuid,
        read_by: Uuid,
        read_by_name: String,
        read_at: DateTime<Utc>,
    },

    /// Aggregate confirmation of a read batch, back to the caller.
    #[serde(rename = "read")]
    ReadConfirmed {
        message_ids: Vec<Uuid>,
        confirmed: bool,
    },

    Typing {
        user_id: Uuid,
        user_name: String,
        status: TypingStatus,
        timestamp: DateTime<Utc>,
    },

    /// A message was deleted. The copy to the caller carries `confirmed`.
    #[serde(rename = "delete")]
    Deleted {
        message_id: Uuid,
        deleted_by: Uuid,
        deleted_at: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confirmed: Option<bool>,
    },

    /// The set of identities with an open connection.
    ActiveUsers { user_ids: Vec<Uuid> },

    /// Full chat-presence status map, broadcast on join/leave.
    #[serde(rename = "get_online_users")]
    OnlineUsers(HashMap<Uuid, ChatPresence>),

    /// Lightweight notice that one user changed chat-presence.
    OnlineUser {
        user_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_avatar: Option<String>,
        timestamp: DateTime<Utc>,
        status: ChatStatus,
    },

    /// Unread-count ping to a recipient who was not chat-active.
    NewNotification { count: u64 },

    /// Response to `get_notifications`.
    Notifications {
        notifications: Vec<NotificationView>,
        count: usize,
    },

    NotificationsMarkedRead {
        notification_ids: Vec<Uuid>,
        confirmed: bool,
    },

    /// Typed error back to the originating connection only.
    Error {
        event: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
}
