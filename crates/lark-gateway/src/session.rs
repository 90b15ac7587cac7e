use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use lark_db::Database;
use lark_db::models::{MessageRow, NotificationRow};
use lark_types::events::{ClientCommand, ServerEvent};
use lark_types::models::{
    ChatStatus, MessageView, NotificationKind, NotificationView, TypingStatus,
};

use crate::dispatcher::Dispatcher;

/// Bounded read of unread notifications — a policy cap, not pagination.
const UNREAD_LIMIT: u32 = 50;

/// Notification previews keep only the first 100 characters.
const PREVIEW_CHARS: usize = 100;

/// Identity attached to the connection by the connection gate.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: Uuid,
    pub name: String,
    pub avatar: Option<String>,
}

/// Failure taxonomy inside event handlers. Never crosses the handler
/// boundary as a panic or a dropped connection — always converted to an
/// `error` event for the originating caller.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Acting on a resource the caller does not own. No state change.
    #[error("{0}")]
    Forbidden(&'static str),

    /// Persistence failure. Logged with context; surfaced to the caller
    /// only, never to the other party.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Dispatch one inbound event. Runs to completion per command; a store
/// error becomes a typed `error` event back to this connection.
pub async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    identity: &Identity,
    cmd: ClientCommand,
) {
    match cmd {
        ClientCommand::JoinChat { friend_id } => {
            let result = join_chat(dispatcher, identity, friend_id).await;
            report(dispatcher, identity, "online_user", "Failed to get online users", None, result).await;
        }
        ClientCommand::LeaveChat => {
            let result = leave_chat(dispatcher, identity).await;
            report(dispatcher, identity, "leave_chat", "Failed to leave chat", None, result).await;
        }
        ClientCommand::Message {
            recipient_id,
            content,
            attachments,
            temp_id,
        } => {
            let result = send_message(
                dispatcher,
                db,
                identity,
                recipient_id,
                content,
                attachments,
                temp_id.clone(),
            )
            .await;
            report(dispatcher, identity, "message", "Failed to send message", temp_id, result).await;
        }
        ClientCommand::Read { message_ids } => {
            let result = mark_read(dispatcher, db, identity, message_ids).await;
            report(dispatcher, identity, "read", "Failed to mark messages as read", None, result)
                .await;
        }
        ClientCommand::Typing {
            recipient_id,
            status,
        } => {
            typing(dispatcher, identity, recipient_id, status).await;
        }
        ClientCommand::Delete { message_id } => {
            let result = delete_message(dispatcher, db, identity, message_id).await;
            report(dispatcher, identity, "delete", "Failed to delete message", None, result).await;
        }
        ClientCommand::GetNotifications => {
            let result = get_notifications(dispatcher, db, identity).await;
            report(dispatcher, identity, "get_notifications", "Failed to get notifications", None, result).await;
        }
        ClientCommand::MarkNotificationsRead { notification_ids } => {
            let result = mark_notifications_read(dispatcher, db, identity, notification_ids).await;
            report(
                dispatcher,
                identity,
                "mark_notifications_read",
                "Failed to mark notifications as read",
                None,
                result,
            )
            .await;
        }
    }
}

/// Convert a handler failure into an `error` event for the caller only.
async fn report(
    dispatcher: &Dispatcher,
    identity: &Identity,
    event: &'static str,
    failure: &str,
    temp_id: Option<String>,
    result: Result<(), SessionError>,
) {
    let Err(err) = result else { return };

    let message = match &err {
        SessionError::Forbidden(msg) => (*msg).to_string(),
        SessionError::Store(e) => {
            error!("{} handler failed for {}: {:#}", event, identity.user_id, e);
            failure.to_string()
        }
    };

    dispatcher
        .send_to_user(
            identity.user_id,
            ServerEvent::Error {
                event,
                message,
                temp_id,
            },
        )
        .await;
}

/// Run a blocking store call off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, SessionError>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(SessionError::Store),
        Err(e) => Err(SessionError::Store(anyhow::anyhow!(
            "store task join error: {e}"
        ))),
    }
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn join_chat(
    dispatcher: &Dispatcher,
    identity: &Identity,
    friend_id: Option<Uuid>,
) -> Result<(), SessionError> {
    let map = dispatcher.join_chat(identity.user_id, friend_id).await;

    dispatcher.broadcast(ServerEvent::OnlineUsers(map));
    dispatcher.broadcast_except(
        identity.user_id,
        ServerEvent::OnlineUser {
            user_id: identity.user_id,
            user_name: Some(identity.name.clone()),
            user_avatar: identity.avatar.clone(),
            timestamp: Utc::now(),
            status: ChatStatus::Online,
        },
    );

    Ok(())
}

async fn leave_chat(dispatcher: &Dispatcher, identity: &Identity) -> Result<(), SessionError> {
    let map = dispatcher.leave_chat(identity.user_id).await;

    dispatcher.broadcast(ServerEvent::OnlineUsers(map));
    dispatcher.broadcast_except(
        identity.user_id,
        ServerEvent::OnlineUser {
            user_id: identity.user_id,
            user_name: None,
            user_avatar: None,
            timestamp: Utc::now(),
            status: ChatStatus::Offline,
        },
    );

    Ok(())
}

async fn send_message(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    identity: &Identity,
    recipient_id: Uuid,
    content: String,
    attachments: Vec<String>,
    temp_id: Option<String>,
) -> Result<(), SessionError> {
    let message_id = Uuid::new_v4();
    let sent_at = Utc::now();
    let attachments_json =
        serde_json::to_string(&attachments).map_err(|e| SessionError::Store(e.into()))?;

    {
        let db = db.clone();
        let mid = message_id.to_string();
        let sid = identity.user_id.to_string();
        let rid = recipient_id.to_string();
        let body = content.clone();
        let ts = rfc3339(sent_at);
        blocking(move || db.insert_message(&mid, &sid, &rid, &body, &attachments_json, &ts))
            .await?;
    }

    // Notification-worthiness is judged on chat-presence: a merely
    // connected recipient still gets a durable notification.
    let recipient_chat_active = dispatcher.is_chat_active(recipient_id).await;

    if !recipient_chat_active {
        let created = {
            let db = db.clone();
            let nid = Uuid::new_v4().to_string();
            let owner = recipient_id.to_string();
            let related = message_id.to_string();
            let ts = rfc3339(sent_at);
            let sid = identity.user_id.to_string();
            let sname = identity.name.clone();
            let preview: String = content.chars().take(PREVIEW_CHARS).collect();
            blocking(move || {
                db.create_message_notification(&nid, &owner, &related, &ts, &sid, &sname, &preview)
            })
            .await
        };

        match created {
            Ok(_) => {
                let count = {
                    let db = db.clone();
                    let owner = recipient_id.to_string();
                    blocking(move || db.unread_notification_count(&owner)).await?
                };
                dispatcher
                    .send_to_user(recipient_id, ServerEvent::NewNotification { count })
                    .await;
            }
            Err(err) => {
                // The message itself is already durable; a failed
                // notification must not block its delivery.
                warn!("notification create failed for message {}: {}", message_id, err);
            }
        }
    } else {
        // Recipient is viewing the chat; deliver the live copy.
        dispatcher
            .send_to_user(
                recipient_id,
                ServerEvent::Message {
                    id: message_id,
                    sender_id: identity.user_id,
                    sender_name: identity.name.clone(),
                    sender_avatar: identity.avatar.clone(),
                    recipient_id,
                    content: content.clone(),
                    attachments: attachments.clone(),
                    is_read: false,
                    sent_at,
                    is_own_message: false,
                    temp_id: None,
                },
            )
            .await;
    }

    // Confirmation copy to the sender, echoing the client temp id so
    // optimistic UI state can reconcile.
    dispatcher
        .send_to_user(
            identity.user_id,
            ServerEvent::Message {
                id: message_id,
                sender_id: identity.user_id,
                sender_name: identity.name.clone(),
                sender_avatar: identity.avatar.clone(),
                recipient_id,
                content,
                attachments,
                is_read: false,
                sent_at,
                is_own_message: true,
                temp_id,
            },
        )
        .await;

    Ok(())
}

async fn mark_read(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    identity: &Identity,
    message_ids: Vec<Uuid>,
) -> Result<(), SessionError> {
    let read_at = Utc::now();
    let ids: Vec<String> = message_ids.iter().map(Uuid::to_string).collect();
    let caller = identity.user_id.to_string();

    // Only rows where the caller is the recipient and the flag is unset
    // are flipped; the store reports which ones, so repeated calls emit
    // no duplicate receipts.
    let affected = {
        let db = db.clone();
        let ids = ids.clone();
        let caller = caller.clone();
        let ts = rfc3339(read_at);
        blocking(move || db.mark_messages_read(&ids, &caller, &ts)).await?
    };

    {
        let db = db.clone();
        let caller = caller.clone();
        let ts = rfc3339(read_at);
        blocking(move || db.mark_message_notifications_read(&ids, &caller, &ts).map(|_| ()))
            .await?;
    }

    for id in &affected {
        let row = {
            let db = db.clone();
            let id = id.clone();
            blocking(move || db.get_message(&id)).await?
        };
        let Some(row) = row else { continue };
        if row.sender_id == caller {
            continue;
        }
        dispatcher
            .send_to_user(
                parse_uuid(&row.sender_id, "messages.sender_id"),
                ServerEvent::ReadReceipt {
                    message_id: parse_uuid(&row.id, "messages.id"),
                    read_by: identity.user_id,
                    read_by_name: identity.name.clone(),
                    read_at,
                },
            )
            .await;
    }

    dispatcher
        .send_to_user(
            identity.user_id,
            ServerEvent::ReadConfirmed {
                message_ids,
                confirmed: true,
            },
        )
        .await;

    Ok(())
}

async fn typing(
    dispatcher: &Dispatcher,
    identity: &Identity,
    recipient_id: Option<Uuid>,
    status: TypingStatus,
) {
    // Low-stakes event: a missing recipient is silently ignored.
    let Some(recipient_id) = recipient_id else {
        return;
    };

    dispatcher
        .send_to_user(
            recipient_id,
            ServerEvent::Typing {
                user_id: identity.user_id,
                user_name: identity.name.clone(),
                status,
                timestamp: Utc::now(),
            },
        )
        .await;
}

async fn delete_message(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    identity: &Identity,
    message_id: Uuid,
) -> Result<(), SessionError> {
    let row = {
        let db = db.clone();
        let id = message_id.to_string();
        blocking(move || db.get_message(&id)).await?
    };

    // Only the original sender may delete; a missing message gets the same
    // answer so callers cannot probe for other people's message ids.
    let row = row
        .filter(|r| r.sender_id == identity.user_id.to_string())
        .ok_or(SessionError::Forbidden("Cannot delete this message"))?;

    {
        let db = db.clone();
        let id = message_id.to_string();
        blocking(move || db.delete_message(&id).map(|_| ())).await?;
    }
    {
        let db = db.clone();
        let id = message_id.to_string();
        blocking(move || db.delete_notifications_for_related(&id).map(|_| ())).await?;
    }

    let deleted_at = Utc::now();
    let recipient = parse_uuid(&row.recipient_id, "messages.recipient_id");

    dispatcher
        .send_to_user(
            recipient,
            ServerEvent::Deleted {
                message_id,
                deleted_by: identity.user_id,
                deleted_at,
                confirmed: None,
            },
        )
        .await;
    dispatcher
        .send_to_user(
            identity.user_id,
            ServerEvent::Deleted {
                message_id,
                deleted_by: identity.user_id,
                deleted_at,
                confirmed: Some(true),
            },
        )
        .await;

    Ok(())
}

async fn get_notifications(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    identity: &Identity,
) -> Result<(), SessionError> {
    let rows = {
        let db = db.clone();
        let owner = identity.user_id.to_string();
        blocking(move || db.unread_notifications(&owner, UNREAD_LIMIT)).await?
    };

    let notifications: Vec<NotificationView> = rows
        .into_iter()
        .map(|(notification, message)| notification_view(notification, message))
        .collect();
    let count = notifications.len();

    dispatcher
        .send_to_user(
            identity.user_id,
            ServerEvent::Notifications {
                notifications,
                count,
            },
        )
        .await;

    Ok(())
}

async fn mark_notifications_read(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    identity: &Identity,
    notification_ids: Vec<Uuid>,
) -> Result<(), SessionError> {
    {
        let db = db.clone();
        let ids: Vec<String> = notification_ids.iter().map(Uuid::to_string).collect();
        let owner = identity.user_id.to_string();
        let ts = rfc3339(Utc::now());
        blocking(move || db.mark_notifications_read(&ids, &owner, &ts).map(|_| ())).await?;
    }

    dispatcher
        .send_to_user(
            identity.user_id,
            ServerEvent::NotificationsMarkedRead {
                notification_ids,
                confirmed: true,
            },
        )
        .await;

    Ok(())
}

// -- Row to view conversion, lenient on corrupt stored fields --

fn parse_uuid(s: &str, context: &str) -> Uuid {
    s.parse().unwrap_or_else(|e| {
        warn!("Corrupt uuid '{}' in {}: {}", s, context, e);
        Uuid::default()
    })
}

fn parse_timestamp(s: &str, context: &str) -> DateTime<Utc> {
    s.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // SQLite's datetime('now') default stores "YYYY-MM-DD HH:MM:SS"
            // without a timezone; parse as naive UTC.
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt timestamp '{}' in {}: {}", s, context, e);
            DateTime::default()
        })
}

pub(crate) fn message_view(row: &MessageRow) -> MessageView {
    let attachments: Vec<String> = serde_json::from_str(&row.attachments).unwrap_or_else(|e| {
        warn!("Corrupt attachments on message '{}': {}", row.id, e);
        Vec::new()
    });

    MessageView {
        id: parse_uuid(&row.id, "messages.id"),
        sender_id: parse_uuid(&row.sender_id, "messages.sender_id"),
        recipient_id: parse_uuid(&row.recipient_id, "messages.recipient_id"),
        content: row.content.clone(),
        attachments,
        sent_at: parse_timestamp(&row.sent_at, "messages.sent_at"),
        is_read: row.is_read,
        read_at: row
            .read_at
            .as_deref()
            .map(|s| parse_timestamp(s, "messages.read_at")),
    }
}

fn notification_view(row: NotificationRow, message: Option<MessageRow>) -> NotificationView {
    NotificationView {
        id: parse_uuid(&row.id, "notifications.id"),
        user_id: parse_uuid(&row.user_id, "notifications.user_id"),
        kind: NotificationKind::parse(&row.kind).unwrap_or_else(|| {
            warn!("Corrupt kind '{}' on notification '{}'", row.kind, row.id);
            NotificationKind::Message
        }),
        related_id: parse_uuid(&row.related_id, "notifications.related_id"),
        is_read: row.is_read,
        created_at: parse_timestamp(&row.created_at, "notifications.created_at"),
        sender_id: row
            .sender_id
            .as_deref()
            .map(|s| parse_uuid(s, "notifications.sender_id")),
        sender_name: row.sender_name,
        preview: row.preview,
        message: message.as_ref().map(message_view),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Peer {
        identity: Identity,
        rx: UnboundedReceiver<ServerEvent>,
    }

    async fn connect(dispatcher: &Dispatcher, db: &Arc<Database>, name: &str) -> Peer {
        let user_id = Uuid::new_v4();
        db.create_user(
            &user_id.to_string(),
            name,
            &format!("{}@example.com", name.to_lowercase()),
            None,
        )
        .unwrap();
        let (_conn_id, rx) = dispatcher.register(user_id).await;
        Peer {
            identity: Identity {
                user_id,
                name: name.to_string(),
                avatar: None,
            },
            rx,
        }
    }

    fn setup() -> (Dispatcher, Arc<Database>) {
        (Dispatcher::new(), Arc::new(Database::open_in_memory().unwrap()))
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) {
        while rx.try_recv().is_ok() {}
    }

    async fn send(dispatcher: &Dispatcher, db: &Arc<Database>, from: &Peer, to: &Peer, text: &str, temp: &str) {
        handle_command(
            dispatcher,
            db,
            &from.identity,
            ClientCommand::Message {
                recipient_id: to.identity.user_id,
                content: text.into(),
                attachments: vec![],
                temp_id: Some(temp.into()),
            },
        )
        .await;
    }

    #[tokio::test]
    async fn message_to_not_chat_active_recipient_creates_notification() {
        let (dispatcher, db) = setup();
        let mut alice = connect(&dispatcher, &db, "Alice").await;
        let mut bob = connect(&dispatcher, &db, "Bob").await;

        send(&dispatcher, &db, &alice, &bob, "hi", "t1").await;

        // Bob is connected but not chat-active: unread-count ping only,
        // nothing on the message channel.
        match bob.rx.try_recv().unwrap() {
            ServerEvent::NewNotification { count } => assert_eq!(count, 1),
            other => panic!("expected new_notification, got {other:?}"),
        }
        assert!(bob.rx.try_recv().is_err());

        // Alice gets the confirmation copy with her temp id.
        match alice.rx.try_recv().unwrap() {
            ServerEvent::Message {
                is_own_message,
                temp_id,
                content,
                is_read,
                ..
            } => {
                assert!(is_own_message);
                assert_eq!(temp_id.as_deref(), Some("t1"));
                assert_eq!(content, "hi");
                assert!(!is_read);
            }
            other => panic!("expected message, got {other:?}"),
        }

        // A durable notification referencing the message exists for Bob.
        let rows = db
            .unread_notifications(&bob.identity.user_id.to_string(), 50)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.sender_name.as_deref(), Some("Alice"));
        assert_eq!(rows[0].1.as_ref().unwrap().content, "hi");
    }

    #[tokio::test]
    async fn message_to_chat_active_recipient_delivers_without_notification() {
        let (dispatcher, db) = setup();
        let alice = connect(&dispatcher, &db, "Alice").await;
        let mut bob = connect(&dispatcher, &db, "Bob").await;

        handle_command(
            &dispatcher,
            &db,
            &bob.identity,
            ClientCommand::JoinChat {
                friend_id: Some(alice.identity.user_id),
            },
        )
        .await;

        send(&dispatcher, &db, &alice, &bob, "hello", "t2").await;

        match bob.rx.try_recv().unwrap() {
            ServerEvent::Message {
                is_own_message,
                temp_id,
                content,
                ..
            } => {
                assert!(!is_own_message);
                assert!(temp_id.is_none());
                assert_eq!(content, "hello");
            }
            other => panic!("expected message, got {other:?}"),
        }

        assert_eq!(
            db.unread_notification_count(&bob.identity.user_id.to_string())
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn repeat_delivery_of_one_message_yields_one_notification() {
        let (dispatcher, db) = setup();
        let alice = connect(&dispatcher, &db, "Alice").await;
        let bob = connect(&dispatcher, &db, "Bob").await;

        send(&dispatcher, &db, &alice, &bob, "one", "t1").await;
        send(&dispatcher, &db, &alice, &bob, "two", "t2").await;

        // Two distinct messages -> two notifications; the dedup key is
        // per message, exercised directly at the store level.
        assert_eq!(
            db.unread_notification_count(&bob.identity.user_id.to_string())
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn read_emits_receipts_only_once() {
        let (dispatcher, db) = setup();
        let mut alice = connect(&dispatcher, &db, "Alice").await;
        let mut bob = connect(&dispatcher, &db, "Bob").await;

        send(&dispatcher, &db, &alice, &bob, "hi", "t1").await;

        let message_id = match alice.rx.try_recv().unwrap() {
            ServerEvent::Message { id, .. } => id,
            other => panic!("expected message, got {other:?}"),
        };
        drain(&mut bob.rx);

        handle_command(
            &dispatcher,
            &db,
            &bob.identity,
            ClientCommand::Read {
                message_ids: vec![message_id],
            },
        )
        .await;

        match alice.rx.try_recv().unwrap() {
            ServerEvent::ReadReceipt {
                message_id: mid,
                read_by,
                ..
            } => {
                assert_eq!(mid, message_id);
                assert_eq!(read_by, bob.identity.user_id);
            }
            other => panic!("expected read receipt, got {other:?}"),
        }
        match bob.rx.try_recv().unwrap() {
            ServerEvent::ReadConfirmed {
                message_ids,
                confirmed,
            } => {
                assert_eq!(message_ids, vec![message_id]);
                assert!(confirmed);
            }
            other => panic!("expected read confirmation, got {other:?}"),
        }

        // The notification is consolidated too.
        assert_eq!(
            db.unread_notification_count(&bob.identity.user_id.to_string())
                .unwrap(),
            0
        );

        // Re-reading the same ids: confirmation again, but no second receipt.
        handle_command(
            &dispatcher,
            &db,
            &bob.identity,
            ClientCommand::Read {
                message_ids: vec![message_id],
            },
        )
        .await;
        assert!(alice.rx.try_recv().is_err());
        assert!(matches!(
            bob.rx.try_recv().unwrap(),
            ServerEvent::ReadConfirmed { .. }
        ));
    }

    #[tokio::test]
    async fn delete_is_sender_only_and_cascades_notifications() {
        let (dispatcher, db) = setup();
        let mut alice = connect(&dispatcher, &db, "Alice").await;
        let mut bob = connect(&dispatcher, &db, "Bob").await;

        send(&dispatcher, &db, &alice, &bob, "secret", "t1").await;
        let message_id = match alice.rx.try_recv().unwrap() {
            ServerEvent::Message { id, .. } => id,
            other => panic!("expected message, got {other:?}"),
        };
        drain(&mut bob.rx);

        // The recipient cannot delete the sender's message.
        handle_command(
            &dispatcher,
            &db,
            &bob.identity,
            ClientCommand::Delete { message_id },
        )
        .await;
        match bob.rx.try_recv().unwrap() {
            ServerEvent::Error { event, .. } => assert_eq!(event, "delete"),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(db.get_message(&message_id.to_string()).unwrap().is_some());

        // The sender can.
        handle_command(
            &dispatcher,
            &db,
            &alice.identity,
            ClientCommand::Delete { message_id },
        )
        .await;
        match bob.rx.try_recv().unwrap() {
            ServerEvent::Deleted {
                message_id: mid,
                confirmed,
                ..
            } => {
                assert_eq!(mid, message_id);
                assert!(confirmed.is_none());
            }
            other => panic!("expected delete, got {other:?}"),
        }
        match alice.rx.try_recv().unwrap() {
            ServerEvent::Deleted { confirmed, .. } => assert_eq!(confirmed, Some(true)),
            other => panic!("expected delete confirmation, got {other:?}"),
        }

        assert!(db.get_message(&message_id.to_string()).unwrap().is_none());
        assert!(
            db.find_notification(
                &bob.identity.user_id.to_string(),
                "message",
                &message_id.to_string()
            )
            .unwrap()
            .is_none()
        );
    }

    #[tokio::test]
    async fn typing_is_forwarded_without_persistence() {
        let (dispatcher, db) = setup();
        let alice = connect(&dispatcher, &db, "Alice").await;
        let mut bob = connect(&dispatcher, &db, "Bob").await;

        for _ in 0..2 {
            handle_command(
                &dispatcher,
                &db,
                &alice.identity,
                ClientCommand::Typing {
                    recipient_id: Some(bob.identity.user_id),
                    status: TypingStatus::Start,
                },
            )
            .await;
        }

        for _ in 0..2 {
            match bob.rx.try_recv().unwrap() {
                ServerEvent::Typing {
                    user_id, status, ..
                } => {
                    assert_eq!(user_id, alice.identity.user_id);
                    assert_eq!(status, TypingStatus::Start);
                }
                other => panic!("expected typing, got {other:?}"),
            }
        }

        // Missing recipient: silently ignored, nothing emitted anywhere.
        handle_command(
            &dispatcher,
            &db,
            &alice.identity,
            ClientCommand::Typing {
                recipient_id: None,
                status: TypingStatus::Stop,
            },
        )
        .await;
        assert!(bob.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn notification_query_and_bulk_mark_read_flow() {
        let (dispatcher, db) = setup();
        let alice = connect(&dispatcher, &db, "Alice").await;
        let mut bob = connect(&dispatcher, &db, "Bob").await;

        send(&dispatcher, &db, &alice, &bob, "hi", "t1").await;
        drain(&mut bob.rx);

        handle_command(&dispatcher, &db, &bob.identity, ClientCommand::GetNotifications).await;
        let notification_id = match bob.rx.try_recv().unwrap() {
            ServerEvent::Notifications {
                notifications,
                count,
            } => {
                assert_eq!(count, 1);
                assert_eq!(
                    notifications[0].message.as_ref().unwrap().content,
                    "hi"
                );
                notifications[0].id
            }
            other => panic!("expected notifications, got {other:?}"),
        };

        handle_command(
            &dispatcher,
            &db,
            &bob.identity,
            ClientCommand::MarkNotificationsRead {
                notification_ids: vec![notification_id],
            },
        )
        .await;
        match bob.rx.try_recv().unwrap() {
            ServerEvent::NotificationsMarkedRead {
                notification_ids,
                confirmed,
            } => {
                assert_eq!(notification_ids, vec![notification_id]);
                assert!(confirmed);
            }
            other => panic!("expected mark confirmation, got {other:?}"),
        }

        handle_command(&dispatcher, &db, &bob.identity, ClientCommand::GetNotifications).await;
        match bob.rx.try_recv().unwrap() {
            ServerEvent::Notifications { count, .. } => assert_eq!(count, 0),
            other => panic!("expected notifications, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_failure_surfaces_error_with_temp_id_to_sender_only() {
        let (dispatcher, db) = setup();
        let mut alice = connect(&dispatcher, &db, "Alice").await;

        // No user row for the recipient: the insert violates the foreign
        // key and the handler converts it into an error event.
        let ghost = Uuid::new_v4();
        let (_conn, mut ghost_rx) = dispatcher.register(ghost).await;

        handle_command(
            &dispatcher,
            &db,
            &alice.identity,
            ClientCommand::Message {
                recipient_id: ghost,
                content: "hi".into(),
                attachments: vec![],
                temp_id: Some("t7".into()),
            },
        )
        .await;

        match alice.rx.try_recv().unwrap() {
            ServerEvent::Error {
                event, temp_id, ..
            } => {
                assert_eq!(event, "message");
                assert_eq!(temp_id.as_deref(), Some("t7"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        // Nothing was partially emitted to the recipient.
        assert!(ghost_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_and_leave_broadcast_status_map() {
        let (dispatcher, db) = setup();
        let alice = connect(&dispatcher, &db, "Alice").await;
        let mut broadcast_rx = dispatcher.subscribe();

        handle_command(
            &dispatcher,
            &db,
            &alice.identity,
            ClientCommand::JoinChat { friend_id: None },
        )
        .await;

        let envelope = broadcast_rx.recv().await.unwrap();
        match envelope.event {
            ServerEvent::OnlineUsers(map) => {
                assert_eq!(map[&alice.identity.user_id].status, ChatStatus::Online);
            }
            other => panic!("expected status map, got {other:?}"),
        }
        let envelope = broadcast_rx.recv().await.unwrap();
        assert_eq!(envelope.exclude, Some(alice.identity.user_id));
        match envelope.event {
            ServerEvent::OnlineUser { status, .. } => assert_eq!(status, ChatStatus::Online),
            other => panic!("expected online notice, got {other:?}"),
        }

        handle_command(&dispatcher, &db, &alice.identity, ClientCommand::LeaveChat).await;
        let envelope = broadcast_rx.recv().await.unwrap();
        match envelope.event {
            ServerEvent::OnlineUsers(map) => {
                assert_eq!(map[&alice.identity.user_id].status, ChatStatus::Active);
            }
            other => panic!("expected status map, got {other:?}"),
        }
    }
}
