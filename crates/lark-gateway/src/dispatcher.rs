use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use lark_types::events::ServerEvent;
use lark_types::models::{ChatPresence, ChatStatus};

/// Envelope for namespace broadcasts. `exclude` lets a handler express
/// "everyone else" fan-out; each connection's send task skips envelopes
/// that exclude its own identity.
#[derive(Debug, Clone)]
pub struct Broadcast {
    pub event: ServerEvent,
    pub exclude: Option<Uuid>,
}

/// Presence registry and delivery router. Tracks which identity owns
/// which connection, the finer-grained chat-viewing status, and routes
/// events to personal channels or the whole namespace.
///
/// Purely in-memory: empty at process start, so every user is presumed
/// offline until they reconnect.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Namespace broadcast channel — every connection subscribes.
    broadcast_tx: broadcast::Sender<Broadcast>,

    /// Connection presence: user_id -> (conn_id, personal channel).
    /// At most one live connection per identity; last writer wins.
    channels: RwLock<HashMap<Uuid, (Uuid, mpsc::UnboundedSender<ServerEvent>)>>,

    /// Chat-viewing presence, distinct from connection presence. An entry
    /// saying `online` means the user is actively viewing a chat, which is
    /// what decides notification-worthiness.
    chat_presence: RwLock<HashMap<Uuid, ChatPresence>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                channels: RwLock::new(HashMap::new()),
                chat_presence: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to namespace broadcasts.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to every connection in the namespace.
    pub fn broadcast(&self, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(Broadcast {
            event,
            exclude: None,
        });
    }

    /// Broadcast to everyone except one identity.
    pub fn broadcast_except(&self, exclude: Uuid, event: ServerEvent) {
        let _ = self.inner.broadcast_tx.send(Broadcast {
            event,
            exclude: Some(exclude),
        });
    }

    /// Register a connection's personal channel, overwriting any prior
    /// entry for the identity. Returns (conn_id, receiver).
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .channels
            .write()
            .await
            .insert(user_id, (conn_id, tx));
        (conn_id, rx)
    }

    /// Tear down a connection's presence, but only if conn_id still owns
    /// the entry — a reconnect with a new connection must not be evicted
    /// by the old connection's late disconnect. Returns whether teardown
    /// actually happened.
    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        {
            let mut channels = self.inner.channels.write().await;
            match channels.get(&user_id) {
                Some((stored, _)) if *stored == conn_id => {
                    channels.remove(&user_id);
                }
                _ => return false,
            }
        }
        self.inner.chat_presence.write().await.remove(&user_id);
        true
    }

    /// The connection id currently owned by an identity, if any.
    pub async fn connection_of(&self, user_id: Uuid) -> Option<Uuid> {
        self.inner
            .channels
            .read()
            .await
            .get(&user_id)
            .map(|(conn_id, _)| *conn_id)
    }

    /// Identities with an open connection.
    pub async fn connected_users(&self) -> Vec<Uuid> {
        self.inner.channels.read().await.keys().copied().collect()
    }

    /// Send a targeted event to one identity's personal channel. A no-op
    /// if no connection is registered — durability for missed messages is
    /// the notification engine's job, not the router's.
    pub async fn send_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let channels = self.inner.channels.read().await;
        if let Some((_, tx)) = channels.get(&user_id) {
            let _ = tx.send(event);
        }
    }

    /// Mark an identity chat-active (viewing a conversation). Returns a
    /// snapshot of the full status map for broadcasting. Idempotent.
    pub async fn join_chat(
        &self,
        user_id: Uuid,
        viewing: Option<Uuid>,
    ) -> HashMap<Uuid, ChatPresence> {
        let mut presence = self.inner.chat_presence.write().await;
        presence.insert(
            user_id,
            ChatPresence {
                status: ChatStatus::Online,
                last_seen: Utc::now(),
                viewing,
            },
        );
        presence.clone()
    }

    /// Mark an identity as connected but no longer viewing a chat.
    pub async fn leave_chat(&self, user_id: Uuid) -> HashMap<Uuid, ChatPresence> {
        let mut presence = self.inner.chat_presence.write().await;
        presence.insert(
            user_id,
            ChatPresence {
                status: ChatStatus::Active,
                last_seen: Utc::now(),
                viewing: None,
            },
        );
        presence.clone()
    }

    /// Chat-presence record for an identity, if one was ever signalled
    /// on the current connection.
    pub async fn chat_status_of(&self, user_id: Uuid) -> Option<ChatPresence> {
        self.inner.chat_presence.read().await.get(&user_id).cloned()
    }

    /// Whether the identity is actively viewing chat. Deliberately NOT the
    /// same as having a connection: a merely-connected recipient still gets
    /// a notification.
    pub async fn is_chat_active(&self, user_id: Uuid) -> bool {
        matches!(
            self.inner.chat_presence.read().await.get(&user_id),
            Some(p) if p.status == ChatStatus::Online
        )
    }

    /// Snapshot of the chat-presence map.
    pub async fn chat_presence_map(&self) -> HashMap<Uuid, ChatPresence> {
        self.inner.chat_presence.read().await.clone()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
