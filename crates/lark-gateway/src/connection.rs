use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use lark_db::Database;
use lark_types::events::{ClientCommand, ServerEvent};

use crate::dispatcher::Dispatcher;
use crate::session::{self, Identity};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Cap on how much of a rejected frame ends up in the log.
const LOG_EXCERPT_BYTES: usize = 200;

/// Truncate a raw frame for logging without splitting a multibyte
/// character. Slicing at a fixed byte offset panics mid-codepoint.
fn log_excerpt(text: &str) -> &str {
    if text.len() <= LOG_EXCERPT_BYTES {
        return text;
    }
    let mut end = LOG_EXCERPT_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Handle one chat connection. The identity arrived as a transport
/// parameter and was checked for presence at the HTTP upgrade layer; it
/// carries no cryptographic proof by design.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    user_id: Uuid,
) {
    // Best-effort Directory update. Presence correctness lives in the
    // registry, so a store failure here is logged and discarded rather
    // than blocking the connection.
    let user = {
        let db = db.clone();
        let id = user_id.to_string();
        tokio::task::spawn_blocking(move || db.find_and_set_status(&id, "active"))
            .await
            .unwrap_or_else(|e| Err(anyhow::anyhow!("store task join error: {e}")))
            .unwrap_or_else(|e| {
                warn!("Failed to mark user {} active: {:#}", user_id, e);
                None
            })
    };

    let identity = Identity {
        user_id,
        name: user
            .as_ref()
            .map(|u| u.name.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        avatar: user.as_ref().and_then(|u| u.avatar.clone()),
    };

    info!("{} ({}) connected to chat gateway", identity.name, user_id);

    let (mut sender, mut receiver) = socket.split();

    // Presence entry: last writer wins on reconnect.
    let (conn_id, mut user_rx) = dispatcher.register(user_id).await;

    // Ack the connection directly, then announce the grown online set to
    // the namespace. Subscribing first means this connection sees the
    // announcement too.
    let ready = ServerEvent::Ready {
        user_id,
        user_name: identity.name.clone(),
    };
    if sender
        .send(Message::Text(serde_json::to_string(&ready).unwrap().into()))
        .await
        .is_err()
    {
        dispatcher.disconnect(user_id, conn_id).await;
        return;
    }

    let mut broadcast_rx = dispatcher.subscribe();
    dispatcher.broadcast(ServerEvent::ActiveUsers {
        user_ids: dispatcher.connected_users().await,
    });

    // Shared flag for heartbeat
    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward namespace broadcasts + personal-channel events to the client,
    // interleaved with heartbeat probes.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let envelope = match result {
                        Ok(envelope) => envelope,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };

                    if envelope.exclude == Some(user_id) {
                        continue;
                    }

                    let text = serde_json::to_string(&envelope.event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                result = user_rx.recv() => {
                    let event = match result {
                        Some(event) => event,
                        None => break,
                    };

                    let text = serde_json::to_string(&event).unwrap();
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client. Commands from this connection are
    // handled in receipt order; completion order across connections is
    // not guaranteed once a handler suspends on a store call.
    let dispatcher_recv = dispatcher.clone();
    let db_recv = db.clone();
    let identity_recv = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(cmd) => {
                        session::handle_command(&dispatcher_recv, &db_recv, &identity_recv, cmd)
                            .await;
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            identity_recv.name,
                            identity_recv.user_id,
                            e,
                            log_excerpt(&text)
                        );
                        dispatcher_recv
                            .send_to_user(
                                identity_recv.user_id,
                                ServerEvent::Error {
                                    event: "parse",
                                    message: "Malformed event payload".into(),
                                    temp_id: None,
                                },
                            )
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    // Teardown, guarded by conn id so a reconnect's presence survives a
    // stale disconnect racing it.
    if dispatcher.disconnect(user_id, conn_id).await {
        let set_offline = {
            let db = db.clone();
            let id = user_id.to_string();
            tokio::task::spawn_blocking(move || db.find_and_set_status(&id, "offline"))
                .await
                .unwrap_or_else(|e| Err(anyhow::anyhow!("store task join error: {e}")))
        };
        if let Err(e) = set_offline {
            warn!("Failed to mark user {} offline: {:#}", user_id, e);
        }

        dispatcher.broadcast(ServerEvent::ActiveUsers {
            user_ids: dispatcher.connected_users().await,
        });
        dispatcher.broadcast(ServerEvent::OnlineUsers(
            dispatcher.chat_presence_map().await,
        ));
    }

    info!("{} ({}) disconnected from chat gateway", identity.name, user_id);
}
