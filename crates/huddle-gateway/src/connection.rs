use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use huddle_types::events::{ClientCommand, ErrorCode, ServerEvent};

use crate::hub::Hub;
use crate::session::Session;
use crate::store::ChatStore;

/// Server sends a Ping every interval; two missed Pongs drop the connection.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const MAX_MISSED_HEARTBEATS: u8 = 2;

/// Drive one WebSocket connection until either side goes away.
///
/// Commands are handled one at a time in arrival order. Outbound events are
/// queued on the session's channel and written by a separate task, so a
/// broadcast never waits on a slow socket.
pub async fn handle_connection<S: ChatStore>(socket: WebSocket, hub: Hub<S>, heartbeat_interval: Duration) {
    let (sender, receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut session = Session::new(tx);
    let conn_id = session.conn_id();

    info!("Connection {} opened", conn_id);

    let pong_received = Arc::new(AtomicBool::new(true));
    let mut send_task = tokio::spawn(forward_events(sender, rx, pong_received.clone(), heartbeat_interval));

    read_commands(&hub, &mut session, receiver, &pong_received, &mut send_task).await;
    send_task.abort();

    hub.disconnect(&mut session).await;
    info!("Connection {} closed", conn_id);
}

/// Outbound queue + heartbeat -> socket.
async fn forward_events(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
    pong_received: Arc<AtomicBool>,
    heartbeat_interval: Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };

                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode outbound event: {}", e);
                        continue;
                    }
                };

                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if pong_received.swap(false, Ordering::Acquire) {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= MAX_MISSED_HEARTBEATS {
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
}

/// Socket -> hub, strictly sequential.
///
/// `writer_done` is only checked while waiting for the next frame, so a
/// command that has started always runs to completion before teardown.
async fn read_commands<S, R, W>(
    hub: &Hub<S>,
    session: &mut Session,
    mut receiver: R,
    pong_received: &AtomicBool,
    mut writer_done: W,
) where
    S: ChatStore,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
    W: Future + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = &mut writer_done => break,
        };
        let Some(Ok(msg)) = frame else { break };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => {
                    // Failures are already acknowledged to this connection.
                    let _ = hub.handle(session, command).await;
                }
                Err(e) => {
                    warn!(
                        "Connection {} bad command: {} -- raw: {}",
                        session.conn_id(),
                        e,
                        &text[..floor_char_boundary(&text, 200)]
                    );
                    session.send(ServerEvent::Error {
                        event: "unknown".to_string(),
                        code: ErrorCode::Validation,
                        message: format!("malformed command: {}", e),
                    });
                }
            },
            Message::Pong(_) => {
                pong_received.store(true, Ordering::Release);
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    (0..=max).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}
