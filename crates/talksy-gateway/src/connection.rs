use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use talksy_types::events::{GatewayCommand, GatewayEvent};

use crate::Hub;
use crate::sync::SyncSession;

/// Transport liveness: the server pings every 15 seconds and drops the socket
/// after 2 missed pongs. Presence heartbeats are separate and run inside the
/// sync session.
const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Commands queued per connection before the reader waits on the session.
const COMMAND_BUFFER: usize = 32;

/// Serve a WebSocket whose JWT was already validated at the HTTP upgrade.
/// The connection lives exactly as long as its sync session.
pub async fn handle_connection_authenticated(
    socket: WebSocket,
    hub: Hub,
    user_id: Uuid,
    username: String,
    initial_conversation: Option<Uuid>,
) {
    let (mut sender, mut receiver) = socket.split();

    info!("{} ({}) connected to gateway", username, user_id);

    let ready = GatewayEvent::Ready {
        user_id,
        username: username.clone(),
    };
    if send_event(&mut sender, &ready).await.is_err() {
        return;
    }

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

    let session = SyncSession::new(hub, user_id, outbox_tx);
    let mut session_task = tokio::spawn(session.run(initial_conversation, command_rx));

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Session snapshots -> client, with ping heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        let mut missed_pongs: u8 = 0;

        loop {
            tokio::select! {
                event = outbox_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_pongs = 0;
                    } else {
                        missed_pongs += 1;
                        if missed_pongs >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_pongs);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client commands -> session
    let username_recv = username.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        if command_tx.send(cmd).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad command: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
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

    // Whichever side ends first takes the others down with it. Aborting the
    // session drops its conversation subscription.
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            session_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
            session_task.abort();
        }
        _ = &mut session_task => {
            send_task.abort();
            recv_task.abort();
        }
    }

    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
