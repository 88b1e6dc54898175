use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use flychat_types::events::{ClientEvent, ServerEvent};

use crate::auth::Identity;
use crate::error::{ChatError, ChatResult};
use crate::presence::ConnectionHandle;
use crate::session::{SessionGateway, SessionState};

/// Handle a WebSocket whose credential was already checked at the HTTP
/// upgrade (bearer header or `?token=`). Goes straight to Ready.
pub async fn handle_connection_authenticated(socket: WebSocket, gateway: SessionGateway, identity: Identity) {
    let (sender, receiver) = socket.split();
    let mut conn = Connection::new(sender, receiver, gateway);
    conn.advance(SessionState::Authenticated);
    conn.run(identity).await;
}

/// Handle a WebSocket that must identify itself with its first frame.
pub async fn handle_connection(socket: WebSocket, gateway: SessionGateway) {
    let (sender, receiver) = socket.split();
    let mut conn = Connection::new(sender, receiver, gateway);
    if let Some(identity) = conn.handshake().await {
        conn.run(identity).await;
    }
}

/// Both halves of one gateway socket. Tracks the lifecycle up to
/// Authenticated; from Active on the [`Session`](crate::Session) does.
struct Connection<K, S> {
    sender: K,
    receiver: S,
    gateway: SessionGateway,
    state: SessionState,
}

impl<K, S, E> Connection<K, S>
where
    K: Sink<Message> + Send + Unpin + 'static,
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    fn new(sender: K, receiver: S, gateway: SessionGateway) -> Self {
        Self {
            sender,
            receiver,
            gateway,
            state: SessionState::Connecting,
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug!("Gateway connection {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Connecting -> Authenticated on a valid `identify`. Anything else gets
    /// an `error` event and a Close, and the connection ends Closed.
    async fn handshake(&mut self) -> Option<Identity> {
        match self.wait_for_identify().await {
            Ok(identity) => {
                self.advance(SessionState::Authenticated);
                Some(identity)
            }
            Err(e) => {
                warn!("WebSocket client failed to identify: {}", e);
                reject(&mut self.sender, &e).await;
                self.advance(SessionState::Closed);
                None
            }
        }
    }

    async fn wait_for_identify(&mut self) -> ChatResult<Identity> {
        let receiver = &mut self.receiver;
        let token = tokio::time::timeout(self.gateway.settings().auth_timeout, async {
            while let Some(Ok(frame)) = receiver.next().await {
                match frame {
                    Message::Text(text) => {
                        return match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(ClientEvent::Identify { token }) => Ok(token),
                            _ => Err(ChatError::authentication("expected identify")),
                        };
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Err(ChatError::authentication("connection closed before identify"))
        })
        .await
        .map_err(|_| ChatError::authentication("identify timed out"))??;

        self.gateway.authenticate(&token).await
    }

    /// Active phase: one writer task draining the outbound queue (plus
    /// heartbeat), and this task reading and dispatching frames in order.
    /// Returns the state the connection ended in.
    async fn run(self, identity: Identity) -> SessionState {
        let Self {
            sender,
            mut receiver,
            gateway,
            state,
        } = self;
        debug_assert_eq!(state, SessionState::Authenticated);

        info!("{} ({}) connected to gateway", identity.username, identity.user_id);
        let (mut session, outbound) = gateway.open(identity).await;

        let pong_received = Arc::new(AtomicBool::new(true));
        let mut send_task = tokio::spawn(write_loop(
            sender,
            outbound,
            session.handle().clone(),
            pong_received.clone(),
            gateway.settings().heartbeat_interval,
        ));
        let mut writer_done = false;

        loop {
            tokio::select! {
                _ = &mut send_task => {
                    writer_done = true;
                    break;
                }
                frame = receiver.next() => {
                    let Some(Ok(frame)) = frame else { break };
                    match frame {
                        Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => {
                                if let Some(reply) = gateway.dispatch(&session, event).await {
                                    if session.handle().send(reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                let identity = session.identity();
                                warn!(
                                    "{} ({}) bad event: {} -- raw: {}",
                                    identity.username,
                                    identity.user_id,
                                    e,
                                    text.chars().take(200).collect::<String>()
                                );
                                let _ = session.handle().try_deliver(ServerEvent::error("malformed event"));
                            }
                        },
                        Message::Pong(_) => pong_received.store(true, Ordering::Release),
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        if !writer_done {
            send_task.abort();
            let _ = send_task.await;
        }

        gateway.close(&mut session).await;
        let identity = session.identity();
        info!("{} ({}) disconnected from gateway", identity.username, identity.user_id);
        session.state()
    }
}

/// Sends the failure as an `error` event, then closes.
async fn reject<K>(sender: &mut K, error: &ChatError)
where
    K: Sink<Message> + Unpin,
{
    if let Ok(text) = serde_json::to_string(&ServerEvent::error(error.user_message())) {
        let _ = sender.send(Message::Text(text.into())).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication failed".into(),
        })))
        .await;
}

async fn write_loop<K>(
    mut sender: K,
    mut outbound: mpsc::Receiver<ServerEvent>,
    handle: ConnectionHandle,
    pong_received: Arc<AtomicBool>,
    interval: Duration,
) where
    K: Sink<Message> + Unpin,
{
    let mut heartbeat = tokio::time::interval(interval);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            _ = handle.closed() => {
                // Only another connection for the same user closes us from outside
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: "session replaced".into(),
                    })))
                    .await;
                break;
            }
            event = outbound.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", event.kind(), e);
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
}
