//! WebSocket transport gateway.
//!
//! The gateway owns no document state: it authenticates the first frame,
//! joins the session registry on the client's behalf, then muxes incoming
//! frames to the session handle and demuxes the session's broadcast stream
//! back to the socket.
//!
//! ```text
//! Client A ──┐                    ┌── session actor (doc 1) ── storage
//!             ├── Gateway ── registry
//! Client B ──┘                    └── session actor (doc 2) ── storage
//! ```
//!
//! Contract per connection: first frame must be `Join`; every mutating
//! frame gets exactly one `Ack` or `Rejected`; presence and heartbeat are
//! fire-and-forget; disconnection of any kind triggers `leave`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::engine::EngineError;
use crate::presence::DEFAULT_HEARTBEAT_TIMEOUT;
use crate::protocol::{Ack, ClientMessage, ProtocolError, RejectReason, ServerMessage};
use crate::session::{
    JoinAccepted, SessionConfig, SessionError, SessionHandle, SessionRegistry,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_GRACE_PERIOD,
};
use crate::storage::{BackoffPolicy, StorageBackend};
use crate::types::Participant;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per session
    pub broadcast_capacity: usize,
    pub heartbeat_timeout: Duration,
    pub grace_period: Duration,
    pub flush_interval: Duration,
    pub max_participants_per_session: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_participants_per_session: 64,
        }
    }
}

impl GatewayConfig {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_timeout: self.heartbeat_timeout,
            grace_period: self.grace_period,
            flush_interval: self.flush_interval,
            broadcast_capacity: self.broadcast_capacity,
            max_participants: self.max_participants_per_session,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Gateway-wide statistics.
#[derive(Debug, Clone, Default)]
pub struct GatewayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// The WebSocket gateway.
pub struct Gateway {
    config: GatewayConfig,
    registry: SessionRegistry,
    auth: Arc<dyn Authenticator>,
    stats: Arc<RwLock<GatewayStats>>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        storage: Arc<dyn StorageBackend>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = SessionRegistry::new(storage, config.session_config());
        Self {
            config,
            registry,
            auth,
            stats: Arc::new(RwLock::new(GatewayStats::default())),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn stats(&self) -> GatewayStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until the task is dropped.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (tests bind port 0 themselves).
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("gateway listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let registry = self.registry.clone();
            let auth = self.auth.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, auth, stats).await {
                    log::warn!("connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: SessionRegistry,
        auth: Arc<dyn Authenticator>,
        stats: Arc<RwLock<GatewayStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result =
            Self::run_connection(&mut ws_sender, &mut ws_receiver, addr, registry, auth, &stats)
                .await;

        let mut s = stats.write().await;
        s.active_connections -= 1;
        drop(s);

        result
    }

    async fn run_connection(
        ws_sender: &mut WsSink,
        ws_receiver: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
        addr: SocketAddr,
        registry: SessionRegistry,
        auth: Arc<dyn Authenticator>,
        stats: &Arc<RwLock<GatewayStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // First frame: Join, or nothing.
        let (credentials, document_id) = loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Binary(data))) => match ClientMessage::decode(&data) {
                    Ok(ClientMessage::Join {
                        credentials,
                        document_id,
                    }) => break (credentials, document_id),
                    Ok(other) => {
                        log::warn!("{addr}: first frame was {other:?}, not a join");
                        send(ws_sender, &ServerMessage::Rejected(RejectReason::AuthRejected))
                            .await?;
                        return Ok(());
                    }
                    Err(e) => {
                        log::warn!("{addr}: undecodable first frame: {e}");
                        send(ws_sender, &ServerMessage::Rejected(RejectReason::AuthRejected))
                            .await?;
                        return Ok(());
                    }
                },
                Some(Ok(Message::Ping(data))) => {
                    ws_sender.send(Message::Pong(data)).await?;
                }
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Ok(_)) => {
                    send(ws_sender, &ServerMessage::Rejected(RejectReason::AuthRejected)).await?;
                    return Ok(());
                }
                Some(Err(e)) => return Err(e.into()),
            }
        };

        // Authenticate before any session contact.
        let user = match auth.authenticate(&credentials) {
            Ok(user) => user,
            Err(e) => {
                log::info!("{addr}: auth rejected: {e}");
                send(ws_sender, &ServerMessage::Rejected(RejectReason::AuthRejected)).await?;
                return Ok(());
            }
        };

        let connection_id = Uuid::new_v4();
        let participant = Participant::new(user.user_id, connection_id, user.name.clone());
        let user_id = participant.user_id;

        let (handle, accepted) = match registry.join(document_id, participant).await {
            Ok(joined) => joined,
            Err(e) => {
                send(ws_sender, &ServerMessage::Rejected(reject_reason(&e))).await?;
                return Ok(());
            }
        };
        log::info!(
            "{} ({user_id}) joined document {document_id} from {addr}",
            user.name
        );

        let JoinAccepted {
            participant,
            participants,
            document,
            meta,
            messages,
            tasks,
            mut events,
            group,
        } = accepted;
        send(
            ws_sender,
            &ServerMessage::Joined {
                participant,
                participants,
                document,
                meta,
                messages,
                tasks,
            },
        )
        .await?;

        let mut exit: Result<(), Box<dyn std::error::Error + Send + Sync>> = Ok(());
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match ClientMessage::decode(&data) {
                                Ok(ClientMessage::Leave) => break,
                                Ok(msg) => {
                                    if let Some(response) =
                                        Self::dispatch(&handle, connection_id, user_id, msg).await
                                    {
                                        if let Err(e) = send(ws_sender, &response).await {
                                            exit = Err(e.into());
                                            break;
                                        }
                                    }
                                }
                                Err(e) => {
                                    log::warn!("{addr}: undecodable frame: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                exit = Err(e.into());
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            exit = Err(e.into());
                            break;
                        }
                    }
                }
                frame = events.recv() => {
                    match frame {
                        Ok(frame) => {
                            // Never echo an event back to its author.
                            if frame.origin == Some(connection_id) {
                                continue;
                            }
                            // A failed write is a disconnect: fall through to
                            // the leave below instead of returning early.
                            if let Err(e) =
                                ws_sender.send(Message::Binary(frame.bytes.clone().into())).await
                            {
                                exit = Err(e.into());
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            group.record_lagged(n);
                            log::warn!("{addr}: dropped {n} events (slow consumer)");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        // Leave runs on every exit path, clean close or not.
        handle.leave(connection_id, user_id).await;
        log::info!("{user_id} left document {document_id} ({addr} disconnected)");
        exit
    }

    /// Route one post-join frame. Returns the response to write, if any.
    async fn dispatch(
        handle: &SessionHandle,
        connection_id: Uuid,
        user_id: Uuid,
        msg: ClientMessage,
    ) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Operation(op) => {
                Some(match handle.submit(connection_id, user_id, op).await {
                    Ok(applied) => ServerMessage::Ack(Ack::Operation {
                        op_id: applied.op_id,
                        revision: applied.revision,
                    }),
                    Err(e) => ServerMessage::Rejected(reject_reason(&e)),
                })
            }
            ClientMessage::Presence { position } => {
                let _ = handle.presence(connection_id, user_id, position).await;
                None
            }
            ClientMessage::Heartbeat => {
                let _ = handle.heartbeat(user_id).await;
                None
            }
            ClientMessage::Chat { text } => {
                Some(match handle.chat(connection_id, user_id, text).await {
                    Ok(msg) => ServerMessage::Ack(Ack::Chat {
                        id: msg.id,
                        seq: msg.seq,
                    }),
                    Err(e) => ServerMessage::Rejected(reject_reason(&e)),
                })
            }
            ClientMessage::Task(action) => {
                Some(match handle.task(connection_id, user_id, action).await {
                    Ok(event) => ServerMessage::Ack(Ack::Task {
                        seq: event.map(|e| e.seq),
                    }),
                    Err(e) => ServerMessage::Rejected(reject_reason(&e)),
                })
            }
            // Join and Leave are handled by the connection loop.
            ClientMessage::Join { .. } => Some(ServerMessage::Rejected(
                RejectReason::MalformedOperation("already joined".into()),
            )),
            ClientMessage::Leave => None,
        }
    }
}

async fn send(ws_sender: &mut WsSink, msg: &ServerMessage) -> Result<(), ProtocolError> {
    let bytes = msg.encode()?;
    ws_sender
        .send(Message::Binary(bytes.into()))
        .await
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn reject_reason(e: &SessionError) -> RejectReason {
    match e {
        SessionError::Engine(EngineError::Malformed(m)) => {
            RejectReason::MalformedOperation(m.clone())
        }
        SessionError::Engine(EngineError::Stale {
            origin_revision,
            oldest_retained,
        }) => RejectReason::StaleOperation {
            origin_revision: *origin_revision,
            oldest_retained: *oldest_retained,
        },
        SessionError::NotFound => RejectReason::NotFound,
        SessionError::StaleSession => RejectReason::StaleSession,
        SessionError::SessionFull => RejectReason::SessionFull,
        SessionError::Storage(_) => RejectReason::StorageUnavailable,
    }
}
