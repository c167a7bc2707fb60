//! Session actors and the session registry.
//!
//! One tokio task per live document owns that document's replication
//! engine, event log and presence table. Every mutation flows through the
//! actor's command channel, so per-session ordering needs no locks and
//! different documents run fully in parallel.
//!
//! Lifecycle: the registry lazily spawns an actor on first join, loading
//! the persisted snapshot. When the participant set becomes empty the actor
//! starts a grace timer (absorbing quick reconnects); on expiry it flushes
//! the snapshot, unregisters itself and exits. A join that races teardown
//! is retried once against a fresh actor before surfacing `StaleSession`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, RwLock};

use crate::broadcast::{BroadcastGroup, Frame};
use crate::engine::{AppliedOperation, DocumentState, EngineError, Operation, ReplicationEngine};
use crate::event_log::{ChatMessage, EventLog, EventLogError, TaskEvent, TaskItem};
use crate::presence::{PresenceTracker, DEFAULT_HEARTBEAT_TIMEOUT};
use crate::protocol::{ServerMessage, SessionEvent, TaskAction};
use crate::storage::{
    save_with_backoff, BackoffPolicy, FlushLocks, SessionSnapshot, StorageBackend, StoreError,
};
use crate::types::{ConnectionId, CursorPosition, DocMeta, DocumentId, Participant, UserId};

/// Default quick-reconnect window before an empty session is torn down.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Default periodic flush interval while a session is occupied.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(30);
/// Applied operations kept for transforming late submissions. The engine log
/// is pruned to this window on each periodic flush; ops originating before
/// it are rejected as stale.
const RETAINED_OP_WINDOW: usize = 1024;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_timeout: Duration,
    pub grace_period: Duration,
    pub flush_interval: Duration,
    /// Per-subscriber broadcast buffer.
    pub broadcast_capacity: usize,
    /// Connection cap per session; joins beyond it are rejected.
    pub max_participants: usize,
    pub backoff: BackoffPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            broadcast_capacity: 256,
            max_participants: 64,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    Engine(EngineError),
    /// Task id does not exist (toggle after a concurrent delete).
    NotFound,
    /// The session tore down mid-request; reconnect and rejoin.
    StaleSession,
    SessionFull,
    Storage(StoreError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Engine(e) => write!(f, "{e}"),
            SessionError::NotFound => write!(f, "not found"),
            SessionError::StaleSession => write!(f, "session is gone; rejoin required"),
            SessionError::SessionFull => write!(f, "session is full"),
            SessionError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        SessionError::Engine(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Storage(e)
    }
}

/// Everything a freshly admitted participant needs: the state snapshot as
/// of admission plus a subscription that observes every later event.
pub struct JoinAccepted {
    pub participant: Participant,
    pub participants: Vec<Participant>,
    pub document: DocumentState,
    pub meta: DocMeta,
    pub messages: Vec<ChatMessage>,
    pub tasks: Vec<TaskItem>,
    pub events: broadcast::Receiver<Arc<Frame>>,
    /// Shared fan-out group, for lag reporting by the transport.
    pub group: Arc<BroadcastGroup>,
}

enum Command {
    Join {
        participant: Participant,
        reply: oneshot::Sender<Result<JoinAccepted, SessionError>>,
    },
    Leave {
        connection_id: ConnectionId,
        user_id: UserId,
    },
    Operation {
        connection_id: ConnectionId,
        user_id: UserId,
        op: Operation,
        reply: oneshot::Sender<Result<AppliedOperation, SessionError>>,
    },
    Presence {
        connection_id: ConnectionId,
        user_id: UserId,
        position: CursorPosition,
    },
    Heartbeat {
        user_id: UserId,
    },
    Chat {
        connection_id: ConnectionId,
        user_id: UserId,
        text: String,
        reply: oneshot::Sender<Result<ChatMessage, SessionError>>,
    },
    Task {
        connection_id: ConnectionId,
        user_id: UserId,
        action: TaskAction,
        reply: oneshot::Sender<Result<Option<TaskEvent>, SessionError>>,
    },
}

/// Cheap handle to one session's command channel.
#[derive(Clone)]
pub struct SessionHandle {
    document_id: DocumentId,
    sender: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    async fn request<T>(
        &self,
        cmd: Command,
        rx: oneshot::Receiver<Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SessionError::StaleSession)?;
        rx.await.map_err(|_| SessionError::StaleSession)?
    }

    pub async fn submit(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        op: Operation,
    ) -> Result<AppliedOperation, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Operation {
                connection_id,
                user_id,
                op,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Fire-and-forget cursor update.
    pub async fn presence(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        position: CursorPosition,
    ) -> Result<(), SessionError> {
        self.sender
            .send(Command::Presence {
                connection_id,
                user_id,
                position,
            })
            .await
            .map_err(|_| SessionError::StaleSession)
    }

    pub async fn heartbeat(&self, user_id: UserId) -> Result<(), SessionError> {
        self.sender
            .send(Command::Heartbeat { user_id })
            .await
            .map_err(|_| SessionError::StaleSession)
    }

    pub async fn chat(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        text: String,
    ) -> Result<ChatMessage, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Chat {
                connection_id,
                user_id,
                text,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Returns the stamped event, or `None` for an idempotent no-op
    /// (deleting a task that is already gone).
    pub async fn task(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        action: TaskAction,
    ) -> Result<Option<TaskEvent>, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            Command::Task {
                connection_id,
                user_id,
                action,
                reply: tx,
            },
            rx,
        )
        .await
    }

    /// Always succeeds from the caller's perspective; a closed channel
    /// means the session already considers everyone gone.
    pub async fn leave(&self, connection_id: ConnectionId, user_id: UserId) {
        let _ = self
            .sender
            .send(Command::Leave {
                connection_id,
                user_id,
            })
            .await;
    }
}

type SessionMap = Arc<RwLock<HashMap<DocumentId, mpsc::Sender<Command>>>>;

/// Maps document ids to live session actors. Cloneable; all clones share
/// one map.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: SessionMap,
    storage: Arc<dyn StorageBackend>,
    flush_locks: Arc<FlushLocks>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(storage: Arc<dyn StorageBackend>, config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            storage,
            flush_locks: Arc::new(FlushLocks::new()),
            config,
        }
    }

    /// Join a document's session, spawning the actor if none is live.
    pub async fn join(
        &self,
        document_id: DocumentId,
        participant: Participant,
    ) -> Result<(SessionHandle, JoinAccepted), SessionError> {
        // One retry: the looked-up actor may tear down between the lookup
        // and our send.
        for _ in 0..2 {
            let sender = self.get_or_spawn(document_id).await;
            let (tx, rx) = oneshot::channel();
            let cmd = Command::Join {
                participant: participant.clone(),
                reply: tx,
            };
            if sender.send(cmd).await.is_err() {
                continue;
            }
            match rx.await {
                Ok(Ok(accepted)) => {
                    let handle = SessionHandle {
                        document_id,
                        sender,
                    };
                    return Ok((handle, accepted));
                }
                Ok(Err(e)) => return Err(e),
                // Reply dropped: the actor died with our join queued.
                Err(_) => continue,
            }
        }
        Err(SessionError::StaleSession)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_live(&self, document_id: DocumentId) -> bool {
        self.sessions
            .read()
            .await
            .get(&document_id)
            .map(|s| !s.is_closed())
            .unwrap_or(false)
    }

    async fn get_or_spawn(&self, document_id: DocumentId) -> mpsc::Sender<Command> {
        // Fast path: read lock.
        {
            let sessions = self.sessions.read().await;
            if let Some(sender) = sessions.get(&document_id) {
                if !sender.is_closed() {
                    return sender.clone();
                }
            }
        }

        // Slow path: write lock, double-check, spawn.
        let mut sessions = self.sessions.write().await;
        if let Some(sender) = sessions.get(&document_id) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (tx, rx) = mpsc::channel(64);
        sessions.insert(document_id, tx.clone());
        let actor = SessionActor {
            document_id,
            sender: tx.clone(),
            registry: self.sessions.clone(),
            storage: self.storage.clone(),
            flush_locks: self.flush_locks.clone(),
            config: self.config.clone(),
        };
        tokio::spawn(actor.run(rx));
        tx
    }
}

struct SessionActor {
    document_id: DocumentId,
    /// Own sender, kept for identity checks against the registry entry.
    sender: mpsc::Sender<Command>,
    registry: SessionMap,
    storage: Arc<dyn StorageBackend>,
    flush_locks: Arc<FlushLocks>,
    config: SessionConfig,
}

struct SessionState {
    engine: ReplicationEngine,
    log: EventLog,
    meta: DocMeta,
    presence: PresenceTracker,
    participants: HashMap<ConnectionId, Participant>,
    group: Arc<BroadcastGroup>,
}

impl SessionActor {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        // Load under the flush lock so a rejoin never reads a snapshot a
        // tearing-down predecessor is still writing.
        let snapshot = {
            let _guard = self.flush_locks.acquire(self.document_id).await;
            match self.storage.load(self.document_id) {
                Ok(found) => found.unwrap_or_else(SessionSnapshot::empty),
                Err(e) => {
                    log::error!("session {}: snapshot load failed: {e}", self.document_id);
                    self.unregister().await;
                    rx.close();
                    while let Some(cmd) = rx.recv().await {
                        reject_unavailable(cmd, &e);
                    }
                    return;
                }
            }
        };

        log::info!(
            "session {} started at revision {}",
            self.document_id,
            snapshot.document.revision
        );

        let mut state = SessionState {
            engine: ReplicationEngine::new(snapshot.document),
            log: EventLog::from_parts(snapshot.messages, snapshot.tasks, snapshot.next_seq),
            meta: snapshot.meta,
            presence: PresenceTracker::new(self.config.heartbeat_timeout),
            participants: HashMap::new(),
            group: Arc::new(BroadcastGroup::new(self.config.broadcast_capacity)),
        };

        let mut sweep = tokio::time::interval(self.config.heartbeat_timeout / 3);
        let mut flush = tokio::time::interval(self.config.flush_interval);
        // The immediate first tick would flush an untouched session.
        flush.reset();
        let mut grace: Option<Pin<Box<tokio::time::Sleep>>> = None;

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => {
                        self.handle(&mut state, cmd);
                        grace_update(&mut grace, &state, self.config.grace_period);
                    }
                    // All senders dropped: registry is gone, shut down.
                    None => break,
                },
                _ = sweep.tick() => {
                    for user_id in state.presence.sweep() {
                        log::info!(
                            "session {}: evicting {user_id} (heartbeat timeout)",
                            self.document_id
                        );
                        state.participants.retain(|_, p| p.user_id != user_id);
                        broadcast_event(&state.group, None, SessionEvent::ParticipantLeft { user_id });
                    }
                    grace_update(&mut grace, &state, self.config.grace_period);
                }
                _ = flush.tick() => {
                    if !state.participants.is_empty() {
                        state.engine.prune(RETAINED_OP_WINDOW);
                        self.spawn_flush(&state);
                    }
                }
                () = async { grace.as_mut().unwrap().as_mut().await }, if grace.is_some() => {
                    grace = None;
                    if state.participants.is_empty() {
                        break;
                    }
                }
            }
        }

        self.teardown(&state).await;
    }

    fn handle(&self, state: &mut SessionState, cmd: Command) {
        match cmd {
            Command::Join { participant, reply } => {
                let result = self.admit(state, participant);
                let _ = reply.send(result);
            }
            Command::Leave {
                connection_id,
                user_id,
            } => {
                if state.participants.remove(&connection_id).is_none() {
                    return;
                }
                let still_connected = state.participants.values().any(|p| p.user_id == user_id);
                if !still_connected {
                    state.presence.remove(&user_id);
                    broadcast_event(
                        &state.group,
                        Some(connection_id),
                        SessionEvent::ParticipantLeft { user_id },
                    );
                }
            }
            Command::Operation {
                connection_id,
                user_id,
                op,
                reply,
            } => {
                if !state.participants.contains_key(&connection_id) {
                    let _ = reply.send(Err(SessionError::StaleSession));
                    return;
                }
                // The authenticated identity is authoritative; an op stamped
                // with someone else's id would forge attribution and the
                // insert tie-break.
                if op.participant_id != user_id {
                    let _ = reply.send(Err(SessionError::Engine(EngineError::Malformed(
                        format!(
                            "operation stamped {} by participant {user_id}",
                            op.participant_id
                        ),
                    ))));
                    return;
                }
                state.presence.heartbeat(&user_id);
                match state.engine.submit(op) {
                    Ok(applied) => {
                        broadcast_event(
                            &state.group,
                            Some(connection_id),
                            SessionEvent::OperationApplied(applied.clone()),
                        );
                        let _ = reply.send(Ok(applied));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            Command::Presence {
                connection_id,
                user_id,
                position,
            } => {
                if state.presence.update(&user_id, position) {
                    broadcast_event(
                        &state.group,
                        Some(connection_id),
                        SessionEvent::Presence { user_id, position },
                    );
                }
            }
            Command::Heartbeat { user_id } => {
                state.presence.heartbeat(&user_id);
            }
            Command::Chat {
                connection_id,
                user_id,
                text,
                reply,
            } => {
                if !state.participants.contains_key(&connection_id) {
                    let _ = reply.send(Err(SessionError::StaleSession));
                    return;
                }
                state.presence.heartbeat(&user_id);
                let msg = state.log.append_message(user_id, text);
                broadcast_event(
                    &state.group,
                    Some(connection_id),
                    SessionEvent::Chat(msg.clone()),
                );
                let _ = reply.send(Ok(msg));
            }
            Command::Task {
                connection_id,
                user_id,
                action,
                reply,
            } => {
                if !state.participants.contains_key(&connection_id) {
                    let _ = reply.send(Err(SessionError::StaleSession));
                    return;
                }
                state.presence.heartbeat(&user_id);
                let result = match action {
                    TaskAction::Add { text } => Ok(Some(state.log.add_task(user_id, text))),
                    TaskAction::Toggle { task_id } => match state.log.toggle_task(task_id) {
                        Ok(event) => Ok(Some(event)),
                        Err(EventLogError::NotFound(_)) => Err(SessionError::NotFound),
                    },
                    TaskAction::Delete { task_id } => Ok(state.log.delete_task(task_id)),
                };
                if let Ok(Some(event)) = &result {
                    broadcast_event(
                        &state.group,
                        Some(connection_id),
                        SessionEvent::Task(event.clone()),
                    );
                }
                let _ = reply.send(result);
            }
        }
    }

    fn admit(
        &self,
        state: &mut SessionState,
        participant: Participant,
    ) -> Result<JoinAccepted, SessionError> {
        if state.participants.len() >= self.config.max_participants {
            return Err(SessionError::SessionFull);
        }

        let connection_id = participant.connection_id;
        state.participants.insert(connection_id, participant.clone());
        state.presence.join(participant.user_id);

        // Broadcast the join before subscribing: the joiner's snapshot
        // already includes itself, and nothing can interleave between the
        // two inside the actor, so the stream lines up with no gap.
        broadcast_event(
            &state.group,
            Some(connection_id),
            SessionEvent::ParticipantJoined(participant.clone()),
        );
        let events = state.group.subscribe();
        Ok(JoinAccepted {
            participant,
            participants: state.participants.values().cloned().collect(),
            document: state.engine.state().clone(),
            meta: state.meta.clone(),
            messages: state.log.messages().to_vec(),
            tasks: state.log.tasks().to_vec(),
            events,
            group: state.group.clone(),
        })
    }

    /// Periodic flush: snapshot is cloned on the actor, written off-task so
    /// a slow backend never stalls the session.
    fn spawn_flush(&self, state: &SessionState) {
        let snapshot = SessionSnapshot::capture(&state.meta, state.engine.state(), &state.log);
        let document_id = self.document_id;
        let storage = self.storage.clone();
        let flush_locks = self.flush_locks.clone();
        let backoff = self.config.backoff;
        tokio::spawn(async move {
            let _guard = flush_locks.acquire(document_id).await;
            if let Err(e) = save_with_backoff(storage.as_ref(), document_id, &snapshot, backoff).await {
                log::error!("session {document_id}: periodic flush failed: {e}");
            }
        });
    }

    async fn teardown(&self, state: &SessionState) {
        // Unregister first so later joins spawn a fresh actor; their load
        // waits on the flush lock we take next.
        self.unregister().await;

        let _guard = self.flush_locks.acquire(self.document_id).await;
        let snapshot = SessionSnapshot::capture(&state.meta, state.engine.state(), &state.log);
        match save_with_backoff(
            self.storage.as_ref(),
            self.document_id,
            &snapshot,
            self.config.backoff,
        )
        .await
        {
            Ok(()) => log::info!(
                "session {} closed at revision {}",
                self.document_id,
                snapshot.document.revision
            ),
            Err(e) => log::error!(
                "session {}: teardown flush failed, state lost since last flush: {e}",
                self.document_id
            ),
        }
    }

    async fn unregister(&self) {
        let mut sessions = self.registry.write().await;
        if let Some(existing) = sessions.get(&self.document_id) {
            if existing.same_channel(&self.sender) {
                sessions.remove(&self.document_id);
            }
        }
    }
}

fn grace_update(
    grace: &mut Option<Pin<Box<tokio::time::Sleep>>>,
    state: &SessionState,
    period: Duration,
) {
    if state.participants.is_empty() {
        if grace.is_none() {
            *grace = Some(Box::pin(tokio::time::sleep(period)));
        }
    } else {
        *grace = None;
    }
}

fn broadcast_event(group: &BroadcastGroup, origin: Option<ConnectionId>, event: SessionEvent) {
    match ServerMessage::Event(event).encode() {
        Ok(bytes) => {
            group.send(Frame::new(origin, bytes));
        }
        Err(e) => log::error!("event encode failed, not broadcast: {e}"),
    }
}

fn reject_unavailable(cmd: Command, err: &StoreError) {
    match cmd {
        Command::Join { reply, .. } => {
            let _ = reply.send(Err(SessionError::Storage(err.clone())));
        }
        Command::Operation { reply, .. } => {
            let _ = reply.send(Err(SessionError::Storage(err.clone())));
        }
        Command::Task { reply, .. } => {
            let _ = reply.send(Err(SessionError::Storage(err.clone())));
        }
        Command::Chat { reply, .. } => {
            let _ = reply.send(Err(SessionError::Storage(err.clone())));
        }
        Command::Leave { .. } | Command::Presence { .. } | Command::Heartbeat { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OpPayload;
    use crate::storage::MemoryBackend;
    use uuid::Uuid;

    fn participant(user: u8) -> Participant {
        Participant::new(Uuid::from_u128(user as u128), Uuid::new_v4(), format!("user{user}"))
    }

    fn registry() -> (SessionRegistry, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let registry = SessionRegistry::new(backend.clone(), SessionConfig::default());
        (registry, backend)
    }

    async fn next_event(rx: &mut broadcast::Receiver<Arc<Frame>>) -> (Option<ConnectionId>, SessionEvent) {
        let frame = rx.recv().await.unwrap();
        match ServerMessage::decode(&frame.bytes).unwrap() {
            ServerMessage::Event(ev) => (frame.origin, ev),
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_then_operation_broadcast() {
        let (registry, _) = registry();
        let doc = Uuid::new_v4();
        let alice = participant(1);
        let bob = participant(2);

        let (handle_a, _accepted_a) = registry.join(doc, alice.clone()).await.unwrap();
        let (_handle_b, mut accepted_b) = registry.join(doc, bob.clone()).await.unwrap();

        let op = Operation {
            op_id: Uuid::new_v4(),
            origin_revision: 0,
            participant_id: alice.user_id,
            payload: OpPayload::Insert { index: 0, text: "neat".into() },
        };
        let applied = handle_a
            .submit(alice.connection_id, alice.user_id, op)
            .await
            .unwrap();
        assert_eq!(applied.revision, 1);

        let (origin, event) = next_event(&mut accepted_b.events).await;
        assert_eq!(origin, Some(alice.connection_id));
        match event {
            SessionEvent::OperationApplied(a) => assert_eq!(a.revision, 1),
            other => panic!("expected operation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_joiner_sees_existing_participants() {
        let (registry, _) = registry();
        let doc = Uuid::new_v4();
        let alice = participant(1);
        let bob = participant(2);

        registry.join(doc, alice.clone()).await.unwrap();
        let (_, accepted) = registry.join(doc, bob.clone()).await.unwrap();
        let ids: Vec<UserId> = accepted.participants.iter().map(|p| p.user_id).collect();
        assert!(ids.contains(&alice.user_id));
        assert!(ids.contains(&bob.user_id));
    }

    #[tokio::test]
    async fn test_chat_total_order() {
        let (registry, _) = registry();
        let doc = Uuid::new_v4();
        let alice = participant(1);
        let bob = participant(2);

        let (handle_a, _) = registry.join(doc, alice.clone()).await.unwrap();
        let (handle_b, _) = registry.join(doc, bob.clone()).await.unwrap();

        let m1 = handle_a
            .chat(alice.connection_id, alice.user_id, "first".into())
            .await
            .unwrap();
        let m2 = handle_b
            .chat(bob.connection_id, bob.user_id, "second".into())
            .await
            .unwrap();
        let m3 = handle_a
            .chat(alice.connection_id, alice.user_id, "third".into())
            .await
            .unwrap();
        assert_eq!(m1.seq, 0);
        assert_eq!(m2.seq, 1);
        assert_eq!(m3.seq, 2);

        // A later joiner observes the same order in its snapshot.
        let (_, accepted) = registry.join(doc, participant(3)).await.unwrap();
        let seqs: Vec<u64> = accepted.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_toggle_deleted_task_not_found() {
        let (registry, _) = registry();
        let doc = Uuid::new_v4();
        let alice = participant(1);
        let (handle, _) = registry.join(doc, alice.clone()).await.unwrap();

        let added = handle
            .task(
                alice.connection_id,
                alice.user_id,
                TaskAction::Add { text: "rack the casks".into() },
            )
            .await
            .unwrap()
            .unwrap();
        let task_id = match added.change {
            crate::event_log::TaskChange::Added(ref t) => t.id,
            _ => unreachable!(),
        };

        handle
            .task(alice.connection_id, alice.user_id, TaskAction::Delete { task_id })
            .await
            .unwrap();
        // Deleting again: idempotent no-op.
        let again = handle
            .task(alice.connection_id, alice.user_id, TaskAction::Delete { task_id })
            .await
            .unwrap();
        assert!(again.is_none());
        // Toggling the deleted task: NotFound.
        let r = handle
            .task(alice.connection_id, alice.user_id, TaskAction::Toggle { task_id })
            .await;
        assert!(matches!(r, Err(SessionError::NotFound)));
    }

    #[tokio::test]
    async fn test_operation_stamped_with_foreign_id_rejected() {
        let (registry, _) = registry();
        let doc = Uuid::new_v4();
        let alice = participant(1);
        let (handle, _) = registry.join(doc, alice.clone()).await.unwrap();

        let forged = Operation {
            op_id: Uuid::new_v4(),
            origin_revision: 0,
            participant_id: participant(2).user_id,
            payload: OpPayload::Insert { index: 0, text: "not mine".into() },
        };
        let r = handle.submit(alice.connection_id, alice.user_id, forged).await;
        assert!(matches!(
            r,
            Err(SessionError::Engine(crate::engine::EngineError::Malformed(_)))
        ));

        // Nothing applied, nothing broadcast.
        let (_, accepted) = registry.join(doc, participant(3)).await.unwrap();
        assert_eq!(accepted.document.revision, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_connection_cannot_mutate() {
        let (registry, _) = registry();
        let doc = Uuid::new_v4();
        let alice = participant(1);
        let (handle, _) = registry.join(doc, alice.clone()).await.unwrap();

        // Past the heartbeat timeout the sweep evicts the silent user.
        tokio::time::advance(Duration::from_secs(31)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        let op = Operation {
            op_id: Uuid::new_v4(),
            origin_revision: 0,
            participant_id: alice.user_id,
            payload: OpPayload::Insert { index: 0, text: "ghost edit".into() },
        };
        let r = handle.submit(alice.connection_id, alice.user_id, op).await;
        assert!(matches!(r, Err(SessionError::StaleSession)));

        let r = handle
            .chat(alice.connection_id, alice.user_id, "still here?".into())
            .await;
        assert!(matches!(r, Err(SessionError::StaleSession)));

        let r = handle
            .task(
                alice.connection_id,
                alice.user_id,
                TaskAction::Add { text: "ghost task".into() },
            )
            .await;
        assert!(matches!(r, Err(SessionError::StaleSession)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_eviction_broadcasts_leave() {
        let (registry, _) = registry();
        let doc = Uuid::new_v4();
        let quiet = participant(1);
        let chatty = participant(2);

        let (_h1, _) = registry.join(doc, quiet.clone()).await.unwrap();
        let (h2, mut accepted) = registry.join(doc, chatty.clone()).await.unwrap();

        // Keep one participant alive past the other's timeout.
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(10)).await;
            h2.heartbeat(chatty.user_id).await.unwrap();
        }

        let (origin, event) = next_event(&mut accepted.events).await;
        assert_eq!(origin, None);
        match event {
            SessionEvent::ParticipantLeft { user_id } => assert_eq!(user_id, quiet.user_id),
            other => panic!("expected leave, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_teardown_flushes_and_rejoin_reloads() {
        let (registry, backend) = registry();
        let doc = Uuid::new_v4();
        let alice = participant(1);

        let (handle, _) = registry.join(doc, alice.clone()).await.unwrap();
        let op = Operation {
            op_id: Uuid::new_v4(),
            origin_revision: 0,
            participant_id: alice.user_id,
            payload: OpPayload::Insert { index: 0, text: "sherry finish".into() },
        };
        handle.submit(alice.connection_id, alice.user_id, op).await.unwrap();
        handle
            .chat(alice.connection_id, alice.user_id, "done for today".into())
            .await
            .unwrap();

        handle.leave(alice.connection_id, alice.user_id).await;
        tokio::time::advance(DEFAULT_GRACE_PERIOD + Duration::from_secs(1)).await;
        // Let the actor run its teardown.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert!(!registry.is_live(doc).await);
        assert!(backend.save_count() >= 1);

        let (_, accepted) = registry.join(doc, participant(2)).await.unwrap();
        assert_eq!(accepted.document.content, "sherry finish");
        assert_eq!(accepted.document.revision, 1);
        assert_eq!(accepted.messages.len(), 1);
        assert_eq!(accepted.messages[0].text, "done for today");
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_reconnect_cancels_teardown() {
        let (registry, backend) = registry();
        let doc = Uuid::new_v4();
        let alice = participant(1);

        let (handle, _) = registry.join(doc, alice.clone()).await.unwrap();
        handle.leave(alice.connection_id, alice.user_id).await;

        tokio::time::advance(Duration::from_secs(2)).await;
        let rejoined = participant(1);
        registry.join(doc, rejoined).await.unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert!(registry.is_live(doc).await);
        assert_eq!(backend.save_count(), 0);
    }

    #[tokio::test]
    async fn test_session_full() {
        let backend = Arc::new(MemoryBackend::new());
        let config = SessionConfig {
            max_participants: 1,
            ..SessionConfig::default()
        };
        let registry = SessionRegistry::new(backend, config);
        let doc = Uuid::new_v4();

        registry.join(doc, participant(1)).await.unwrap();
        let r = registry.join(doc, participant(2)).await;
        assert!(matches!(r, Err(SessionError::SessionFull)));
    }

    #[tokio::test]
    async fn test_load_failure_surfaces_storage_error() {
        struct FailingLoad;
        impl StorageBackend for FailingLoad {
            fn load(&self, _d: DocumentId) -> Result<Option<SessionSnapshot>, StoreError> {
                Err(StoreError::Unavailable("disk gone".into()))
            }
            fn save(&self, _d: DocumentId, _s: &SessionSnapshot) -> Result<(), StoreError> {
                Ok(())
            }
        }
        let registry = SessionRegistry::new(Arc::new(FailingLoad), SessionConfig::default());
        let r = registry.join(Uuid::new_v4(), participant(1)).await;
        assert!(matches!(r, Err(SessionError::Storage(_)) | Err(SessionError::StaleSession)));
    }
}
