//! # vault-collab: Collaborative session engine
//!
//! Server-side engine for real-time multi-user document collaboration:
//! transform-based text replication, presence, an ordered chat/task log,
//! and session lifecycle management behind a WebSocket gateway.
//!
//! ## Architecture
//!
//! ```text
//! Client A ──┐   WebSocket    ┌─────────┐   commands   ┌───────────────┐
//!             ├──────────────► │ Gateway │ ───────────► │ session actor │
//! Client B ──┘  Binary Proto  └─────────┘   (mpsc)     │  (per doc)    │
//!                                  ▲                    ├───────────────┤
//!                                  │   broadcast        │ engine        │
//!                                  └────────────────────┤ event log     │
//!                                       (fan-out)       │ presence      │
//!                                                       └──────┬────────┘
//!                                                              │ snapshots
//!                                                       ┌──────▼────────┐
//!                                                       │ StorageBackend│
//!                                                       │ (RocksDB/LZ4) │
//!                                                       └───────────────┘
//! ```
//!
//! Every document has at most one live session actor; all mutations for a
//! document are serialized through its command channel, which is what makes
//! revision numbers, event sequence numbers and membership changes totally
//! ordered per session without locks.
//!
//! ## Modules
//!
//! - [`engine`]: document replication (operational transforms)
//! - [`event_log`]: chat + tasks with server-assigned sequence numbers
//! - [`presence`]: cursor positions and heartbeat liveness
//! - [`session`]: per-document actors and the session registry
//! - [`broadcast`]: origin-tagged fan-out with backpressure
//! - [`protocol`]: binary wire protocol (bincode-encoded messages)
//! - [`server`]: WebSocket transport gateway
//! - [`auth`]: identity collaborator trait
//! - [`storage`]: snapshot persistence (memory and RocksDB backends)

pub mod auth;
pub mod broadcast;
pub mod engine;
pub mod event_log;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod types;

// Re-exports for convenience
pub use auth::{AuthedUser, AuthError, Authenticator, Credentials, StaticDirectory};
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use engine::{
    AppliedOperation, CanonicalPayload, DocumentState, EngineError, FormatSpan, OpPayload,
    Operation, ReplicationEngine, Style,
};
pub use event_log::{ChatMessage, EventLog, EventLogError, TaskChange, TaskEvent, TaskItem};
pub use presence::{PresenceTracker, DEFAULT_HEARTBEAT_TIMEOUT};
pub use protocol::{
    Ack, ClientMessage, ProtocolError, RejectReason, ServerMessage, SessionEvent, TaskAction,
};
pub use server::{Gateway, GatewayConfig, GatewayStats};
pub use session::{
    JoinAccepted, SessionConfig, SessionError, SessionHandle, SessionRegistry,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_GRACE_PERIOD,
};
pub use storage::{
    save_with_backoff, BackoffPolicy, FlushLocks, MemoryBackend, SessionMetadata, SessionSnapshot,
    SessionStore, StorageBackend, StoreConfig, StoreError,
};
pub use types::{
    ConnectionId, CursorPosition, DocCategory, DocMeta, DocStatus, DocumentId, MessageId,
    OperationId, Participant, TaskId, UserId, AGENT_USER_ID,
};
