//! Persistence for session snapshots.
//!
//! The [`StorageBackend`] trait is the boundary: the session actor loads a
//! snapshot on first join and saves one on periodic flush and teardown.
//! Storage failures degrade durability (the save is retried with backoff)
//! but never corrupt in-memory session state.
//!
//! ```text
//! ┌───────────────┐  load / save   ┌──────────────────┐
//! │ session actor │ ─────────────► │ StorageBackend   │
//! │ (in-memory)   │                │  MemoryBackend   │
//! └───────────────┘                │  SessionStore    │ (RocksDB, LZ4)
//!                                  └──────────────────┘
//! ```

pub mod rocks;

pub use rocks::{SessionMetadata, SessionStore, StoreConfig};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::engine::DocumentState;
use crate::event_log::{ChatMessage, EventLog, TaskItem};
use crate::types::{DocMeta, DocumentId};

/// Everything a rejoin needs to observe identical session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub meta: DocMeta,
    pub document: DocumentState,
    pub messages: Vec<ChatMessage>,
    pub tasks: Vec<TaskItem>,
    pub next_seq: u64,
}

impl SessionSnapshot {
    pub fn empty() -> Self {
        Self {
            meta: DocMeta::default(),
            document: DocumentState::new(),
            messages: Vec::new(),
            tasks: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn capture(meta: &DocMeta, document: &DocumentState, log: &EventLog) -> Self {
        Self {
            meta: meta.clone(),
            document: document.clone(),
            messages: log.messages().to_vec(),
            tasks: log.tasks().to_vec(),
            next_seq: log.next_seq(),
        }
    }
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    DatabaseError(String),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    /// Backend temporarily unavailable; the caller may retry.
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable snapshot storage. Implementations must be safe to call from
/// multiple sessions concurrently; per-document write ordering is the
/// caller's job (see [`FlushLocks`]).
pub trait StorageBackend: Send + Sync {
    /// Load the snapshot for a document. `None` means the document has never
    /// been persisted; the session starts empty.
    fn load(&self, document_id: DocumentId) -> Result<Option<SessionSnapshot>, StoreError>;

    fn save(&self, document_id: DocumentId, snapshot: &SessionSnapshot) -> Result<(), StoreError>;
}

/// Retry schedule for snapshot saves.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max_attempts: 5,
        }
    }
}

/// Save with exponential backoff: base delay, doubling per attempt. Returns
/// the last error once attempts are exhausted; the caller keeps its
/// in-memory state either way.
pub async fn save_with_backoff(
    backend: &dyn StorageBackend,
    document_id: DocumentId,
    snapshot: &SessionSnapshot,
    policy: BackoffPolicy,
) -> Result<(), StoreError> {
    let mut delay = policy.base;
    let mut last_err = StoreError::Unavailable("no attempts configured".into());
    for attempt in 1..=policy.max_attempts.max(1) {
        match backend.save(document_id, snapshot) {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!(
                    "snapshot save failed for {document_id} (attempt {attempt}/{}): {e}",
                    policy.max_attempts
                );
                last_err = e;
            }
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(delay).await;
            delay *= 2;
        }
    }
    Err(last_err)
}

/// Per-document async locks so a periodic flush and a teardown flush never
/// interleave their writes to the same persisted record.
#[derive(Default)]
pub struct FlushLocks {
    locks: Mutex<HashMap<DocumentId, Arc<AsyncMutex<()>>>>,
}

impl FlushLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, document_id: DocumentId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(document_id)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// In-memory backend for tests, with injectable failures for exercising the
/// backoff path.
#[derive(Default)]
pub struct MemoryBackend {
    snapshots: Mutex<HashMap<DocumentId, SessionSnapshot>>,
    fail_remaining: AtomicU32,
    saves: AtomicU32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<DocumentId, SessionSnapshot>> {
        match self.snapshots.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn load(&self, document_id: DocumentId) -> Result<Option<SessionSnapshot>, StoreError> {
        Ok(self.map().get(&document_id).cloned())
    }

    fn save(&self, document_id: DocumentId, snapshot: &SessionSnapshot) -> Result<(), StoreError> {
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        self.map().insert(document_id, snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn snapshot_with_content(content: &str) -> SessionSnapshot {
        SessionSnapshot {
            document: DocumentState::with_content(content),
            ..SessionSnapshot::empty()
        }
    }

    #[test]
    fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        let doc = Uuid::new_v4();
        assert!(backend.load(doc).unwrap().is_none());

        let snap = snapshot_with_content("single malt");
        backend.save(doc, &snap).unwrap();
        assert_eq!(backend.load(doc).unwrap(), Some(snap));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_retries_until_success() {
        let backend = MemoryBackend::new();
        backend.fail_next(2);
        let doc = Uuid::new_v4();
        let snap = snapshot_with_content("batch 12");

        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max_attempts: 5,
        };
        save_with_backoff(&backend, doc, &snap, policy).await.unwrap();
        assert_eq!(backend.save_count(), 1);
        assert_eq!(backend.load(doc).unwrap(), Some(snap));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up_after_max_attempts() {
        let backend = MemoryBackend::new();
        backend.fail_next(10);
        let doc = Uuid::new_v4();
        let snap = SessionSnapshot::empty();

        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max_attempts: 3,
        };
        let r = save_with_backoff(&backend, doc, &snap, policy).await;
        assert!(matches!(r, Err(StoreError::Unavailable(_))));
        assert_eq!(backend.save_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_locks_serialize_same_document() {
        let locks = Arc::new(FlushLocks::new());
        let doc = Uuid::new_v4();

        let guard = locks.acquire(doc).await;
        let locks2 = locks.clone();
        let contender = tokio::spawn(async move {
            let _g = locks2.acquire(doc).await;
        });

        // Held lock blocks the contender.
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_locks_independent_documents() {
        let locks = FlushLocks::new();
        let _a = locks.acquire(Uuid::new_v4()).await;
        // A different document's lock is acquired without waiting.
        let _b = locks.acquire(Uuid::new_v4()).await;
    }
}
