//! Binary wire protocol between clients and the gateway.
//!
//! Messages are bincode-encoded enums carried in WebSocket binary frames.
//! The first client frame on a connection must be [`ClientMessage::Join`];
//! every mutating message is answered with exactly one [`ServerMessage::Ack`]
//! or [`ServerMessage::Rejected`], while presence and heartbeat frames are
//! fire-and-forget. Everything else a client receives is a
//! [`ServerMessage::Event`] fanned out from its session.

use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::engine::{AppliedOperation, DocumentState, Operation};
use crate::event_log::{ChatMessage, TaskEvent, TaskItem};
use crate::types::{CursorPosition, DocMeta, DocumentId, MessageId, OperationId, Participant, TaskId, UserId};

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Must be the first frame on a connection.
    Join {
        credentials: Credentials,
        document_id: DocumentId,
    },
    Leave,
    Operation(Operation),
    /// Fire-and-forget cursor update. Never acked.
    Presence { position: CursorPosition },
    /// Explicit liveness signal for otherwise idle clients.
    Heartbeat,
    Chat { text: String },
    Task(TaskAction),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskAction {
    Add { text: String },
    Toggle { task_id: TaskId },
    Delete { task_id: TaskId },
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join accepted: the full session snapshot as of admission.
    Joined {
        participant: Participant,
        participants: Vec<Participant>,
        document: DocumentState,
        meta: DocMeta,
        messages: Vec<ChatMessage>,
        tasks: Vec<TaskItem>,
    },
    Ack(Ack),
    Rejected(RejectReason),
    Event(SessionEvent),
}

/// Positive response to a mutating message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Ack {
    Operation { op_id: OperationId, revision: u64 },
    Chat { id: MessageId, seq: u64 },
    /// `seq` is None for an idempotent no-op (deleting an absent task).
    Task { seq: Option<u64> },
}

/// Why a frame was refused. Mirrors the per-module error taxonomy so
/// clients can distinguish drop-and-continue from resync-required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    MalformedOperation(String),
    StaleOperation {
        origin_revision: u64,
        oldest_retained: u64,
    },
    /// The session was torn down mid-request; reconnect and rejoin.
    StaleSession,
    StorageUnavailable,
    AuthRejected,
    NotFound,
    SessionFull,
}

/// Session-scoped events fanned out to every participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    OperationApplied(AppliedOperation),
    Presence {
        user_id: UserId,
        position: CursorPosition,
    },
    Chat(ChatMessage),
    Task(TaskEvent),
    ParticipantJoined(Participant),
    ParticipantLeft {
        user_id: UserId,
    },
}

/// Protocol errors. Transport disconnects are normal leave processing at
/// the gateway, never surfaced through here.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A text or otherwise non-binary frame where a binary one is required.
    InvalidFrame,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidFrame => write!(f, "Invalid frame"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::OpPayload;
    use uuid::Uuid;

    #[test]
    fn test_join_roundtrip() {
        let msg = ClientMessage::Join {
            credentials: Credentials {
                email: "testuser1@gmail.com".into(),
                secret: "123456789".into(),
            },
            document_id: Uuid::new_v4(),
        };
        let bytes = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_operation_roundtrip() {
        let msg = ClientMessage::Operation(Operation {
            op_id: Uuid::new_v4(),
            origin_revision: 17,
            participant_id: Uuid::new_v4(),
            payload: OpPayload::Insert {
                index: 4,
                text: "angel's share".into(),
            },
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(ClientMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_server_event_roundtrip() {
        let msg = ServerMessage::Event(SessionEvent::Presence {
            user_id: Uuid::new_v4(),
            position: CursorPosition::new(120.5, 48.0),
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_reject_reason_roundtrip() {
        let msg = ServerMessage::Rejected(RejectReason::StaleOperation {
            origin_revision: 3,
            oldest_retained: 9,
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(ClientMessage::decode(&garbage).is_err());
        assert!(ServerMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_heartbeat_is_tiny() {
        let bytes = ClientMessage::Heartbeat.encode().unwrap();
        assert!(bytes.len() <= 4, "heartbeat frame {} bytes", bytes.len());
    }
}
