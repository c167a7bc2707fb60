//! Shared domain types: identifiers, participants, document metadata.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type DocumentId = Uuid;
pub type UserId = Uuid;
pub type ConnectionId = Uuid;
pub type OperationId = Uuid;
pub type TaskId = Uuid;
pub type MessageId = Uuid;

/// Reserved user id for the AI collaborator. It joins sessions through the
/// normal chat/operation interfaces; nothing downstream special-cases it
/// beyond the `is_agent` flag on its [`Participant`].
pub const AGENT_USER_ID: Uuid = Uuid::from_u128(0x00A1_AE57_0000_0000_0000_0000_0000_0001);

/// A connected member of a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub name: String,
    /// RGBA color for cursor rendering, stable per user id.
    pub color: [f32; 4],
    pub is_agent: bool,
}

impl Participant {
    pub fn new(user_id: UserId, connection_id: ConnectionId, name: impl Into<String>) -> Self {
        Self {
            user_id,
            connection_id,
            name: name.into(),
            color: color_from_id(user_id),
            is_agent: user_id == AGENT_USER_ID,
        }
    }
}

/// Stable color from a user id hash.
fn color_from_id(id: Uuid) -> [f32; 4] {
    let hash = id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// A participant's live cursor location, in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f32,
    pub y: f32,
}

impl CursorPosition {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Document category. Closed set, checked at the protocol boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocCategory {
    Personal,
    Work,
    Private,
    Archives,
}

/// Document lifecycle status. Closed set, checked at the protocol boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocStatus {
    Distilling,
    Aged,
    Bottled,
}

/// Descriptive document metadata carried alongside the replicated state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocMeta {
    pub title: String,
    pub category: DocCategory,
    pub status: DocStatus,
}

impl Default for DocMeta {
    fn default() -> Self {
        Self {
            title: String::new(),
            category: DocCategory::Personal,
            status: DocStatus::Distilling,
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_stable_color() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let a = Participant::new(id, Uuid::new_v4(), "Alice");
        let b = Participant::new(id, Uuid::new_v4(), "Alice");
        assert_eq!(a.color, b.color);
    }

    #[test]
    fn test_agent_participant_flagged() {
        let p = Participant::new(AGENT_USER_ID, Uuid::new_v4(), "Distillery AI");
        assert!(p.is_agent);

        let human = Participant::new(Uuid::new_v4(), Uuid::new_v4(), "Bob");
        assert!(!human.is_agent);
    }

    #[test]
    fn test_doc_meta_default() {
        let meta = DocMeta::default();
        assert_eq!(meta.category, DocCategory::Personal);
        assert_eq!(meta.status, DocStatus::Distilling);
        assert!(meta.title.is_empty());
    }
}
