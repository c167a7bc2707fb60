//! Ordered event log: chat messages and task items for one session.
//!
//! Every accepted mutation is stamped with the next per-document sequence
//! number at acceptance time, so all observers see the same total order.
//! Client-side timestamps are carried as display metadata only and never
//! affect ordering.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{now_millis, MessageId, TaskId, UserId};

/// One chat message. Append-only; never edited after acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    /// Server-assigned total-order position within the session.
    pub seq: u64,
    pub sender_id: UserId,
    pub text: String,
    pub timestamp: u64,
}

/// One task item. Mutated in place by toggle; removed by delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: TaskId,
    /// Sequence number of the mutation that last touched this task.
    pub seq: u64,
    pub text: String,
    pub completed: bool,
    pub created_by: UserId,
}

/// A task mutation as broadcast to observers, stamped with its sequence
/// number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub seq: u64,
    pub change: TaskChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskChange {
    Added(TaskItem),
    Toggled(TaskItem),
    Removed(TaskId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventLogError {
    /// Toggle on a task id that does not exist (e.g. concurrently deleted).
    NotFound(TaskId),
}

impl std::fmt::Display for EventLogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventLogError::NotFound(id) => write!(f, "task {id} not found"),
        }
    }
}

impl std::error::Error for EventLogError {}

/// Chat + task log for one session. Single-owner, like the replication
/// engine: only the session actor mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLog {
    next_seq: u64,
    messages: Vec<ChatMessage>,
    tasks: Vec<TaskItem>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            next_seq: 0,
            messages: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Rebuild from persisted parts. `next_seq` must be at least one past
    /// the highest stamped sequence number.
    pub fn from_parts(messages: Vec<ChatMessage>, tasks: Vec<TaskItem>, next_seq: u64) -> Self {
        Self {
            next_seq,
            messages,
            tasks,
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn tasks(&self) -> &[TaskItem] {
        &self.tasks
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Append a chat message; returns it stamped with its sequence number.
    pub fn append_message(&mut self, sender_id: UserId, text: String) -> ChatMessage {
        let msg = ChatMessage {
            id: Uuid::new_v4(),
            seq: self.take_seq(),
            sender_id,
            text,
            timestamp: now_millis(),
        };
        self.messages.push(msg.clone());
        msg
    }

    pub fn add_task(&mut self, created_by: UserId, text: String) -> TaskEvent {
        let task = TaskItem {
            id: Uuid::new_v4(),
            seq: self.take_seq(),
            text,
            completed: false,
            created_by,
        };
        self.tasks.push(task.clone());
        TaskEvent {
            seq: task.seq,
            change: TaskChange::Added(task),
        }
    }

    /// Flip completion. Unknown id is an error and consumes no sequence
    /// number; the caller must not broadcast anything for it.
    pub fn toggle_task(&mut self, task_id: TaskId) -> Result<TaskEvent, EventLogError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or(EventLogError::NotFound(task_id))?;
        task.completed = !task.completed;
        task.seq = {
            let seq = self.next_seq;
            self.next_seq += 1;
            seq
        };
        let snapshot = task.clone();
        Ok(TaskEvent {
            seq: snapshot.seq,
            change: TaskChange::Toggled(snapshot),
        })
    }

    /// Remove a task. Deleting an already-deleted id is a no-op success
    /// with no event, so racing deletes both succeed.
    pub fn delete_task(&mut self, task_id: TaskId) -> Option<TaskEvent> {
        let idx = self.tasks.iter().position(|t| t.id == task_id)?;
        self.tasks.remove(idx);
        let seq = self.take_seq();
        Some(TaskEvent {
            seq,
            change: TaskChange::Removed(task_id),
        })
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
