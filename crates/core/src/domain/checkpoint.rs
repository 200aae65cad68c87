use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::message::Message;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointId(pub String);

impl CheckpointId {
    /// Time-ordered id so lexical order follows creation order within a process.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Node the reasoning loop runs next when resuming from a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopNode {
    Agent,
    Tools,
    End,
}

impl LoopNode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Tools => "tools",
            Self::End => "end",
        }
    }
}

/// Accumulated conversation state; this is exactly what a checkpoint snapshots.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub messages: Vec<Message>,
}

impl ConversationState {
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Prepends `instruction` unless the history already holds a system message.
    /// Returns whether a message was inserted.
    pub fn ensure_system_instruction(&mut self, instruction: &str) -> bool {
        if self.messages.iter().any(Message::is_system) {
            return false;
        }
        self.messages.insert(0, Message::system(instruction));
        true
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub created_at: DateTime<Utc>,
    pub state: ConversationState,
    pub next: LoopNode,
}

impl Checkpoint {
    pub fn new(state: ConversationState, next: LoopNode) -> Self {
        Self { id: CheckpointId::generate(), created_at: Utc::now(), state, next }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    Loop,
    Resume,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    pub step: i64,
    /// Node name to number of messages it wrote in the step that produced this checkpoint.
    #[serde(default)]
    pub writes: BTreeMap<String, usize>,
}

impl CheckpointMetadata {
    pub fn for_step(source: CheckpointSource, step: i64, node: LoopNode, written: usize) -> Self {
        let mut writes = BTreeMap::new();
        writes.insert(node.as_str().to_string(), written);
        Self { source, step, writes }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub thread_id: ThreadId,
    pub checkpoint_id: CheckpointId,
}

/// One channel write handed to `put_writes`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelWrite {
    pub channel: String,
    pub value: Value,
}

impl ChannelWrite {
    pub fn new(channel: impl Into<String>, value: Value) -> Self {
        Self { channel: channel.into(), value }
    }
}

/// Intermediate write recorded against a checkpoint before its successor is committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub task_id: String,
    pub idx: u32,
    pub channel: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointTuple {
    pub config: CheckpointRef,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent: Option<CheckpointRef>,
    pub pending_writes: Vec<PendingWrite>,
}

#[cfg(test)]
mod tests {
    use super::{CheckpointId, ConversationState};
    use crate::domain::message::Message;

    #[test]
    fn system_instruction_is_prepended_once() {
        let mut state = ConversationState { messages: vec![Message::human("hello")] };

        assert!(state.ensure_system_instruction("be helpful"));
        assert!(!state.ensure_system_instruction("be helpful"));

        assert_eq!(state.messages.len(), 2);
        assert!(state.messages[0].is_system());
    }

    #[test]
    fn generated_ids_sort_by_creation() {
        let first = CheckpointId::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = CheckpointId::generate();
        assert!(first < second);
    }
}
