//! Record model
//!
//! Records are the immutable envelopes exchanged with and emitted by agents.
//! Nothing in the runtime mutates a record after construction; builders
//! consume `self` and return a new value.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a live agent, chosen by the caller at create time
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate an id of the form `<prefix>-<uuid>`
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}-{}", prefix, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AgentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique identifier of one record instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction and meaning of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    /// Caller to agent: requests an action
    Command,
    /// Agent to observers: reports something happened
    Event,
    /// Agent to observers: reports the state was replaced
    StateChange,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Command => write!(f, "command"),
            RecordKind::Event => write!(f, "event"),
            RecordKind::StateChange => write!(f, "state_change"),
        }
    }
}

/// Mailbox priority for prioritized agents. Ignored by FIFO mailboxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// The unit of communication with an agent.
///
/// `P` is the agent's closed message vocabulary; the runtime never looks
/// inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<P> {
    pub id: RecordId,
    pub agent_id: AgentId,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: RecordKind,
    pub payload: P,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl<P> Record<P> {
    pub fn new(agent_id: impl Into<AgentId>, kind: RecordKind, payload: P) -> Self {
        Self {
            id: RecordId::new(),
            agent_id: agent_id.into(),
            timestamp: chrono::Utc::now(),
            kind,
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn command(agent_id: impl Into<AgentId>, payload: P) -> Self {
        Self::new(agent_id, RecordKind::Command, payload)
    }

    pub fn event(agent_id: impl Into<AgentId>, payload: P) -> Self {
        Self::new(agent_id, RecordKind::Event, payload)
    }

    pub fn state_change(agent_id: impl Into<AgentId>, payload: P) -> Self {
        Self::new(agent_id, RecordKind::StateChange, payload)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_command(&self) -> bool {
        self.kind == RecordKind::Command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ids_are_unique() {
        let a = Record::command("agent", 1u32);
        let b = Record::command("agent", 1u32);
        assert_ne!(a.id, b.id);
        assert_eq!(a.agent_id, b.agent_id);
    }

    #[test]
    fn builders_set_kind_and_metadata() {
        let record = Record::event("agent", "done").with_metadata("source", serde_json::json!("test"));
        assert_eq!(record.kind, RecordKind::Event);
        assert!(!record.is_command());
        assert_eq!(record.metadata["source"], serde_json::json!("test"));
    }

    #[test]
    fn kind_serializes_in_wire_casing() {
        let json = serde_json::to_string(&RecordKind::StateChange).unwrap();
        assert_eq!(json, "\"STATE_CHANGE\"");
    }

    #[test]
    fn priority_orders_critical_highest() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn generated_agent_ids_keep_prefix() {
        let id = AgentId::generate("child");
        assert!(id.as_str().starts_with("child-"));
        assert_ne!(id, AgentId::generate("child"));
    }
}
