//! Error types for the agent runtime

use crate::record::{AgentId, RecordId};
use std::time::Duration;

/// Result type for runtime operations
pub type EffectorResult<T> = Result<T, EffectorError>;

/// Failures surfaced to callers of the registry and agent instances.
///
/// Every variant that concerns a specific agent carries its id, and
/// reducer failures also carry the id of the record being folded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EffectorError {
    #[error("agent {agent_id} not found")]
    NotFound { agent_id: AgentId },

    #[error("agent {agent_id} already exists")]
    AlreadyExists { agent_id: AgentId },

    #[error("agent {agent_id} rejected record {record_id}: {reason}")]
    InputValidation {
        agent_id: AgentId,
        record_id: RecordId,
        reason: String,
    },

    #[error("agent {agent_id} failed to process record {record_id}: {reason}")]
    ExecutionFailure {
        agent_id: AgentId,
        record_id: RecordId,
        reason: String,
    },

    #[error("mailbox of agent {agent_id} stayed full for {timeout:?}")]
    BackpressureTimeout { agent_id: AgentId, timeout: Duration },

    #[error("registry capacity of {max_agents} agents exceeded")]
    CapacityExceeded { max_agents: usize },

    #[error("subscriber of agent {agent_id} lagged behind and skipped {skipped} records")]
    SubscriberLagged { agent_id: AgentId, skipped: u64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EffectorError {
    pub fn not_found(agent_id: &AgentId) -> Self {
        EffectorError::NotFound {
            agent_id: agent_id.clone(),
        }
    }

    /// The agent this failure concerns, if any
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            EffectorError::NotFound { agent_id }
            | EffectorError::AlreadyExists { agent_id }
            | EffectorError::InputValidation { agent_id, .. }
            | EffectorError::ExecutionFailure { agent_id, .. }
            | EffectorError::BackpressureTimeout { agent_id, .. }
            | EffectorError::SubscriberLagged { agent_id, .. } => Some(agent_id),
            EffectorError::CapacityExceeded { .. } | EffectorError::InvalidConfig(_) => None,
        }
    }

    /// The record whose reduction failed, if any
    pub fn record_id(&self) -> Option<RecordId> {
        match self {
            EffectorError::InputValidation { record_id, .. }
            | EffectorError::ExecutionFailure { record_id, .. } => Some(*record_id),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EffectorError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, EffectorError::AlreadyExists { .. })
    }

    pub fn is_backpressure_timeout(&self) -> bool {
        matches!(self, EffectorError::BackpressureTimeout { .. })
    }

    /// True for failures raised by a reducer while folding a record
    pub fn is_reduction_failure(&self) -> bool {
        matches!(
            self,
            EffectorError::InputValidation { .. } | EffectorError::ExecutionFailure { .. }
        )
    }
}

/// Failure returned by a reducer. The processing loop tags it with the
/// agent and record ids before handing it back to the sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReduceError {
    /// The payload does not fit what the reducer expects in this state
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The reducer could not complete the fold
    #[error("{0}")]
    Failed(String),
}

impl ReduceError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        ReduceError::InvalidInput(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        ReduceError::Failed(reason.into())
    }

    pub(crate) fn into_effector(self, agent_id: &AgentId, record_id: RecordId) -> EffectorError {
        match self {
            ReduceError::InvalidInput(reason) => EffectorError::InputValidation {
                agent_id: agent_id.clone(),
                record_id,
                reason,
            },
            ReduceError::Failed(reason) => EffectorError::ExecutionFailure {
                agent_id: agent_id.clone(),
                record_id,
                reason,
            },
        }
    }
}

/// Registry calls made from inside a reducer surface as execution failures
impl From<EffectorError> for ReduceError {
    fn from(error: EffectorError) -> Self {
        ReduceError::Failed(error.to_string())
    }
}
