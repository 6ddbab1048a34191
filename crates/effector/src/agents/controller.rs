//! Controller agent
//!
//! An agent that manages other agents. Its reducer calls back into a child
//! registry while folding, so creating and terminating children is ordered
//! with every other command the controller receives.

use crate::error::{EffectorResult, ReduceError};
use crate::record::{AgentId, Record};
use crate::reducer::{ReduceContext, Reducer};
use crate::registry::Registry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Capability to create and terminate child agents
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChildLifecycle: Send + Sync + 'static {
    async fn spawn_child(&self, id: &AgentId) -> EffectorResult<()>;

    async fn terminate_child(&self, id: &AgentId) -> EffectorResult<()>;
}

type ChildFactory<R> =
    dyn Fn(&AgentId) -> (<R as Reducer>::State, R) + Send + Sync + 'static;

/// Children of one reducer type living in a dedicated registry
pub struct ChildPool<R: Reducer> {
    registry: Registry<R>,
    factory: Arc<ChildFactory<R>>,
}

impl<R: Reducer> ChildPool<R> {
    /// `factory` builds the initial state and reducer for each new child
    pub fn new<F>(registry: Registry<R>, factory: F) -> Self
    where
        F: Fn(&AgentId) -> (R::State, R) + Send + Sync + 'static,
    {
        Self {
            registry,
            factory: Arc::new(factory),
        }
    }

    pub fn registry(&self) -> &Registry<R> {
        &self.registry
    }
}

#[async_trait]
impl<R: Reducer> ChildLifecycle for ChildPool<R> {
    async fn spawn_child(&self, id: &AgentId) -> EffectorResult<()> {
        let (state, reducer) = (self.factory)(id);
        self.registry.create(id.clone(), state, reducer)?;
        Ok(())
    }

    async fn terminate_child(&self, id: &AgentId) -> EffectorResult<()> {
        self.registry.terminate(id).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    pub managed_ids: Vec<AgentId>,
}

impl ControllerState {
    pub fn manages(&self, id: &AgentId) -> bool {
        self.managed_ids.contains(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControllerMessage {
    /// Create a child, with a generated id unless one is given
    CreateChild { child_id: Option<AgentId> },
    TerminateChild { child_id: AgentId },
    /// Terminate every managed child
    TerminateAll,
    ChildCreated { child_id: AgentId },
    ChildTerminated { child_id: AgentId },
}

pub struct ControllerReducer {
    children: Arc<dyn ChildLifecycle>,
}

impl ControllerReducer {
    pub fn new(children: Arc<dyn ChildLifecycle>) -> Self {
        Self { children }
    }
}

impl fmt::Debug for ControllerReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerReducer").finish_non_exhaustive()
    }
}

#[async_trait]
impl Reducer for ControllerReducer {
    type State = ControllerState;
    type Message = ControllerMessage;

    fn agent_type(&self) -> &'static str {
        "controller"
    }

    async fn reduce(
        &self,
        record: &Record<ControllerMessage>,
        mut state: ControllerState,
        ctx: &mut ReduceContext<ControllerMessage>,
    ) -> Result<ControllerState, ReduceError> {
        match &record.payload {
            ControllerMessage::CreateChild { child_id } => {
                let child_id = child_id
                    .clone()
                    .unwrap_or_else(|| AgentId::generate(&format!("{}-child", ctx.agent_id())));
                if state.manages(&child_id) {
                    return Err(ReduceError::invalid(format!(
                        "child {child_id} is already managed"
                    )));
                }

                self.children.spawn_child(&child_id).await?;
                debug!(controller = %ctx.agent_id(), child = %child_id, "Child created");

                state.managed_ids.push(child_id.clone());
                ctx.emit_event(ControllerMessage::ChildCreated { child_id });
            }
            ControllerMessage::TerminateChild { child_id } => {
                if !state.manages(child_id) {
                    return Err(ReduceError::invalid(format!(
                        "child {child_id} is not managed by this controller"
                    )));
                }

                self.children.terminate_child(child_id).await?;
                debug!(controller = %ctx.agent_id(), child = %child_id, "Child terminated");

                state.managed_ids.retain(|id| id != child_id);
                ctx.emit_event(ControllerMessage::ChildTerminated {
                    child_id: child_id.clone(),
                });
            }
            ControllerMessage::TerminateAll => {
                for child_id in std::mem::take(&mut state.managed_ids) {
                    match self.children.terminate_child(&child_id).await {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {
                            warn!(controller = %ctx.agent_id(), child = %child_id, "Managed child already gone");
                        }
                        Err(e) => return Err(e.into()),
                    }
                    ctx.emit_event(ControllerMessage::ChildTerminated { child_id });
                }
            }
            ControllerMessage::ChildCreated { .. } | ControllerMessage::ChildTerminated { .. } => {
                return Err(ReduceError::invalid("controller events cannot be sent as commands"));
            }
        }

        Ok(state)
    }
}
