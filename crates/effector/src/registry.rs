//! Agent registry
//!
//! Owns the id → running agent map and the externally visible lifecycle.
//! Per id the registry moves through `absent → live → terminating → absent`:
//! the existence check and the insert on create, and the existence check and
//! the terminating mark on terminate, are each a single read-modify-write on
//! the map entry. A terminating agent is indistinguishable from an absent one
//! for every other operation.

use crate::config::{EffectorConfig, MailboxConfig};
use crate::error::{EffectorError, EffectorResult};
use crate::instance::{AgentInstance, AgentStats, RecordStream};
use crate::mailbox::Delivery;
use crate::record::{AgentId, Priority, Record};
use crate::reducer::Reducer;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct RegistryEntry<R: Reducer> {
    instance: Arc<AgentInstance<R>>,
    fiber: Option<JoinHandle<()>>,
    terminating: bool,
}

/// Registry of independently running agents sharing one reducer type.
///
/// Cheap to clone; clones share the same map. Separate `Registry::new`
/// calls produce fully independent registries.
pub struct Registry<R: Reducer> {
    agents: Arc<DashMap<AgentId, RegistryEntry<R>>>,
    config: Arc<EffectorConfig>,
}

impl<R: Reducer> Clone for Registry<R> {
    fn clone(&self) -> Self {
        Self {
            agents: Arc::clone(&self.agents),
            config: Arc::clone(&self.config),
        }
    }
}

impl<R: Reducer> fmt::Debug for Registry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("agents", &self.agents.len())
            .field("max_agents", &self.config.max_agents)
            .finish()
    }
}

impl<R: Reducer> Registry<R> {
    pub fn new(config: EffectorConfig) -> EffectorResult<Self> {
        config.validate()?;
        info!(max_agents = config.max_agents, "Agent registry created");
        Ok(Self {
            agents: Arc::new(DashMap::new()),
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &EffectorConfig {
        &self.config
    }

    /// Create an agent using the registry's default mailbox
    pub fn create(
        &self,
        id: impl Into<AgentId>,
        initial_state: R::State,
        reducer: R,
    ) -> EffectorResult<AgentHandle<R>> {
        let mailbox = self.config.mailbox.clone();
        self.create_with_mailbox(id, initial_state, reducer, mailbox)
    }

    /// Create an agent and start its processing loop.
    ///
    /// Fails with `AlreadyExists` while an agent with this id is live or
    /// terminating.
    pub fn create_with_mailbox(
        &self,
        id: impl Into<AgentId>,
        initial_state: R::State,
        reducer: R,
        mailbox: MailboxConfig,
    ) -> EffectorResult<AgentHandle<R>> {
        let id = id.into();
        mailbox.validate()?;

        if self.agents.len() >= self.config.max_agents {
            warn!(agent_id = %id, max_agents = self.config.max_agents, "Registry at capacity");
            return Err(EffectorError::CapacityExceeded {
                max_agents: self.config.max_agents,
            });
        }

        match self.agents.entry(id.clone()) {
            Entry::Occupied(_) => {
                debug!(agent_id = %id, "Create rejected, id in use");
                Err(EffectorError::AlreadyExists { agent_id: id })
            }
            Entry::Vacant(vacant) => {
                let instance = Arc::new(AgentInstance::new(
                    id.clone(),
                    initial_state,
                    reducer,
                    &mailbox,
                    self.config.subscriber_buffer,
                ));
                let fiber = instance.start_processing();
                info!(agent_id = %id, agent_type = %instance.agent_type(), "Agent created");

                vacant.insert(RegistryEntry {
                    instance,
                    fiber: Some(fiber),
                    terminating: false,
                });

                Ok(AgentHandle {
                    id,
                    registry: self.clone(),
                })
            }
        }
    }

    /// Stop an agent and free its id.
    ///
    /// Exactly one of several concurrent calls for the same id succeeds; the
    /// others, and any call for an absent id, fail with `NotFound`. The id
    /// stays reserved until the processing loop has stopped (or the shutdown
    /// timeout elapsed), so a create for the same id cannot overlap the old
    /// agent.
    pub async fn terminate(&self, id: &AgentId) -> EffectorResult<()> {
        let (instance, fiber) = {
            let mut entry = self
                .agents
                .get_mut(id)
                .ok_or_else(|| EffectorError::not_found(id))?;
            if entry.terminating {
                return Err(EffectorError::not_found(id));
            }
            entry.terminating = true;
            (Arc::clone(&entry.instance), entry.fiber.take())
        };

        info!(agent_id = %id, "Terminating agent");

        match fiber {
            // Called from the agent's own reducer: the loop cannot be awaited
            // from inside itself, so release first and let the abort land on
            // the next yield.
            Some(fiber) if tokio::task::try_id() == Some(fiber.id()) => {
                instance.terminate();
                self.agents.remove(id);
                fiber.abort();
            }
            Some(fiber) => {
                fiber.abort();
                self.await_fiber(id, fiber).await;
                instance.terminate();
                self.agents.remove(id);
            }
            None => {
                instance.terminate();
                self.agents.remove(id);
            }
        }

        info!(agent_id = %id, "Agent terminated");
        Ok(())
    }

    async fn await_fiber(&self, id: &AgentId, fiber: JoinHandle<()>) {
        match tokio::time::timeout(self.config.shutdown_timeout(), fiber).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_cancelled() => {}
            Ok(Err(e)) => {
                error!(agent_id = %id, error = %e, "Agent fiber ended abnormally");
            }
            Err(_) => {
                warn!(agent_id = %id, "Agent fiber did not stop within shutdown timeout");
            }
        }
    }

    /// Enqueue a record and wait for it to be folded
    pub async fn send(&self, id: &AgentId, record: Record<R::Message>) -> EffectorResult<()> {
        self.lookup(id)?.send(record).await
    }

    /// Enqueue a record without waiting for it to be folded
    pub async fn post(&self, id: &AgentId, record: Record<R::Message>) -> EffectorResult<Delivery> {
        self.lookup(id)?.post(record).await
    }

    pub async fn post_with_priority(
        &self,
        id: &AgentId,
        record: Record<R::Message>,
        priority: Priority,
    ) -> EffectorResult<Delivery> {
        self.lookup(id)?.post_with_priority(record, priority).await
    }

    pub fn get_state(&self, id: &AgentId) -> EffectorResult<R::State> {
        Ok(self.lookup(id)?.get_state())
    }

    pub fn watch_state(&self, id: &AgentId) -> EffectorResult<watch::Receiver<R::State>> {
        Ok(self.lookup(id)?.watch_state())
    }

    /// Subscribe to an agent's emissions. Lookup failure is delivered
    /// through the stream itself.
    pub fn subscribe(&self, id: &AgentId) -> RecordStream<R::Message> {
        match self.lookup(id) {
            Ok(instance) => instance.subscribe(),
            Err(e) => RecordStream::failed(e),
        }
    }

    pub fn stats(&self, id: &AgentId) -> EffectorResult<AgentStats> {
        Ok(self.lookup(id)?.stats())
    }

    /// Handle bound to an existing live agent
    pub fn handle(&self, id: &AgentId) -> EffectorResult<AgentHandle<R>> {
        self.lookup(id)?;
        Ok(AgentHandle {
            id: id.clone(),
            registry: self.clone(),
        })
    }

    /// Ids of all live agents, sorted
    pub fn list(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .agents
            .iter()
            .filter(|entry| !entry.terminating)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.lookup(id).is_ok()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Terminate every live agent
    pub async fn shutdown(&self) {
        let ids = self.list();
        info!(agents = ids.len(), "Shutting down agent registry");

        for id in ids {
            if let Err(e) = self.terminate(&id).await {
                debug!(agent_id = %id, error = %e, "Agent already gone during shutdown");
            }
        }
    }

    fn lookup(&self, id: &AgentId) -> EffectorResult<Arc<AgentInstance<R>>> {
        match self.agents.get(id) {
            Some(entry) if !entry.terminating => Ok(Arc::clone(&entry.instance)),
            _ => Err(EffectorError::not_found(id)),
        }
    }
}

/// Handle to one agent, routed through its registry on every call so a
/// terminated agent is reported as `NotFound`.
pub struct AgentHandle<R: Reducer> {
    id: AgentId,
    registry: Registry<R>,
}

impl<R: Reducer> Clone for AgentHandle<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<R: Reducer> fmt::Debug for AgentHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentHandle").field("id", &self.id).finish()
    }
}

impl<R: Reducer> AgentHandle<R> {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Send a command payload and wait for it to be folded
    pub async fn send(&self, payload: R::Message) -> EffectorResult<()> {
        self.send_record(Record::command(self.id.clone(), payload))
            .await
    }

    pub async fn send_record(&self, record: Record<R::Message>) -> EffectorResult<()> {
        self.registry.send(&self.id, record).await
    }

    /// Enqueue a command payload without waiting for it to be folded
    pub async fn post(&self, payload: R::Message) -> EffectorResult<Delivery> {
        self.registry
            .post(&self.id, Record::command(self.id.clone(), payload))
            .await
    }

    pub async fn post_with_priority(
        &self,
        payload: R::Message,
        priority: Priority,
    ) -> EffectorResult<Delivery> {
        self.registry
            .post_with_priority(&self.id, Record::command(self.id.clone(), payload), priority)
            .await
    }

    pub fn get_state(&self) -> EffectorResult<R::State> {
        self.registry.get_state(&self.id)
    }

    pub fn watch_state(&self) -> EffectorResult<watch::Receiver<R::State>> {
        self.registry.watch_state(&self.id)
    }

    pub fn subscribe(&self) -> RecordStream<R::Message> {
        self.registry.subscribe(&self.id)
    }

    pub fn stats(&self) -> EffectorResult<AgentStats> {
        self.registry.stats(&self.id)
    }

    pub async fn terminate(&self) -> EffectorResult<()> {
        self.registry.terminate(&self.id).await
    }
}
