//! Reducer contract
//!
//! A reducer folds one record into the agent's state. It runs only on the
//! agent's own processing loop, never concurrently with itself, and may
//! await other services (including a registry) while folding.

use crate::error::{EffectorError, EffectorResult, ReduceError};
use crate::mailbox::{Delivery, Mailbox};
use crate::record::{AgentId, Priority, Record};
use async_trait::async_trait;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Weak;

/// State-folding behaviour of one agent type
#[async_trait]
pub trait Reducer: Send + Sync + 'static {
    /// State owned by the agent; callers only ever see clones of it
    type State: Clone + Send + Sync + 'static;

    /// Closed vocabulary of commands and emitted events
    type Message: Clone + Send + Sync + fmt::Debug + 'static;

    /// Short type name used in logs
    fn agent_type(&self) -> &'static str {
        "agent"
    }

    /// Fold `record` into `state`.
    ///
    /// Returning an error leaves the state untouched and discards anything
    /// emitted through `ctx` during this call.
    async fn reduce(
        &self,
        record: &Record<Self::Message>,
        state: Self::State,
        ctx: &mut ReduceContext<Self::Message>,
    ) -> Result<Self::State, ReduceError>;

    /// Called once when the agent is terminated, after its processing loop
    /// has stopped. Release anything the reducer started outside a reduction.
    fn shutdown(&self) {}
}

/// Per-record context handed to a reducer.
///
/// Emissions are buffered and only published after the reduction commits.
pub struct ReduceContext<M> {
    agent_id: AgentId,
    myself: SelfRef<M>,
    emitted: Vec<Record<M>>,
}

impl<M> ReduceContext<M> {
    pub(crate) fn new(agent_id: AgentId, myself: SelfRef<M>) -> Self {
        Self {
            agent_id,
            myself,
            emitted: Vec::new(),
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Emit an `EVENT` record to subscribers
    pub fn emit_event(&mut self, payload: M) {
        let record = Record::event(self.agent_id.clone(), payload);
        self.emitted.push(record);
    }

    /// Emit a `STATE_CHANGE` record to subscribers
    pub fn emit_state_change(&mut self, payload: M) {
        let record = Record::state_change(self.agent_id.clone(), payload);
        self.emitted.push(record);
    }

    /// Emit a fully built record
    pub fn emit(&mut self, record: Record<M>) {
        self.emitted.push(record);
    }

    /// Handle for posting records back to this agent's own mailbox
    pub fn myself(&self) -> SelfRef<M> {
        self.myself.clone()
    }

    pub(crate) fn into_emitted(self) -> Vec<Record<M>> {
        self.emitted
    }
}

/// Weak reference to an agent's own mailbox.
///
/// Lets an agent schedule follow-up records for itself (for example from a
/// task it spawned) without keeping itself alive after termination.
pub struct SelfRef<M> {
    agent_id: AgentId,
    mailbox: Weak<Mailbox<M>>,
}

impl<M> Clone for SelfRef<M> {
    fn clone(&self) -> Self {
        Self {
            agent_id: self.agent_id.clone(),
            mailbox: Weak::clone(&self.mailbox),
        }
    }
}

impl<M> fmt::Debug for SelfRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfRef")
            .field("agent_id", &self.agent_id)
            .finish()
    }
}

impl<M> SelfRef<M> {
    pub(crate) fn new(agent_id: AgentId, mailbox: Weak<Mailbox<M>>) -> Self {
        Self { agent_id, mailbox }
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Enqueue a command for this agent with normal priority.
    ///
    /// Never await the returned delivery from inside the same agent's
    /// reducer: the record cannot be processed until that reduction ends.
    pub async fn post(&self, payload: M) -> EffectorResult<Delivery> {
        self.post_with_priority(payload, Priority::Normal).await
    }

    pub async fn post_with_priority(
        &self,
        payload: M,
        priority: Priority,
    ) -> EffectorResult<Delivery> {
        let mailbox = self
            .mailbox
            .upgrade()
            .ok_or_else(|| EffectorError::not_found(&self.agent_id))?;
        mailbox
            .push(Record::command(self.agent_id.clone(), payload), priority)
            .await
    }
}

/// Adapter turning a synchronous closure into a [`Reducer`]
pub struct FnReducer<S, M, F> {
    name: &'static str,
    fold: F,
    _marker: PhantomData<fn(S, M)>,
}

impl<S, M, F> FnReducer<S, M, F>
where
    F: Fn(&Record<M>, S, &mut ReduceContext<M>) -> Result<S, ReduceError>,
{
    pub fn new(name: &'static str, fold: F) -> Self {
        Self {
            name,
            fold,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<S, M, F> Reducer for FnReducer<S, M, F>
where
    S: Clone + Send + Sync + 'static,
    M: Clone + Send + Sync + fmt::Debug + 'static,
    F: Fn(&Record<M>, S, &mut ReduceContext<M>) -> Result<S, ReduceError>
        + Send
        + Sync
        + 'static,
{
    type State = S;
    type Message = M;

    fn agent_type(&self) -> &'static str {
        self.name
    }

    async fn reduce(
        &self,
        record: &Record<M>,
        state: S,
        ctx: &mut ReduceContext<M>,
    ) -> Result<S, ReduceError> {
        (self.fold)(record, state, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailboxConfig;
    use crate::record::RecordKind;
    use std::sync::Arc;

    fn context(mailbox: &Arc<Mailbox<i64>>) -> ReduceContext<i64> {
        let id = AgentId::new("sum");
        ReduceContext::new(id.clone(), SelfRef::new(id, Arc::downgrade(mailbox)))
    }

    #[tokio::test]
    async fn fn_reducer_folds_and_emits() {
        let mailbox = Arc::new(Mailbox::new(AgentId::new("sum"), &MailboxConfig::default()));
        let reducer = FnReducer::new("sum", |record: &Record<i64>, state: i64, ctx: &mut ReduceContext<i64>| {
            let next = state + record.payload;
            ctx.emit_state_change(next);
            Ok(next)
        });

        let mut ctx = context(&mailbox);
        let next = reducer
            .reduce(&Record::command("sum", 5), 10, &mut ctx)
            .await
            .unwrap();

        assert_eq!(next, 15);
        assert_eq!(reducer.agent_type(), "sum");
        let emitted = ctx.into_emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, RecordKind::StateChange);
        assert_eq!(emitted[0].payload, 15);
    }

    #[tokio::test]
    async fn self_ref_posts_into_own_mailbox() {
        let mailbox = Arc::new(Mailbox::new(AgentId::new("sum"), &MailboxConfig::default()));
        let ctx = context(&mailbox);

        ctx.myself().post(7).await.unwrap();
        assert_eq!(mailbox.len(), 1);
        let envelope = mailbox.recv().await.unwrap();
        assert_eq!(envelope.record.payload, 7);
        assert!(envelope.record.is_command());
    }

    #[tokio::test]
    async fn self_ref_fails_after_agent_is_gone() {
        let mailbox = Arc::new(Mailbox::new(AgentId::new("sum"), &MailboxConfig::default()));
        let myself = context(&mailbox).myself();
        drop(mailbox);

        let err = myself.post(1).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
