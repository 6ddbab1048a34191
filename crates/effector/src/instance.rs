//! Agent instance
//!
//! One running state machine: a state cell written only by its own
//! processing loop, a bounded mailbox, and a broadcast stream of the records
//! its reductions emit.

use crate::config::MailboxConfig;
use crate::error::{EffectorError, EffectorResult};
use crate::mailbox::{Delivery, Envelope, Mailbox};
use crate::record::{AgentId, Priority, Record};
use crate::reducer::{ReduceContext, Reducer, SelfRef};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;
use tracing::{debug, error, info, trace, warn};

/// Point-in-time counters for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStats {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub processed: u64,
    pub failed: u64,
    pub queued: usize,
    pub subscribers: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A single running agent
pub struct AgentInstance<R: Reducer> {
    id: AgentId,
    reducer: R,
    mailbox: Arc<Mailbox<R::Message>>,
    state: watch::Sender<R::State>,
    emitter: Mutex<Option<broadcast::Sender<Record<R::Message>>>>,
    processed: AtomicU64,
    failed: AtomicU64,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl<R: Reducer> AgentInstance<R> {
    pub fn new(
        id: AgentId,
        initial_state: R::State,
        reducer: R,
        mailbox: &MailboxConfig,
        subscriber_buffer: usize,
    ) -> Self {
        let (state, _) = watch::channel(initial_state);
        let (emitter, _) = broadcast::channel(subscriber_buffer.max(1));

        Self {
            mailbox: Arc::new(Mailbox::new(id.clone(), mailbox)),
            id,
            reducer,
            state,
            emitter: Mutex::new(Some(emitter)),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            created_at: chrono::Utc::now(),
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn agent_type(&self) -> &'static str {
        self.reducer.agent_type()
    }

    /// Enqueue a record without waiting for it to be processed
    pub async fn post(&self, record: Record<R::Message>) -> EffectorResult<Delivery> {
        self.mailbox.push(record, Priority::Normal).await
    }

    /// Enqueue with an explicit priority (only honored by priority mailboxes)
    pub async fn post_with_priority(
        &self,
        record: Record<R::Message>,
        priority: Priority,
    ) -> EffectorResult<Delivery> {
        self.mailbox.push(record, priority).await
    }

    /// Enqueue a record and wait for its reduction to finish
    pub async fn send(&self, record: Record<R::Message>) -> EffectorResult<()> {
        self.post(record).await?.outcome().await
    }

    /// State as of the most recently committed record
    pub fn get_state(&self) -> R::State {
        self.state.borrow().clone()
    }

    /// Receiver notified on every committed state
    pub fn watch_state(&self) -> watch::Receiver<R::State> {
        self.state.subscribe()
    }

    /// Live stream of emitted records, starting now
    pub fn subscribe(&self) -> RecordStream<R::Message> {
        match self.emitter.lock().as_ref() {
            Some(emitter) => RecordStream::live(self.id.clone(), emitter.subscribe()),
            None => RecordStream::failed(EffectorError::not_found(&self.id)),
        }
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            agent_id: self.id.clone(),
            agent_type: self.agent_type().to_string(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            queued: self.mailbox.len(),
            subscribers: self
                .emitter
                .lock()
                .as_ref()
                .map(|emitter| emitter.receiver_count())
                .unwrap_or(0),
            created_at: self.created_at,
        }
    }

    /// Spawn the processing loop. The owner keeps the handle so it can
    /// interrupt the loop at termination.
    pub fn start_processing(self: &Arc<Self>) -> JoinHandle<()> {
        let instance = Arc::clone(self);
        tokio::spawn(async move { instance.run().await })
    }

    /// Release the mailbox, complete all subscription streams and run the
    /// reducer's shutdown hook.
    ///
    /// Does not stop the processing loop; the owner interrupts it first.
    pub fn terminate(&self) {
        let dropped = self.mailbox.close();
        let emitter = self.emitter.lock().take();
        drop(emitter);
        self.reducer.shutdown();
        debug!(agent_id = %self.id, dropped, "Agent resources released");
    }

    fn myself(&self) -> SelfRef<R::Message> {
        SelfRef::new(self.id.clone(), Arc::downgrade(&self.mailbox))
    }

    async fn run(self: Arc<Self>) {
        let _guard = CloseOnExit {
            agent_id: self.id.clone(),
            mailbox: Arc::clone(&self.mailbox),
        };
        info!(agent_id = %self.id, agent_type = %self.agent_type(), "Agent processing started");

        while let Some(envelope) = self.mailbox.recv().await {
            let Envelope {
                record,
                reply,
                slot,
            } = envelope;
            drop(slot);

            let result = self.process(&record).await;
            if reply.send(result).is_err() {
                trace!(agent_id = %self.id, record_id = %record.id, "Sender no longer waiting");
            }
        }

        debug!(agent_id = %self.id, "Agent processing stopped");
    }

    async fn process(&self, record: &Record<R::Message>) -> EffectorResult<()> {
        let current = self.state.borrow().clone();
        let mut ctx = ReduceContext::new(self.id.clone(), self.myself());

        match self.reducer.reduce(record, current, &mut ctx).await {
            Ok(next) => {
                self.state.send_replace(next);
                self.processed.fetch_add(1, Ordering::Relaxed);
                self.publish(ctx.into_emitted());
                debug!(agent_id = %self.id, record_id = %record.id, "Record processed");
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let error = e.into_effector(&self.id, record.id);
                warn!(agent_id = %self.id, record_id = %record.id, error = %error, "Reduction failed");
                Err(error)
            }
        }
    }

    fn publish(&self, records: Vec<Record<R::Message>>) {
        if records.is_empty() {
            return;
        }
        let emitter = self.emitter.lock();
        if let Some(emitter) = emitter.as_ref() {
            for record in records {
                // No receivers is not an error
                let _ = emitter.send(record);
            }
        }
    }
}

/// Closes the mailbox when the processing loop exits for any reason, so a
/// panicking reducer cannot leave senders waiting forever.
struct CloseOnExit<M> {
    agent_id: AgentId,
    mailbox: Arc<Mailbox<M>>,
}

impl<M> Drop for CloseOnExit<M> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(agent_id = %self.agent_id, "Agent processing loop panicked");
        }
        self.mailbox.close();
    }
}

/// Stream of records emitted by one agent.
///
/// Lookup failures and subscriber lag are delivered as `Err` items; the
/// stream ends when the agent terminates.
pub struct RecordStream<M> {
    inner: StreamInner<M>,
}

enum StreamInner<M> {
    Live {
        agent_id: AgentId,
        records: BroadcastStream<Record<M>>,
    },
    Failed(Option<EffectorError>),
}

impl<M: Clone + Send + 'static> RecordStream<M> {
    fn live(agent_id: AgentId, receiver: broadcast::Receiver<Record<M>>) -> Self {
        Self {
            inner: StreamInner::Live {
                agent_id,
                records: BroadcastStream::new(receiver),
            },
        }
    }
}

impl<M> RecordStream<M> {
    /// A stream that yields `error` once and ends
    pub(crate) fn failed(error: EffectorError) -> Self {
        Self {
            inner: StreamInner::Failed(Some(error)),
        }
    }
}

impl<M: Clone + Send + 'static> Stream for RecordStream<M> {
    type Item = EffectorResult<Record<M>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().inner {
            StreamInner::Live { agent_id, records } => match Pin::new(records).poll_next(cx) {
                Poll::Ready(Some(Ok(record))) => Poll::Ready(Some(Ok(record))),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(agent_id = %agent_id, skipped, "Subscriber lagged");
                    Poll::Ready(Some(Err(EffectorError::SubscriberLagged {
                        agent_id: agent_id.clone(),
                        skipped,
                    })))
                }
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
            StreamInner::Failed(error) => Poll::Ready(error.take().map(Err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReduceError;
    use crate::reducer::FnReducer;
    use crate::record::RecordKind;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    type AddFn = fn(&Record<i64>, i64, &mut ReduceContext<i64>) -> Result<i64, ReduceError>;
    type Adder = FnReducer<i64, i64, AddFn>;

    fn add(record: &Record<i64>, state: i64, ctx: &mut ReduceContext<i64>) -> Result<i64, ReduceError> {
        if record.payload < 0 {
            return Err(ReduceError::invalid("negative amounts are not accepted"));
        }
        let next = state + record.payload;
        ctx.emit_state_change(next);
        Ok(next)
    }

    fn adder(mailbox: MailboxConfig) -> Arc<AgentInstance<Adder>> {
        let reducer: Adder = FnReducer::new("adder", add as AddFn);
        Arc::new(AgentInstance::new(AgentId::new("adder"), 0, reducer, &mailbox, 16))
    }

    #[tokio::test]
    async fn folds_records_in_order() {
        let instance = adder(MailboxConfig::default());
        let _fiber = instance.start_processing();

        for amount in [1, 2, 3] {
            instance.send(Record::command("adder", amount)).await.unwrap();
        }
        assert_eq!(instance.get_state(), 6);
        assert_eq!(instance.stats().processed, 3);
    }

    #[tokio::test]
    async fn failed_reduction_keeps_state_and_loop() {
        let instance = adder(MailboxConfig::default());
        let _fiber = instance.start_processing();

        instance.send(Record::command("adder", 4)).await.unwrap();
        let bad = Record::command("adder", -1);
        let bad_id = bad.id;
        let err = instance.send(bad).await.unwrap_err();
        assert!(matches!(err, EffectorError::InputValidation { .. }));
        assert_eq!(err.record_id(), Some(bad_id));

        instance.send(Record::command("adder", 1)).await.unwrap();
        assert_eq!(instance.get_state(), 5);

        let stats = instance.stats();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.agent_type, "adder");
    }

    #[tokio::test]
    async fn unstarted_instance_applies_backpressure() {
        let instance = adder(
            MailboxConfig::bounded(1).with_backpressure_timeout(Duration::from_millis(25)),
        );

        let first = instance.post(Record::command("adder", 1)).await;
        let second = instance.post(Record::command("adder", 2)).await;
        assert!(first.is_ok());
        assert!(second.unwrap_err().is_backpressure_timeout());
    }

    #[tokio::test]
    async fn subscribers_see_emissions_after_subscribing() {
        let instance = adder(MailboxConfig::default());
        let _fiber = instance.start_processing();

        instance.send(Record::command("adder", 1)).await.unwrap();
        let mut first = instance.subscribe();
        let mut second = instance.subscribe();
        assert_eq!(instance.stats().subscribers, 2);

        instance.send(Record::command("adder", 2)).await.unwrap();
        instance.send(Record::command("adder", 3)).await.unwrap();

        for stream in [&mut first, &mut second] {
            let a = stream.next().await.unwrap().unwrap();
            let b = stream.next().await.unwrap().unwrap();
            assert_eq!(a.kind, RecordKind::StateChange);
            assert_eq!((a.payload, b.payload), (3, 6));
        }
    }

    #[tokio::test]
    async fn terminate_completes_streams_and_rejects_sends() {
        let instance = adder(MailboxConfig::default());
        let fiber = instance.start_processing();
        let mut stream = instance.subscribe();

        fiber.abort();
        instance.terminate();

        assert!(stream.next().await.is_none());
        let err = instance.send(Record::command("adder", 1)).await.unwrap_err();
        assert!(err.is_not_found());

        let mut late = instance.subscribe();
        assert!(late.next().await.unwrap().unwrap_err().is_not_found());
        assert!(late.next().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let reducer: Adder = FnReducer::new("adder", add as AddFn);
        let instance = Arc::new(AgentInstance::new(
            AgentId::new("adder"),
            0,
            reducer,
            &MailboxConfig::default(),
            1,
        ));
        let _fiber = instance.start_processing();
        let mut stream = instance.subscribe();

        instance.send(Record::command("adder", 1)).await.unwrap();
        instance.send(Record::command("adder", 1)).await.unwrap();

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, EffectorError::SubscriberLagged { skipped: 1, .. }));
        assert_eq!(stream.next().await.unwrap().unwrap().payload, 2);
    }

    #[tokio::test]
    async fn watch_state_observes_commits() {
        let instance = adder(MailboxConfig::default());
        let _fiber = instance.start_processing();
        let mut watcher = instance.watch_state();

        instance.post(Record::command("adder", 10)).await.unwrap();
        let state = watcher.wait_for(|value| *value == 10).await.unwrap();
        assert_eq!(*state, 10);
    }
}
