//! Agent mailbox
//!
//! Bounded inbound queue with two disciplines: plain FIFO, or priority
//! order with FIFO among equal priorities. Capacity is enforced with a
//! semaphore so senders suspend while the mailbox is full and give up after
//! the configured backpressure timeout. A slot is released as soon as the
//! processing loop dequeues the record, not when its reduction finishes.

use crate::config::MailboxConfig;
use crate::error::{EffectorError, EffectorResult};
use crate::record::{AgentId, Priority, Record, RecordId};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// A queued record together with the channel its sender awaits
#[derive(Debug)]
pub(crate) struct Envelope<M> {
    pub(crate) record: Record<M>,
    pub(crate) reply: oneshot::Sender<EffectorResult<()>>,
    pub(crate) slot: OwnedSemaphorePermit,
}

#[derive(Debug)]
struct Prioritized<M> {
    priority: Priority,
    seq: u64,
    envelope: Envelope<M>,
}

impl<M> PartialEq for Prioritized<M> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<M> Eq for Prioritized<M> {}

impl<M> PartialOrd for Prioritized<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Prioritized<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier arrival
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
enum Lane<M> {
    Fifo(VecDeque<Envelope<M>>),
    Priority(BinaryHeap<Prioritized<M>>),
    Closed,
}

impl<M> Lane<M> {
    fn len(&self) -> usize {
        match self {
            Lane::Fifo(queue) => queue.len(),
            Lane::Priority(heap) => heap.len(),
            Lane::Closed => 0,
        }
    }
}

/// Bounded mailbox for one agent
#[derive(Debug)]
pub struct Mailbox<M> {
    agent_id: AgentId,
    lane: Mutex<Lane<M>>,
    slots: Arc<Semaphore>,
    ready: Notify,
    backpressure_timeout: Duration,
    capacity: usize,
    next_seq: AtomicU64,
    enqueued: AtomicU64,
}

impl<M> Mailbox<M> {
    pub fn new(agent_id: AgentId, config: &MailboxConfig) -> Self {
        let capacity = config.effective_capacity();
        debug_assert!(capacity > 0, "mailbox capacity must be positive");

        let lane = if config.prioritized {
            Lane::Priority(BinaryHeap::with_capacity(capacity.min(1024)))
        } else {
            Lane::Fifo(VecDeque::with_capacity(capacity.min(1024)))
        };

        Self {
            agent_id,
            lane: Mutex::new(lane),
            slots: Arc::new(Semaphore::new(capacity)),
            ready: Notify::new(),
            backpressure_timeout: config.backpressure_timeout(),
            capacity,
            next_seq: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
        }
    }

    /// Enqueue a record, waiting for space up to the backpressure timeout.
    ///
    /// Fails with `NotFound` once the mailbox is closed, including for
    /// senders that were already waiting for space.
    pub async fn push(&self, record: Record<M>, priority: Priority) -> EffectorResult<Delivery> {
        let slot = match tokio::time::timeout(
            self.backpressure_timeout,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => return Err(EffectorError::not_found(&self.agent_id)),
            Err(_) => {
                warn!(
                    agent_id = %self.agent_id,
                    record_id = %record.id,
                    timeout = ?self.backpressure_timeout,
                    "Mailbox full, send timed out"
                );
                return Err(EffectorError::BackpressureTimeout {
                    agent_id: self.agent_id.clone(),
                    timeout: self.backpressure_timeout,
                });
            }
        };

        let record_id = record.id;
        let (reply, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            record,
            reply,
            slot,
        };

        {
            let mut lane = self.lane.lock();
            match &mut *lane {
                Lane::Closed => return Err(EffectorError::not_found(&self.agent_id)),
                Lane::Fifo(queue) => queue.push_back(envelope),
                Lane::Priority(heap) => {
                    let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
                    heap.push(Prioritized {
                        priority,
                        seq,
                        envelope,
                    });
                }
            }
        }

        self.enqueued.fetch_add(1, AtomicOrdering::Relaxed);
        self.ready.notify_one();
        debug!(agent_id = %self.agent_id, record_id = %record_id, ?priority, "Record enqueued");

        Ok(Delivery {
            agent_id: self.agent_id.clone(),
            record_id,
            reply: reply_rx,
        })
    }

    /// Wait for the next record. Returns `None` once the mailbox is closed.
    ///
    /// Only the owning processing loop calls this.
    pub(crate) async fn recv(&self) -> Option<Envelope<M>> {
        loop {
            {
                let mut lane = self.lane.lock();
                match &mut *lane {
                    Lane::Closed => return None,
                    Lane::Fifo(queue) => {
                        if let Some(envelope) = queue.pop_front() {
                            return Some(envelope);
                        }
                    }
                    Lane::Priority(heap) => {
                        if let Some(entry) = heap.pop() {
                            return Some(entry.envelope);
                        }
                    }
                }
            }
            self.ready.notified().await;
        }
    }

    /// Close the mailbox. Queued records are dropped, so their senders
    /// observe `NotFound`; waiting and future senders fail the same way.
    pub fn close(&self) -> usize {
        let pending = std::mem::replace(&mut *self.lane.lock(), Lane::Closed);
        let dropped = pending.len();
        self.slots.close();
        self.ready.notify_one();
        drop(pending);

        if dropped > 0 {
            debug!(agent_id = %self.agent_id, dropped, "Mailbox closed with pending records");
        }
        dropped
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.lane.lock(), Lane::Closed)
    }

    /// Records currently waiting to be processed
    pub fn len(&self) -> usize {
        self.lane.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total records accepted since creation
    pub fn enqueued_count(&self) -> u64 {
        self.enqueued.load(AtomicOrdering::Relaxed)
    }
}

/// Ticket for one enqueued record.
///
/// Dropping it is fine; the record is still processed.
#[derive(Debug)]
pub struct Delivery {
    agent_id: AgentId,
    record_id: RecordId,
    reply: oneshot::Receiver<EffectorResult<()>>,
}

impl Delivery {
    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Wait until the record has been folded into the agent's state.
    ///
    /// Yields the reducer's failure for this record, or `NotFound` if the
    /// agent was terminated before the record was processed.
    pub async fn outcome(self) -> EffectorResult<()> {
        match self.reply.await {
            Ok(result) => result,
            Err(_) => Err(EffectorError::NotFound {
                agent_id: self.agent_id,
            }),
        }
    }
}
