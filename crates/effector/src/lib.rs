//! In-process actor runtime
//!
//! Runs a dynamic set of independent, uniquely identified state machines
//! ("agents"). Each agent owns private state that changes only by folding
//! incoming records through its [`Reducer`], drains a bounded mailbox on its
//! own task, and broadcasts the records it emits to any number of
//! subscribers.
//!
//! # Architecture
//!
//! - **Record**: immutable command / event / state-change envelope
//! - **Reducer**: folds one record into the next state, may await other services
//! - **Mailbox**: bounded FIFO or priority queue with backpressure timeout
//! - **AgentInstance**: state cell, mailbox, emitter and processing loop
//! - **Registry**: id → agent map with atomic create / terminate
//! - **agents**: counter, controller and supervisor built on the above
//!
//! # Usage
//!
//! ```no_run
//! use effector::agents::{CounterMessage, CounterReducer, CounterState};
//! use effector::{EffectorConfig, Registry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry: Registry<CounterReducer> = Registry::new(EffectorConfig::default())?;
//!     let counter = registry.create("counter-1", CounterState::default(), CounterReducer)?;
//!
//!     counter.send(CounterMessage::Increment { by: 2 }).await?;
//!     assert_eq!(counter.get_state()?.count, 2);
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod agents;
pub mod config;
pub mod error;
pub mod instance;
pub mod mailbox;
pub mod record;
pub mod reducer;
pub mod registry;

pub use config::{EffectorConfig, MailboxConfig};
pub use error::{EffectorError, EffectorResult, ReduceError};
pub use instance::{AgentInstance, AgentStats, RecordStream};
pub use mailbox::{Delivery, Mailbox};
pub use record::{AgentId, Priority, Record, RecordId, RecordKind};
pub use reducer::{FnReducer, ReduceContext, Reducer, SelfRef};
pub use registry::{AgentHandle, Registry};
