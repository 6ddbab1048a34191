//! Counter agent
//!
//! Minimal stateful agent used as the child type of the controller and in
//! examples.

use crate::error::ReduceError;
use crate::record::Record;
use crate::reducer::{ReduceContext, Reducer};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CounterMessage {
    Increment { by: i64 },
    Decrement { by: i64 },
    Reset,
    /// Emitted after every committed change
    Changed { count: i64 },
}

/// Folds increments into a running count. Rejects overflow and `Changed`
/// sent as a command.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterReducer;

#[async_trait]
impl Reducer for CounterReducer {
    type State = CounterState;
    type Message = CounterMessage;

    fn agent_type(&self) -> &'static str {
        "counter"
    }

    async fn reduce(
        &self,
        record: &Record<CounterMessage>,
        state: CounterState,
        ctx: &mut ReduceContext<CounterMessage>,
    ) -> Result<CounterState, ReduceError> {
        let count = match &record.payload {
            CounterMessage::Increment { by } => state
                .count
                .checked_add(*by)
                .ok_or_else(|| ReduceError::failed("counter overflow"))?,
            CounterMessage::Decrement { by } => state
                .count
                .checked_sub(*by)
                .ok_or_else(|| ReduceError::failed("counter overflow"))?,
            CounterMessage::Reset => 0,
            CounterMessage::Changed { .. } => {
                return Err(ReduceError::invalid("Changed is an event, not a command"));
            }
        };

        ctx.emit_state_change(CounterMessage::Changed { count });
        Ok(CounterState { count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectorConfig;
    use crate::record::{AgentId, RecordKind};
    use crate::registry::Registry;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn counts_and_reports_changes() {
        let registry: Registry<CounterReducer> = Registry::new(EffectorConfig::default()).unwrap();
        let counter = registry
            .create("counter", CounterState::default(), CounterReducer)
            .unwrap();
        let mut changes = counter.subscribe();

        counter.send(CounterMessage::Increment { by: 5 }).await.unwrap();
        counter.send(CounterMessage::Decrement { by: 2 }).await.unwrap();
        assert_eq!(counter.get_state().unwrap().count, 3);

        let first = changes.next().await.unwrap().unwrap();
        assert_eq!(first.kind, RecordKind::StateChange);
        assert_eq!(first.agent_id, AgentId::new("counter"));
        assert_eq!(first.payload, CounterMessage::Changed { count: 5 });

        counter.send(CounterMessage::Reset).await.unwrap();
        assert_eq!(counter.get_state().unwrap(), CounterState::default());
    }

    #[tokio::test]
    async fn rejects_events_and_overflow() {
        let registry: Registry<CounterReducer> = Registry::new(EffectorConfig::default()).unwrap();
        let counter = registry
            .create("counter", CounterState { count: i64::MAX }, CounterReducer)
            .unwrap();

        let err = counter
            .send(CounterMessage::Changed { count: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::EffectorError::InputValidation { .. }));

        let err = counter
            .send(CounterMessage::Increment { by: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, crate::EffectorError::ExecutionFailure { .. }));
        assert_eq!(counter.get_state().unwrap().count, i64::MAX);
    }

    #[test]
    fn messages_use_tagged_wire_format() {
        let json = serde_json::to_value(CounterMessage::Increment { by: 2 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "INCREMENT", "by": 2}));
    }
}
