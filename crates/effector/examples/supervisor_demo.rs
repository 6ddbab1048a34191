//! Runs a controller managing counters next to a supervisor coordinating
//! two dependent steps.
//!
//! Configuration is read from the file named by `EFFECTOR_CONFIG` when set,
//! otherwise defaults are used.
//!
//! ```text
//! RUST_LOG=effector=debug cargo run -p effector --example supervisor_demo
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use effector::agents::{
    ChildPool, ControllerMessage, ControllerReducer, ControllerState, CounterMessage,
    CounterReducer, CounterState, ProcessState, SupervisorMessage, SupervisorReducer,
    SupervisorState, TaskStep,
};
use effector::{AgentId, EffectorConfig, Registry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::info;

/// Pretends to fetch a batch of rows
struct FetchRows;

#[async_trait]
impl TaskStep for FetchRows {
    async fn run(&self, _input: Option<Value>) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(json!({ "rows": [3, 1, 4, 1, 5] }))
    }
}

/// Sums the rows produced by the previous step
struct SumRows;

#[async_trait]
impl TaskStep for SumRows {
    async fn run(&self, input: Option<Value>) -> Result<Value> {
        let rows = input
            .as_ref()
            .and_then(|v| v.get("rows"))
            .and_then(Value::as_array)
            .context("previous step produced no rows")?;
        let total: i64 = rows.iter().filter_map(Value::as_i64).sum();
        Ok(json!({ "total": total }))
    }
}

async fn load_config() -> Result<EffectorConfig> {
    match std::env::var("EFFECTOR_CONFIG") {
        Ok(path) => EffectorConfig::load(&path).await,
        Err(_) => {
            let mut config = EffectorConfig::default();
            config.apply_env_overrides()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config().await?;
    common::init_logging(&config.logging)?;

    // Controller managing counters
    let counters: Registry<CounterReducer> = Registry::new(config.clone())?;
    let pool = ChildPool::new(counters.clone(), |_id: &AgentId| {
        (CounterState::default(), CounterReducer)
    });
    let controllers: Registry<ControllerReducer> = Registry::new(config.clone())?;
    let controller = controllers.create(
        "controller",
        ControllerState::default(),
        ControllerReducer::new(Arc::new(pool)),
    )?;

    for _ in 0..3 {
        controller
            .send(ControllerMessage::CreateChild { child_id: None })
            .await?;
    }

    let managed = controller.get_state()?.managed_ids;
    for (n, child_id) in managed.iter().enumerate() {
        counters
            .handle(child_id)?
            .send(CounterMessage::Increment { by: n as i64 + 1 })
            .await?;
    }
    for child_id in &managed {
        info!(child = %child_id, count = counters.get_state(child_id)?.count, "Child state");
    }

    // Supervisor coordinating two steps
    let supervisors: Registry<SupervisorReducer> = Registry::new(config)?;
    let supervisor = supervisors.create(
        "supervisor",
        SupervisorState::default(),
        SupervisorReducer::new(Arc::new(FetchRows), Arc::new(SumRows)),
    )?;
    let mut transitions = supervisor.subscribe();

    supervisor.send(SupervisorMessage::Start).await?;
    while let Some(record) = transitions.next().await {
        if let SupervisorMessage::Transitioned { from, to } = record?.payload {
            info!(%from, %to, "Supervisor moved");
            if to.is_terminal() {
                break;
            }
        }
    }

    let state = supervisor.get_state()?;
    info!(
        state = %state.process_state,
        result = ?state.task_b_result,
        "Supervisor finished"
    );
    if state.process_state != ProcessState::Completed {
        anyhow::bail!("supervisor ended in {}", state.process_state);
    }

    controller.send(ControllerMessage::TerminateAll).await?;
    supervisors.shutdown().await;
    controllers.shutdown().await;
    counters.shutdown().await;
    Ok(())
}
