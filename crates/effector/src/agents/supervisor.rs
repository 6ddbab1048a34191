//! Supervisor agent
//!
//! Coordinates two dependent steps: on `Start` it runs step A, feeds A's
//! output into step B, and tracks
//! `IDLE → RUNNING_A → RUNNING_B → COMPLETED | FAILED | CANCELLED`.
//!
//! Steps run on their own tasks and report back by posting
//! `StepSucceeded` / `StepFailed` into the supervisor's own mailbox. Every
//! report carries the run number it belongs to; a report for an older run,
//! or for a step the supervisor is no longer waiting on, is ignored. `Cancel`
//! fires the run's cancellation token, so an outstanding step is dropped and
//! its late result can never move the supervisor out of `CANCELLED`.
//!
//! Run tokens are children of one token owned by the reducer, which is
//! cancelled when the agent terminates; no step outlives its supervisor.
//! A report that meets a full mailbox is retried until it lands, the run is
//! cancelled, or the supervisor is gone.

use crate::error::ReduceError;
use crate::reducer::{ReduceContext, Reducer, SelfRef};
use crate::record::Record;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REPORT_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    #[default]
    Idle,
    RunningA,
    RunningB,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::RunningA | ProcessState::RunningB)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Cancelled
        )
    }

    /// The step this state is waiting on, if any
    fn awaiting(&self) -> Option<Step> {
        match self {
            ProcessState::RunningA => Some(Step::A),
            ProcessState::RunningB => Some(Step::B),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessState::Idle => "IDLE",
            ProcessState::RunningA => "RUNNING_A",
            ProcessState::RunningB => "RUNNING_B",
            ProcessState::Completed => "COMPLETED",
            ProcessState::Failed => "FAILED",
            ProcessState::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    A,
    B,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupervisorState {
    pub process_state: ProcessState,
    /// Number of the current or most recent run; 0 before the first start
    pub run: u64,
    pub task_a_result: Option<Value>,
    pub task_b_result: Option<Value>,
    pub error: Option<String>,
    #[serde(skip)]
    in_flight: Option<CancellationToken>,
}

impl SupervisorState {
    fn transition(
        &mut self,
        to: ProcessState,
        ctx: &mut ReduceContext<SupervisorMessage>,
    ) {
        let from = self.process_state;
        self.process_state = to;
        debug!(supervisor = %ctx.agent_id(), run = self.run, %from, %to, "Supervisor transition");
        ctx.emit_state_change(SupervisorMessage::Transitioned { from, to });
    }

    fn stop_in_flight(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorMessage {
    Start,
    Cancel,
    StepSucceeded { run: u64, step: Step, output: Value },
    StepFailed { run: u64, step: Step, error: String },
    /// Emitted on every state machine transition
    Transitioned { from: ProcessState, to: ProcessState },
}

/// One unit of work run by the supervisor. Step B receives step A's output.
#[async_trait]
pub trait TaskStep: Send + Sync + 'static {
    async fn run(&self, input: Option<Value>) -> anyhow::Result<Value>;
}

pub struct SupervisorReducer {
    task_a: Arc<dyn TaskStep>,
    task_b: Arc<dyn TaskStep>,
    lifetime: CancellationToken,
}

impl SupervisorReducer {
    pub fn new(task_a: Arc<dyn TaskStep>, task_b: Arc<dyn TaskStep>) -> Self {
        Self {
            task_a,
            task_b,
            lifetime: CancellationToken::new(),
        }
    }

    fn launch(
        &self,
        step: Step,
        run: u64,
        input: Option<Value>,
        token: CancellationToken,
        myself: SelfRef<SupervisorMessage>,
    ) {
        let task = match step {
            Step::A => Arc::clone(&self.task_a),
            Step::B => Arc::clone(&self.task_b),
        };

        tokio::spawn(async move {
            let mut work = tokio::spawn(async move { task.run(input).await });

            let report = tokio::select! {
                _ = token.cancelled() => {
                    work.abort();
                    debug!(supervisor = %myself.agent_id(), run, ?step, "Step cancelled");
                    return;
                }
                joined = &mut work => match joined {
                    Ok(Ok(output)) => SupervisorMessage::StepSucceeded { run, step, output },
                    Ok(Err(e)) => SupervisorMessage::StepFailed {
                        run,
                        step,
                        error: format!("{e:#}"),
                    },
                    Err(e) => SupervisorMessage::StepFailed {
                        run,
                        step,
                        error: format!("step task ended abnormally: {e}"),
                    },
                },
            };

            deliver(&myself, report, run, step, &token).await;
        });
    }
}

/// Post a step report, retrying while the mailbox is full
async fn deliver(
    myself: &SelfRef<SupervisorMessage>,
    report: SupervisorMessage,
    run: u64,
    step: Step,
    token: &CancellationToken,
) {
    loop {
        let posted = tokio::select! {
            _ = token.cancelled() => {
                debug!(supervisor = %myself.agent_id(), run, ?step, "Step result dropped after cancellation");
                return;
            }
            posted = myself.post(report.clone()) => posted,
        };

        match posted {
            Ok(_) => return,
            Err(e) if e.is_backpressure_timeout() => {
                warn!(supervisor = %myself.agent_id(), run, ?step, "Supervisor mailbox full, retrying step result");
                tokio::time::sleep(REPORT_RETRY_DELAY).await;
            }
            Err(e) => {
                debug!(supervisor = %myself.agent_id(), run, ?step, error = %e, "Step result undeliverable");
                return;
            }
        }
    }
}

impl fmt::Debug for SupervisorReducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorReducer")
            .field("terminated", &self.lifetime.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Reducer for SupervisorReducer {
    type State = SupervisorState;
    type Message = SupervisorMessage;

    fn agent_type(&self) -> &'static str {
        "supervisor"
    }

    fn shutdown(&self) {
        self.lifetime.cancel();
    }

    async fn reduce(
        &self,
        record: &Record<SupervisorMessage>,
        mut state: SupervisorState,
        ctx: &mut ReduceContext<SupervisorMessage>,
    ) -> Result<SupervisorState, ReduceError> {
        match &record.payload {
            SupervisorMessage::Start => {
                if state.process_state.is_running() {
                    return Err(ReduceError::invalid(format!(
                        "supervisor is already {}",
                        state.process_state
                    )));
                }

                let token = self.lifetime.child_token();
                state.run += 1;
                state.task_a_result = None;
                state.task_b_result = None;
                state.error = None;
                state.in_flight = Some(token.clone());

                info!(supervisor = %ctx.agent_id(), run = state.run, "Supervisor run started");
                self.launch(Step::A, state.run, None, token, ctx.myself());
                state.transition(ProcessState::RunningA, ctx);
            }
            SupervisorMessage::Cancel => {
                if !state.process_state.is_running() {
                    debug!(supervisor = %ctx.agent_id(), state = %state.process_state, "Nothing to cancel");
                    return Ok(state);
                }

                state.stop_in_flight();
                info!(supervisor = %ctx.agent_id(), run = state.run, "Supervisor run cancelled");
                state.transition(ProcessState::Cancelled, ctx);
            }
            SupervisorMessage::StepSucceeded { run, step, output } => {
                if *run != state.run || state.process_state.awaiting() != Some(*step) {
                    debug!(supervisor = %ctx.agent_id(), run, ?step, "Ignoring stale step result");
                    return Ok(state);
                }

                match step {
                    Step::A => {
                        state.task_a_result = Some(output.clone());
                        let token = state
                            .in_flight
                            .clone()
                            .unwrap_or_else(|| self.lifetime.child_token());
                        state.in_flight = Some(token.clone());
                        self.launch(Step::B, state.run, Some(output.clone()), token, ctx.myself());
                        state.transition(ProcessState::RunningB, ctx);
                    }
                    Step::B => {
                        state.task_b_result = Some(output.clone());
                        state.in_flight = None;
                        info!(supervisor = %ctx.agent_id(), run = state.run, "Supervisor run completed");
                        state.transition(ProcessState::Completed, ctx);
                    }
                }
            }
            SupervisorMessage::StepFailed { run, step, error } => {
                if *run != state.run || state.process_state.awaiting() != Some(*step) {
                    debug!(supervisor = %ctx.agent_id(), run, ?step, "Ignoring stale step failure");
                    return Ok(state);
                }

                warn!(supervisor = %ctx.agent_id(), run, ?step, error = %error, "Supervisor step failed");
                state.in_flight = None;
                state.error = Some(error.clone());
                state.transition(ProcessState::Failed, ctx);
            }
            SupervisorMessage::Transitioned { .. } => {
                return Err(ReduceError::invalid("Transitioned is an event, not a command"));
            }
        }

        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EffectorConfig;
    use crate::error::EffectorError;
    use crate::registry::{AgentHandle, Registry};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_stream::StreamExt;

    struct Constant(Value);

    #[async_trait]
    impl TaskStep for Constant {
        async fn run(&self, _input: Option<Value>) -> anyhow::Result<Value> {
            Ok(self.0.clone())
        }
    }

    /// Doubles the numeric output of the previous step
    struct Double;

    #[async_trait]
    impl TaskStep for Double {
        async fn run(&self, input: Option<Value>) -> anyhow::Result<Value> {
            let n = input
                .and_then(|v| v.as_i64())
                .ok_or_else(|| anyhow::anyhow!("expected a number"))?;
            Ok(json!(n * 2))
        }
    }

    struct Broken;

    #[async_trait]
    impl TaskStep for Broken {
        async fn run(&self, _input: Option<Value>) -> anyhow::Result<Value> {
            anyhow::bail!("upstream unavailable")
        }
    }

    struct Never;

    #[async_trait]
    impl TaskStep for Never {
        async fn run(&self, _input: Option<Value>) -> anyhow::Result<Value> {
            std::future::pending().await
        }
    }

    #[derive(Default)]
    struct Counted(AtomicUsize);

    #[async_trait]
    impl TaskStep for Counted {
        async fn run(&self, _input: Option<Value>) -> anyhow::Result<Value> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    fn supervisor(
        task_a: Arc<dyn TaskStep>,
        task_b: Arc<dyn TaskStep>,
    ) -> (Registry<SupervisorReducer>, AgentHandle<SupervisorReducer>) {
        let registry = Registry::new(EffectorConfig::default()).unwrap();
        let handle = registry
            .create(
                "supervisor",
                SupervisorState::default(),
                SupervisorReducer::new(task_a, task_b),
            )
            .unwrap();
        (registry, handle)
    }

    async fn settle(handle: &AgentHandle<SupervisorReducer>) -> SupervisorState {
        let mut watcher = handle.watch_state().unwrap();
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            watcher.wait_for(|s| s.process_state.is_terminal()),
        )
        .await
        .expect("supervisor did not settle")
        .unwrap()
        .clone();
        state
    }

    #[tokio::test]
    async fn runs_both_steps_in_order() {
        let (_registry, handle) = supervisor(Arc::new(Constant(json!(21))), Arc::new(Double));
        let mut transitions = handle.subscribe();

        handle.send(SupervisorMessage::Start).await.unwrap();
        let state = settle(&handle).await;

        assert_eq!(state.process_state, ProcessState::Completed);
        assert_eq!(state.task_a_result, Some(json!(21)));
        assert_eq!(state.task_b_result, Some(json!(42)));
        assert_eq!(state.error, None);

        let mut seen = Vec::new();
        for _ in 0..3 {
            match transitions.next().await.unwrap().unwrap().payload {
                SupervisorMessage::Transitioned { to, .. } => seen.push(to),
                other => panic!("unexpected emission {other:?}"),
            }
        }
        assert_eq!(
            seen,
            vec![
                ProcessState::RunningA,
                ProcessState::RunningB,
                ProcessState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn step_a_failure_fails_the_run_without_running_b() {
        let task_b = Arc::new(Counted::default());
        let (_registry, handle) = supervisor(Arc::new(Broken), task_b.clone());

        handle.send(SupervisorMessage::Start).await.unwrap();
        let state = settle(&handle).await;

        assert_eq!(state.process_state, ProcessState::Failed);
        assert_eq!(state.error.as_deref(), Some("upstream unavailable"));
        assert_eq!(task_b.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_wins_over_late_results() {
        let (_registry, handle) = supervisor(Arc::new(Never), Arc::new(Double));

        handle.send(SupervisorMessage::Start).await.unwrap();
        assert_eq!(handle.get_state().unwrap().process_state, ProcessState::RunningA);

        handle.send(SupervisorMessage::Cancel).await.unwrap();
        assert_eq!(handle.get_state().unwrap().process_state, ProcessState::Cancelled);

        handle
            .send(SupervisorMessage::StepSucceeded {
                run: 1,
                step: Step::A,
                output: json!(1),
            })
            .await
            .unwrap();
        handle
            .send(SupervisorMessage::StepFailed {
                run: 1,
                step: Step::A,
                error: "late".to_string(),
            })
            .await
            .unwrap();

        let state = handle.get_state().unwrap();
        assert_eq!(state.process_state, ProcessState::Cancelled);
        assert_eq!(state.task_a_result, None);
        assert_eq!(state.error, None);
    }

    #[tokio::test]
    async fn cancel_during_second_step_ignores_its_late_result() {
        let (_registry, handle) = supervisor(Arc::new(Constant(json!(5))), Arc::new(Never));

        handle.send(SupervisorMessage::Start).await.unwrap();
        let mut watcher = handle.watch_state().unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            watcher.wait_for(|s| s.process_state == ProcessState::RunningB),
        )
        .await
        .expect("step A did not finish")
        .unwrap();

        handle.send(SupervisorMessage::Cancel).await.unwrap();
        handle
            .send(SupervisorMessage::StepSucceeded {
                run: 1,
                step: Step::B,
                output: json!(10),
            })
            .await
            .unwrap();

        let state = handle.get_state().unwrap();
        assert_eq!(state.process_state, ProcessState::Cancelled);
        assert_eq!(state.task_a_result, Some(json!(5)));
        assert_eq!(state.task_b_result, None);
    }

    #[test]
    fn shutdown_cancels_every_run_token() {
        let reducer = SupervisorReducer::new(Arc::new(Never), Arc::new(Never));
        let first = reducer.lifetime.child_token();
        let second = reducer.lifetime.child_token();

        reducer.shutdown();
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }

    #[tokio::test]
    async fn start_while_running_is_rejected() {
        let (_registry, handle) = supervisor(Arc::new(Never), Arc::new(Double));
        handle.send(SupervisorMessage::Start).await.unwrap();

        let err = handle.send(SupervisorMessage::Start).await.unwrap_err();
        assert!(matches!(err, EffectorError::InputValidation { .. }));
        assert_eq!(handle.get_state().unwrap().run, 1);
    }

    #[tokio::test]
    async fn cancel_when_idle_is_a_no_op() {
        let (_registry, handle) = supervisor(Arc::new(Never), Arc::new(Double));

        handle.send(SupervisorMessage::Cancel).await.unwrap();
        assert_eq!(handle.get_state().unwrap().process_state, ProcessState::Idle);
    }

    #[tokio::test]
    async fn restart_after_completion_starts_a_new_run() {
        let (_registry, handle) = supervisor(Arc::new(Constant(json!(1))), Arc::new(Double));

        handle.send(SupervisorMessage::Start).await.unwrap();
        settle(&handle).await;

        handle.send(SupervisorMessage::Start).await.unwrap();
        let state = handle.get_state().unwrap();
        assert_eq!(state.run, 2);

        // Stale result from the first run must not count toward the second
        handle
            .send(SupervisorMessage::StepSucceeded {
                run: 1,
                step: Step::B,
                output: json!(99),
            })
            .await
            .unwrap();
        let state = settle(&handle).await;
        assert_eq!(state.process_state, ProcessState::Completed);
        assert_eq!(state.task_b_result, Some(json!(2)));
    }

    #[test]
    fn process_state_uses_screaming_names() {
        assert_eq!(
            serde_json::to_value(ProcessState::RunningA).unwrap(),
            json!("RUNNING_A")
        );
        assert_eq!(ProcessState::Cancelled.to_string(), "CANCELLED");
    }
}
