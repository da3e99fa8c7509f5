//! Drives one run's script against its driver session.
//!
//! Each step walks `Sending -> AwaitingCompletion -> Validating -> Advanced`
//! and every transition is written to the registry before the next one
//! starts. Failures are offered to the recovery controller first; when it
//! gives up, the run is parked as `waiting` with `needs_action` until a human
//! decision or a stop arrives.

mod capture;
pub mod decision;
mod pacing;

pub use decision::DecisionHub;

use crate::driver::{AgentDriver, CompletionStatus, DriverError, Sink};
use crate::error::{FailureKind, StepFailure};
use crate::recovery::{RecoveryController, RecoveryOutcome};
use crate::registry::{
    Decision, DecisionRecord, RunPatch, RunRegistry, RunStatus, StepPhase,
};
use crate::runtime::config::CoordinatorConfig;
use crate::runtime::telemetry::Telemetry;
use crate::script::Script;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Extra time granted past the driver's own completion budget before the
/// executor gives up on `await_completion` returning at all.
const COMPLETION_GRACE: Duration = Duration::from_secs(30);

/// Where execution (re)starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub step_index: usize,
    /// The step's text is already in the session; resume at awaiting completion.
    pub already_sent: bool,
}

impl ResumePoint {
    pub fn start() -> Self {
        Self::fresh(0)
    }

    pub fn fresh(step_index: usize) -> Self {
        Self {
            step_index,
            already_sent: false,
        }
    }

    pub fn sent(step_index: usize) -> Self {
        Self {
            step_index,
            already_sent: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Cancelled by a stop or a coordinator shutdown. The run record is left
    /// to whoever cancelled.
    Interrupted,
    Failed { reason: String },
}

enum StepResult {
    Done(String),
    Failed { failure: StepFailure, sent: bool },
    Cancelled,
}

pub struct StepExecutor {
    registry: Arc<RunRegistry>,
    recovery: RecoveryController,
    decisions: Arc<DecisionHub>,
    sink: Arc<dyn Sink>,
    config: Arc<CoordinatorConfig>,
    telemetry: Arc<Telemetry>,
}

impl StepExecutor {
    pub fn new(
        registry: Arc<RunRegistry>,
        decisions: Arc<DecisionHub>,
        sink: Arc<dyn Sink>,
        config: Arc<CoordinatorConfig>,
    ) -> Self {
        let telemetry = registry.telemetry().clone();
        Self {
            recovery: RecoveryController::new(registry.clone(), config.clone()),
            registry,
            decisions,
            sink,
            config,
            telemetry,
        }
    }

    pub fn decisions(&self) -> &Arc<DecisionHub> {
        &self.decisions
    }

    /// Executes steps `[start.step_index, script.len())`.
    pub async fn run(
        &self,
        run_id: &str,
        driver: Arc<dyn AgentDriver>,
        script: Arc<Script>,
        start: ResumePoint,
        cancel: &CancellationToken,
    ) -> Outcome {
        let driver = driver.as_ref();
        let variables = self
            .registry
            .get(run_id)
            .await
            .map(|run| run.variables)
            .unwrap_or_default();
        let mut point = start;

        while point.step_index < script.len() {
            if cancel.is_cancelled() {
                return Outcome::Interrupted;
            }

            let index = point.step_index;
            let Some(step) = script.step(index) else {
                break;
            };
            let text = step.render(&variables);

            match self
                .execute_step(run_id, driver, index, script.len(), &text, point.already_sent, cancel)
                .await
            {
                StepResult::Cancelled => return Outcome::Interrupted,
                StepResult::Done(output) => {
                    let is_last = script.is_last(index);
                    if is_last {
                        let output = capture::capture_stable_output(
                            run_id,
                            driver,
                            output,
                            self.config.capture_max_reads(),
                            self.config.capture_interval(),
                            cancel,
                        )
                        .await;
                        self.sink.deliver(run_id, index, &output);
                    }
                    self.advance(run_id, index).await;
                    if !is_last && !self.pace(cancel).await {
                        return Outcome::Interrupted;
                    }
                    point = ResumePoint::fresh(index + 1);
                }
                StepResult::Failed { failure, sent } => {
                    match self
                        .handle_failure(run_id, driver, &script, index, failure, sent, cancel)
                        .await
                    {
                        Ok(next) => point = next,
                        Err(outcome) => return outcome,
                    }
                }
            }
        }

        self.registry
            .upsert(
                run_id,
                RunPatch::new()
                    .status(RunStatus::Completed)
                    .current_step(script.len())
                    .phase(StepPhase::Advanced),
            )
            .await;
        tracing::info!(run_id, steps = script.len(), "run completed");
        Outcome::Completed
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_step(
        &self,
        run_id: &str,
        driver: &dyn AgentDriver,
        index: usize,
        total: usize,
        text: &str,
        already_sent: bool,
        cancel: &CancellationToken,
    ) -> StepResult {
        if !already_sent {
            self.registry
                .upsert(
                    run_id,
                    RunPatch::new()
                        .status(RunStatus::Running)
                        .total_steps(total)
                        .step_index(index)
                        .phase(StepPhase::Sending),
                )
                .await;
            tracing::debug!(run_id, step = index, "sending step");

            match cancellable(cancel, driver.send(text)).await {
                None => return StepResult::Cancelled,
                Some(Err(err)) => {
                    return StepResult::Failed {
                        failure: driver_failure(&err),
                        sent: false,
                    }
                }
                Some(Ok(())) => {}
            }
        }

        self.registry
            .upsert(
                run_id,
                RunPatch::new()
                    .status(RunStatus::Running)
                    .step_index(index)
                    .phase(StepPhase::AwaitingCompletion),
            )
            .await;

        let budget = self.config.step_timeout();
        let completion = tokio::time::timeout(
            budget.saturating_add(COMPLETION_GRACE),
            driver.await_completion(budget),
        );
        match cancellable(cancel, completion).await {
            None => return StepResult::Cancelled,
            Some(Ok(Ok(CompletionStatus::Completed))) => {}
            Some(Ok(Ok(CompletionStatus::TimedOut))) | Some(Err(_)) => {
                return StepResult::Failed {
                    failure: StepFailure::new(
                        FailureKind::Timeout,
                        format!("no completion within {budget:?}"),
                    ),
                    sent: true,
                }
            }
            Some(Ok(Err(err))) => {
                return StepResult::Failed {
                    failure: driver_failure(&err),
                    sent: true,
                }
            }
        }

        self.registry
            .upsert(run_id, RunPatch::new().phase(StepPhase::Validating))
            .await;

        let output = match cancellable(cancel, driver.read_output()).await {
            None => return StepResult::Cancelled,
            Some(Ok(output)) => output,
            Some(Err(err)) => {
                return StepResult::Failed {
                    failure: driver_failure(&err),
                    sent: true,
                }
            }
        };

        match validate_output(&output, self.config.hard_failure_markers()) {
            Ok(()) => StepResult::Done(output),
            Err(failure) => StepResult::Failed {
                failure,
                sent: true,
            },
        }
    }

    /// Returns the point to continue from, or the outcome that ends the run.
    #[allow(clippy::too_many_arguments)]
    async fn handle_failure(
        &self,
        run_id: &str,
        driver: &dyn AgentDriver,
        script: &Script,
        index: usize,
        failure: StepFailure,
        sent: bool,
        cancel: &CancellationToken,
    ) -> Result<ResumePoint, Outcome> {
        tracing::warn!(run_id, step = index, failure = %failure, "step failed");

        if failure.kind.is_fatal() {
            return Err(self.fail(run_id, &failure).await);
        }

        let Some(run) = self.registry.get(run_id).await else {
            return Err(Outcome::Interrupted);
        };
        if run.is_terminal() {
            return Err(Outcome::Interrupted);
        }

        match self
            .recovery
            .attempt_recovery(&run, driver, script, &failure, cancel)
            .await
        {
            RecoveryOutcome::Resumed(point) => return Ok(point),
            RecoveryOutcome::Cancelled => return Err(Outcome::Interrupted),
            RecoveryOutcome::SessionLost => {
                let lost = StepFailure::new(FailureKind::SessionLost, "session lost during recovery");
                return Err(self.fail(run_id, &lost).await);
            }
            RecoveryOutcome::Exhausted => {}
        }

        let receiver = self.decisions.register(run_id).await;
        self.registry
            .upsert(
                run_id,
                RunPatch::new()
                    .status(RunStatus::Waiting)
                    .needs_action(true)
                    .reason(failure.reason())
                    .error(failure.detail.clone()),
            )
            .await;
        self.telemetry.record_decision_requested();
        tracing::warn!(run_id, step = index, "run needs a human decision");

        let Some(decision) = self.decisions.wait(run_id, receiver, cancel).await else {
            return Err(Outcome::Interrupted);
        };

        self.registry
            .upsert(
                run_id,
                RunPatch::new()
                    .status(RunStatus::Running)
                    .needs_action(false)
                    .clear_reason()
                    .decision(DecisionRecord {
                        decision,
                        step_index: index,
                        failure: Some(failure.reason()),
                        decided_at: Utc::now(),
                    }),
            )
            .await;
        tracing::info!(run_id, step = index, decision = %decision, "decision received");

        match decision {
            Decision::Wait => Ok(ResumePoint {
                step_index: index,
                already_sent: sent,
            }),
            Decision::Skip => {
                self.advance(run_id, index).await;
                Ok(ResumePoint::fresh(index + 1))
            }
        }
    }

    async fn advance(&self, run_id: &str, index: usize) {
        self.registry
            .upsert(
                run_id,
                RunPatch::new()
                    .step_index(index)
                    .phase(StepPhase::Advanced)
                    .clear_recovery(),
            )
            .await;
        self.telemetry.record_step_completed();
        tracing::debug!(run_id, step = index, "step advanced");
    }

    async fn fail(&self, run_id: &str, failure: &StepFailure) -> Outcome {
        let reason = failure.reason();
        self.registry
            .upsert(
                run_id,
                RunPatch::new()
                    .status(RunStatus::Failed)
                    .needs_action(false)
                    .reason(reason.clone())
                    .error(failure.detail.clone()),
            )
            .await;
        tracing::error!(run_id, failure = %failure, "run failed");
        Outcome::Failed { reason }
    }

    async fn pace(&self, cancel: &CancellationToken) -> bool {
        let delay = pacing::pacing_delay(self.config.pacing_min(), self.config.pacing_max());
        pacing::pause(delay, cancel).await
    }
}

/// Checks a response for emptiness and configured hard-failure markers.
pub fn validate_output(output: &str, markers: &[String]) -> Result<(), StepFailure> {
    if output.trim().is_empty() {
        return Err(StepFailure::new(FailureKind::ContentInvalid, "empty response"));
    }
    let lowered = output.to_lowercase();
    if let Some(marker) = markers.iter().find(|marker| lowered.contains(marker.as_str())) {
        return Err(StepFailure::new(
            FailureKind::ContentInvalid,
            format!("response contains failure marker {marker:?}"),
        ));
    }
    Ok(())
}

fn driver_failure(err: &DriverError) -> StepFailure {
    StepFailure::new(err.failure_kind(), err.to_string())
}

async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}
