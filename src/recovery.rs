//! Automatic recovery: reload the driver session, re-derive the run's real
//! position from its transcript and hand a resume point back to the executor.
//!
//! A failure episode starts at the first recoverable failure of a step and
//! ends when the run advances past that step (the executor clears the
//! recovery state) or when the attempt budget runs out. Attempts are counted
//! on the run itself, so a step that fails again after a successful resync
//! keeps consuming the same budget.

pub(crate) mod backoff;

use self::backoff::{is_cancelled, retry_with_backoff, RetryBackoff, RetryDisposition};
use crate::driver::{AgentDriver, DriverError, ReloadOutcome};
use crate::error::StepFailure;
use crate::executor::ResumePoint;
use crate::position::{Detection, PositionDetector, UnmatchedReason};
use crate::registry::{RecoveryState, Run, RunPatch, RunRegistry, RunStatus, StepPhase};
use crate::runtime::config::CoordinatorConfig;
use crate::runtime::telemetry::Telemetry;
use crate::script::Script;
use anyhow::anyhow;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Resumed(ResumePoint),
    /// Recovery is disabled, not applicable, or out of attempts.
    Exhausted,
    SessionLost,
    Cancelled,
}

/// Picks where to continue given the checkpoint and what the transcript shows.
///
/// A detected position at or past the checkpoint is adopted and treated as
/// already sent. Anything else keeps the checkpoint and resends it, so the
/// run never moves behind its checkpoint.
pub fn resolve_resume_point(checkpoint_index: usize, detection: &Detection) -> ResumePoint {
    match detection.step_index() {
        Some(detected) if detected >= checkpoint_index => ResumePoint::sent(detected),
        _ => ResumePoint::fresh(checkpoint_index),
    }
}

pub struct RecoveryController {
    registry: Arc<RunRegistry>,
    config: Arc<CoordinatorConfig>,
    detector: PositionDetector,
    telemetry: Arc<Telemetry>,
}

impl RecoveryController {
    pub fn new(registry: Arc<RunRegistry>, config: Arc<CoordinatorConfig>) -> Self {
        let telemetry = registry.telemetry().clone();
        Self {
            detector: PositionDetector::new(config.min_signature_chars()),
            registry,
            config,
            telemetry,
        }
    }

    pub async fn attempt_recovery(
        &self,
        run: &Run,
        driver: &dyn AgentDriver,
        script: &Script,
        failure: &StepFailure,
        cancel: &CancellationToken,
    ) -> RecoveryOutcome {
        let max_attempts = self.config.recovery_max_attempts();
        let used = run.recovery.as_ref().map_or(0, |state| state.attempt);

        if !self.config.recovery_enabled() || !self.config.is_recoverable(failure.kind) {
            tracing::debug!(
                run_id = %run.id,
                failure = %failure,
                "failure is not eligible for automatic recovery"
            );
            return RecoveryOutcome::Exhausted;
        }

        if used >= max_attempts {
            return self.exhaust(run, failure, used).await;
        }

        let checkpoint_step = run.current_step.max(1);
        let backoff = RetryBackoff::new(
            self.config.recovery_initial_delay(),
            self.config.recovery_max_delay(),
        )
        .with_max_attempts((max_attempts - used) as usize)
        .with_cancellation(cancel);

        let reloaded = retry_with_backoff(
            backoff,
            |try_number| {
                let attempt = used + try_number as u32;
                let delay = backoff.delay_for(try_number);
                self.reload_once(run, driver, failure, attempt, checkpoint_step, delay)
            },
            |attempt, delay, err, will_retry| {
                tracing::warn!(
                    run_id = %run.id,
                    attempt = used + attempt as u32,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    will_retry,
                    error = %err,
                    "driver reload failed"
                );
            },
            |_, err| match err.downcast_ref::<DriverError>() {
                Some(DriverError::SessionLost) => RetryDisposition::Abort,
                _ => RetryDisposition::Retry,
            },
        )
        .await;

        if let Err(err) = reloaded {
            if is_cancelled(&err) {
                return RecoveryOutcome::Cancelled;
            }
            if matches!(err.downcast_ref::<DriverError>(), Some(DriverError::SessionLost)) {
                return RecoveryOutcome::SessionLost;
            }
            let attempts = self
                .registry
                .get(&run.id)
                .await
                .and_then(|current| current.recovery)
                .map_or(max_attempts, |state| state.attempt);
            return self.exhaust(run, failure, attempts).await;
        }

        let detection = match driver.read_transcript().await {
            Ok(transcript) => self.detector.detect(&transcript, script.signatures()),
            Err(DriverError::SessionLost) => return RecoveryOutcome::SessionLost,
            Err(err) => {
                tracing::warn!(
                    run_id = %run.id,
                    error = %err,
                    "could not read transcript after reload; keeping checkpoint"
                );
                Detection::Unmatched {
                    reason: UnmatchedReason::EmptyTranscript,
                }
            }
        };

        let checkpoint_index = checkpoint_step - 1;
        let point = resolve_resume_point(checkpoint_index, &detection);
        let phase = if point.already_sent {
            StepPhase::AwaitingCompletion
        } else {
            StepPhase::Sending
        };

        self.registry
            .upsert(
                &run.id,
                RunPatch::new()
                    .status(RunStatus::Running)
                    .step_index(point.step_index)
                    .phase(phase)
                    .allow_regression(),
            )
            .await;
        self.telemetry.record_recovery_succeeded();

        tracing::info!(
            run_id = %run.id,
            checkpoint = checkpoint_index,
            resume_at = point.step_index,
            already_sent = point.already_sent,
            detection = ?detection,
            "run resynchronized after reload"
        );

        RecoveryOutcome::Resumed(point)
    }

    async fn reload_once(
        &self,
        run: &Run,
        driver: &dyn AgentDriver,
        failure: &StepFailure,
        attempt: u32,
        checkpoint_step: usize,
        delay: Duration,
    ) -> anyhow::Result<()> {
        self.telemetry.record_recovery_attempt();
        self.registry
            .upsert(
                &run.id,
                RunPatch::new()
                    .status(RunStatus::Recovering)
                    .recovery(RecoveryState {
                        attempt,
                        max_attempts: self.config.recovery_max_attempts(),
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        reason: failure.kind,
                        checkpoint_step,
                        updated_at: Utc::now(),
                    })
                    .reason(failure.reason()),
            )
            .await;

        match driver.force_reload(self.config.reload_timeout()).await? {
            ReloadOutcome::Confirmed => Ok(()),
            ReloadOutcome::NotConfirmed => Err(anyhow!(
                "reload not confirmed within {:?}",
                self.config.reload_timeout()
            )),
        }
    }

    async fn exhaust(&self, run: &Run, failure: &StepFailure, attempts: u32) -> RecoveryOutcome {
        self.telemetry.record_recovery_exhausted();
        self.registry
            .upsert(&run.id, RunPatch::new().clear_recovery())
            .await;
        tracing::warn!(
            run_id = %run.id,
            attempts,
            failure = %failure,
            "automatic recovery exhausted"
        );
        RecoveryOutcome::Exhausted
    }
}
