//! Monotonic merge of a [`RunPatch`] into a [`Run`], followed by the
//! normalization and consistency pass every stored record goes through.
//!
//! Rules, in order:
//! - A run that is already terminal is locked: its status never changes again
//!   and progress from later patches is discarded. Empty diagnostics may still
//!   be filled in.
//! - Progress counters only move forward unless the patch closes the run or
//!   carries `allow_regression`.
//! - `step_index` and the step label are always derived from `current_step`.
//! - Terminal runs never carry `needs_action` or a recovery state.

use super::patch::RunPatch;
use super::run::{step_label, Run, RunStatus};
use chrono::{DateTime, Utc};
use std::fmt;

const MISSING_FAILURE_REASON: &str = "run failed without a recorded reason";

/// A logical anomaly found (and where possible corrected) after a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inconsistency {
    StepBeyondTotal { current_step: usize, total_steps: usize },
    NeedsActionOnClosedRun,
    MissingSession,
    FailedWithoutReason,
}

impl Inconsistency {
    /// Whether the normalizer rewrote the record to remove the anomaly.
    pub fn corrected(&self) -> bool {
        !matches!(self, Inconsistency::MissingSession)
    }
}

impl fmt::Display for Inconsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Inconsistency::StepBeyondTotal {
                current_step,
                total_steps,
            } => write!(
                f,
                "current step {current_step} exceeds total {total_steps}; clamped"
            ),
            Inconsistency::NeedsActionOnClosedRun => {
                write!(f, "closed run flagged as needing action; cleared")
            }
            Inconsistency::MissingSession => write!(f, "active run has no session reference"),
            Inconsistency::FailedWithoutReason => {
                write!(f, "failed run has no reason; backfilled")
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct MergeOutcome {
    pub run: Run,
    pub corrections: Vec<Inconsistency>,
    /// The patch hit the terminal lock and its progress was dropped.
    pub discarded: bool,
}

pub(crate) fn merge(
    current: Option<&Run>,
    run_id: &str,
    patch: RunPatch,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut run = current
        .cloned()
        .unwrap_or_else(|| Run::new(run_id, now));

    let discarded = if run.is_terminal() {
        apply_to_closed(&mut run, patch);
        true
    } else {
        apply_to_active(&mut run, patch, now);
        false
    };

    let corrections = check_consistency(&mut run);
    normalize(&mut run, now);

    MergeOutcome {
        run,
        corrections,
        discarded,
    }
}

fn apply_to_closed(run: &mut Run, patch: RunPatch) {
    if run.reason.is_none() {
        if let Some(Some(reason)) = patch.reason {
            run.reason = Some(reason);
        }
    }
    if run.error.is_none() {
        run.error = patch.error;
    }
}

fn apply_to_active(run: &mut Run, patch: RunPatch, now: DateTime<Utc>) {
    let rewind = patch.is_closing() || patch.allow_regression;

    if run.category.is_empty() {
        if let Some(category) = patch.category {
            run.category = category;
        }
    }
    if run.variables.is_empty() {
        if let Some(variables) = patch.variables {
            run.variables = variables;
        }
    }
    if let Some(status) = patch.status {
        run.status = status;
    }

    if let Some(total) = patch.total_steps {
        run.total_steps = advance(run.total_steps, total, rewind);
    }
    let incoming_step = patch
        .current_step
        .or_else(|| patch.step_index.map(|index| index + 1));
    if let Some(step) = incoming_step {
        run.current_step = advance(run.current_step, step, rewind);
    }

    if let Some(phase) = patch.phase {
        run.phase = Some(phase);
    }
    if let Some(session) = patch.session_ref {
        run.session_ref = Some(session);
    }
    if let Some(recovery) = patch.recovery {
        run.recovery = recovery;
    }
    if let Some(reason) = patch.reason {
        run.reason = reason;
    }
    if let Some(error) = patch.error {
        run.error = Some(error);
    }
    if let Some(needs_action) = patch.needs_action {
        run.needs_action = needs_action;
    }
    if let Some(decision) = patch.decision {
        run.decisions.push(decision);
    }

    if run.is_terminal() {
        run.finished_at.get_or_insert(now);
    }
}

fn advance(current: usize, incoming: usize, rewind: bool) -> usize {
    if rewind {
        incoming
    } else {
        current.max(incoming)
    }
}

fn normalize(run: &mut Run, now: DateTime<Utc>) {
    if run.is_terminal() {
        run.needs_action = false;
        run.recovery = None;
    }
    run.step_index = run.current_step.saturating_sub(1);
    run.step_label = step_label(run.current_step, run.total_steps);
    run.updated_at = run.updated_at.max(now).max(run.started_at);
}

fn check_consistency(run: &mut Run) -> Vec<Inconsistency> {
    let mut found = Vec::new();

    if run.total_steps > 0 && run.current_step > run.total_steps {
        found.push(Inconsistency::StepBeyondTotal {
            current_step: run.current_step,
            total_steps: run.total_steps,
        });
        run.current_step = run.total_steps;
    }

    if run.is_terminal() && run.needs_action {
        found.push(Inconsistency::NeedsActionOnClosedRun);
        run.needs_action = false;
    }

    if run.is_active() && run.session_ref.is_none() {
        found.push(Inconsistency::MissingSession);
    }

    if run.status == RunStatus::Failed && run.reason.is_none() {
        found.push(Inconsistency::FailedWithoutReason);
        run.reason = Some(
            run.error
                .clone()
                .unwrap_or_else(|| MISSING_FAILURE_REASON.to_owned()),
        );
    }

    found
}
