//! Failure taxonomy shared by the step executor, the recovery controller, and
//! the coordinator command surface.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a step failure.
///
/// The first three kinds are offered to the recovery controller before they
/// are surfaced to a human. `SessionLost` is always fatal for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Timeout,
    ContentInvalid,
    SessionLost,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ContentInvalid => "content_invalid",
            Self::SessionLost => "session_lost",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionLost)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed step phase together with the driver's diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Compact `kind: detail` form stored in the run's `reason`.
    pub fn reason(&self) -> String {
        format!("{}: {}", self.kind, self.detail)
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.detail)
    }
}

impl std::error::Error for StepFailure {}

/// Errors returned by the coordinator command surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    RunNotFound { run_id: String },
    RunClosed { run_id: String },
    RunAlreadyActive { run_id: String },
    RunNotWaiting { run_id: String },
    UnknownCategory { category: String },
    MissingSession { run_id: String },
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::RunNotFound { run_id } => write!(f, "run {run_id} not found"),
            CoordinatorError::RunClosed { run_id } => write!(f, "run {run_id} is already closed"),
            CoordinatorError::RunAlreadyActive { run_id } => {
                write!(f, "run {run_id} already has a live task")
            }
            CoordinatorError::RunNotWaiting { run_id } => {
                write!(f, "run {run_id} is not waiting for a decision")
            }
            CoordinatorError::UnknownCategory { category } => {
                write!(f, "no script registered for category {category}")
            }
            CoordinatorError::MissingSession { run_id } => {
                write!(f, "run {run_id} has no driver session to attach to")
            }
        }
    }
}

impl std::error::Error for CoordinatorError {}
