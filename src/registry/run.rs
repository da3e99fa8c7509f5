use crate::driver::SessionRef;
use crate::error::FailureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Starting,
    Running,
    Recovering,
    Waiting,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Recovering => "recovering",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "recovering" => Ok(Self::Recovering),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

/// Last per-step state the executor reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Sending,
    AwaitingCompletion,
    Validating,
    Advanced,
}

impl FromStr for StepPhase {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sending" => Ok(Self::Sending),
            "awaiting_completion" => Ok(Self::AwaitingCompletion),
            "validating" => Ok(Self::Validating),
            "advanced" => Ok(Self::Advanced),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

/// Human resolution of a `needs_action` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Retry the phase that failed.
    Wait,
    /// Accept the current step as done and advance.
    Skip,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Decision {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "skip" => Ok(Self::Skip),
            other => Err(UnknownVariant(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown value {:?}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}

/// A recorded human decision, kept so skipped steps are explicit in the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub decision: Decision,
    pub step_index: usize,
    pub failure: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// Bookkeeping for an in-progress automatic recovery episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub reason: FailureKind,
    /// The `current_step` value recovery is anchored to.
    pub checkpoint_step: usize,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryState {
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// The unit of work tracked by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub category: String,
    pub status: RunStatus,
    /// 1-based step being worked on; equals `total_steps` once completed.
    pub current_step: usize,
    pub total_steps: usize,
    pub step_index: usize,
    pub step_label: Option<String>,
    pub phase: Option<StepPhase>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub session_ref: Option<SessionRef>,
    pub recovery: Option<RecoveryState>,
    pub reason: Option<String>,
    pub error: Option<String>,
    pub needs_action: bool,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub decisions: Vec<DecisionRecord>,
}

impl Run {
    pub(crate) fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_owned(),
            category: String::new(),
            status: RunStatus::Starting,
            current_step: 0,
            total_steps: 0,
            step_index: 0,
            step_label: None,
            phase: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            session_ref: None,
            recovery: None,
            reason: None,
            error: None,
            needs_action: false,
            variables: BTreeMap::new(),
            decisions: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// 0-based index of the step the run is anchored to.
    pub fn checkpoint_index(&self) -> usize {
        self.current_step.saturating_sub(1)
    }

    /// Time used to order closed runs for retention.
    pub fn recency(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.updated_at)
    }
}

pub(crate) fn step_label(current_step: usize, total_steps: usize) -> Option<String> {
    match (current_step, total_steps) {
        (0, _) => None,
        (current, 0) => Some(format!("Step {current}")),
        (current, total) => Some(format!("Step {current}/{total}")),
    }
}
