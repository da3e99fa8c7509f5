//! Partial updates applied to a run through [`RunRegistry::upsert`].
//!
//! [`RunRegistry::upsert`]: crate::registry::RunRegistry::upsert

use super::run::{DecisionRecord, RecoveryState, RunStatus, StepPhase};
use crate::driver::SessionRef;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub category: Option<String>,
    pub status: Option<RunStatus>,
    pub current_step: Option<usize>,
    pub total_steps: Option<usize>,
    pub step_index: Option<usize>,
    pub phase: Option<StepPhase>,
    pub session_ref: Option<SessionRef>,
    /// `Some(None)` clears the recovery state.
    pub recovery: Option<Option<RecoveryState>>,
    /// `Some(None)` clears the reason.
    pub reason: Option<Option<String>>,
    pub error: Option<String>,
    pub needs_action: Option<bool>,
    pub variables: Option<BTreeMap<String, String>>,
    pub decision: Option<DecisionRecord>,
    /// Lets progress counters move backwards. Reserved for position resync.
    pub allow_regression: bool,
}

impl RunPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn current_step(mut self, step: usize) -> Self {
        self.current_step = Some(step);
        self
    }

    pub fn total_steps(mut self, total: usize) -> Self {
        self.total_steps = Some(total);
        self
    }

    pub fn step_index(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }

    pub fn phase(mut self, phase: StepPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn session_ref(mut self, session: SessionRef) -> Self {
        self.session_ref = Some(session);
        self
    }

    pub fn recovery(mut self, recovery: RecoveryState) -> Self {
        self.recovery = Some(Some(recovery));
        self
    }

    pub fn clear_recovery(mut self) -> Self {
        self.recovery = Some(None);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(Some(reason.into()));
        self
    }

    pub fn clear_reason(mut self) -> Self {
        self.reason = Some(None);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn needs_action(mut self, needs_action: bool) -> Self {
        self.needs_action = Some(needs_action);
        self
    }

    pub fn variables(mut self, variables: BTreeMap<String, String>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn decision(mut self, record: DecisionRecord) -> Self {
        self.decision = Some(record);
        self
    }

    pub fn allow_regression(mut self) -> Self {
        self.allow_regression = true;
        self
    }

    /// Whether this patch moves the run into a terminal status.
    pub fn is_closing(&self) -> bool {
        self.status.is_some_and(|status| status.is_terminal())
    }

    /// Builds a patch from loosely-typed JSON, e.g. an external decision or UI
    /// message. Keys may be camelCase or snake_case. Unknown keys and values of
    /// the wrong shape are ignored so the merge stays total.
    pub fn from_value(value: &Value) -> Self {
        let Some(object) = value.as_object() else {
            tracing::debug!("ignoring non-object run patch");
            return Self::default();
        };

        Self {
            category: string_field(object, &["category"]),
            status: string_field(object, &["status"]).and_then(|s| s.parse().ok()),
            current_step: count_field(object, &["currentStep", "current_step"]),
            total_steps: count_field(object, &["totalSteps", "total_steps"]),
            step_index: count_field(object, &["stepIndex", "step_index"]),
            phase: string_field(object, &["phase"]).and_then(|s| s.parse().ok()),
            session_ref: string_field(object, &["sessionRef", "session_ref", "driverSessionRef"])
                .filter(|s| !s.trim().is_empty())
                .map(SessionRef::new),
            recovery: match field(object, &["recovery"]) {
                Some(Value::Null) => Some(None),
                Some(other) => serde_json::from_value(other.clone()).ok().map(Some),
                None => None,
            },
            reason: match field(object, &["reason"]) {
                Some(Value::Null) => Some(None),
                Some(Value::String(reason)) => Some(Some(reason.clone())),
                _ => None,
            },
            error: string_field(object, &["error"]),
            needs_action: field(object, &["needsAction", "needs_action"]).and_then(Value::as_bool),
            variables: None,
            decision: None,
            allow_regression: field(object, &["allowRegression", "allow_regression"])
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

fn field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    field(object, keys)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn count_field(object: &Map<String, Value>, keys: &[&str]) -> Option<usize> {
    field(object, keys)
        .and_then(Value::as_u64)
        .and_then(|value| usize::try_from(value).ok())
}
