use crate::driver::{SessionRef, Transcript};
use crate::position::{MatchMethod, PositionDetector};
use crate::script::Script;
use serde::Serialize;
use std::sync::Arc;

/// Result of one [`scan_and_resume`](super::Coordinator::scan_and_resume) pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Existing runs re-attached to their session.
    pub resumed: Vec<String>,
    /// Runs created for sessions no run was bound to.
    pub started: Vec<String>,
    pub skipped: Vec<SkippedSession>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedSession {
    pub session_ref: SessionRef,
    pub reason: String,
}

impl ScanReport {
    pub(crate) fn skip(&mut self, session_ref: SessionRef, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(session = %session_ref, reason = %reason, "scan skipped session");
        self.skipped.push(SkippedSession {
            session_ref,
            reason,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.resumed.is_empty() && self.started.is_empty() && self.skipped.is_empty()
    }
}

/// Finds the script and step a transcript belongs to. Candidates are tried in
/// order; an exact match anywhere beats a containment match.
pub(crate) fn detect_across(
    detector: &PositionDetector,
    transcript: &Transcript,
    candidates: &[Arc<Script>],
) -> Option<(Arc<Script>, usize)> {
    let mut fallback = None;

    for script in candidates {
        let detection = detector.detect(transcript, script.signatures());
        let Some(step_index) = detection.step_index() else {
            continue;
        };
        match detection.method() {
            Some(MatchMethod::Exact) => return Some((script.clone(), step_index)),
            _ => {
                if fallback.is_none() {
                    fallback = Some((script.clone(), step_index));
                }
            }
        }
    }

    fallback
}
