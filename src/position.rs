//! Recovers "where a run is" from transcript content alone.
//!
//! The external agent exposes no sequence number, so the last user-authored
//! message is fingerprinted with the same rule that built the script's
//! signature catalog and matched against it: exact signature equality first,
//! then substring containment in either direction for signatures long enough
//! not to collide on boilerplate.
//!
//! Steps that end with identical sentences produce identical signatures. The
//! detector then reports the highest such index. This is a heuristic: if an
//! earlier duplicate is actually the current step, the reported position is
//! ahead of reality. Callers that hold an independent checkpoint should treat
//! the detection as a hint bounded by it.

use crate::driver::Transcript;
use crate::script::{Signature, SignatureCatalog};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Minimum signature length, in characters, for a containment match.
pub const DEFAULT_MIN_SIGNATURE_CHARS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Containment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    EmptyTranscript,
    SignatureTooShort,
    SignatureNotFound,
}

impl UnmatchedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyTranscript => "empty_transcript",
            Self::SignatureTooShort => "signature_too_short",
            Self::SignatureNotFound => "signature_not_found",
        }
    }
}

impl fmt::Display for UnmatchedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Detection {
    Matched {
        step_index: usize,
        method: MatchMethod,
    },
    Unmatched {
        reason: UnmatchedReason,
    },
}

impl Detection {
    pub fn is_matched(&self) -> bool {
        matches!(self, Detection::Matched { .. })
    }

    pub fn step_index(&self) -> Option<usize> {
        match self {
            Detection::Matched { step_index, .. } => Some(*step_index),
            Detection::Unmatched { .. } => None,
        }
    }

    pub fn method(&self) -> Option<MatchMethod> {
        match self {
            Detection::Matched { method, .. } => Some(*method),
            Detection::Unmatched { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<UnmatchedReason> {
        match self {
            Detection::Matched { .. } => None,
            Detection::Unmatched { reason } => Some(*reason),
        }
    }

    fn unmatched(reason: UnmatchedReason) -> Self {
        Detection::Unmatched { reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionDetector {
    min_signature_chars: usize,
}

impl Default for PositionDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_SIGNATURE_CHARS)
    }
}

impl PositionDetector {
    pub fn new(min_signature_chars: usize) -> Self {
        Self {
            min_signature_chars: min_signature_chars.max(1),
        }
    }

    pub fn min_signature_chars(&self) -> usize {
        self.min_signature_chars
    }

    /// Maps the transcript's most recent user message to a step index.
    pub fn detect(&self, transcript: &Transcript, catalog: &SignatureCatalog) -> Detection {
        match transcript.last_user_message() {
            Some(message) => self.detect_message(message, catalog),
            None => Detection::unmatched(UnmatchedReason::EmptyTranscript),
        }
    }

    /// Maps a single message text to a step index.
    pub fn detect_message(&self, message: &str, catalog: &SignatureCatalog) -> Detection {
        let signature = Signature::from_text(message);
        if signature.is_empty() {
            return Detection::unmatched(UnmatchedReason::EmptyTranscript);
        }

        let exact = catalog
            .iter()
            .filter(|(_, entry)| **entry == signature)
            .map(|(index, _)| index)
            .max();
        if let Some(step_index) = exact {
            return Detection::Matched {
                step_index,
                method: MatchMethod::Exact,
            };
        }

        if signature.char_len() < self.min_signature_chars {
            return Detection::unmatched(UnmatchedReason::SignatureTooShort);
        }

        let contained = catalog
            .iter()
            .filter(|(_, entry)| entry.char_len() >= self.min_signature_chars)
            .filter(|(_, entry)| signature.contains(entry) || entry.contains(&signature))
            .max_by_key(|(index, entry)| (entry.char_len(), *index))
            .map(|(index, _)| index);

        match contained {
            Some(step_index) => Detection::Matched {
                step_index,
                method: MatchMethod::Containment,
            },
            None => Detection::unmatched(UnmatchedReason::SignatureNotFound),
        }
    }
}

/// Runs the default detector.
pub fn detect(transcript: &Transcript, catalog: &SignatureCatalog) -> Detection {
    PositionDetector::default().detect(transcript, catalog)
}
