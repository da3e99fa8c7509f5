//! Text fingerprints used to recognise which scripted step a transcript
//! message corresponds to.
//!
//! A signature keeps only the trailing sentences of a text, then folds it:
//! Unicode canonical decomposition with combining marks dropped, lowercase,
//! every non-alphanumeric character replaced by a space, whitespace collapsed.
//! The same rule builds the script catalog and normalizes transcript messages,
//! so equal signatures mean "same ending" regardless of formatting noise.

use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Number of trailing sentences folded into a signature.
pub const TRAILING_SENTENCES: usize = 2;

const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?', '\n', '…', '。', '！', '？'];

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(String);

impl Signature {
    /// Builds the signature of `text` from its last [`TRAILING_SENTENCES`] sentences.
    pub fn from_text(text: &str) -> Self {
        Self(fold(&trailing_sentences(text, TRAILING_SENTENCES)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Length in characters, which is what the detector's floor is expressed in.
    pub fn char_len(&self) -> usize {
        self.0.chars().count()
    }

    pub fn contains(&self, other: &Signature) -> bool {
        self.0.contains(other.as_str())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the last `count` sentences of `text`, joined by a single space.
///
/// Fragments without any alphanumeric content (ellipses, separators, bullet
/// glyphs) are not counted as sentences.
pub fn trailing_sentences(text: &str, count: usize) -> String {
    let mut sentences: Vec<&str> = Vec::new();
    let mut start = 0;

    for (offset, ch) in text.char_indices() {
        if SENTENCE_TERMINATORS.contains(&ch) {
            let end = offset + ch.len_utf8();
            push_sentence(&mut sentences, &text[start..end]);
            start = end;
        }
    }
    push_sentence(&mut sentences, &text[start..]);

    let skip = sentences.len().saturating_sub(count);
    sentences[skip..].join(" ")
}

fn push_sentence<'a>(sentences: &mut Vec<&'a str>, candidate: &'a str) {
    let trimmed = candidate.trim();
    if trimmed.chars().any(char::is_alphanumeric) {
        sentences.push(trimmed);
    }
}

/// Case, diacritic and punctuation insensitive folding with collapsed whitespace.
pub fn fold(text: &str) -> String {
    let stripped: String = text
        .nfd()
        .filter(|ch| !is_combining_mark(*ch))
        .flat_map(char::to_lowercase)
        .map(|ch| if ch.is_alphanumeric() { ch } else { ' ' })
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}
