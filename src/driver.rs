//! Collaborator interfaces consumed by the coordination core: the agent
//! driver that talks to one external session, the provider that opens and
//! enumerates sessions, and the sink that receives final outputs.

use crate::error::FailureKind;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type DriverFuture<'a, T> = BoxFuture<'a, Result<T, DriverError>>;

/// Opaque handle to one external agent session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionRef(String);

impl SessionRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptMessage {
    pub role: Role,
    pub text: String,
}

impl TranscriptMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            role: Role::Agent,
            text: text.into(),
        }
    }
}

/// Tail of a session's conversation, oldest message first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub messages: Vec<TranscriptMessage>,
}

impl Transcript {
    pub fn new(messages: Vec<TranscriptMessage>) -> Self {
        Self { messages }
    }

    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(|message| message.text.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Confirmed,
    NotConfirmed,
}

/// Error surfaced by an [`AgentDriver`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The driver could not deliver or read data; the session may still be usable.
    Transport(String),
    /// The underlying session no longer exists.
    SessionLost,
}

impl DriverError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DriverError::Transport(_) => FailureKind::Transport,
            DriverError::SessionLost => FailureKind::SessionLost,
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Transport(detail) => write!(f, "driver transport error: {detail}"),
            DriverError::SessionLost => write!(f, "driver session lost"),
        }
    }
}

impl std::error::Error for DriverError {}

/// One external agent session. Implementations own every UI/transport detail.
pub trait AgentDriver: Send + Sync {
    fn session_ref(&self) -> &SessionRef;

    fn send<'a>(&'a self, text: &'a str) -> DriverFuture<'a, ()>;

    /// Waits for the agent to finish responding, for at most `budget`.
    fn await_completion(&self, budget: Duration) -> DriverFuture<'_, CompletionStatus>;

    fn read_output(&self) -> DriverFuture<'_, String>;

    fn read_transcript(&self) -> DriverFuture<'_, Transcript>;

    /// Hard reload bypassing caches; `Confirmed` only once the reload is observed complete.
    fn force_reload(&self, timeout: Duration) -> DriverFuture<'_, ReloadOutcome>;

    fn session_exists(&self) -> BoxFuture<'_, bool>;

    /// Best-effort teardown used as a backstop when a run is stopped.
    fn destroy(&self) -> BoxFuture<'_, ()>;
}

/// A session currently open on the agent side, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSession {
    pub session_ref: SessionRef,
    pub category: Option<String>,
}

/// Opens, re-attaches and enumerates agent sessions.
pub trait SessionProvider: Send + Sync {
    fn open<'a>(&'a self, category: &'a str) -> BoxFuture<'a, Result<Arc<dyn AgentDriver>>>;

    fn attach<'a>(&'a self, session: &'a SessionRef)
        -> BoxFuture<'a, Result<Arc<dyn AgentDriver>>>;

    fn open_sessions(&self) -> BoxFuture<'_, Result<Vec<OpenSession>>>;
}

/// Receives final step outputs. Delivery is fire-and-forget; retries and
/// deduplication are the sink's responsibility.
pub trait Sink: Send + Sync {
    fn deliver(&self, run_id: &str, step_index: usize, output: &str);
}
