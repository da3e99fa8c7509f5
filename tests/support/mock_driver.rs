use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use runcoord::{
    AgentDriver, CompletionStatus, DriverError, DriverFuture, OpenSession, ReloadOutcome,
    SessionProvider, SessionRef, Sink, Transcript, TranscriptMessage,
};

/// In-memory agent session. Sent text is echoed into the transcript and the
/// default response is `answer <number of messages sent>`.
pub struct MockDriver {
    session: SessionRef,
    sent: Mutex<Vec<String>>,
    transcript: Mutex<Vec<TranscriptMessage>>,
    send_failures: Mutex<VecDeque<DriverError>>,
    completions: Mutex<VecDeque<CompletionStatus>>,
    outputs: Mutex<VecDeque<String>>,
    reloads: Mutex<VecDeque<ReloadOutcome>>,
    reload_count: AtomicUsize,
    stalled: AtomicBool,
    panic_on_read: AtomicBool,
    destroyed: AtomicBool,
}

impl MockDriver {
    pub fn new(session: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            session: SessionRef::new(session),
            sent: Mutex::default(),
            transcript: Mutex::default(),
            send_failures: Mutex::default(),
            completions: Mutex::default(),
            outputs: Mutex::default(),
            reloads: Mutex::default(),
            reload_count: AtomicUsize::new(0),
            stalled: AtomicBool::new(false),
            panic_on_read: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Seeds the transcript as if `text` had been sent by an earlier process.
    pub fn with_history(self: Arc<Self>, user_messages: &[&str]) -> Arc<Self> {
        {
            let mut transcript = self.transcript.lock().unwrap();
            for text in user_messages {
                transcript.push(TranscriptMessage::user(*text));
                transcript.push(TranscriptMessage::agent("earlier answer"));
            }
        }
        self
    }

    /// While stalled, `await_completion` never returns.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn panic_on_read(&self) {
        self.panic_on_read.store(true, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, errors: impl IntoIterator<Item = DriverError>) {
        self.send_failures.lock().unwrap().extend(errors);
    }

    pub fn queue_completions(&self, statuses: impl IntoIterator<Item = CompletionStatus>) {
        self.completions.lock().unwrap().extend(statuses);
    }

    pub fn queue_outputs(&self, outputs: &[&str]) {
        self.outputs
            .lock()
            .unwrap()
            .extend(outputs.iter().map(|output| output.to_string()));
    }

    pub fn queue_reloads(&self, outcomes: impl IntoIterator<Item = ReloadOutcome>) {
        self.reloads.lock().unwrap().extend(outcomes);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn reload_count(&self) -> usize {
        self.reload_count.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl AgentDriver for MockDriver {
    fn session_ref(&self) -> &SessionRef {
        &self.session
    }

    fn send<'a>(&'a self, text: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            if self.is_destroyed() {
                return Err(DriverError::SessionLost);
            }
            if let Some(err) = self.send_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            self.sent.lock().unwrap().push(text.to_string());
            self.transcript
                .lock()
                .unwrap()
                .push(TranscriptMessage::user(text));
            Ok(())
        })
    }

    fn await_completion(&self, _budget: Duration) -> DriverFuture<'_, CompletionStatus> {
        Box::pin(async move {
            if self.stalled.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(self
                .completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(CompletionStatus::Completed))
        })
    }

    fn read_output(&self) -> DriverFuture<'_, String> {
        Box::pin(async move {
            if self.panic_on_read.load(Ordering::SeqCst) {
                panic!("mock driver read_output exploded");
            }
            let queued = self.outputs.lock().unwrap().pop_front();
            Ok(queued.unwrap_or_else(|| format!("answer {}", self.sent.lock().unwrap().len())))
        })
    }

    fn read_transcript(&self) -> DriverFuture<'_, Transcript> {
        Box::pin(async move { Ok(Transcript::new(self.transcript.lock().unwrap().clone())) })
    }

    fn force_reload(&self, _timeout: Duration) -> DriverFuture<'_, ReloadOutcome> {
        Box::pin(async move {
            self.reload_count.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .reloads
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(ReloadOutcome::Confirmed))
        })
    }

    fn session_exists(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { !self.is_destroyed() })
    }

    fn destroy(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.destroyed.store(true, Ordering::SeqCst);
        })
    }
}

struct Entry {
    driver: Arc<MockDriver>,
    category: Option<String>,
}

/// Session provider backed by [`MockDriver`]s. Opened sessions are named
/// `tab-1`, `tab-2`, ... and survive across coordinators sharing the provider.
#[derive(Default)]
pub struct MockSessionProvider {
    sessions: Mutex<BTreeMap<SessionRef, Entry>>,
    queued: Mutex<VecDeque<Arc<MockDriver>>>,
    opened: AtomicUsize,
    stall_new: AtomicBool,
}

impl MockSessionProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sessions opened from now on start stalled.
    pub fn stall_new_sessions(&self, stalled: bool) {
        self.stall_new.store(stalled, Ordering::SeqCst);
    }

    /// The next `open` hands out `driver` instead of a fresh one.
    pub fn queue_session(&self, driver: Arc<MockDriver>) {
        self.queued.lock().unwrap().push_back(driver);
    }

    /// Registers a session that exists before any coordinator runs.
    pub fn insert(&self, driver: Arc<MockDriver>, category: Option<&str>) {
        self.sessions.lock().unwrap().insert(
            driver.session_ref().clone(),
            Entry {
                driver,
                category: category.map(str::to_owned),
            },
        );
    }

    pub fn driver(&self, session: &SessionRef) -> Option<Arc<MockDriver>> {
        self.sessions
            .lock()
            .unwrap()
            .get(session)
            .map(|entry| entry.driver.clone())
    }
}

impl SessionProvider for MockSessionProvider {
    fn open<'a>(&'a self, category: &'a str) -> BoxFuture<'a, Result<Arc<dyn AgentDriver>>> {
        Box::pin(async move {
            let queued = self.queued.lock().unwrap().pop_front();
            let driver = match queued {
                Some(driver) => driver,
                None => {
                    let number = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
                    let driver = MockDriver::new(format!("tab-{number}"));
                    driver.set_stalled(self.stall_new.load(Ordering::SeqCst));
                    driver
                }
            };
            self.insert(driver.clone(), Some(category));
            Ok(driver as Arc<dyn AgentDriver>)
        })
    }

    fn attach<'a>(
        &'a self,
        session: &'a SessionRef,
    ) -> BoxFuture<'a, Result<Arc<dyn AgentDriver>>> {
        Box::pin(async move {
            let driver = self
                .driver(session)
                .filter(|driver| !driver.is_destroyed())
                .ok_or_else(|| anyhow!("session {session} is not open"))?;
            Ok(driver as Arc<dyn AgentDriver>)
        })
    }

    fn open_sessions(&self) -> BoxFuture<'_, Result<Vec<OpenSession>>> {
        Box::pin(async move {
            let sessions = self.sessions.lock().unwrap();
            Ok(sessions
                .iter()
                .filter(|(_, entry)| !entry.driver.is_destroyed())
                .map(|(session, entry)| OpenSession {
                    session_ref: session.clone(),
                    category: entry.category.clone(),
                })
                .collect())
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(String, usize, String)>>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<(String, usize, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Sink for RecordingSink {
    fn deliver(&self, run_id: &str, step_index: usize, output: &str) {
        self.delivered
            .lock()
            .unwrap()
            .push((run_id.to_string(), step_index, output.to_string()));
    }
}
