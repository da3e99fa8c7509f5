//! Durable, authoritative map of run id to [`Run`].
//!
//! Every mutation goes through [`RunRegistry::upsert`], which applies the
//! monotonic merge, runs the consistency checks, prunes closed runs and
//! persists the collection while holding the registry lock. Writers from
//! different tasks therefore observe a single total order of merges.

pub mod merge;
pub mod patch;
pub mod retention;
pub mod run;
pub mod store;

pub use merge::Inconsistency;
pub use patch::RunPatch;
pub use retention::DEFAULT_RETENTION_LIMIT;
pub use run::{
    Decision, DecisionRecord, RecoveryState, Run, RunStatus, StepPhase, UnknownVariant,
};
pub use store::{JsonFileStore, MemoryStore, RunStore};

use crate::driver::SessionRef;
use crate::runtime::telemetry::Telemetry;
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub active: usize,
    pub closed: usize,
    pub needs_action: usize,
}

pub struct RunRegistry {
    state: Mutex<HashMap<String, Run>>,
    store: Arc<dyn RunStore>,
    retention_limit: usize,
    events: broadcast::Sender<Run>,
    telemetry: Arc<Telemetry>,
}

impl RunRegistry {
    pub fn new(store: Arc<dyn RunStore>, retention_limit: usize, telemetry: Arc<Telemetry>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(HashMap::new()),
            store,
            retention_limit,
            events,
            telemetry,
        }
    }

    /// Registry backed by a [`MemoryStore`], with its own telemetry.
    pub fn in_memory(retention_limit: usize) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            retention_limit,
            Arc::new(Telemetry::default()),
        )
    }

    pub fn retention_limit(&self) -> usize {
        self.retention_limit
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Loads persisted runs into memory. Duplicate ids keep the record with
    /// the latest `updated_at`; loaded records are normalized like any merge.
    pub async fn restore(&self) -> Result<usize> {
        let loaded = self
            .store
            .load()
            .await
            .context("failed to load persisted runs")?;

        let mut deduped: HashMap<String, Run> = HashMap::new();
        for run in loaded {
            match deduped.get(&run.id) {
                Some(existing) if existing.updated_at >= run.updated_at => {}
                _ => {
                    deduped.insert(run.id.clone(), run);
                }
            }
        }

        let mut state = self.state.lock().await;
        let mut restored = 0;
        for (id, run) in deduped {
            if state
                .get(&id)
                .is_some_and(|current| current.updated_at >= run.updated_at)
            {
                continue;
            }
            let outcome = merge::merge(Some(&run), &id, RunPatch::new(), run.updated_at);
            self.report_corrections(&id, &outcome.corrections);
            state.insert(id, outcome.run);
            restored += 1;
        }

        let evicted = retention::prune(&mut state, self.retention_limit);
        tracing::info!(
            target: "runcoord::registry",
            restored,
            evicted = evicted.len(),
            "restored runs from store"
        );
        Ok(restored)
    }

    /// Merges `patch` into the run (creating it if needed) and returns the
    /// normalized record. Persistence failures are logged, never returned.
    pub async fn upsert(&self, run_id: &str, patch: RunPatch) -> Run {
        let mut state = self.state.lock().await;

        let outcome = merge::merge(state.get(run_id), run_id, patch, Utc::now());
        if outcome.discarded {
            tracing::debug!(
                target: "runcoord::registry",
                run_id,
                status = %outcome.run.status,
                "run is closed; progress from patch discarded"
            );
        }
        self.report_corrections(run_id, &outcome.corrections);

        let run = outcome.run;
        state.insert(run_id.to_owned(), run.clone());

        let evicted = retention::prune(&mut state, self.retention_limit);
        if !evicted.is_empty() {
            tracing::debug!(
                target: "runcoord::registry",
                evicted = evicted.len(),
                "pruned closed runs"
            );
        }

        let records: Vec<Run> = state.values().cloned().collect();
        if let Err(err) = self.store.persist(&records).await {
            self.telemetry.record_persist_failure();
            tracing::error!(
                target: "runcoord::registry",
                run_id,
                error = %err,
                "failed to persist runs; keeping in-memory state"
            );
        }
        drop(state);

        let _ = self.events.send(run.clone());
        run
    }

    pub async fn get(&self, run_id: &str) -> Option<Run> {
        self.state.lock().await.get(run_id).cloned()
    }

    /// All retained runs, active first, then by most recent update.
    pub async fn snapshot(&self) -> Vec<Run> {
        retention::ordered(&*self.state.lock().await)
    }

    /// Most recently updated non-terminal run bound to `session`.
    pub async fn active_run_for_session(&self, session: &SessionRef) -> Option<Run> {
        self.state
            .lock()
            .await
            .values()
            .filter(|run| run.is_active() && run.session_ref.as_ref() == Some(session))
            .max_by_key(|run| run.updated_at)
            .cloned()
    }

    pub async fn counts(&self) -> RegistryCounts {
        let state = self.state.lock().await;
        state
            .values()
            .fold(RegistryCounts::default(), |mut counts, run| {
                if run.is_terminal() {
                    counts.closed += 1;
                } else {
                    counts.active += 1;
                }
                if run.needs_action {
                    counts.needs_action += 1;
                }
                counts
            })
    }

    /// Every merged record, in merge order. Slow receivers may lag.
    pub fn subscribe(&self) -> broadcast::Receiver<Run> {
        self.events.subscribe()
    }

    fn report_corrections(&self, run_id: &str, corrections: &[Inconsistency]) {
        if corrections.is_empty() {
            return;
        }
        for inconsistency in corrections {
            tracing::warn!(
                target: "runcoord::registry",
                run_id,
                corrected = inconsistency.corrected(),
                "{inconsistency}"
            );
        }
        self.telemetry
            .record_registry_corrections(corrections.len() as u64);
    }
}
