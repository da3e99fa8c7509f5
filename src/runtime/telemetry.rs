use crate::registry::RunRegistry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Monotonic counters shared by the registry, executor, recovery controller
/// and coordinator.
#[derive(Default, Debug)]
pub struct Telemetry {
    runs_started: AtomicU64,
    runs_resumed: AtomicU64,
    steps_completed: AtomicU64,
    recoveries_attempted: AtomicU64,
    recoveries_succeeded: AtomicU64,
    recoveries_exhausted: AtomicU64,
    decisions_requested: AtomicU64,
    registry_corrections: AtomicU64,
    persist_failures: AtomicU64,
}

impl Telemetry {
    pub fn record_run_started(&self) {
        self.runs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_run_resumed(&self) {
        self.runs_resumed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_step_completed(&self) {
        self.steps_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_attempt(&self) {
        self.recoveries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_succeeded(&self) {
        self.recoveries_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_exhausted(&self) {
        self.recoveries_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision_requested(&self) {
        self.decisions_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registry_corrections(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.registry_corrections.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            runs_resumed: self.runs_resumed.load(Ordering::Relaxed),
            steps_completed: self.steps_completed.load(Ordering::Relaxed),
            recoveries_attempted: self.recoveries_attempted.load(Ordering::Relaxed),
            recoveries_succeeded: self.recoveries_succeeded.load(Ordering::Relaxed),
            recoveries_exhausted: self.recoveries_exhausted.load(Ordering::Relaxed),
            decisions_requested: self.decisions_requested.load(Ordering::Relaxed),
            registry_corrections: self.registry_corrections.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub runs_started: u64,
    pub runs_resumed: u64,
    pub steps_completed: u64,
    pub recoveries_attempted: u64,
    pub recoveries_succeeded: u64,
    pub recoveries_exhausted: u64,
    pub decisions_requested: u64,
    pub registry_corrections: u64,
    pub persist_failures: u64,
}

/// Spawns a background task that periodically logs counters and registry sizes.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    registry: Arc<RunRegistry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "runcoord::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current = telemetry.snapshot();
                    let steps_delta = current
                        .steps_completed
                        .saturating_sub(last_snapshot.steps_completed);
                    let counts = registry.counts().await;

                    tracing::info!(
                        target: "runcoord::metrics",
                        active_runs = counts.active,
                        closed_runs = counts.closed,
                        waiting_runs = counts.needs_action,
                        steps_completed = current.steps_completed,
                        steps_delta,
                        recoveries_attempted = current.recoveries_attempted,
                        recoveries_exhausted = current.recoveries_exhausted,
                        registry_corrections = current.registry_corrections,
                        persist_failures = current.persist_failures,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current;
                }
            }
        }
    })
}
