use crate::coordinator::{Coordinator, ScanReport};
use crate::runtime::telemetry::spawn_metrics_reporter;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the coordinator lifecycle: restores persisted runs, re-attaches them
/// to open sessions, reports metrics and shuts everything down on Ctrl-C.
pub struct Runner {
    coordinator: Arc<Coordinator>,
    reporter: Option<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

impl Runner {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        Self {
            coordinator,
            reporter: None,
            started: false,
            stopped: false,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Returns a clone of the coordinator's root token so external callers can
    /// integrate with their own signal handlers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.coordinator.cancellation_token()
    }

    /// Restores the registry, runs one scan pass and starts the metrics
    /// reporter. Returns the scan report.
    pub async fn start(&mut self) -> Result<ScanReport> {
        if self.stopped {
            bail!("runner cannot be restarted after stop; build a new coordinator");
        }
        if self.started {
            return Ok(ScanReport::default());
        }

        let restored = self
            .coordinator
            .registry()
            .restore()
            .await
            .context("failed to restore runs at startup")?;

        let report = match self.coordinator.scan_and_resume().await {
            Ok(report) => report,
            Err(err) => {
                tracing::warn!(error = %err, "startup scan failed; runs stay resumable");
                ScanReport::default()
            }
        };

        let config = self.coordinator.config();
        self.reporter = Some(spawn_metrics_reporter(
            self.coordinator.telemetry().clone(),
            self.coordinator.registry().clone(),
            self.coordinator.cancellation_token().child_token(),
            config.metrics_interval(),
        ));
        self.started = true;

        tracing::info!(
            restored,
            resumed = report.resumed.len(),
            started = report.started.len(),
            "runner started"
        );
        Ok(report)
    }

    /// Interrupts every run task and waits for the reporter to exit.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.started {
            return Ok(());
        }

        self.coordinator.shutdown().await;
        if let Some(reporter) = self.reporter.take() {
            reporter.await.context("metrics reporter task failed")?;
        }
        self.started = false;
        self.stopped = true;
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the root token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        let shutdown = self.cancellation_token();
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }
}
