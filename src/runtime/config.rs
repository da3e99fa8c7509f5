use crate::error::FailureKind;
use crate::position::DEFAULT_MIN_SIGNATURE_CHARS;
use crate::registry::DEFAULT_RETENTION_LIMIT;
use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_STEP_TIMEOUT_SECS: u64 = 3 * 60 * 60;
const DEFAULT_PACING_MIN_SECS: u64 = 3;
const DEFAULT_PACING_MAX_SECS: u64 = 12;
const DEFAULT_RECOVERY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RECOVERY_INITIAL_DELAY_SECS: u64 = 5;
const DEFAULT_RECOVERY_MAX_DELAY_SECS: u64 = 60;
const DEFAULT_RELOAD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CAPTURE_MAX_READS: usize = 5;
const DEFAULT_CAPTURE_INTERVAL_SECS: u64 = 2;
const DEFAULT_DESTROY_TIMEOUT_SECS: u64 = 10;
const DEFAULT_HARD_FAILURE_MARKERS: [&str; 4] = [
    "something went wrong",
    "an error occurred",
    "network error",
    "conversation not found",
];

/// Runtime configuration for the coordinator and everything it drives.
///
/// Instances are constructed via [`CoordinatorConfig::builder`] so invariants
/// are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    retention_limit: usize,
    step_timeout: Duration,
    pacing_min: Duration,
    pacing_max: Duration,
    recovery_enabled: bool,
    recovery_max_attempts: u32,
    recovery_initial_delay: Duration,
    recovery_max_delay: Duration,
    recoverable_failures: Vec<FailureKind>,
    reload_timeout: Duration,
    capture_max_reads: usize,
    capture_interval: Duration,
    hard_failure_markers: Vec<String>,
    min_signature_chars: usize,
    destroy_timeout: Duration,
    metrics_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retention_limit: DEFAULT_RETENTION_LIMIT,
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
            pacing_min: Duration::from_secs(DEFAULT_PACING_MIN_SECS),
            pacing_max: Duration::from_secs(DEFAULT_PACING_MAX_SECS),
            recovery_enabled: true,
            recovery_max_attempts: DEFAULT_RECOVERY_MAX_ATTEMPTS,
            recovery_initial_delay: Duration::from_secs(DEFAULT_RECOVERY_INITIAL_DELAY_SECS),
            recovery_max_delay: Duration::from_secs(DEFAULT_RECOVERY_MAX_DELAY_SECS),
            recoverable_failures: vec![
                FailureKind::Transport,
                FailureKind::Timeout,
                FailureKind::ContentInvalid,
            ],
            reload_timeout: Duration::from_secs(DEFAULT_RELOAD_TIMEOUT_SECS),
            capture_max_reads: DEFAULT_CAPTURE_MAX_READS,
            capture_interval: Duration::from_secs(DEFAULT_CAPTURE_INTERVAL_SECS),
            hard_failure_markers: DEFAULT_HARD_FAILURE_MARKERS
                .iter()
                .map(|marker| (*marker).to_owned())
                .collect(),
            min_signature_chars: DEFAULT_MIN_SIGNATURE_CHARS,
            destroy_timeout: Duration::from_secs(DEFAULT_DESTROY_TIMEOUT_SECS),
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
        }
    }
}

impl CoordinatorConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::default()
    }

    /// Number of closed runs retained by the registry.
    pub fn retention_limit(&self) -> usize {
        self.retention_limit
    }

    /// Budget for a single step's completion.
    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    pub fn pacing_min(&self) -> Duration {
        self.pacing_min
    }

    pub fn pacing_max(&self) -> Duration {
        self.pacing_max
    }

    pub fn recovery_enabled(&self) -> bool {
        self.recovery_enabled
    }

    /// Reload attempts allowed per failure episode.
    pub fn recovery_max_attempts(&self) -> u32 {
        self.recovery_max_attempts
    }

    pub fn recovery_initial_delay(&self) -> Duration {
        self.recovery_initial_delay
    }

    pub fn recovery_max_delay(&self) -> Duration {
        self.recovery_max_delay
    }

    pub fn recoverable_failures(&self) -> &[FailureKind] {
        &self.recoverable_failures
    }

    pub fn is_recoverable(&self, kind: FailureKind) -> bool {
        self.recoverable_failures.contains(&kind)
    }

    /// Confirmation window for a forced reload.
    pub fn reload_timeout(&self) -> Duration {
        self.reload_timeout
    }

    pub fn capture_max_reads(&self) -> usize {
        self.capture_max_reads
    }

    pub fn capture_interval(&self) -> Duration {
        self.capture_interval
    }

    /// Lower-cased substrings that mark an agent response as failed.
    pub fn hard_failure_markers(&self) -> &[String] {
        &self.hard_failure_markers
    }

    pub fn min_signature_chars(&self) -> usize {
        self.min_signature_chars
    }

    /// Upper bound on the background session teardown after a stop.
    pub fn destroy_timeout(&self) -> Duration {
        self.destroy_timeout
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout.is_zero() {
            bail!("step_timeout must be greater than 0");
        }

        if self.pacing_min > self.pacing_max {
            bail!(
                "pacing_min ({:?}) must not exceed pacing_max ({:?})",
                self.pacing_min,
                self.pacing_max
            );
        }

        if self.recovery_max_attempts == 0 {
            bail!("recovery_max_attempts must be greater than 0");
        }

        if self.recovery_initial_delay > self.recovery_max_delay {
            bail!(
                "recovery_initial_delay ({:?}) must not exceed recovery_max_delay ({:?})",
                self.recovery_initial_delay,
                self.recovery_max_delay
            );
        }

        if self.recoverable_failures.contains(&FailureKind::SessionLost) {
            bail!("recoverable_failures cannot include session_lost");
        }

        if self.reload_timeout.is_zero() {
            bail!("reload_timeout must be greater than 0");
        }

        if self.capture_max_reads == 0 {
            bail!("capture_max_reads must be greater than 0");
        }

        if self.min_signature_chars == 0 {
            bail!("min_signature_chars must be greater than 0");
        }

        if self.destroy_timeout.is_zero() {
            bail!("destroy_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self
            .hard_failure_markers
            .iter()
            .any(|marker| marker.trim().is_empty())
        {
            bail!("hard_failure_markers cannot contain empty markers");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct CoordinatorConfigBuilder {
    retention_limit: Option<usize>,
    step_timeout: Option<Duration>,
    pacing: Option<(Duration, Duration)>,
    recovery_enabled: Option<bool>,
    recovery_max_attempts: Option<u32>,
    recovery_initial_delay: Option<Duration>,
    recovery_max_delay: Option<Duration>,
    recoverable_failures: Option<Vec<FailureKind>>,
    reload_timeout: Option<Duration>,
    capture_max_reads: Option<usize>,
    capture_interval: Option<Duration>,
    hard_failure_markers: Option<Vec<String>>,
    min_signature_chars: Option<usize>,
    destroy_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl CoordinatorConfigBuilder {
    pub fn retention_limit(mut self, limit: usize) -> Self {
        self.retention_limit = Some(limit);
        self
    }

    pub fn step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    pub fn pacing(mut self, min: Duration, max: Duration) -> Self {
        self.pacing = Some((min, max));
        self
    }

    pub fn recovery_enabled(mut self, enabled: bool) -> Self {
        self.recovery_enabled = Some(enabled);
        self
    }

    pub fn recovery_max_attempts(mut self, attempts: u32) -> Self {
        self.recovery_max_attempts = Some(attempts);
        self
    }

    pub fn recovery_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.recovery_initial_delay = Some(initial);
        self.recovery_max_delay = Some(max);
        self
    }

    pub fn recoverable_failures(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.recoverable_failures = Some(kinds.into_iter().collect());
        self
    }

    pub fn reload_timeout(mut self, timeout: Duration) -> Self {
        self.reload_timeout = Some(timeout);
        self
    }

    pub fn capture(mut self, max_reads: usize, interval: Duration) -> Self {
        self.capture_max_reads = Some(max_reads);
        self.capture_interval = Some(interval);
        self
    }

    pub fn hard_failure_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.hard_failure_markers = Some(markers.into_iter().map(Into::into).collect());
        self
    }

    pub fn min_signature_chars(mut self, chars: usize) -> Self {
        self.min_signature_chars = Some(chars);
        self
    }

    pub fn destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<CoordinatorConfig> {
        let defaults = CoordinatorConfig::default();
        let (pacing_min, pacing_max) = self
            .pacing
            .unwrap_or((defaults.pacing_min, defaults.pacing_max));

        let config = CoordinatorConfig {
            retention_limit: self.retention_limit.unwrap_or(defaults.retention_limit),
            step_timeout: self.step_timeout.unwrap_or(defaults.step_timeout),
            pacing_min,
            pacing_max,
            recovery_enabled: self.recovery_enabled.unwrap_or(defaults.recovery_enabled),
            recovery_max_attempts: self
                .recovery_max_attempts
                .unwrap_or(defaults.recovery_max_attempts),
            recovery_initial_delay: self
                .recovery_initial_delay
                .unwrap_or(defaults.recovery_initial_delay),
            recovery_max_delay: self
                .recovery_max_delay
                .unwrap_or(defaults.recovery_max_delay),
            recoverable_failures: self
                .recoverable_failures
                .unwrap_or(defaults.recoverable_failures),
            reload_timeout: self.reload_timeout.unwrap_or(defaults.reload_timeout),
            capture_max_reads: self
                .capture_max_reads
                .unwrap_or(defaults.capture_max_reads),
            capture_interval: self.capture_interval.unwrap_or(defaults.capture_interval),
            hard_failure_markers: self
                .hard_failure_markers
                .map(|markers| markers.into_iter().map(normalized_marker).collect())
                .unwrap_or(defaults.hard_failure_markers),
            min_signature_chars: self
                .min_signature_chars
                .unwrap_or(defaults.min_signature_chars),
            destroy_timeout: self.destroy_timeout.unwrap_or(defaults.destroy_timeout),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
        };

        config.validate()?;
        Ok(config)
    }
}

fn normalized_marker(marker: String) -> String {
    marker.trim().to_lowercase()
}
