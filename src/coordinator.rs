//! Owns every run task and exposes the command surface: start, resume, stop,
//! decide and the bulk scan that re-attaches runs to open sessions.
//!
//! Each run executes in its own tokio task under a child of the coordinator's
//! root [`CancellationToken`]. Stopping a run writes the terminal status to the
//! registry before the task is cancelled, so late progress from the task is
//! discarded by the merge. Cancelling the root only interrupts tasks; their
//! runs stay open and can be resumed by a later scan.

pub mod command;
pub mod scan;

pub use command::{Command, CommandKind, CommandReply, StopScope};
pub use scan::{ScanReport, SkippedSession};

use crate::driver::{AgentDriver, SessionProvider, SessionRef, Sink};
use crate::error::CoordinatorError;
use crate::executor::{DecisionHub, Outcome, ResumePoint, StepExecutor};
use crate::position::PositionDetector;
use crate::recovery::resolve_resume_point;
use crate::registry::{
    Decision, DecisionRecord, Run, RunPatch, RunRegistry, RunStatus, RunStore, StepPhase,
};
use crate::runtime::config::CoordinatorConfig;
use crate::runtime::telemetry::Telemetry;
use crate::script::{Script, ScriptCatalog};
use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use rand::Rng;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STOP_REASON: &str = "stopped by request";

struct ManagedRun {
    task_id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    driver: Arc<dyn AgentDriver>,
}

type TaskMap = Arc<Mutex<HashMap<String, ManagedRun>>>;

pub struct Coordinator {
    config: Arc<CoordinatorConfig>,
    registry: Arc<RunRegistry>,
    sessions: Arc<dyn SessionProvider>,
    scripts: Arc<ScriptCatalog>,
    executor: Arc<StepExecutor>,
    decisions: Arc<DecisionHub>,
    detector: PositionDetector,
    tasks: TaskMap,
    next_task_id: AtomicU64,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn RunStore>,
        sessions: Arc<dyn SessionProvider>,
        scripts: ScriptCatalog,
        sink: Arc<dyn Sink>,
    ) -> Self {
        let config = Arc::new(config);
        let telemetry = Arc::new(Telemetry::default());
        let registry = Arc::new(RunRegistry::new(
            store,
            config.retention_limit(),
            telemetry.clone(),
        ));
        let decisions = Arc::new(DecisionHub::new());
        let executor = Arc::new(StepExecutor::new(
            registry.clone(),
            decisions.clone(),
            sink,
            config.clone(),
        ));

        Self {
            detector: PositionDetector::new(config.min_signature_chars()),
            config,
            registry,
            sessions,
            scripts: Arc::new(scripts),
            executor,
            decisions,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_task_id: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            telemetry,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn decisions(&self) -> &Arc<DecisionHub> {
        &self.decisions
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Root token; every run task holds a child of it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ids of runs that currently have a task, sorted.
    pub async fn live_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn dispatch(&self, command: Command) -> Result<CommandReply> {
        command::dispatch(self, command).await
    }

    /// Opens a session for `category` and starts a new run at its first step.
    pub async fn start(&self, category: &str, variables: BTreeMap<String, String>) -> Result<Run> {
        let script = self.script_for(category)?;
        let driver = self
            .sessions
            .open(category)
            .await
            .with_context(|| format!("failed to open a session for category {category}"))?;

        let run_id = self.fresh_run_id().await;
        let run = self
            .registry
            .upsert(
                &run_id,
                RunPatch::new()
                    .status(RunStatus::Starting)
                    .category(category)
                    .session_ref(driver.session_ref().clone())
                    .total_steps(script.len())
                    .current_step(1)
                    .variables(variables),
            )
            .await;
        self.telemetry.record_run_started();
        tracing::info!(
            run_id = %run.id,
            category,
            session = %driver.session_ref(),
            steps = script.len(),
            "run started"
        );

        self.spawn_run(&run.id, driver, script, ResumePoint::start())
            .await;
        Ok(run)
    }

    /// Re-attaches a persisted open run that has no task and continues it
    /// from the position its transcript shows.
    pub async fn resume(&self, run_id: &str) -> Result<Run> {
        let run = self.open_run(run_id).await?;
        if self.has_task(run_id).await {
            return Err(CoordinatorError::RunAlreadyActive {
                run_id: run_id.to_owned(),
            }
            .into());
        }

        let script = self.script_for(&run.category)?;
        let driver = self.attach(&run).await?;
        let point = self.locate(&run, driver.as_ref(), &script).await;
        self.continue_run(&run, driver, script, point, None).await
    }

    /// Locks every run in `scope` as stopped and cancels its task. Returns
    /// the ids that were stopped; runs already closed are left untouched.
    pub async fn stop(&self, scope: StopScope) -> Result<Vec<String>> {
        let targets: Vec<Run> = match &scope {
            StopScope::Run(run_id) => {
                let run = self.registry.get(run_id).await.ok_or_else(|| {
                    CoordinatorError::RunNotFound {
                        run_id: run_id.clone(),
                    }
                })?;
                vec![run]
            }
            StopScope::Session(session) => self
                .registry
                .snapshot()
                .await
                .into_iter()
                .filter(|run| run.session_ref.as_ref() == Some(session))
                .collect(),
            StopScope::All => self.registry.snapshot().await,
        };

        let mut stopped = Vec::new();
        for run in targets.into_iter().filter(Run::is_active) {
            self.registry
                .upsert(
                    &run.id,
                    RunPatch::new()
                        .status(RunStatus::Stopped)
                        .needs_action(false)
                        .reason(STOP_REASON),
                )
                .await;

            let managed = self.tasks.lock().await.remove(&run.id);
            let driver = match managed {
                Some(managed) => {
                    managed.cancel.cancel();
                    Some(managed.driver)
                }
                None => None,
            };
            self.destroy_in_background(&run, driver);

            tracing::info!(run_id = %run.id, "run stopped");
            stopped.push(run.id);
        }

        stopped.sort();
        Ok(stopped)
    }

    /// Resolves a run blocked on a human. If its task is gone (for example
    /// after a restart) the run is re-attached: `wait` resumes where the
    /// transcript shows, `skip` continues with the following step.
    pub async fn decide(&self, run_id: &str, decision: Decision) -> Result<()> {
        let run = self.open_run(run_id).await?;
        if !run.needs_action {
            return Err(CoordinatorError::RunNotWaiting {
                run_id: run_id.to_owned(),
            }
            .into());
        }

        if self.decisions.decide(run_id, decision).await {
            tracing::info!(run_id, decision = %decision, "decision delivered to run task");
            return Ok(());
        }
        if self.has_task(run_id).await {
            return Err(CoordinatorError::RunNotWaiting {
                run_id: run_id.to_owned(),
            }
            .into());
        }

        let script = self.script_for(&run.category)?;
        let driver = self.attach(&run).await?;
        let failed_index = run.checkpoint_index();
        let point = match decision {
            Decision::Wait => self.locate(&run, driver.as_ref(), &script).await,
            Decision::Skip => ResumePoint::fresh(failed_index + 1),
        };
        let record = DecisionRecord {
            decision,
            step_index: failed_index,
            failure: run.reason.clone(),
            decided_at: Utc::now(),
        };

        tracing::info!(
            run_id,
            decision = %decision,
            resume_at = point.step_index,
            "decision resumed orphaned run"
        );
        self.continue_run(&run, driver, script, point, Some(record))
            .await?;
        Ok(())
    }

    /// Applies `decision` to every run that needs action. Returns the ids that
    /// accepted it; failures are logged and skipped.
    pub async fn decide_all(&self, decision: Decision) -> Vec<String> {
        let waiting: Vec<String> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|run| run.is_active() && run.needs_action)
            .map(|run| run.id)
            .collect();

        let mut decided = Vec::new();
        for run_id in waiting {
            match self.decide(&run_id, decision).await {
                Ok(()) => decided.push(run_id),
                Err(err) => {
                    tracing::warn!(run_id = %run_id, error = %err, "bulk decision skipped run")
                }
            }
        }
        decided.sort();
        decided
    }

    /// One pass over the provider's open sessions against a registry snapshot
    /// taken at the start of the pass.
    pub async fn scan_and_resume(&self) -> Result<ScanReport> {
        let snapshot = self.registry.snapshot().await;
        let sessions = self
            .sessions
            .open_sessions()
            .await
            .context("failed to list open sessions")?;

        let mut report = ScanReport::default();
        for open in sessions {
            let session = open.session_ref;
            if self.session_has_task(&session).await {
                report.skip(session, "run task already live");
                continue;
            }

            let latest = snapshot
                .iter()
                .filter(|run| run.session_ref.as_ref() == Some(&session))
                .max_by_key(|run| run.updated_at);

            match latest {
                Some(run) if run.is_terminal() => {
                    report.skip(session, format!("bound run {} is {}", run.id, run.status));
                }
                Some(run) if run.needs_action => {
                    report.skip(session, "awaiting a human decision");
                }
                Some(run) => match self.resume(&run.id).await {
                    Ok(resumed) => report.resumed.push(resumed.id),
                    Err(err) => report.skip(session, format!("resume failed: {err:#}")),
                },
                None => match self.adopt(&session, open.category.as_deref()).await {
                    Ok(Some(run)) => report.started.push(run.id),
                    Ok(None) => report.skip(session, "position not detected"),
                    Err(err) => report.skip(session, format!("adoption failed: {err:#}")),
                },
            }
        }

        tracing::info!(
            resumed = report.resumed.len(),
            started = report.started.len(),
            skipped = report.skipped.len(),
            "scan pass finished"
        );
        Ok(report)
    }

    pub async fn list_runs(&self) -> Vec<Run> {
        self.registry.snapshot().await
    }

    /// Cancels the root token and waits for every run task to exit. Runs are
    /// left in their current, non-terminal state.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drained: Vec<(String, ManagedRun)> = self.tasks.lock().await.drain().collect();
        for (run_id, managed) in drained {
            if let Err(err) = managed.handle.await {
                tracing::warn!(run_id = %run_id, error = %err, "run task did not exit cleanly");
            }
        }
        tracing::info!("coordinator shut down");
    }

    /// Starts a run for a session no run is bound to, at the step its
    /// transcript shows was last sent.
    async fn adopt(&self, session: &SessionRef, category: Option<&str>) -> Result<Option<Run>> {
        let candidates = match category {
            Some(category) => vec![self.script_for(category)?],
            None => self.scripts.ordered(),
        };

        let driver = self
            .sessions
            .attach(session)
            .await
            .with_context(|| format!("failed to attach session {session}"))?;
        let transcript = driver
            .read_transcript()
            .await
            .with_context(|| format!("failed to read transcript of session {session}"))?;

        let Some((script, step_index)) =
            scan::detect_across(&self.detector, &transcript, &candidates)
        else {
            return Ok(None);
        };

        let run_id = self.fresh_run_id().await;
        let run = self
            .registry
            .upsert(
                &run_id,
                RunPatch::new()
                    .status(RunStatus::Running)
                    .category(script.category())
                    .session_ref(session.clone())
                    .total_steps(script.len())
                    .step_index(step_index)
                    .phase(StepPhase::AwaitingCompletion),
            )
            .await;
        self.telemetry.record_run_started();
        tracing::info!(
            run_id = %run.id,
            session = %session,
            category = script.category(),
            step = step_index,
            "adopted open session"
        );

        self.spawn_run(&run.id, driver, script, ResumePoint::sent(step_index))
            .await;
        Ok(Some(run))
    }

    async fn continue_run(
        &self,
        run: &Run,
        driver: Arc<dyn AgentDriver>,
        script: Arc<Script>,
        point: ResumePoint,
        decision: Option<DecisionRecord>,
    ) -> Result<Run> {
        let mut patch = RunPatch::new()
            .session_ref(driver.session_ref().clone())
            .total_steps(script.len())
            .needs_action(false)
            .clear_reason()
            .clear_recovery();
        if let Some(record) = decision {
            patch = patch.decision(record);
        }

        if point.step_index >= script.len() {
            let run = self
                .registry
                .upsert(
                    &run.id,
                    patch
                        .status(RunStatus::Completed)
                        .current_step(script.len())
                        .phase(StepPhase::Advanced),
                )
                .await;
            tracing::info!(run_id = %run.id, "nothing left to execute; run completed");
            return Ok(run);
        }

        let phase = if point.already_sent {
            StepPhase::AwaitingCompletion
        } else {
            StepPhase::Sending
        };
        let updated = self
            .registry
            .upsert(
                &run.id,
                patch
                    .status(RunStatus::Running)
                    .step_index(point.step_index)
                    .phase(phase),
            )
            .await;
        if updated.is_terminal() {
            return Err(CoordinatorError::RunClosed {
                run_id: run.id.clone(),
            }
            .into());
        }

        self.telemetry.record_run_resumed();
        tracing::info!(
            run_id = %run.id,
            step = point.step_index,
            already_sent = point.already_sent,
            "run resumed"
        );
        self.spawn_run(&run.id, driver, script, point).await;
        Ok(updated)
    }

    /// Where to continue a run given its checkpoint and its session transcript.
    async fn locate(&self, run: &Run, driver: &dyn AgentDriver, script: &Script) -> ResumePoint {
        let checkpoint = run.checkpoint_index();
        match driver.read_transcript().await {
            Ok(transcript) => {
                let detection = self.detector.detect(&transcript, script.signatures());
                tracing::debug!(run_id = %run.id, checkpoint, detection = ?detection, "located run");
                resolve_resume_point(checkpoint, &detection)
            }
            Err(err) => {
                tracing::warn!(
                    run_id = %run.id,
                    error = %err,
                    "could not read transcript; resending checkpoint"
                );
                ResumePoint::fresh(checkpoint)
            }
        }
    }

    async fn spawn_run(
        &self,
        run_id: &str,
        driver: Arc<dyn AgentDriver>,
        script: Arc<Script>,
        point: ResumePoint,
    ) {
        let mut tasks = self.tasks.lock().await;
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();

        let handle = tokio::spawn(supervise(
            self.executor.clone(),
            self.registry.clone(),
            self.tasks.clone(),
            task_id,
            run_id.to_owned(),
            driver.clone(),
            script,
            point,
            cancel.clone(),
        ));

        let replaced = tasks.insert(
            run_id.to_owned(),
            ManagedRun {
                task_id,
                cancel,
                handle,
                driver,
            },
        );
        if let Some(previous) = replaced {
            tracing::warn!(run_id, "replacing an existing run task");
            previous.cancel.cancel();
        }
    }

    fn destroy_in_background(&self, run: &Run, driver: Option<Arc<dyn AgentDriver>>) {
        let session = run.session_ref.clone();
        if driver.is_none() && session.is_none() {
            return;
        }

        let sessions = self.sessions.clone();
        let timeout = self.config.destroy_timeout();
        let run_id = run.id.clone();
        tokio::spawn(async move {
            let driver = match (driver, session) {
                (Some(driver), _) => driver,
                (None, Some(session)) => match sessions.attach(&session).await {
                    Ok(driver) => driver,
                    Err(err) => {
                        tracing::debug!(run_id = %run_id, error = %err, "no session to destroy");
                        return;
                    }
                },
                (None, None) => return,
            };
            if !driver.session_exists().await {
                tracing::debug!(run_id = %run_id, "session already gone");
                return;
            }
            if tokio::time::timeout(timeout, driver.destroy()).await.is_err() {
                tracing::warn!(run_id = %run_id, ?timeout, "session teardown timed out");
            }
        });
    }

    async fn open_run(&self, run_id: &str) -> Result<Run> {
        let run = self
            .registry
            .get(run_id)
            .await
            .ok_or_else(|| CoordinatorError::RunNotFound {
                run_id: run_id.to_owned(),
            })?;
        if run.is_terminal() {
            return Err(CoordinatorError::RunClosed {
                run_id: run_id.to_owned(),
            }
            .into());
        }
        Ok(run)
    }

    async fn attach(&self, run: &Run) -> Result<Arc<dyn AgentDriver>> {
        let session = run
            .session_ref
            .as_ref()
            .ok_or_else(|| CoordinatorError::MissingSession {
                run_id: run.id.clone(),
            })?;
        self.sessions
            .attach(session)
            .await
            .with_context(|| format!("failed to attach session {session} for run {}", run.id))
    }

    fn script_for(&self, category: &str) -> Result<Arc<Script>> {
        self.scripts.get(category).ok_or_else(|| {
            CoordinatorError::UnknownCategory {
                category: category.to_owned(),
            }
            .into()
        })
    }

    /// Mints an id no record in the registry already carries.
    async fn fresh_run_id(&self) -> String {
        loop {
            let run_id = generate_run_id();
            if self.registry.get(&run_id).await.is_none() {
                return run_id;
            }
            tracing::warn!(run_id = %run_id, "generated run id already taken, retrying");
        }
    }

    async fn has_task(&self, run_id: &str) -> bool {
        self.tasks.lock().await.contains_key(run_id)
    }

    async fn session_has_task(&self, session: &SessionRef) -> bool {
        self.tasks
            .lock()
            .await
            .values()
            .any(|managed| managed.driver.session_ref() == session)
    }
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    executor: Arc<StepExecutor>,
    registry: Arc<RunRegistry>,
    tasks: TaskMap,
    task_id: u64,
    run_id: String,
    driver: Arc<dyn AgentDriver>,
    script: Arc<Script>,
    point: ResumePoint,
    cancel: CancellationToken,
) {
    let result = AssertUnwindSafe(executor.run(&run_id, driver, script, point, &cancel))
        .catch_unwind()
        .await;

    match result {
        Ok(Outcome::Completed) => {}
        Ok(Outcome::Interrupted) => {
            tracing::debug!(run_id = %run_id, "run task interrupted");
        }
        Ok(Outcome::Failed { reason }) => {
            tracing::debug!(run_id = %run_id, reason = %reason, "run task ended with failure");
        }
        Err(payload) => {
            let panic_msg = panic_message(payload.as_ref());
            tracing::error!(run_id = %run_id, panic = %panic_msg, "run task panicked");
            registry
                .upsert(
                    &run_id,
                    RunPatch::new()
                        .status(RunStatus::Failed)
                        .needs_action(false)
                        .reason(format!("run task panicked: {panic_msg}")),
                )
                .await;
        }
    }

    let mut tasks = tasks.lock().await;
    if tasks
        .get(&run_id)
        .is_some_and(|managed| managed.task_id == task_id)
    {
        tasks.remove(&run_id);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Ids are unique within a process through the sequence; the timestamp and
/// salt keep them apart from ids minted before a restart.
fn generate_run_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0);
    let sequence = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let salt: u16 = rand::thread_rng().gen();
    format!("run-{millis:x}-{sequence:x}-{salt:04x}")
}
