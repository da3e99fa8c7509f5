use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use runcoord::{
    Coordinator, CoordinatorConfig, MemoryStore, Run, RunStore, Script, ScriptCatalog,
};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use super::mock_driver::{MockSessionProvider, RecordingSink};

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

pub const BRIEFING: &str = "briefing";
pub const REVIEW: &str = "review";

/// Placeholders only appear in each step's first sentence so rendered text
/// keeps the template's signature.
pub const BRIEFING_STEPS: [&str; 3] = [
    "Read the {{topic}} brief. Summarize the key facts. Keep it short and factual.",
    "Look again at the {{topic}} brief. List the open questions it raises. Order them by importance.",
    "Address the reply to {{name}}. Draft a reply to the team. Close with the next steps.",
];

pub const REVIEW_STEPS: [&str; 5] = [
    "Open the draft. Check the introduction for clarity. Note every unclear sentence.",
    "Continue with the draft. Check the methods section for gaps. Note every missing detail.",
    "Continue with the draft. Check the results section for errors. Note every wrong figure.",
    "Continue with the draft. Check the discussion for overclaims. Note every weak argument.",
    "Finish the draft review. Write the overall verdict. List the required changes.",
];

pub fn catalog() -> ScriptCatalog {
    ScriptCatalog::new()
        .with_script(Script::new(BRIEFING, BRIEFING_STEPS).expect("briefing script"))
        .with_script(Script::new(REVIEW, REVIEW_STEPS).expect("review script"))
}

pub fn briefing_variables() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("topic".to_string(), "launch".to_string()),
        ("name".to_string(), "Sam".to_string()),
    ])
}

pub fn render(template: &str, variables: &BTreeMap<String, String>) -> String {
    variables.iter().fold(template.to_string(), |text, (key, value)| {
        text.replace(&format!("{{{{{key}}}}}"), value)
    })
}

pub fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .pacing(Duration::ZERO, Duration::ZERO)
        .recovery_delays(Duration::from_millis(1), Duration::from_millis(5))
        .capture(3, Duration::from_millis(1))
        .destroy_timeout(Duration::from_millis(200))
        .metrics_interval(Duration::from_millis(50))
        .build()
        .expect("valid test config")
}

pub struct TestBed {
    pub coordinator: Arc<Coordinator>,
    pub provider: Arc<MockSessionProvider>,
    pub sink: Arc<RecordingSink>,
    pub store: Arc<dyn RunStore>,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_parts(
            fast_config(),
            Arc::new(MemoryStore::new()),
            MockSessionProvider::new(),
        )
    }

    pub fn with_parts(
        config: CoordinatorConfig,
        store: Arc<dyn RunStore>,
        provider: Arc<MockSessionProvider>,
    ) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let coordinator = Arc::new(Coordinator::new(
            config,
            store.clone(),
            provider.clone(),
            catalog(),
            sink.clone(),
        ));
        Self {
            coordinator,
            provider,
            sink,
            store,
        }
    }

    /// A second coordinator over the same store and sessions, as after a restart.
    pub fn restarted(&self) -> Self {
        Self::with_parts(fast_config(), self.store.clone(), self.provider.clone())
    }

    pub async fn wait_for_run<F>(&self, run_id: &str, predicate: F) -> Result<Run>
    where
        F: Fn(&Run) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(run) = self.coordinator.registry().get(run_id).await {
                if predicate(&run) {
                    return Ok(run);
                }
                if Instant::now() > deadline {
                    bail!("timed out waiting on run {run_id}; last state: {run:?}");
                }
            } else if Instant::now() > deadline {
                bail!("run {run_id} never appeared in the registry");
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_until_idle(&self) -> Result<()> {
        wait_until(|| async { self.coordinator.live_runs().await.is_empty() }).await
    }
}

pub async fn wait_until<F, Fut>(condition: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition().await {
        if Instant::now() > deadline {
            bail!("condition not reached within 5s");
        }
        sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
