//! Durable backing for the run registry. The registry writes its whole pruned
//! collection on every merge; a store only has to make that write atomic.

use super::run::Run;
use anyhow::{bail, Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const STORE_FORMAT_VERSION: u32 = 1;

pub trait RunStore: Send + Sync {
    fn load(&self) -> BoxFuture<'_, Result<Vec<Run>>>;

    fn persist<'a>(&'a self, runs: &'a [Run]) -> BoxFuture<'a, Result<()>>;
}

/// Keeps the last persisted collection in memory. Used by tests and by
/// deployments that rebuild state from open sessions on every start.
#[derive(Debug, Default)]
pub struct MemoryStore {
    runs: Mutex<Vec<Run>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_runs(runs: Vec<Run>) -> Self {
        Self {
            runs: Mutex::new(runs),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of successful `persist` calls.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn stored(&self) -> Vec<Run> {
        self.runs
            .lock()
            .map(|runs| runs.clone())
            .unwrap_or_default()
    }
}

impl RunStore for MemoryStore {
    fn load(&self) -> BoxFuture<'_, Result<Vec<Run>>> {
        Box::pin(async move {
            let runs = self
                .runs
                .lock()
                .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
            Ok(runs.clone())
        })
    }

    fn persist<'a>(&'a self, runs: &'a [Run]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut stored = self
                .runs
                .lock()
                .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
            *stored = runs.to_vec();
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRuns {
    version: u32,
    runs: Vec<Run>,
}

/// Writes the collection as one JSON document, via a temporary sibling file
/// renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "runs.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl RunStore for JsonFileStore {
    fn load(&self) -> BoxFuture<'_, Result<Vec<Run>>> {
        Box::pin(async move {
            let bytes = match tokio::fs::read(&self.path).await {
                Ok(bytes) => bytes,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to read {}", self.path.display()))
                }
            };

            let stored: StoredRuns = serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to decode {}", self.path.display()))?;
            if stored.version != STORE_FORMAT_VERSION {
                bail!(
                    "unsupported run store version {} in {}",
                    stored.version,
                    self.path.display()
                );
            }
            Ok(stored.runs)
        })
    }

    fn persist<'a>(&'a self, runs: &'a [Run]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let document = StoredRuns {
                version: STORE_FORMAT_VERSION,
                runs: runs.to_vec(),
            };
            let bytes = serde_json::to_vec_pretty(&document).context("failed to encode runs")?;

            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }

            let temp = self.temp_path();
            tokio::fs::write(&temp, &bytes)
                .await
                .with_context(|| format!("failed to write {}", temp.display()))?;
            tokio::fs::rename(&temp, &self.path)
                .await
                .with_context(|| format!("failed to replace {}", self.path.display()))?;
            Ok(())
        })
    }
}
