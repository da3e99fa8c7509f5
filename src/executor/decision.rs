use crate::registry::Decision;
use std::collections::HashMap;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

/// Rendezvous between executors blocked on a human and whoever delivers the
/// decision. At most one waiter exists per run.
#[derive(Debug, Default)]
pub struct DecisionHub {
    waiters: Mutex<HashMap<String, oneshot::Sender<Decision>>>,
}

impl DecisionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for `run_id`, replacing any stale one. Register
    /// before publishing the run as waiting so no decision is lost.
    pub async fn register(&self, run_id: &str) -> oneshot::Receiver<Decision> {
        let (sender, receiver) = oneshot::channel();
        self.waiters.lock().await.insert(run_id.to_owned(), sender);
        receiver
    }

    /// Blocks until a decision arrives or `cancel` fires.
    pub async fn wait(
        &self,
        run_id: &str,
        receiver: oneshot::Receiver<Decision>,
        cancel: &CancellationToken,
    ) -> Option<Decision> {
        tokio::select! {
            _ = cancel.cancelled() => {
                self.waiters.lock().await.remove(run_id);
                None
            }
            decision = receiver => decision.ok(),
        }
    }

    /// Delivers `decision` to the waiter for `run_id`. Returns `false` if no
    /// executor is blocked on that run.
    pub async fn decide(&self, run_id: &str, decision: Decision) -> bool {
        let Some(sender) = self.waiters.lock().await.remove(run_id) else {
            return false;
        };
        sender.send(decision).is_ok()
    }

    /// Delivers `decision` to every waiter; returns the run ids reached.
    pub async fn decide_all(&self, decision: Decision) -> Vec<String> {
        let waiters: Vec<(String, oneshot::Sender<Decision>)> =
            self.waiters.lock().await.drain().collect();
        let mut delivered: Vec<String> = waiters
            .into_iter()
            .filter_map(|(run_id, sender)| sender.send(decision).ok().map(|_| run_id))
            .collect();
        delivered.sort();
        delivered
    }

    pub async fn is_waiting(&self, run_id: &str) -> bool {
        self.waiters
            .lock()
            .await
            .get(run_id)
            .is_some_and(|sender| !sender.is_closed())
    }

    pub async fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .waiters
            .lock()
            .await
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .map(|(run_id, _)| run_id.clone())
            .collect();
        ids.sort();
        ids
    }
}
