use super::run::Run;
use std::cmp::Reverse;
use std::collections::HashMap;

/// Default number of closed runs kept in the registry.
pub const DEFAULT_RETENTION_LIMIT: usize = 50;

/// Drops closed runs beyond the `limit` most recent ones, oldest first.
/// Active runs are never evicted. Returns the evicted ids.
pub(crate) fn prune(runs: &mut HashMap<String, Run>, limit: usize) -> Vec<String> {
    let mut closed: Vec<(&String, &Run)> = runs.iter().filter(|(_, run)| run.is_terminal()).collect();
    if closed.len() <= limit {
        return Vec::new();
    }

    closed.sort_by_key(|(id, run)| (Reverse(run.recency()), Reverse(run.updated_at), *id));
    let evicted: Vec<String> = closed
        .into_iter()
        .skip(limit)
        .map(|(id, _)| id.clone())
        .collect();

    for id in &evicted {
        runs.remove(id);
    }
    evicted
}

/// Active runs first, then everything by most recent update.
pub(crate) fn ordered(runs: &HashMap<String, Run>) -> Vec<Run> {
    let mut all: Vec<Run> = runs.values().cloned().collect();
    all.sort_by(|a, b| {
        a.is_terminal()
            .cmp(&b.is_terminal())
            .then_with(|| b.updated_at.cmp(&a.updated_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    all
}
