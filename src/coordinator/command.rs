//! Closed set of coordinator commands and the table that routes them.

use super::{Coordinator, ScanReport};
use crate::driver::SessionRef;
use crate::registry::{Decision, Run};
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopScope {
    Run(String),
    Session(SessionRef),
    All,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Start {
        category: String,
        #[serde(default)]
        variables: BTreeMap<String, String>,
    },
    Resume {
        run_id: String,
    },
    Stop {
        scope: StopScope,
    },
    Decide {
        run_id: String,
        decision: Decision,
    },
    DecideAll {
        decision: Decision,
    },
    ScanAndResume,
    ListRuns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Start,
    Resume,
    Stop,
    Decide,
    DecideAll,
    ScanAndResume,
    ListRuns,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Decide => "decide",
            Self::DecideAll => "decide_all",
            Self::ScanAndResume => "scan_and_resume",
            Self::ListRuns => "list_runs",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Start { .. } => CommandKind::Start,
            Command::Resume { .. } => CommandKind::Resume,
            Command::Stop { .. } => CommandKind::Stop,
            Command::Decide { .. } => CommandKind::Decide,
            Command::DecideAll { .. } => CommandKind::DecideAll,
            Command::ScanAndResume => CommandKind::ScanAndResume,
            Command::ListRuns => CommandKind::ListRuns,
        }
    }

    /// Parses an external trigger such as `{"command": "decide", "run_id": "r1", "decision": "skip"}`.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).context("invalid coordinator command")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reply", content = "data", rename_all = "snake_case")]
pub enum CommandReply {
    Run(Run),
    Stopped(Vec<String>),
    Decided(Vec<String>),
    Scan(ScanReport),
    Runs(Vec<Run>),
}

type Handler = for<'a> fn(&'a Coordinator, Command) -> BoxFuture<'a, Result<CommandReply>>;

const HANDLERS: [(CommandKind, Handler); 7] = [
    (CommandKind::Start, start),
    (CommandKind::Resume, resume),
    (CommandKind::Stop, stop),
    (CommandKind::Decide, decide),
    (CommandKind::DecideAll, decide_all),
    (CommandKind::ScanAndResume, scan_and_resume),
    (CommandKind::ListRuns, list_runs),
];

pub(super) async fn dispatch(coordinator: &Coordinator, command: Command) -> Result<CommandReply> {
    let kind = command.kind();
    let handler = HANDLERS
        .iter()
        .find(|(registered, _)| *registered == kind)
        .map(|(_, handler)| *handler)
        .ok_or_else(|| anyhow!("no handler registered for {kind}"))?;
    tracing::debug!(command = %kind, "dispatching coordinator command");
    handler(coordinator, command).await
}

fn mismatched(expected: CommandKind, command: &Command) -> anyhow::Error {
    anyhow!("{expected} handler received a {} command", command.kind())
}

fn start(coordinator: &Coordinator, command: Command) -> BoxFuture<'_, Result<CommandReply>> {
    Box::pin(async move {
        match command {
            Command::Start {
                category,
                variables,
            } => Ok(CommandReply::Run(coordinator.start(&category, variables).await?)),
            other => Err(mismatched(CommandKind::Start, &other)),
        }
    })
}

fn resume(coordinator: &Coordinator, command: Command) -> BoxFuture<'_, Result<CommandReply>> {
    Box::pin(async move {
        let Command::Resume { run_id } = &command else {
            return Err(mismatched(CommandKind::Resume, &command));
        };
        Ok(CommandReply::Run(coordinator.resume(run_id).await?))
    })
}

fn stop(coordinator: &Coordinator, command: Command) -> BoxFuture<'_, Result<CommandReply>> {
    Box::pin(async move {
        match command {
            Command::Stop { scope } => Ok(CommandReply::Stopped(coordinator.stop(scope).await?)),
            other => Err(mismatched(CommandKind::Stop, &other)),
        }
    })
}

fn decide(coordinator: &Coordinator, command: Command) -> BoxFuture<'_, Result<CommandReply>> {
    Box::pin(async move {
        let Command::Decide { run_id, decision } = &command else {
            return Err(mismatched(CommandKind::Decide, &command));
        };
        coordinator.decide(run_id, *decision).await?;
        Ok(CommandReply::Decided(vec![run_id.clone()]))
    })
}

fn decide_all(coordinator: &Coordinator, command: Command) -> BoxFuture<'_, Result<CommandReply>> {
    Box::pin(async move {
        match command {
            Command::DecideAll { decision } => {
                Ok(CommandReply::Decided(coordinator.decide_all(decision).await))
            }
            other => Err(mismatched(CommandKind::DecideAll, &other)),
        }
    })
}

fn scan_and_resume(
    coordinator: &Coordinator,
    command: Command,
) -> BoxFuture<'_, Result<CommandReply>> {
    Box::pin(async move {
        if command.kind() != CommandKind::ScanAndResume {
            bail!(mismatched(CommandKind::ScanAndResume, &command));
        }
        Ok(CommandReply::Scan(coordinator.scan_and_resume().await?))
    })
}

fn list_runs(coordinator: &Coordinator, command: Command) -> BoxFuture<'_, Result<CommandReply>> {
    Box::pin(async move {
        if command.kind() != CommandKind::ListRuns {
            bail!(mismatched(CommandKind::ListRuns, &command));
        }
        Ok(CommandReply::Runs(coordinator.list_runs().await))
    })
}
