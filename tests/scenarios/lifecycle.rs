use std::sync::Arc;

use crate::support::{
    helpers::{
        briefing_variables, fast_config, init_tracing, render, wait_until, TestBed, BRIEFING,
        BRIEFING_STEPS,
    },
    mock_driver::{MockDriver, MockSessionProvider},
};
use anyhow::{Context, Result};
use runcoord::{
    Command, CommandReply, CoordinatorError, JsonFileStore, RunPatch, RunStatus, Runner,
    SessionRef, StepPhase, StopScope,
};
use serde_json::json;

fn is_coordinator_error(err: &anyhow::Error, expected: &CoordinatorError) -> bool {
    err.downcast_ref::<CoordinatorError>() == Some(expected)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_runs_script_to_completion() -> Result<()> {
    init_tracing();
    let bed = TestBed::new();
    let variables = briefing_variables();

    let run = bed.coordinator.start(BRIEFING, variables.clone()).await?;
    assert_eq!(run.status, RunStatus::Starting);
    assert_eq!(run.total_steps, 3);
    assert_eq!(run.session_ref, Some(SessionRef::new("tab-1")));

    let done = bed
        .wait_for_run(&run.id, |run| run.status == RunStatus::Completed)
        .await?;
    assert_eq!(done.current_step, 3);
    assert!(done.finished_at.is_some());
    assert!(!done.needs_action);

    let driver = bed
        .provider
        .driver(&SessionRef::new("tab-1"))
        .context("session opened")?;
    let expected: Vec<String> = BRIEFING_STEPS
        .iter()
        .map(|template| render(template, &variables))
        .collect();
    assert_eq!(driver.sent(), expected);
    assert_eq!(
        bed.sink.delivered(),
        vec![(run.id.clone(), 2, "answer 3".to_string())]
    );

    bed.wait_until_idle().await?;
    let telemetry = bed.coordinator.telemetry().snapshot();
    assert_eq!(telemetry.runs_started, 1);
    assert_eq!(telemetry.steps_completed, 3);
    Ok(())
}

#[tokio::test]
async fn unknown_category_is_rejected() -> Result<()> {
    init_tracing();
    let bed = TestBed::new();
    let err = bed
        .coordinator
        .start("translation", Default::default())
        .await
        .expect_err("no such script");
    assert!(is_coordinator_error(
        &err,
        &CoordinatorError::UnknownCategory {
            category: "translation".into()
        }
    ));
    assert!(bed.coordinator.list_runs().await.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_locks_the_run_and_tears_down_the_session() -> Result<()> {
    init_tracing();
    let bed = TestBed::new();
    bed.provider.stall_new_sessions(true);

    let run = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    bed.wait_for_run(&run.id, |run| {
        run.phase == Some(StepPhase::AwaitingCompletion)
    })
    .await?;

    let stopped = bed.coordinator.stop(StopScope::Run(run.id.clone())).await?;
    assert_eq!(stopped, vec![run.id.clone()]);

    let record = bed
        .coordinator
        .registry()
        .get(&run.id)
        .await
        .context("run retained")?;
    assert_eq!(record.status, RunStatus::Stopped);
    assert_eq!(record.reason.as_deref(), Some("stopped by request"));
    assert!(record.finished_at.is_some());

    let driver = bed
        .provider
        .driver(&SessionRef::new("tab-1"))
        .context("session opened")?;
    wait_until(|| async { driver.is_destroyed() }).await?;
    bed.wait_until_idle().await?;

    // Late progress from a task that has not noticed the stop yet.
    let late = bed
        .coordinator
        .registry()
        .upsert(
            &run.id,
            RunPatch::new()
                .status(RunStatus::Running)
                .current_step(3)
                .needs_action(true),
        )
        .await;
    assert_eq!(late.status, RunStatus::Stopped);
    assert_eq!(late.current_step, 1);
    assert!(!late.needs_action);

    assert!(bed
        .coordinator
        .stop(StopScope::Run(run.id.clone()))
        .await?
        .is_empty());
    let err = bed.coordinator.resume(&run.id).await.expect_err("closed run");
    assert!(is_coordinator_error(
        &err,
        &CoordinatorError::RunClosed { run_id: run.id }
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_by_session_and_stop_all() -> Result<()> {
    init_tracing();
    let bed = TestBed::new();
    bed.provider.stall_new_sessions(true);

    let first = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    let second = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    for run_id in [&first.id, &second.id] {
        bed.wait_for_run(run_id, |run| {
            run.phase == Some(StepPhase::AwaitingCompletion)
        })
        .await?;
    }

    let stopped = bed
        .coordinator
        .stop(StopScope::Session(SessionRef::new("tab-1")))
        .await?;
    assert_eq!(stopped, vec![first.id.clone()]);
    let survivor = bed
        .coordinator
        .registry()
        .get(&second.id)
        .await
        .context("second run")?;
    assert!(survivor.is_active());

    let stopped = bed.coordinator.stop(StopScope::All).await?;
    assert_eq!(stopped, vec![second.id.clone()]);
    bed.wait_until_idle().await?;
    assert_eq!(bed.coordinator.registry().counts().await.active, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_leaves_runs_resumable_after_restart() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = Arc::new(JsonFileStore::new(dir.path().join("runs.json")));
    let provider = MockSessionProvider::new();
    provider.stall_new_sessions(true);

    let bed = TestBed::with_parts(fast_config(), store, provider);
    let run = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    bed.wait_for_run(&run.id, |run| {
        run.phase == Some(StepPhase::AwaitingCompletion)
    })
    .await?;

    bed.coordinator.shutdown().await;
    assert!(bed.coordinator.live_runs().await.is_empty());
    let interrupted = bed
        .coordinator
        .registry()
        .get(&run.id)
        .await
        .context("run retained")?;
    assert_eq!(interrupted.status, RunStatus::Running);

    let driver = bed
        .provider
        .driver(&SessionRef::new("tab-1"))
        .context("session opened")?;
    driver.set_stalled(false);

    let restarted = bed.restarted();
    let mut runner = Runner::new(restarted.coordinator.clone());
    let report = runner.start().await?;
    assert_eq!(report.resumed, vec![run.id.clone()]);
    assert!(report.started.is_empty());

    restarted
        .wait_for_run(&run.id, |run| run.status == RunStatus::Completed)
        .await?;
    // The first step was already in the session and is not sent twice.
    assert_eq!(driver.sent().len(), 3);
    assert_eq!(restarted.sink.delivered().len(), 1);
    assert_eq!(restarted.coordinator.telemetry().snapshot().runs_resumed, 1);

    runner.stop().await?;
    assert!(runner.start().await.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_task_fails_its_run() -> Result<()> {
    init_tracing();
    let bed = TestBed::new();
    let driver = MockDriver::new("tab-boom");
    driver.panic_on_read();
    bed.provider.queue_session(driver);

    let run = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    let failed = bed
        .wait_for_run(&run.id, |run| run.status == RunStatus::Failed)
        .await?;
    let reason = failed.reason.context("failure reason")?;
    assert!(reason.starts_with("run task panicked"), "{reason}");
    bed.wait_until_idle().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_dispatch_through_the_table() -> Result<()> {
    init_tracing();
    let bed = TestBed::new();

    let command = Command::from_value(json!({
        "command": "start",
        "category": "briefing",
        "variables": {"topic": "budget", "name": "Ana"},
    }))?;
    let CommandReply::Run(run) = bed.coordinator.dispatch(command).await? else {
        panic!("start should reply with the run");
    };
    bed.wait_for_run(&run.id, |run| run.status == RunStatus::Completed)
        .await?;

    let CommandReply::Runs(runs) = bed.coordinator.dispatch(Command::ListRuns).await? else {
        panic!("list_runs should reply with runs");
    };
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].variables.get("name").map(String::as_str), Some("Ana"));

    let err = bed
        .coordinator
        .dispatch(Command::Resume {
            run_id: run.id.clone(),
        })
        .await
        .expect_err("completed run cannot resume");
    assert!(is_coordinator_error(
        &err,
        &CoordinatorError::RunClosed { run_id: run.id }
    ));

    let reply = bed
        .coordinator
        .dispatch(Command::Stop {
            scope: StopScope::All,
        })
        .await?;
    assert_eq!(reply, CommandReply::Stopped(Vec::new()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_of_starts_gets_distinct_runs() -> Result<()> {
    init_tracing();
    let bed = TestBed::new();
    bed.provider.stall_new_sessions(true);

    let starts = (0..16).map(|_| bed.coordinator.start(BRIEFING, briefing_variables()));
    let runs = futures::future::try_join_all(starts).await?;
    let ids: std::collections::HashSet<&str> = runs.iter().map(|run| run.id.as_str()).collect();
    assert_eq!(ids.len(), 16);
    assert_eq!(bed.coordinator.registry().counts().await.active, 16);

    let mut stopped = bed.coordinator.stop(StopScope::All).await?;
    stopped.sort();
    let mut expected: Vec<String> = runs.into_iter().map(|run| run.id).collect();
    expected.sort();
    assert_eq!(stopped, expected);
    bed.wait_until_idle().await?;
    Ok(())
}
