use std::sync::Arc;

use crate::support::{
    helpers::{briefing_variables, init_tracing, TestBed, BRIEFING},
    mock_driver::{MockDriver, MockSessionProvider},
};
use anyhow::{Context, Result};
use runcoord::{
    CompletionStatus, CoordinatorConfig, CoordinatorError, Decision, MemoryStore, RunStatus,
    StepPhase,
};
use std::time::Duration;

fn config(recovery_enabled: bool, max_attempts: u32) -> CoordinatorConfig {
    CoordinatorConfig::builder()
        .pacing(Duration::ZERO, Duration::ZERO)
        .recovery_enabled(recovery_enabled)
        .recovery_max_attempts(max_attempts)
        .recovery_delays(Duration::from_millis(1), Duration::from_millis(5))
        .capture(3, Duration::from_millis(1))
        .destroy_timeout(Duration::from_millis(200))
        .build()
        .expect("valid test config")
}

fn bed(recovery_enabled: bool, max_attempts: u32) -> TestBed {
    TestBed::with_parts(
        config(recovery_enabled, max_attempts),
        Arc::new(MemoryStore::new()),
        MockSessionProvider::new(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_recovery_waits_for_a_skip() -> Result<()> {
    init_tracing();
    let bed = bed(true, 2);
    let driver = MockDriver::new("tab-1");
    driver.queue_completions([CompletionStatus::TimedOut; 3]);
    bed.provider.queue_session(driver.clone());

    let run = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    let waiting = bed.wait_for_run(&run.id, |run| run.needs_action).await?;
    assert_eq!(waiting.status, RunStatus::Waiting);
    assert!(waiting
        .reason
        .as_deref()
        .is_some_and(|reason| reason.starts_with("timeout")));
    assert!(waiting.recovery.is_none());
    assert_eq!(driver.reload_count(), 2);
    assert_eq!(bed.coordinator.decisions().pending().await, vec![run.id.clone()]);

    bed.coordinator.decide(&run.id, Decision::Skip).await?;
    let done = bed
        .wait_for_run(&run.id, |run| run.status == RunStatus::Completed)
        .await?;

    let decision = done.decisions.last().context("decision logged")?;
    assert_eq!(decision.decision, Decision::Skip);
    assert_eq!(decision.step_index, 0);
    // Step one was sent once and never resent; steps two and three follow.
    assert_eq!(driver.sent().len(), 3);
    assert_eq!(
        bed.sink.delivered(),
        vec![(run.id.clone(), 2, "answer 3".to_string())]
    );

    let err = bed
        .coordinator
        .decide(&run.id, Decision::Wait)
        .await
        .expect_err("run already closed");
    assert_eq!(
        err.downcast_ref::<CoordinatorError>(),
        Some(&CoordinatorError::RunClosed { run_id: run.id })
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decision_for_a_busy_run_is_rejected() -> Result<()> {
    init_tracing();
    let bed = bed(true, 3);
    bed.provider.stall_new_sessions(true);

    let run = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    bed.wait_for_run(&run.id, |run| {
        run.phase == Some(StepPhase::AwaitingCompletion)
    })
    .await?;

    let err = bed
        .coordinator
        .decide(&run.id, Decision::Skip)
        .await
        .expect_err("run is not waiting");
    assert_eq!(
        err.downcast_ref::<CoordinatorError>(),
        Some(&CoordinatorError::RunNotWaiting {
            run_id: run.id.clone()
        })
    );

    let missing = bed
        .coordinator
        .decide("run-unknown", Decision::Skip)
        .await
        .expect_err("unknown run");
    assert!(matches!(
        missing.downcast_ref::<CoordinatorError>(),
        Some(CoordinatorError::RunNotFound { .. })
    ));

    bed.coordinator.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn orphaned_waiting_run_resumes_after_restart() -> Result<()> {
    init_tracing();
    let bed = bed(false, 1);
    let driver = MockDriver::new("tab-1");
    driver.queue_completions([CompletionStatus::TimedOut]);
    bed.provider.queue_session(driver.clone());

    let run = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    bed.wait_for_run(&run.id, |run| run.needs_action).await?;
    assert_eq!(driver.reload_count(), 0);

    bed.coordinator.shutdown().await;
    let parked = bed
        .coordinator
        .registry()
        .get(&run.id)
        .await
        .context("run retained")?;
    assert_eq!(parked.status, RunStatus::Waiting);
    assert!(parked.needs_action);

    let restarted = bed.restarted();
    restarted.coordinator.registry().restore().await?;

    let scan = restarted.coordinator.scan_and_resume().await?;
    assert!(scan.resumed.is_empty());
    assert_eq!(scan.skipped.len(), 1);
    assert_eq!(scan.skipped[0].reason, "awaiting a human decision");

    restarted.coordinator.decide(&run.id, Decision::Wait).await?;
    let done = restarted
        .wait_for_run(&run.id, |run| run.status == RunStatus::Completed)
        .await?;
    assert_eq!(
        done.decisions.last().map(|record| record.decision),
        Some(Decision::Wait)
    );
    // Waiting re-awaited the step already in the session instead of resending it.
    assert_eq!(driver.sent().len(), 3);
    assert_eq!(restarted.sink.delivered().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decide_all_releases_every_waiting_run() -> Result<()> {
    init_tracing();
    let bed = bed(false, 1);
    for session in ["tab-a", "tab-b"] {
        let driver = MockDriver::new(session);
        driver.queue_completions([CompletionStatus::TimedOut]);
        bed.provider.queue_session(driver);
    }

    let first = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    let second = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    for run_id in [&first.id, &second.id] {
        bed.wait_for_run(run_id, |run| run.needs_action).await?;
    }
    assert_eq!(bed.coordinator.registry().counts().await.needs_action, 2);

    let mut expected = vec![first.id.clone(), second.id.clone()];
    expected.sort();
    assert_eq!(bed.coordinator.decide_all(Decision::Skip).await, expected);

    for run_id in [&first.id, &second.id] {
        bed.wait_for_run(run_id, |run| run.status == RunStatus::Completed)
            .await?;
    }
    assert!(bed.coordinator.decide_all(Decision::Skip).await.is_empty());
    Ok(())
}
