use crate::support::{
    helpers::{briefing_variables, init_tracing, TestBed, BRIEFING, REVIEW, REVIEW_STEPS},
    mock_driver::MockDriver,
};
use anyhow::{Context, Result};
use runcoord::{Command, CommandReply, RunStatus, SessionRef, StepPhase, StopScope};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_adopts_an_unbound_session_at_its_detected_step() -> Result<()> {
    init_tracing();
    let bed = TestBed::new();
    let adopted = MockDriver::new("tab-7").with_history(&REVIEW_STEPS[..4]);
    bed.provider.insert(adopted.clone(), None);
    bed.provider
        .insert(MockDriver::new("tab-8").with_history(&["hello there"]), None);

    let report = bed.coordinator.scan_and_resume().await?;
    assert!(report.resumed.is_empty());
    assert_eq!(report.started.len(), 1);
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].session_ref, SessionRef::new("tab-8"));
    assert_eq!(report.skipped[0].reason, "position not detected");

    let run_id = report.started[0].clone();
    let run = bed
        .coordinator
        .registry()
        .get(&run_id)
        .await
        .context("adopted run")?;
    assert_eq!(run.category, REVIEW);
    assert_eq!(run.session_ref, Some(SessionRef::new("tab-7")));
    // The fourth step was the last one sent; the run anchors there.
    assert_eq!(run.current_step, 4);

    bed.wait_for_run(&run_id, |run| run.status == RunStatus::Completed)
        .await?;
    assert_eq!(adopted.sent(), vec![REVIEW_STEPS[4].to_string()]);
    assert_eq!(
        bed.sink.delivered(),
        vec![(run_id, 4, "answer 1".to_string())]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scan_skips_live_and_closed_sessions() -> Result<()> {
    init_tracing();
    let bed = TestBed::new();

    let finished = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    bed.wait_for_run(&finished.id, |run| run.status == RunStatus::Completed)
        .await?;
    bed.wait_until_idle().await?;

    bed.provider.stall_new_sessions(true);
    let live = bed.coordinator.start(BRIEFING, briefing_variables()).await?;
    bed.wait_for_run(&live.id, |run| {
        run.phase == Some(StepPhase::AwaitingCompletion)
    })
    .await?;

    let CommandReply::Scan(report) = bed.coordinator.dispatch(Command::ScanAndResume).await? else {
        panic!("scan should reply with a report");
    };
    assert!(report.resumed.is_empty());
    assert!(report.started.is_empty());

    let reasons: Vec<(String, String)> = report
        .skipped
        .iter()
        .map(|skipped| (skipped.session_ref.to_string(), skipped.reason.clone()))
        .collect();
    assert_eq!(
        reasons,
        vec![
            (
                "tab-1".to_string(),
                format!("bound run {} is completed", finished.id)
            ),
            ("tab-2".to_string(), "run task already live".to_string()),
        ]
    );

    bed.coordinator.stop(StopScope::All).await?;
    bed.wait_until_idle().await?;
    Ok(())
}
