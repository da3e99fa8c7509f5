use crate::driver::{AgentDriver, DriverError};
use crate::recovery::backoff::{retry_with_backoff, RetryBackoff, RetryDisposition};
use anyhow::anyhow;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Re-reads the driver output until two consecutive reads agree, up to
/// `max_reads` extra reads spaced by `interval`. Falls back to the last
/// successful read if the output never settles.
pub(crate) async fn capture_stable_output(
    run_id: &str,
    driver: &dyn AgentDriver,
    first_read: String,
    max_reads: usize,
    interval: Duration,
    cancel: &CancellationToken,
) -> String {
    let last = Mutex::new(first_read);

    let settled = retry_with_backoff(
        RetryBackoff::fixed(interval)
            .with_max_attempts(max_reads)
            .with_cancellation(cancel),
        |_| {
            let last = &last;
            async move {
                let current = driver.read_output().await?;
                let mut previous = last.lock().await;
                if *previous == current {
                    Ok(current)
                } else {
                    *previous = current;
                    Err(anyhow!("output still changing"))
                }
            }
        },
        |_, _, _, _| {},
        |_, err| match err.downcast_ref::<DriverError>() {
            Some(DriverError::SessionLost) => RetryDisposition::Abort,
            _ => RetryDisposition::Retry,
        },
    )
    .await;

    match settled {
        Ok(output) => output,
        Err(err) => {
            tracing::warn!(
                run_id,
                max_reads,
                error = %err,
                "output did not stabilize; using last read"
            );
            last.into_inner()
        }
    }
}
