use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Uniformly random delay in `[min, max]`.
pub(crate) fn pacing_delay(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

/// Sleeps for `delay`. Returns `false` if cancelled first.
pub(crate) async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
