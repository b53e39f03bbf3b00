//! Fixed-interval observation of background work from the caller's loop.
//!
//! Background threads and child processes never call back into caller state.
//! Instead a task on the caller's single-threaded loop checks a non-blocking
//! predicate on a timer and reacts once it reports completion.

use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Shortest accepted polling period.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default polling period for runs and evaluations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Wait until `finished` returns true, checking it once per `period`.
///
/// The predicate must not block. Returns the number of checks performed.
pub async fn poll_until(period: Duration, mut finished: impl FnMut() -> bool) -> u64 {
    let mut ticker = interval(period.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut checks = 0u64;
    loop {
        ticker.tick().await;
        checks += 1;
        if finished() {
            return checks;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_poll_until_counts_checks() {
        let calls = Cell::new(0);
        let checks = poll_until(Duration::from_millis(1), || {
            calls.set(calls.get() + 1);
            calls.get() == 3
        })
        .await;
        assert_eq!(checks, 3);
    }

    #[tokio::test]
    async fn test_zero_period_is_clamped() {
        let checks = poll_until(Duration::ZERO, || true).await;
        assert_eq!(checks, 1);
    }
}
