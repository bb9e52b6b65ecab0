//! Fixed-interval, deadline-bounded polling with cancellation.
//!
//! The first attempt runs one interval after the poll starts. Attempts are
//! never overlapped: a slow attempt delays the next tick instead of queuing
//! ticks behind it.

use std::future::Future;
use std::time::Duration;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub interval: Duration,
    pub deadline: Duration,
}

impl PollSchedule {
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Run `attempt` on every tick until it yields `Some`, the deadline passes or
/// `cancel` fires. Cancellation and the deadline also interrupt an attempt that
/// is still in flight.
///
/// The closure receives the 1-based attempt number.
pub async fn poll_until<T, F, Fut>(
    schedule: PollSchedule,
    cancel: &CancellationToken,
    mut attempt: F,
) -> PollOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    let deadline = sleep_until(start + schedule.deadline);
    tokio::pin!(deadline);

    let mut ticker = interval_at(start + schedule.interval, schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut attempt_no = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = &mut deadline => return PollOutcome::TimedOut,
            _ = ticker.tick() => {}
        }

        attempt_no += 1;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = &mut deadline => return PollOutcome::TimedOut,
            result = attempt(attempt_no) => {
                if let Some(value) = result {
                    return PollOutcome::Ready(value);
                }
                tracing::trace!(attempt = attempt_no, "poll attempt not ready");
            }
        }
    }
}
