//! Wake-up timer of the control loop.
//!
//! The timer is either *level* (fires at the next known scheduled time) or
//! *edgy* (the last pass left ready jobs behind, so the next finished job
//! should trigger a pass right away). It has two mutators:
//! [`reset_at`](SchedulerTimer::reset_at) after every pass, and
//! [`reschedule_earlier`](SchedulerTimer::reschedule_earlier) when something
//! may have become due sooner.

use chrono::{DateTime, Utc};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::trace;

/// Shortest wait between two passes.
pub const MIN_WAKE_INTERVAL: Duration = Duration::from_secs(1);

/// Longest wait between two passes.
pub const MAX_WAKE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Edgy/level wake-up timer.
pub struct SchedulerTimer {
    sleep: Pin<Box<Sleep>>,
    target: DateTime<Utc>,
    edgy: bool,
}

impl SchedulerTimer {
    /// Create a timer whose first wake-up is [`MIN_WAKE_INTERVAL`] from now.
    pub fn new() -> Self {
        let target = Utc::now() + to_chrono(MIN_WAKE_INTERVAL);
        Self {
            sleep: Box::pin(tokio::time::sleep(MIN_WAKE_INTERVAL)),
            target,
            edgy: false,
        }
    }

    /// Wait for the timer to fire.
    pub async fn fired(&mut self) {
        self.sleep.as_mut().await;
    }

    /// Arm the timer for `next` and set the edgy flag. Returns the wait.
    pub fn reset_at(&mut self, next: DateTime<Utc>, edgy: bool) -> Duration {
        self.reset_at_from(Utc::now(), next, edgy)
    }

    /// Move the wake-up earlier if `next` is before the current target.
    ///
    /// An edgy timer always fires after the minimum interval and stops being
    /// edgy, whatever `next` is. Returns the new wait, or zero when unchanged.
    pub fn reschedule_earlier(&mut self, next: Option<DateTime<Utc>>) -> Duration {
        self.reschedule_earlier_from(Utc::now(), next)
    }

    fn reset_at_from(&mut self, now: DateTime<Utc>, next: DateTime<Utc>, edgy: bool) -> Duration {
        let wait = clamp_wait(now, next);
        self.target = now + to_chrono(wait);
        self.edgy = edgy;
        self.sleep.as_mut().reset(Instant::now() + wait);

        trace!(
            wait_ms = wait.as_millis() as u64,
            edgy,
            "Scheduler timer reset"
        );
        wait
    }

    fn reschedule_earlier_from(
        &mut self,
        now: DateTime<Utc>,
        next: Option<DateTime<Utc>>,
    ) -> Duration {
        if self.edgy {
            return self.reset_at_from(now, now, false);
        }

        match next {
            Some(next) if next < self.target => self.reset_at_from(now, next, false),
            _ => Duration::ZERO,
        }
    }
}

impl Default for SchedulerTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_wait(now: DateTime<Utc>, next: DateTime<Utc>) -> Duration {
    (next - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        .clamp(MIN_WAKE_INTERVAL, MAX_WAKE_INTERVAL)
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_clamp_wait() {
        let now = Utc::now();
        assert_eq!(clamp_wait(now, now - ChronoDuration::seconds(5)), MIN_WAKE_INTERVAL);
        assert_eq!(clamp_wait(now, now), MIN_WAKE_INTERVAL);
        assert_eq!(
            clamp_wait(now, now + ChronoDuration::seconds(30)),
            Duration::from_secs(30)
        );
        assert_eq!(clamp_wait(now, now + ChronoDuration::days(2)), MAX_WAKE_INTERVAL);
    }

    #[tokio::test]
    async fn test_reset_at_sets_target_and_edgy() {
        let mut timer = SchedulerTimer::new();
        let now = Utc::now();

        let wait = timer.reset_at_from(now, now + ChronoDuration::seconds(90), true);
        assert_eq!(wait, Duration::from_secs(90));
        assert!(timer.edgy);
        assert_eq!(timer.target, now + ChronoDuration::seconds(90));
    }

    #[tokio::test]
    async fn test_reschedule_earlier_only_moves_forward_in_time() {
        let mut timer = SchedulerTimer::new();
        let now = Utc::now();
        timer.reset_at_from(now, now + ChronoDuration::seconds(60), false);

        // Later than the target: unchanged.
        let wait = timer.reschedule_earlier_from(now, Some(now + ChronoDuration::seconds(120)));
        assert_eq!(wait, Duration::ZERO);
        assert_eq!(timer.target, now + ChronoDuration::seconds(60));

        // No time at all: unchanged.
        assert_eq!(timer.reschedule_earlier_from(now, None), Duration::ZERO);

        // Earlier: moved.
        let wait = timer.reschedule_earlier_from(now, Some(now + ChronoDuration::seconds(10)));
        assert_eq!(wait, Duration::from_secs(10));
        assert_eq!(timer.target, now + ChronoDuration::seconds(10));
    }

    #[tokio::test]
    async fn test_edgy_timer_fires_soon_on_any_signal() {
        let mut timer = SchedulerTimer::new();
        let now = Utc::now();
        timer.reset_at_from(now, now + ChronoDuration::minutes(30), true);

        let wait = timer.reschedule_earlier_from(now, None);
        assert_eq!(wait, MIN_WAKE_INTERVAL);
        assert!(!timer.edgy);

        // Once level again, a later time does not move it.
        let wait = timer.reschedule_earlier_from(now, Some(now + ChronoDuration::minutes(5)));
        assert_eq!(wait, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fired_after_wait() {
        let mut timer = SchedulerTimer::new();
        let start = Instant::now();
        timer.fired().await;
        assert!(start.elapsed() >= MIN_WAKE_INTERVAL);

        timer.reset_at(Utc::now() + ChronoDuration::seconds(5), false);
        let start = Instant::now();
        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(4));
    }
}
