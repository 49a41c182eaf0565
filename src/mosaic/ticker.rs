use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Longest single sleep in a cancellable wait.
const SLICE: Duration = Duration::from_millis(50);

/// Fixed-period drive loop clock for blocking threads.
///
/// Deadlines are multiples of the period from the start instant. A caller that
/// overruns skips the deadlines it missed instead of firing them back to back.
pub struct Ticker {
    period: Duration,
    next: Instant,
}

impl Ticker {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        Self {
            period,
            next: Instant::now() + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Blocks until the next deadline. Returns the number of deadlines skipped.
    pub fn wait(&mut self) -> u32 {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
        }
        let (next, missed) = advance(self.next, Instant::now(), self.period);
        self.next = next;
        missed
    }
}

/// Next deadline after `now` on the grid `deadline + k * period`, and how many
/// grid points were passed over.
fn advance(deadline: Instant, now: Instant, period: Duration) -> (Instant, u32) {
    if now < deadline + period {
        return (deadline + period, 0);
    }
    let behind = now - deadline;
    let missed = (behind.as_nanos() / period.as_nanos()) as u32;
    (deadline + period * (missed + 1), missed)
}

/// Sleeps for `duration` unless `cancel` fires first. Returns false when cancelled.
pub fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    let until = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= until {
            return true;
        }
        std::thread::sleep((until - now).min(SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_on_time() {
        let start = Instant::now();
        let period = Duration::from_millis(40);
        let (next, missed) = advance(start, start + Duration::from_millis(1), period);
        assert_eq!(next, start + period);
        assert_eq!(missed, 0);
    }

    #[test]
    fn test_advance_skips_missed_deadlines() {
        let start = Instant::now();
        let period = Duration::from_millis(40);
        // woke up 130ms late: deadlines at +40, +80, +120 were passed
        let (next, missed) = advance(start, start + Duration::from_millis(130), period);
        assert_eq!(missed, 3);
        assert_eq!(next, start + Duration::from_millis(160));
    }

    #[test]
    fn test_wait_keeps_period() {
        let mut ticker = Ticker::new(Duration::from_millis(5));
        let started = Instant::now();
        for _ in 0..4 {
            ticker.wait();
        }
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_cancelled_sleep_returns_early() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        assert!(!sleep_unless_cancelled(Duration::from_secs(10), &cancel));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(sleep_unless_cancelled(Duration::from_millis(1), &CancellationToken::new()));
    }
}
