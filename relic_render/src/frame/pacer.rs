//! Frame-rate limiter used when vertical sync is off.

use std::time::{Duration, Instant};

/// OS sleep granularity guard: below this remaining wait we spin instead of
/// sleeping, since a sleep may overshoot by a whole scheduler quantum.
const SPIN_THRESHOLD: Duration = Duration::from_millis(2);

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WaitStrategy {
    /// Coarse-sleep for the given duration, then re-check.
    Sleep(Duration),
    /// Yield-spin until the deadline passes.
    Spin,
    Done,
}

pub(crate) fn wait_strategy(remaining: Duration) -> WaitStrategy {
    if remaining > SPIN_THRESHOLD {
        WaitStrategy::Sleep(remaining - SPIN_THRESHOLD)
    } else if !remaining.is_zero() {
        WaitStrategy::Spin
    } else {
        WaitStrategy::Done
    }
}

/// Paces the render loop to a configured FPS cap.
pub struct FramePacer {
    interval: Option<Duration>,
    next_deadline: Option<Instant>,
}

impl FramePacer {
    pub fn new(fps_cap: Option<u32>) -> Self {
        let interval = fps_cap
            .filter(|cap| *cap > 0)
            .map(|cap| Duration::from_secs(1) / cap);
        FramePacer {
            interval,
            next_deadline: None,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Blocks until the next frame deadline.
    pub fn pace(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };

        let now = Instant::now();
        let deadline = self.next_deadline.unwrap_or(now);

        loop {
            let now = Instant::now();
            let remaining = deadline.saturating_duration_since(now);
            match wait_strategy(remaining) {
                WaitStrategy::Sleep(by) => std::thread::sleep(by),
                WaitStrategy::Spin => std::thread::yield_now(),
                WaitStrategy::Done => break,
            }
        }

        // Anchor off the deadline, not "now", so oversleep doesn't accumulate.
        // After a long stall the deadline is reset instead of being chased.
        let now = Instant::now();
        self.next_deadline = if now > deadline + interval {
            Some(now + interval)
        } else {
            Some(deadline + interval)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleeps_above_the_spin_threshold() {
        assert_eq!(
            wait_strategy(Duration::from_millis(10)),
            WaitStrategy::Sleep(Duration::from_millis(8))
        );
    }

    #[test]
    fn spins_below_the_spin_threshold() {
        assert_eq!(wait_strategy(Duration::from_millis(1)), WaitStrategy::Spin);
        assert_eq!(wait_strategy(Duration::from_micros(1)), WaitStrategy::Spin);
        // Exactly at the threshold still spins; only strictly-above sleeps.
        assert_eq!(wait_strategy(SPIN_THRESHOLD), WaitStrategy::Spin);
    }

    #[test]
    fn zero_remaining_is_done() {
        assert_eq!(wait_strategy(Duration::ZERO), WaitStrategy::Done);
    }

    #[test]
    fn cap_translates_to_interval() {
        let pacer = FramePacer::new(Some(100));
        assert_eq!(pacer.interval(), Some(Duration::from_millis(10)));

        assert_eq!(FramePacer::new(None).interval(), None);
        assert_eq!(FramePacer::new(Some(0)).interval(), None);
    }

    #[test]
    fn uncapped_pace_returns_immediately() {
        let mut pacer = FramePacer::new(None);
        let start = Instant::now();
        pacer.pace();
        assert!(start.elapsed() < Duration::from_millis(5));
    }
}
