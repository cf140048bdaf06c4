//! Sliding-window rate limiting (§4.6.4), grounded on the same
//! timestamp-vector approach as the teacher's endpoint rate limiter, pared
//! down to the two windows the transport core needs: messages/sec and
//! connection-attempts/min.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A single sliding window: records event timestamps, prunes anything
/// older than `window`, and reports whether the next event would exceed
/// `limit`.
pub struct SlidingWindow {
    window: Duration,
    limit: u32,
    events: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            window,
            limit,
            events: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns `Some(current)` (and does not record the event) if admitting
    /// one more event now would exceed the limit; otherwise records it and
    /// returns `None`.
    pub fn try_admit(&mut self, now: Instant) -> Result<(), (u64, u64)> {
        self.prune(now);
        if self.events.len() as u32 >= self.limit {
            return Err((self.events.len() as u64, self.limit as u64));
        }
        self.events.push_back(now);
        Ok(())
    }

    /// Gives back a slot without it ever having consumed one — used when a
    /// connection-rate overflow must not also burn a reconnect attempt.
    pub fn release_last(&mut self) {
        self.events.pop_back();
    }

    pub fn current_count(&mut self, now: Instant) -> u64 {
        self.prune(now);
        self.events.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let mut window = SlidingWindow::new(Duration::from_secs(1), 2);
        let now = Instant::now();
        assert!(window.try_admit(now).is_ok());
        assert!(window.try_admit(now).is_ok());
        assert!(window.try_admit(now).is_err());
    }

    #[test]
    fn prunes_events_older_than_window() {
        let mut window = SlidingWindow::new(Duration::from_millis(10), 1);
        let t0 = Instant::now();
        assert!(window.try_admit(t0).is_ok());
        let t1 = t0 + Duration::from_millis(20);
        assert!(window.try_admit(t1).is_ok());
    }

    #[test]
    fn release_last_frees_a_slot() {
        let mut window = SlidingWindow::new(Duration::from_secs(1), 1);
        let now = Instant::now();
        assert!(window.try_admit(now).is_ok());
        window.release_last();
        assert!(window.try_admit(now).is_ok());
    }
}
