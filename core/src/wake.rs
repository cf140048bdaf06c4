//! Wall-clock wake detection (§4.7): notices when the process was asleep
//! (suspended laptop, paused container) so callers can reset backoff state
//! that would otherwise look like a very long, very patient retry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tracing::info;

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_WAKE_THRESHOLD: Duration = Duration::from_secs(30);
pub const DEFAULT_CROSS_INCARNATION_THRESHOLD_SECS: i64 = 3600;

/// Samples the monotonic clock on a timer; if more wall time elapsed
/// between samples than the sample interval plus `threshold`, a wake is
/// assumed and `on_wake` runs.
pub struct WakeDetector {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WakeDetector {
    /// Starts sampling immediately. Dropping the returned detector (or
    /// calling `stop`) is idempotent and always cancels the background
    /// task.
    pub fn start<F>(interval: Duration, threshold: Duration, on_wake: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut last = TokioInstant::now();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = TokioInstant::now();
                let elapsed = now.duration_since(last);
                last = now;
                if elapsed > interval + threshold {
                    info!(?elapsed, "wall clock jump detected, treating as wake from sleep");
                    on_wake();
                }
            }
        });
        Arc::new(Self {
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for WakeDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True if more than `threshold_secs` elapsed between `last_active_ts` and
/// `now_ts` (both unix seconds) — the process incarnation that set
/// `last_active_ts` is treated as a different "session" from `now_ts`'s.
/// Strictly greater-than: equal to the threshold does not count.
pub fn detect_cross_incarnation_wake(last_active_ts: i64, now_ts: i64, threshold_secs: i64) -> bool {
    now_ts - last_active_ts > threshold_secs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_at_threshold_is_not_a_wake() {
        assert!(!detect_cross_incarnation_wake(1_000, 1_000 + 3600, 3600));
    }

    #[test]
    fn past_threshold_is_a_wake() {
        assert!(detect_cross_incarnation_wake(1_000, 1_000 + 3601, 3600));
    }

    #[test]
    fn within_threshold_is_not_a_wake() {
        assert!(!detect_cross_incarnation_wake(1_000, 1_500, 3600));
    }

    #[tokio::test(start_paused = true)]
    async fn detects_simulated_clock_jump() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let woke = Arc::new(AtomicBool::new(false));
        let woke_clone = woke.clone();

        let detector = WakeDetector::start(Duration::from_millis(10), Duration::from_millis(5), move || {
            woke_clone.store(true, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;

        detector.stop();
        assert!(woke.load(Ordering::SeqCst));
    }
}
