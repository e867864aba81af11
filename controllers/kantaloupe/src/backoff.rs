//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciles grow along the Fibonacci sequence in
//! seconds: 1s, 1s, 2s, 3s, 5s, 8s ... capped at the configured maximum.
//! State is tracked per object key and reset after a successful reconcile.
//!
//! Also home to the jitter helper used for periodic requeues and the
//! retry-on-conflict loop wrapped around read-modify-write updates.

use crate::error::{ControllerError, ErrorKind};
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each backoff is the sum of the previous two, capped at `max_seconds`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_seconds: u64,
    prev_seconds: u64,
    current_seconds: u64,
    max_seconds: u64,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff with minimum and maximum values in seconds
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            prev_seconds: 0,
            current_seconds: min_seconds,
            max_seconds,
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result = self.current_seconds;
        let next = self.prev_seconds + self.current_seconds;
        self.prev_seconds = self.current_seconds;
        self.current_seconds = std::cmp::min(next, self.max_seconds);
        result
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev_seconds = 0;
        self.current_seconds = self.min_seconds;
    }
}

/// Backoff state for a single object key
#[derive(Debug, Clone)]
struct BackoffState {
    backoff: FibonacciBackoff,
    error_count: u32,
}

/// Per-key backoff bookkeeping shared by a controller's error policy.
#[derive(Debug)]
pub struct BackoffTracker {
    min_seconds: u64,
    max_seconds: u64,
    states: Mutex<HashMap<String, BackoffState>>,
}

impl BackoffTracker {
    /// Creates a tracker whose sequences run from `min_seconds` to `max_seconds`.
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        Self {
            min_seconds,
            max_seconds,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure for `key` and returns the delay before the next attempt.
    pub fn next_delay(&self, key: &str) -> Duration {
        let Ok(mut states) = self.states.lock() else {
            return Duration::from_secs(self.max_seconds);
        };
        let state = states.entry(key.to_string()).or_insert_with(|| BackoffState {
            backoff: FibonacciBackoff::new(self.min_seconds, self.max_seconds),
            error_count: 0,
        });
        state.error_count += 1;
        state.backoff.next_backoff()
    }

    /// Consecutive failures recorded for `key`.
    pub fn error_count(&self, key: &str) -> u32 {
        self.states
            .lock()
            .ok()
            .and_then(|s| s.get(key).map(|st| st.error_count))
            .unwrap_or(0)
    }

    /// Forgets the failures of `key` after a successful reconcile.
    pub fn reset(&self, key: &str) {
        if let Ok(mut states) = self.states.lock() {
            states.remove(key);
        }
    }
}

/// Spreads `d` uniformly over `[d, d + d*factor)`.
pub fn jitter(d: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return d;
    }
    let extra = rand::thread_rng().gen_range(0.0..factor);
    d + d.mul_f64(extra)
}

const CONFLICT_RETRY_STEPS: u32 = 5;
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Runs `op` again while it fails with a conflict, up to five attempts.
///
/// `op` must re-read the object on every attempt.
pub async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, ControllerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ControllerError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.kind() == ErrorKind::Conflict && attempt < CONFLICT_RETRY_STEPS => {
                attempt += 1;
                tokio::time::sleep(jitter(CONFLICT_RETRY_DELAY, 0.1)).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 60);

        assert_eq!(backoff.next_backoff_seconds(), 1);
        assert_eq!(backoff.next_backoff_seconds(), 1);
        assert_eq!(backoff.next_backoff_seconds(), 2);
        assert_eq!(backoff.next_backoff_seconds(), 3);
        assert_eq!(backoff.next_backoff_seconds(), 5);
        assert_eq!(backoff.next_backoff_seconds(), 8);
        assert_eq!(backoff.next_backoff_seconds(), 13);
    }

    #[test]
    fn test_fibonacci_backoff_max_cap() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        for _ in 0..6 {
            backoff.next_backoff_seconds();
        }
        // 13 would be next, capped at 10
        assert_eq!(backoff.next_backoff_seconds(), 10);
        assert_eq!(backoff.next_backoff_seconds(), 10);
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(1, 60);
        backoff.next_backoff_seconds();
        backoff.next_backoff_seconds();
        backoff.next_backoff_seconds();

        backoff.reset();

        assert_eq!(backoff.next_backoff_seconds(), 1);
        assert_eq!(backoff.next_backoff_seconds(), 1);
        assert_eq!(backoff.next_backoff_seconds(), 2);
    }

    #[test]
    fn test_tracker_is_per_key() {
        let tracker = BackoffTracker::new(1, 60);
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_secs(1));
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_secs(1));
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_secs(2));
        assert_eq!(tracker.next_delay("ns/b"), Duration::from_secs(1));
        assert_eq!(tracker.error_count("ns/a"), 3);

        tracker.reset("ns/a");
        assert_eq!(tracker.error_count("ns/a"), 0);
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let d = jitter(base, 0.5);
            assert!(d >= base && d < Duration::from_secs(15));
        }
        assert_eq!(jitter(base, 0.0), base);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_gives_up_on_other_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_on_conflict(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ControllerError::InvalidConfig("bad".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_returns_success() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, ControllerError>(n) }
        })
        .await;
        assert_eq!(result.unwrap(), 0);
    }
}
