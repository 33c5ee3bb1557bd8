use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Admission decision for a keyed request stream. Implementations must be
/// safe to call from concurrent handlers.
pub trait RateLimiter: Send + Sync {
    /// Returns `true` if the request is admitted. A `true` result counts
    /// the request against the window; `false` leaves state untouched.
    fn check(
        &self,
        scope: &str,
        key: &str,
        window: Duration,
        max: usize,
        now: DateTime<Utc>,
    ) -> bool;
}

/// In-memory sliding-window limiter. Tracks request timestamps per
/// (scope, key) pair and prunes entries older than the window on each
/// check.
#[derive(Default)]
pub struct SlidingWindowLimiter {
    hits: Mutex<HashMap<(String, String), VecDeque<DateTime<Utc>>>>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn check(
        &self,
        scope: &str,
        key: &str,
        window: Duration,
        max: usize,
        now: DateTime<Utc>,
    ) -> bool {
        let mut hits = match self.hits.lock() {
            Ok(guard) => guard,
            // A poisoned lock means a panicked handler; fail open.
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = hits
            .entry((scope.to_owned(), key.to_owned()))
            .or_default();

        let cutoff = now - window;
        while entry.front().is_some_and(|stamp| *stamp <= cutoff) {
            entry.pop_front();
        }

        if entry.len() >= max {
            return false;
        }

        entry.push_back(now);
        true
    }
}
