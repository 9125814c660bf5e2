use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Fixed-window quota for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateBucket {
    pub user_id: String,
    pub points_remaining: u32,
    pub window_start: Instant,
    pub window_duration: Duration,
    pub capacity: u32,
}

impl RateBucket {
    fn new(user_id: &str, capacity: u32, window_duration: Duration, now: Instant) -> Self {
        Self {
            user_id: user_id.to_string(),
            points_remaining: capacity,
            window_start: now,
            window_duration,
            capacity,
        }
    }

    fn window_elapsed(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= self.window_duration
    }
}

/// Per-user query admission: `capacity` queries per fixed window.
///
/// Buckets are created lazily on the first attempt and refilled when a new
/// window starts.
pub struct AdmissionController {
    capacity: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, RateBucket>>,
}

impl AdmissionController {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, RateBucket>> {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Consume one point for `user_id`. Returns `false`, without changing
    /// anything, when the current window is exhausted.
    pub fn try_consume(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets();
        let bucket = buckets
            .entry(user_id.to_string())
            .or_insert_with(|| RateBucket::new(user_id, self.capacity, self.window, now));

        if bucket.window_elapsed(now) {
            bucket.points_remaining = bucket.capacity;
            bucket.window_start = now;
        }
        if bucket.points_remaining == 0 {
            debug!(user = %user_id, "query rate limited");
            return false;
        }
        bucket.points_remaining -= 1;
        true
    }

    /// Points `user_id` could spend right now, without consuming any.
    pub fn remaining_points(&self, user_id: &str) -> u32 {
        let now = Instant::now();
        match self.buckets().get(user_id) {
            Some(bucket) if !bucket.window_elapsed(now) => bucket.points_remaining,
            _ => self.capacity,
        }
    }

    /// Time until `user_id`'s window rolls over, if a bucket exists.
    pub fn retry_after(&self, user_id: &str) -> Option<Duration> {
        let now = Instant::now();
        self.buckets().get(user_id).map(|bucket| {
            (bucket.window_start + bucket.window_duration).saturating_duration_since(now)
        })
    }

    /// Drop buckets whose window ended and that have seen no attempt for
    /// `retention`. A dropped bucket behaves exactly like a refilled one.
    pub fn purge_stale(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            let age = now.saturating_duration_since(bucket.window_start);
            !(bucket.window_elapsed(now) && age >= retention)
        });
        let purged = before - buckets.len();
        if purged > 0 {
            debug!(purged, "purged stale rate buckets");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.buckets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn capacity_then_denied_then_refilled() {
        let ac = AdmissionController::new(10, WINDOW);
        for _ in 0..10 {
            assert!(ac.try_consume("u1"));
        }
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!ac.try_consume("u1"));
        assert_eq!(ac.remaining_points("u1"), 0);

        tokio::time::advance(Duration::from_secs(56)).await;
        assert!(ac.try_consume("u1"));
        assert_eq!(ac.remaining_points("u1"), 9);
    }

    #[tokio::test(start_paused = true)]
    async fn users_are_independent() {
        let ac = AdmissionController::new(1, WINDOW);
        assert!(ac.try_consume("a"));
        assert!(!ac.try_consume("a"));
        assert!(ac.try_consume("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_points_does_not_consume() {
        let ac = AdmissionController::new(3, WINDOW);
        assert_eq!(ac.remaining_points("u"), 3);
        assert!(ac.is_empty());
        assert!(ac.try_consume("u"));
        assert_eq!(ac.remaining_points("u"), 2);
        assert_eq!(ac.remaining_points("u"), 2);

        tokio::time::advance(WINDOW).await;
        assert_eq!(ac.remaining_points("u"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn denial_does_not_extend_window() {
        let ac = AdmissionController::new(1, WINDOW);
        assert!(ac.try_consume("u"));
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(!ac.try_consume("u"));
        assert_eq!(ac.retry_after("u"), Some(Duration::from_secs(1)));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(ac.try_consume("u"));
    }

    #[tokio::test(start_paused = true)]
    async fn purge_keeps_active_windows() {
        let ac = AdmissionController::new(5, WINDOW);
        ac.try_consume("old");
        tokio::time::advance(Duration::from_secs(600)).await;
        ac.try_consume("new");

        assert_eq!(ac.purge_stale(Duration::from_secs(300)), 1);
        assert_eq!(ac.len(), 1);
        assert_eq!(ac.remaining_points("new"), 4);
        assert_eq!(ac.remaining_points("old"), 5);
    }
}
