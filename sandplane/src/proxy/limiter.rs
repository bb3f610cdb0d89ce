//! Per-sandbox admission control for inbound proxy connections.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Hooks fired around admission decisions. They observe, never decide.
pub trait ConnectionObserver: Send + Sync {
    /// A connection was admitted; `count` includes it.
    fn on_acquired(&self, _sandbox_id: &str, _count: usize) {}

    fn on_blocked(&self, _sandbox_id: &str, _limit: usize) {}

    /// A previously admitted connection finished after `held`.
    fn on_released(&self, _sandbox_id: &str, _held: Duration) {}
}

/// Resolves the connection limit for a sandbox at admission time.
pub trait LimitPolicy: Send + Sync {
    fn max_connections(&self, sandbox_id: &str) -> usize;
}

/// Same limit for every sandbox.
#[derive(Debug, Clone, Copy)]
pub struct FixedLimit(pub usize);

impl LimitPolicy for FixedLimit {
    fn max_connections(&self, _sandbox_id: &str) -> usize {
        self.0
    }
}

impl<F> LimitPolicy for F
where
    F: Fn(&str) -> usize + Send + Sync,
{
    fn max_connections(&self, sandbox_id: &str) -> usize {
        self(sandbox_id)
    }
}

/// Counting semaphore per sandbox. Never blocks: over the limit is a denial.
#[derive(Debug, Default)]
pub struct ConnectionLimiter {
    counts: Mutex<HashMap<String, usize>>,
}

impl ConnectionLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one slot if fewer than `max_limit` are in use.
    ///
    /// Returns the count after the call and whether a slot was taken. A denied
    /// call leaves the count unchanged.
    pub fn try_acquire(&self, sandbox_id: &str, max_limit: usize) -> (usize, bool) {
        let mut counts = self.counts.lock();
        let count = counts.entry(sandbox_id.to_string()).or_insert(0);
        if *count >= max_limit {
            let current = *count;
            if current == 0 {
                counts.remove(sandbox_id);
            }
            return (current, false);
        }
        *count += 1;
        (*count, true)
    }

    /// Return one slot. Releasing an idle sandbox is a no-op.
    pub fn release(&self, sandbox_id: &str) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(sandbox_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(sandbox_id);
            }
        }
    }

    pub fn count(&self, sandbox_id: &str) -> usize {
        self.counts.lock().get(sandbox_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_up_to_limit() {
        let limiter = ConnectionLimiter::new();
        assert_eq!(limiter.try_acquire("sbx", 2), (1, true));
        assert_eq!(limiter.try_acquire("sbx", 2), (2, true));
        assert_eq!(limiter.try_acquire("sbx", 2), (2, false));
        assert_eq!(limiter.count("sbx"), 2);
    }

    #[test]
    fn test_release_returns_capacity() {
        let limiter = ConnectionLimiter::new();
        assert!(limiter.try_acquire("sbx", 1).1);
        assert!(!limiter.try_acquire("sbx", 1).1);

        limiter.release("sbx");
        assert_eq!(limiter.count("sbx"), 0);
        assert!(limiter.try_acquire("sbx", 1).1);
    }

    #[test]
    fn test_release_idle_is_noop() {
        let limiter = ConnectionLimiter::new();
        limiter.release("sbx");
        assert_eq!(limiter.count("sbx"), 0);
    }

    #[test]
    fn test_zero_limit_denies() {
        let limiter = ConnectionLimiter::new();
        assert_eq!(limiter.try_acquire("sbx", 0), (0, false));
        assert_eq!(limiter.count("sbx"), 0);
    }

    #[test]
    fn test_sandboxes_are_independent() {
        let limiter = ConnectionLimiter::new();
        assert!(limiter.try_acquire("a", 1).1);
        assert!(limiter.try_acquire("b", 1).1);
        assert!(!limiter.try_acquire("a", 1).1);
    }

    #[test]
    fn test_closure_policy() {
        let policy = |sandbox_id: &str| if sandbox_id == "vip" { 10 } else { 1 };
        assert_eq!(policy.max_connections("vip"), 10);
        assert_eq!(FixedLimit(3).max_connections("any"), 3);
    }
}
