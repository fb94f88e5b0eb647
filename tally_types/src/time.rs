//! Millisecond clock seam.
//!
//! Components that stamp documents or expire cache entries take an
//! `Arc<dyn TimeProvider>` so tests can drive time explicitly.

use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of the current time in milliseconds since the Unix epoch.
pub trait TimeProvider: Debug + Send + Sync {
    fn now(&self) -> i64;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl SystemProvider {
    pub fn new() -> Self {
        Self
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before Unix epoch")
            .as_millis() as i64
    }
}

/// A clock fixed to an explicit value, advanced by tests.
#[derive(Debug)]
pub struct MockProvider {
    now: AtomicI64,
}

impl MockProvider {
    pub fn new(now: i64) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, now: i64) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Advance the clock by `millis`.
    pub fn inc(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_is_settable() {
        let clock = MockProvider::new(1_420_502_400_000);
        assert_eq!(clock.now(), 1_420_502_400_000);
        clock.inc(500);
        assert_eq!(clock.now(), 1_420_502_400_500);
        clock.set(0);
        assert_eq!(clock.now(), 0);
    }
}
