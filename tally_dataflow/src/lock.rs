//! Keyed mutual exclusion.
//!
//! Serializes work per string key while unrelated keys proceed in
//! parallel. Guards release on drop, so a panicking or erroring holder
//! cannot wedge its key.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A map of per-key async mutexes, created on first use.
#[derive(Debug, Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting if it is held.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.locks
                .lock()
                .entry(key.to_owned())
                .or_insert_with(Default::default),
        );
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_serializes_different_keys_do_not() {
        let locks = Arc::new(KeyedMutex::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let a = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = locks.lock("g1").await;
                order.lock().push("a-start");
                tokio::time::sleep(Duration::from_millis(50)).await;
                order.lock().push("a-end");
            })
        };

        // Give task a the lock first.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let b = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = locks.lock("g1").await;
                order.lock().push("b");
            })
        };
        let c = {
            let locks = Arc::clone(&locks);
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = locks.lock("g2").await;
                order.lock().push("c");
            })
        };

        for t in [a, b, c] {
            t.await.unwrap();
        }

        let order = order.lock();
        // b waited for a to finish; c (another key) ran in between.
        let a_end = order.iter().position(|s| *s == "a-end").unwrap();
        let b_pos = order.iter().position(|s| *s == "b").unwrap();
        let c_pos = order.iter().position(|s| *s == "c").unwrap();
        assert!(b_pos > a_end);
        assert!(c_pos < b_pos);
    }
}
