//! Duplicate-submission detection.
//!
//! The filter remembers recently produced output-document ids in a bounded
//! in-memory set so a resubmitted input can be rejected without a storage
//! round trip. It is deliberately best-effort: entries expire after a slack
//! window and are evicted beyond a maximum count, and a miss only means
//! "unknown" — the caller falls back to a storage existence check before
//! concluding an input is new. The filter never substitutes for storage,
//! it only short-circuits the common case.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use clru::CLruCache;
use parking_lot::Mutex;

use tally_types::TimeProvider;

/// What the filter knows about an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    /// The id was recorded within the slack window: a duplicate.
    Seen,
    /// Absent or stale: storage has the final word.
    Unknown,
}

/// Sizing of the duplicate filter.
#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// How long an entry stays authoritative.
    pub slack: Duration,
    /// Maximum number of retained ids.
    pub max_entries: NonZeroUsize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            // Matches the widest accumulation slack a deployment uses.
            slack: Duration::from_secs(5 * 3600),
            max_entries: NonZeroUsize::new(1_000_000).unwrap(),
        }
    }
}

/// A bounded, time-windowed set of recently seen output ids.
pub struct DupFilter {
    slack_millis: i64,
    entries: Mutex<CLruCache<String, i64>>,
    clock: Arc<dyn TimeProvider>,
}

impl std::fmt::Debug for DupFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DupFilter")
            .field("slack_millis", &self.slack_millis)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl DupFilter {
    pub fn new(config: DedupConfig, clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            slack_millis: config.slack.as_millis() as i64,
            entries: Mutex::new(CLruCache::new(config.max_entries)),
            clock,
        }
    }

    /// Consult the filter for an output id.
    pub fn check(&self, id: &str) -> Presence {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(id) {
            Some(&seen_at) if now - seen_at <= self.slack_millis => Presence::Seen,
            Some(_) => {
                // Stale entries are no longer authoritative.
                entries.pop(id);
                Presence::Unknown
            }
            None => Presence::Unknown,
        }
    }

    /// Record an output id as seen now.
    pub fn mark_seen(&self, id: &str) {
        let now = self.clock.now();
        self.entries.lock().put(id.to_owned(), now);
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
