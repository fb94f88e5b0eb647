//! Monotonic sequence ids.
//!
//! Input documents arriving within the same millisecond need distinct,
//! time-ordered ids. A sequence id is `<millis>-<counter>`: the integer
//! prefix remains a real millisecond timestamp (so time-based partitioning
//! keeps working, see [`crate::id::time_millis`]), while the zero-padded
//! counter disambiguates collisions and never runs backwards even when the
//! wall clock does.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::time::TimeProvider;

/// Generator of process-local monotonic sequence ids.
#[derive(Debug)]
pub struct SeqIdGen {
    clock: Arc<dyn TimeProvider>,
    state: Mutex<(i64, u32)>,
}

impl SeqIdGen {
    pub fn new(clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            clock,
            state: Mutex::new((0, 0)),
        }
    }

    /// Produce the next sequence id.
    pub fn next_id(&self) -> String {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if now > state.0 {
            *state = (now, 0);
        } else {
            state.1 += 1;
        }
        format!("{}-{:04}", state.0, state.1)
    }
}
