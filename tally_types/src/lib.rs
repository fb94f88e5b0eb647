//! Shared types for the tally metering pipeline.
//!
//! This crate defines the pieces every other tally crate builds on:
//!
//! * [`id`] — the canonical key/time document id forms (`k/<key>/t/<time>`
//!   and `t/<time>/k/<key>`) and the extractors that recover keys and times
//!   from them.
//! * [`doc`] — the schemaless JSON document model stored by the partitioned
//!   store, carrying an id, an opaque revision token and a `processed`
//!   timestamp next to the application fields.
//! * [`error`] — the storage error taxonomy, classified for retry and
//!   circuit-breaker layers via [`Retryable`].
//! * [`time`] — a small clock seam so slack windows and `processed` stamps
//!   are testable against a mock clock.
//! * [`seqid`] — monotonic sequence ids whose integer prefix stays a real
//!   millisecond timestamp, used to give same-millisecond inputs distinct,
//!   time-ordered ids.

pub mod doc;
pub mod error;
pub mod id;
pub mod seqid;
pub mod time;

pub use doc::{Doc, PutResult, Row};
pub use error::{Retryable, StoreError};
pub use id::{kturi, pad16, time_millis, tkuri, turi};
pub use seqid::SeqIdGen;
pub use time::{MockProvider, SystemProvider, TimeProvider};
