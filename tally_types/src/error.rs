//! Storage error taxonomy.
//!
//! Errors carry an explicit retry classification instead of ad hoc flags so
//! the retry and circuit-breaker wrappers around storage calls can decide
//! terminally: a write conflict must never be retried and must not trip a
//! breaker, while a transient backend failure may be retried.

use thiserror::Error;

/// Whether an operation that produced an error may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryable {
    /// Retrying can only reproduce the outcome (e.g. a write conflict);
    /// upstream retry layers must stop immediately.
    Never,
    /// The failure is likely to clear on its own; retrying is reasonable.
    Transient,
    /// A configuration or routing defect; retrying cannot help and the
    /// failure should be surfaced loudly.
    Fatal,
}

/// An error from the partitioned store or one of its physical databases.
///
/// Variants carry owned context rather than wrapped sources so the error is
/// `Clone`: a failed partition resolution or handle construction is made
/// sticky by replaying the same error on every subsequent operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An optimistic write collided with an existing revision.
    #[error("write conflict on document {id}")]
    Conflict { id: String },

    /// The partition function failed to resolve a key/time to a partition.
    #[error("partition routing failed for {context}: {message}")]
    Partition { context: String, message: String },

    /// Constructing a database handle failed.
    #[error("failed to construct database handle for {uri}: {message}")]
    Connect { uri: String, message: String },

    /// The physical database reported a failure.
    #[error("database {db} error: {message}")]
    Backend {
        db: String,
        status: Option<u16>,
        message: String,
    },

    /// A document id without a parseable key/time.
    #[error("malformed document id {id}")]
    BadId { id: String },
}

impl StoreError {
    /// Retry classification for this error.
    pub fn retryable(&self) -> Retryable {
        match self {
            Self::Conflict { .. } => Retryable::Never,
            Self::Backend { .. } => Retryable::Transient,
            Self::Partition { .. } | Self::Connect { .. } | Self::BadId { .. } => Retryable::Fatal,
        }
    }

    /// Whether this error should count against a circuit breaker.
    ///
    /// Conflicts are an expected outcome of optimistic writes and duplicate
    /// detection, not a sign of an unhealthy partition.
    pub fn trips_breaker(&self) -> bool {
        !matches!(self, Self::Conflict { .. })
    }

    /// Shorthand for a conflict on the given document id.
    pub fn conflict(id: impl Into<String>) -> Self {
        Self::Conflict { id: id.into() }
    }

    /// Shorthand for a backend error on the given database.
    pub fn backend(db: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Backend {
            db: db.into(),
            status,
            message: message.into(),
        }
    }
}
