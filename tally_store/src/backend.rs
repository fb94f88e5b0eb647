//! The physical database seam.
//!
//! A [`DocDb`] is one physical database: one partition of one epoch. The
//! partitioned store composes many of them behind its logical surface.
//! Implementations normalize their native failures into [`StoreError`]
//! before returning.

use std::fmt::Debug;

use async_trait::async_trait;
use tally_types::{Doc, PutResult, Row, StoreError};

/// Parameters of a range scan against one physical database.
///
/// Bounds are inclusive and given in traversal order: a descending scan
/// starts at the higher id and ends at the lower one.
#[derive(Debug, Clone)]
pub struct RangeQuery {
    /// Inclusive first id bound.
    pub start: String,
    /// Inclusive last id bound.
    pub end: String,
    /// Return rows in descending id order.
    pub descending: bool,
    /// Maximum number of rows to return.
    pub limit: Option<usize>,
    /// Attach document bodies to the returned rows.
    pub include_docs: bool,
}

/// One physical database holding documents of a single partition/epoch.
#[async_trait]
pub trait DocDb: Debug + Send + Sync {
    /// The database name (its partitioned uri).
    fn name(&self) -> &str;

    /// Fetch a document by id; `Ok(None)` when absent.
    async fn get(&self, id: &str) -> Result<Option<Doc>, StoreError>;

    /// Store a document, enforcing revision-checked optimistic concurrency.
    async fn put(&self, doc: &Doc) -> Result<PutResult, StoreError>;

    /// Delete a document; its revision must match.
    async fn remove(&self, doc: &Doc) -> Result<PutResult, StoreError>;

    /// Fetch many documents by id, one row per requested id, in order.
    async fn fetch(&self, ids: &[String], include_docs: bool) -> Result<Vec<Row>, StoreError>;

    /// Scan a contiguous id range.
    async fn range(&self, query: &RangeQuery) -> Result<Vec<Row>, StoreError>;

    /// Store many documents, one result per document, in order; per-document
    /// conflicts are reported in the result list, not as a call failure.
    async fn bulk(&self, docs: &[Doc]) -> Result<Vec<Result<PutResult, StoreError>>, StoreError>;
}

/// A stand-in for a database that could not be resolved or constructed.
///
/// Every operation replays the original error, so a routing or construction
/// failure stays sticky and visible instead of degrading into silently
/// skipped documents.
#[derive(Debug)]
pub struct ErrDb {
    name: String,
    err: StoreError,
}

impl ErrDb {
    pub fn new(name: impl Into<String>, err: StoreError) -> Self {
        Self {
            name: name.into(),
            err,
        }
    }
}

#[async_trait]
impl DocDb for ErrDb {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, _id: &str) -> Result<Option<Doc>, StoreError> {
        Err(self.err.clone())
    }

    async fn put(&self, _doc: &Doc) -> Result<PutResult, StoreError> {
        Err(self.err.clone())
    }

    async fn remove(&self, _doc: &Doc) -> Result<PutResult, StoreError> {
        Err(self.err.clone())
    }

    async fn fetch(&self, _ids: &[String], _include_docs: bool) -> Result<Vec<Row>, StoreError> {
        Err(self.err.clone())
    }

    async fn range(&self, _query: &RangeQuery) -> Result<Vec<Row>, StoreError> {
        Err(self.err.clone())
    }

    async fn bulk(
        &self,
        _docs: &[Doc],
    ) -> Result<Vec<Result<PutResult, StoreError>>, StoreError> {
        Err(self.err.clone())
    }
}
