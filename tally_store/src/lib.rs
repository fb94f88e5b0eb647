//! A partitioned document store client.
//!
//! [`PartitionedStore`] presents the `get`/`put`/`remove`/`all_docs`/
//! `bulk_docs` surface of a single document database while transparently
//! fanning out to many physical databases, one per `(partition, epoch)`
//! pair resolved by a [`tally_sharder::Partitioner`].
//!
//! Three execution engines do the fan-out:
//!
//! * single ops resolve one partition and run against its pooled handle;
//! * bulk ops group documents by target database, run the bulk primitive
//!   once per group (groups concurrently), and reassemble per-document
//!   results in exactly the input order — round-trips are bounded by the
//!   number of distinct databases touched, not the number of documents;
//! * range ops walk the partitions intersecting the time range in bound
//!   order, merging and sorting rows by id, cutting off at `limit` early
//!   and applying `skip` only after the merge.
//!
//! Failures in partition resolution or handle construction surface as
//! sticky [`backend::ErrDb`] handles, so every document routed to a broken
//! partition reports the same error instead of being silently skipped.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;

use tally_sharder::{Candidates, Op, Partitioner};
use tally_types::{id, time_millis, Doc, PutResult, Row, StoreError, TimeProvider};

pub mod backend;
pub mod couch;
pub mod mem;
pub mod pool;

pub use backend::{DocDb, ErrDb, RangeQuery};
pub use couch::CouchConnector;
pub use pool::{DbConnector, DbUri, MemConnector, Mode};

use pool::DbPool;

/// A request against the logical `all_docs` surface.
#[derive(Debug, Clone)]
pub enum AllDocs {
    /// Fetch the given ids, one row each, in order.
    Keys { ids: Vec<String>, include_docs: bool },
    /// Scan a contiguous id range.
    Range(RangeOptions),
}

/// Options of a logical range scan.
///
/// Bounds are inclusive and given in traversal order: a descending scan
/// starts at the higher id and ends at the lower one.
#[derive(Debug, Clone)]
pub struct RangeOptions {
    /// Inclusive first id bound.
    pub start: String,
    /// Inclusive last id bound.
    pub end: String,
    /// Maximum rows returned, counted after `skip`.
    pub limit: Option<usize>,
    /// Rows to drop from the front of the merged result.
    pub skip: usize,
    /// Return rows in descending id order.
    pub descending: bool,
    /// Attach document bodies.
    pub include_docs: bool,
}

impl RangeOptions {
    /// A full scan from `start` to `end` with bodies attached.
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            limit: None,
            skip: 0,
            descending: false,
            include_docs: true,
        }
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }
}

/// The logical store over a set of partitioned physical databases.
#[derive(Debug)]
pub struct PartitionedStore {
    partitioner: Arc<dyn Partitioner>,
    uri: DbUri,
    pool: DbPool,
    clock: Arc<dyn TimeProvider>,
}

impl PartitionedStore {
    pub fn new(
        partitioner: Arc<dyn Partitioner>,
        uri: DbUri,
        connector: Arc<dyn DbConnector>,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            partitioner,
            uri,
            pool: DbPool::new(connector),
            clock,
        }
    }

    /// Fetch a single document; `Ok(None)` when absent.
    pub async fn get(&self, doc_id: &str) -> Result<Option<Doc>, StoreError> {
        debug!(id = %doc_id, "get");
        self.db_for(doc_id, Op::Read, Mode::Read).await.get(doc_id).await
    }

    /// Store a single document, stamping `processed` when unset.
    pub async fn put(&self, doc: &Doc) -> Result<PutResult, StoreError> {
        debug!(id = %doc.id, "put");
        let doc = self.stamped(doc);
        self.db_for(&doc.id, Op::Write, Mode::Write)
            .await
            .put(&doc)
            .await
    }

    /// Remove a single document; its revision must match.
    pub async fn remove(&self, doc: &Doc) -> Result<PutResult, StoreError> {
        debug!(id = %doc.id, "remove");
        self.db_for(&doc.id, Op::Write, Mode::Write)
            .await
            .remove(doc)
            .await
    }

    /// Fetch a list of ids or scan a range, see [`AllDocs`].
    pub async fn all_docs(&self, query: AllDocs) -> Result<Vec<Row>, StoreError> {
        match query {
            AllDocs::Keys { ids, include_docs } => self.fetch_rows(ids, include_docs).await,
            AllDocs::Range(options) => self.range_rows(options).await,
        }
    }

    /// Store many documents, one result per document, in input order.
    ///
    /// Group failures (a broken partition, a down database) are reported on
    /// each of that group's documents; the overall call still succeeds with
    /// a complete, ordered result list.
    pub async fn bulk_docs(
        &self,
        docs: &[Doc],
    ) -> Result<Vec<Result<PutResult, StoreError>>, StoreError> {
        let total = docs.len();
        debug!(docs = total, "bulk update");

        let mut groups: Vec<(Arc<dyn DocDb>, Vec<(usize, Doc)>)> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for (i, doc) in docs.iter().enumerate() {
            let doc = self.stamped(doc);
            let db = self.db_for(&doc.id, Op::Write, Mode::Write).await;
            let slot = *by_name.entry(db.name().to_owned()).or_insert_with(|| {
                groups.push((db, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push((i, doc));
        }
        debug!(groups = groups.len(), "bulk update grouped");

        let group_results = join_all(groups.into_iter().map(|(db, members)| async move {
            let group_docs: Vec<Doc> = members.iter().map(|(_, d)| d.clone()).collect();
            match db.bulk(&group_docs).await {
                Ok(results) => members
                    .into_iter()
                    .map(|(i, _)| i)
                    .zip(results)
                    .collect::<Vec<_>>(),
                Err(err) => members
                    .into_iter()
                    .map(|(i, _)| (i, Err(err.clone())))
                    .collect(),
            }
        }))
        .await;

        // Reassemble into the input order.
        let mut out: Vec<Option<Result<PutResult, StoreError>>> =
            (0..total).map(|_| None).collect();
        for (i, result) in group_results.into_iter().flatten() {
            out[i] = Some(result);
        }
        Ok(out
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|| {
                    Err(StoreError::backend(
                        "bulk",
                        None,
                        format!("missing bulk result for document {i}"),
                    ))
                })
            })
            .collect())
    }

    fn stamped(&self, doc: &Doc) -> Doc {
        let mut doc = doc.clone();
        if doc.processed.is_none() {
            doc.processed = Some(self.clock.now());
        }
        doc
    }

    fn id_parts(doc_id: &str) -> Result<(&str, i64), StoreError> {
        let key = id::key(doc_id);
        let time = id::time(doc_id).and_then(time_millis);
        match (key, time) {
            (Some(key), Some(time)) => Ok((key, time)),
            _ => Err(StoreError::BadId {
                id: doc_id.to_owned(),
            }),
        }
    }

    /// Resolve the handle for a single-document operation. Failures become
    /// sticky error handles rather than call errors, so they flow through
    /// the grouped engines as per-document results.
    async fn db_for(&self, doc_id: &str, op: Op, mode: Mode) -> Arc<dyn DocDb> {
        let (key, time) = match Self::id_parts(doc_id) {
            Ok(parts) => parts,
            Err(err) => return Arc::new(ErrDb::new(format!("badid-{doc_id}"), err)),
        };
        match self.partitioner.partition(Some(key), time, op) {
            Ok(Candidates::One(p)) => self.pool.db(&self.uri.partition_uri(p), mode).await,
            Ok(Candidates::Many(_)) => Arc::new(ErrDb::new(
                format!("partition-err-{doc_id}"),
                StoreError::Partition {
                    context: doc_id.to_owned(),
                    message: "ambiguous partition for single-document operation".into(),
                },
            )),
            Err(err) => Arc::new(ErrDb::new(
                format!("partition-err-{doc_id}"),
                StoreError::Partition {
                    context: doc_id.to_owned(),
                    message: err.to_string(),
                },
            )),
        }
    }

    async fn fetch_rows(
        &self,
        ids: Vec<String>,
        include_docs: bool,
    ) -> Result<Vec<Row>, StoreError> {
        let total = ids.len();
        debug!(ids = total, "fetch");

        let mut groups: Vec<(Arc<dyn DocDb>, Vec<(usize, String)>)> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        for (i, doc_id) in ids.into_iter().enumerate() {
            let db = self.db_for(&doc_id, Op::Read, Mode::Read).await;
            let slot = *by_name.entry(db.name().to_owned()).or_insert_with(|| {
                groups.push((db, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push((i, doc_id));
        }

        let group_results = join_all(groups.into_iter().map(|(db, members)| async move {
            let group_ids: Vec<String> = members.iter().map(|(_, id)| id.clone()).collect();
            match db.fetch(&group_ids, include_docs).await {
                Ok(rows) => members
                    .into_iter()
                    .map(|(i, _)| i)
                    .zip(rows)
                    .collect::<Vec<_>>(),
                Err(err) => members
                    .into_iter()
                    .map(|(i, id)| (i, Row::failed(id, err.clone())))
                    .collect(),
            }
        }))
        .await;

        let mut out: Vec<Option<Row>> = (0..total).map(|_| None).collect();
        for (i, row) in group_results.into_iter().flatten() {
            out[i] = Some(row);
        }
        Ok(out
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                r.unwrap_or_else(|| {
                    Row::failed(
                        String::new(),
                        StoreError::backend("fetch", None, format!("missing row {i}")),
                    )
                })
            })
            .collect())
    }

    async fn range_rows(&self, options: RangeOptions) -> Result<Vec<Row>, StoreError> {
        debug!(start = %options.start, end = %options.end, "range scan");

        // A range over a single key scans that key's partitions; differing
        // or missing keys force a scan of every partition per epoch.
        let key = match (id::key(&options.start), id::key(&options.end)) {
            (Some(a), Some(b)) if a == b => Some(a),
            _ => None,
        };
        let bound_time = |bound: &str| {
            id::time(bound)
                .and_then(time_millis)
                .ok_or_else(|| StoreError::BadId {
                    id: bound.to_owned(),
                })
        };
        let start_time = bound_time(&options.start)?;
        let end_time = bound_time(&options.end)?;

        let groups = self
            .partitioner
            .partition_range(key, start_time, end_time, Op::Read)
            .map_err(|err| StoreError::Partition {
                context: format!("{}..{}", options.start, options.end),
                message: err.to_string(),
            })?;

        // Rows are accumulated up to limit + skip; skip applies once, after
        // the merge, never per partition.
        let cutoff = options.limit.map(|l| l + options.skip);
        let mut accum: Vec<Row> = Vec::new();
        for candidates in groups {
            if cutoff.is_some_and(|c| accum.len() >= c) {
                break;
            }
            let needed = cutoff.map(|c| c - accum.len());
            let query = RangeQuery {
                start: options.start.clone(),
                end: options.end.clone(),
                descending: options.descending,
                limit: needed,
                include_docs: options.include_docs,
            };

            match candidates {
                Candidates::One(p) => {
                    let db = self.pool.db(&self.uri.partition_uri(p), Mode::Read).await;
                    accum.extend(db.range(&query).await?);
                }
                Candidates::Many(partitions) => {
                    // Query every partition of the epoch, then merge-sort
                    // before counting rows against the limit.
                    let results = join_all(partitions.iter().map(|p| {
                        let query = query.clone();
                        let uri = self.uri.partition_uri(*p);
                        async move { self.pool.db(&uri, Mode::Read).await.range(&query).await }
                    }))
                    .await;

                    let mut merged: Vec<Row> = Vec::new();
                    for rows in results {
                        merged.extend(rows?);
                    }
                    merged.sort_by(|a, b| a.id.cmp(&b.id));
                    if options.descending {
                        merged.reverse();
                    }
                    if let Some(needed) = needed {
                        merged.truncate(needed);
                    }
                    accum.extend(merged);
                }
            }
        }

        Ok(accum.into_iter().skip(options.skip).collect())
    }
}
