//! In-memory backend for tests and local runs.
//!
//! Handles are cheap and deliberately excluded from the connection pool;
//! the document data itself lives in a process-wide registry of named
//! stores, so every handle opened for the same name observes the same
//! documents while each call still gets a fresh handle.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use tally_types::{Doc, PutResult, Row, StoreError};

use crate::backend::{DocDb, RangeQuery};

static STORES: LazyLock<Mutex<HashMap<String, Arc<MemStore>>>> =
    LazyLock::new(Default::default);

/// Delete every named store whose name matches `pattern`.
///
/// Test support, so suites start from empty databases.
pub fn drop_matching(pattern: &str) -> Result<(), regex::Error> {
    let re = Regex::new(pattern)?;
    STORES.lock().retain(|name, _| !re.is_match(name));
    Ok(())
}

#[derive(Debug, Default)]
struct MemStore {
    docs: Mutex<BTreeMap<String, Doc>>,
    rev_seq: AtomicU64,
}

impl MemStore {
    fn next_rev(&self, current: Option<&str>) -> String {
        let gen = current
            .and_then(|r| r.split('-').next())
            .and_then(|g| g.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let seq = self.rev_seq.fetch_add(1, Ordering::Relaxed);
        format!("{gen}-{seq:08x}")
    }
}

/// A handle onto a named in-memory database.
#[derive(Debug)]
pub struct MemDb {
    name: String,
    store: Arc<MemStore>,
}

impl MemDb {
    /// Open a handle onto the named store, creating it on first use.
    pub fn open(name: impl Into<String>) -> Self {
        let name = name.into();
        let store = Arc::clone(
            STORES
                .lock()
                .entry(name.clone())
                .or_insert_with(Default::default),
        );
        Self { name, store }
    }

    fn apply_put(&self, docs: &mut BTreeMap<String, Doc>, doc: &Doc) -> Result<PutResult, StoreError> {
        let current = docs.get(&doc.id);
        match (current, &doc.rev) {
            (Some(cur), rev) if *rev != cur.rev => Err(StoreError::conflict(&doc.id)),
            (None, Some(_)) => Err(StoreError::conflict(&doc.id)),
            (cur, _) => {
                let rev = self.store.next_rev(cur.and_then(|c| c.rev.as_deref()));
                let mut stored = doc.clone();
                stored.rev = Some(rev.clone());
                docs.insert(doc.id.clone(), stored);
                Ok(PutResult {
                    id: doc.id.clone(),
                    rev,
                })
            }
        }
    }
}

#[async_trait]
impl DocDb for MemDb {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Option<Doc>, StoreError> {
        Ok(self.store.docs.lock().get(id).cloned())
    }

    async fn put(&self, doc: &Doc) -> Result<PutResult, StoreError> {
        let mut docs = self.store.docs.lock();
        self.apply_put(&mut docs, doc)
    }

    async fn remove(&self, doc: &Doc) -> Result<PutResult, StoreError> {
        let mut docs = self.store.docs.lock();
        match docs.get(&doc.id) {
            None => Err(StoreError::conflict(&doc.id)),
            Some(cur) if cur.rev != doc.rev => Err(StoreError::conflict(&doc.id)),
            Some(_) => {
                docs.remove(&doc.id);
                Ok(PutResult {
                    id: doc.id.clone(),
                    rev: self.store.next_rev(doc.rev.as_deref()),
                })
            }
        }
    }

    async fn fetch(&self, ids: &[String], include_docs: bool) -> Result<Vec<Row>, StoreError> {
        let docs = self.store.docs.lock();
        Ok(ids
            .iter()
            .map(|id| match docs.get(id) {
                Some(doc) if include_docs => Row::found(doc.clone()),
                Some(doc) => Row::present(id, doc.rev.clone().unwrap_or_default()),
                None => Row::absent(id),
            })
            .collect())
    }

    async fn range(&self, query: &RangeQuery) -> Result<Vec<Row>, StoreError> {
        let (lo, hi) = if query.descending {
            (&query.end, &query.start)
        } else {
            (&query.start, &query.end)
        };
        let docs = self.store.docs.lock();
        let range = docs.range::<String, _>((Bound::Included(lo), Bound::Included(hi)));

        let mut rows: Vec<Row> = range
            .map(|(_, doc)| {
                if query.include_docs {
                    Row::found(doc.clone())
                } else {
                    Row::present(&doc.id, doc.rev.clone().unwrap_or_default())
                }
            })
            .collect();
        if query.descending {
            rows.reverse();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn bulk(&self, docs: &[Doc]) -> Result<Vec<Result<PutResult, StoreError>>, StoreError> {
        let mut stored = self.store.docs.lock();
        Ok(docs
            .iter()
            .map(|doc| self.apply_put(&mut stored, doc))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(id: &str, v: serde_json::Value) -> Doc {
        match v {
            serde_json::Value::Object(m) => Doc::new(id, m),
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn handles_share_the_named_store() {
        drop_matching("^shared-").unwrap();
        let a = MemDb::open("shared-db-0-0");
        let b = MemDb::open("shared-db-0-0");

        a.put(&doc("k/x/t/0000000000000001", json!({"n": 1})))
            .await
            .unwrap();
        let got = b.get("k/x/t/0000000000000001").await.unwrap().unwrap();
        assert_eq!(got.get("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn puts_conflict_on_revision_mismatch() {
        drop_matching("^conflict-").unwrap();
        let db = MemDb::open("conflict-db-0-0");
        let d = doc("k/x/t/0000000000000001", json!({"n": 1}));

        let first = db.put(&d).await.unwrap();
        // Same doc without the assigned revision: optimistic put must fail.
        assert_eq!(
            db.put(&d).await.unwrap_err(),
            StoreError::conflict("k/x/t/0000000000000001")
        );
        // With the assigned revision it succeeds and bumps the generation.
        let updated = db.put(&d.clone().with_rev(first.rev)).await.unwrap();
        assert!(updated.rev.starts_with("2-"));
    }

    #[tokio::test]
    async fn remove_then_get_is_absent() {
        drop_matching("^remove-").unwrap();
        let db = MemDb::open("remove-db-0-0");
        let d = doc("k/x/t/0000000000000001", json!({"n": 1}));

        let put = db.put(&d).await.unwrap();
        db.remove(&d.clone().with_rev(put.rev)).await.unwrap();
        assert_eq!(db.get(&d.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn range_respects_bounds_order_and_limit() {
        drop_matching("^range-").unwrap();
        let db = MemDb::open("range-db-0-0");
        for t in 1..=5 {
            db.put(&doc(
                &tally_types::kturi("x", &t.to_string()),
                json!({"t": t}),
            ))
            .await
            .unwrap();
        }

        let rows = db
            .range(&RangeQuery {
                start: tally_types::kturi("x", "2"),
                end: tally_types::kturi("x", "4"),
                descending: false,
                limit: Some(2),
                include_docs: true,
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, tally_types::kturi("x", "2"));
        assert_eq!(rows[1].id, tally_types::kturi("x", "3"));

        // Descending bounds arrive in traversal order.
        let rows = db
            .range(&RangeQuery {
                start: tally_types::kturi("x", "5"),
                end: tally_types::kturi("x", "1"),
                descending: true,
                limit: Some(1),
                include_docs: false,
            })
            .await
            .unwrap();
        assert_eq!(rows[0].id, tally_types::kturi("x", "5"));
        assert_eq!(rows[0].doc, None);
    }

    #[tokio::test]
    async fn bulk_reports_per_document_conflicts() {
        drop_matching("^bulk-").unwrap();
        let db = MemDb::open("bulk-db-0-0");
        let a = doc("k/a/t/0000000000000001", json!({"n": 1}));
        let b = doc("k/b/t/0000000000000001", json!({"n": 2}));

        db.put(&a).await.unwrap();
        let results = db.bulk(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0], Err(StoreError::conflict(&a.id)));
        assert!(results[1].is_ok());
    }
}
