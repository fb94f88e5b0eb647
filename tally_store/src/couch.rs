//! CouchDB-compatible HTTP backend.
//!
//! Each partition database maps to one CouchDB database named by its
//! partitioned uri. Write-mode handles create the database on first use;
//! read-mode handles skip setup so reading never creates an empty database.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;
use url::Url;

use tally_types::{Doc, PutResult, Row, StoreError};

use crate::backend::{DocDb, RangeQuery};
use crate::pool::{DbConnector, Mode};

/// Connector producing [`CouchDb`] handles for `http(s)` uris.
///
/// Raw engine options are forwarded as query parameters on database
/// creation (e.g. `{"partitioned": false}`), the deployment's passthrough
/// for engine tuning.
#[derive(Debug, Clone, Default)]
pub struct CouchConnector {
    options: Map<String, Value>,
}

impl CouchConnector {
    pub fn new(options: Map<String, Value>) -> Self {
        Self { options }
    }
}

#[async_trait]
impl DbConnector for CouchConnector {
    fn poolable(&self, _uri: &str) -> bool {
        true
    }

    async fn connect(&self, uri: &str, mode: Mode) -> Result<Arc<dyn DocDb>, StoreError> {
        let db = CouchDb::new(uri).map_err(|message| StoreError::Connect {
            uri: uri.to_owned(),
            message,
        })?;

        // Reads must not create a missing database.
        if mode == Mode::Write {
            db.create(&self.options).await?;
        }
        Ok(Arc::new(db))
    }
}

/// One CouchDB database over HTTP.
#[derive(Debug)]
pub struct CouchDb {
    name: String,
    url: Url,
    client: reqwest::Client,
}

impl CouchDb {
    fn new(uri: &str) -> Result<Self, String> {
        let url = Url::parse(uri).map_err(|e| e.to_string())?;
        Ok(Self {
            name: uri.to_owned(),
            url,
            client: reqwest::Client::new(),
        })
    }

    // The whole id is one path segment; `push` percent-encodes the `/`
    // separators inside it.
    fn doc_url(&self, id: &str) -> Result<Url, StoreError> {
        self.join(id)
    }

    fn join(&self, path: &str) -> Result<Url, StoreError> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|()| self.err(None, "database uri cannot be a base"))?
            .pop_if_empty()
            .push(path);
        Ok(url)
    }

    fn err(&self, status: Option<StatusCode>, message: impl Into<String>) -> StoreError {
        StoreError::backend(&self.name, status.map(|s| s.as_u16()), message)
    }

    async fn create(&self, options: &Map<String, Value>) -> Result<(), StoreError> {
        let mut req = self.client.put(self.url.clone());
        for (k, v) in options {
            req = req.query(&[(k.as_str(), v.to_string())]);
        }
        let res = req.send().await.map_err(|e| self.err(None, e.to_string()))?;
        match res.status() {
            s if s.is_success() => Ok(()),
            // Already exists.
            StatusCode::PRECONDITION_FAILED => Ok(()),
            s => Err(self.err(Some(s), "database creation failed")),
        }
    }

    fn row_from(&self, row: CouchRow) -> Row {
        let id = row
            .id
            .or(row.key)
            .unwrap_or_default();
        match row.error.as_deref() {
            // A missing document is an absent result, not an error.
            Some("not_found") => Row::absent(id),
            Some(e) => Row::failed(id, self.err(None, e.to_owned())),
            None => {
                let deleted = row.value.as_ref().is_some_and(|v| v.deleted);
                match (deleted, row.doc, row.value) {
                    (true, _, _) => Row::absent(id),
                    (_, Some(doc), _) => Row::found(doc),
                    (_, None, Some(v)) => Row::present(id, v.rev.unwrap_or_default()),
                    (_, None, None) => Row::absent(id),
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct CouchPutResponse {
    id: String,
    rev: String,
}

#[derive(Debug, Deserialize)]
struct CouchRowValue {
    rev: Option<String>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct CouchRow {
    id: Option<String>,
    key: Option<String>,
    value: Option<CouchRowValue>,
    doc: Option<Doc>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CouchAllDocsResponse {
    rows: Vec<CouchRow>,
}

#[derive(Debug, Deserialize)]
struct CouchBulkRow {
    id: Option<String>,
    rev: Option<String>,
    error: Option<String>,
    reason: Option<String>,
}

#[async_trait]
impl DocDb for CouchDb {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Option<Doc>, StoreError> {
        let res = self
            .client
            .get(self.doc_url(id)?)
            .send()
            .await
            .map_err(|e| self.err(None, e.to_string()))?;
        match res.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => res
                .json::<Doc>()
                .await
                .map(Some)
                .map_err(|e| self.err(None, e.to_string())),
            s => Err(self.err(Some(s), "get failed")),
        }
    }

    async fn put(&self, doc: &Doc) -> Result<PutResult, StoreError> {
        let res = self
            .client
            .put(self.doc_url(&doc.id)?)
            .json(doc)
            .send()
            .await
            .map_err(|e| self.err(None, e.to_string()))?;
        match res.status() {
            StatusCode::CONFLICT => Err(StoreError::conflict(&doc.id)),
            s if s.is_success() => {
                let body: CouchPutResponse = res
                    .json()
                    .await
                    .map_err(|e| self.err(None, e.to_string()))?;
                Ok(PutResult {
                    id: body.id,
                    rev: body.rev,
                })
            }
            s => Err(self.err(Some(s), "put failed")),
        }
    }

    async fn remove(&self, doc: &Doc) -> Result<PutResult, StoreError> {
        let rev = doc
            .rev
            .as_deref()
            .ok_or_else(|| StoreError::conflict(&doc.id))?;
        let res = self
            .client
            .delete(self.doc_url(&doc.id)?)
            .query(&[("rev", rev)])
            .send()
            .await
            .map_err(|e| self.err(None, e.to_string()))?;
        match res.status() {
            StatusCode::CONFLICT | StatusCode::NOT_FOUND => Err(StoreError::conflict(&doc.id)),
            s if s.is_success() => {
                let body: CouchPutResponse = res
                    .json()
                    .await
                    .map_err(|e| self.err(None, e.to_string()))?;
                Ok(PutResult {
                    id: body.id,
                    rev: body.rev,
                })
            }
            s => Err(self.err(Some(s), "remove failed")),
        }
    }

    async fn fetch(&self, ids: &[String], include_docs: bool) -> Result<Vec<Row>, StoreError> {
        let url = self.join("_all_docs")?;
        let res = self
            .client
            .post(url)
            .query(&[("include_docs", include_docs)])
            .json(&json!({ "keys": ids }))
            .send()
            .await
            .map_err(|e| self.err(None, e.to_string()))?;
        // A database that was never created holds no documents.
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(ids.iter().map(Row::absent).collect());
        }
        if !res.status().is_success() {
            return Err(self.err(Some(res.status()), "fetch failed"));
        }
        let body: CouchAllDocsResponse = res
            .json()
            .await
            .map_err(|e| self.err(None, e.to_string()))?;
        debug!(db = %self.name, rows = body.rows.len(), "fetched rows");
        Ok(body.rows.into_iter().map(|r| self.row_from(r)).collect())
    }

    async fn range(&self, query: &RangeQuery) -> Result<Vec<Row>, StoreError> {
        let url = self.join("_all_docs")?;
        // Bounds arrive in traversal order, which is CouchDB's own
        // convention for descending scans.
        let mut req = self
            .client
            .get(url)
            .query(&[
                ("startkey", Value::String(query.start.clone()).to_string()),
                ("endkey", Value::String(query.end.clone()).to_string()),
            ])
            .query(&[("include_docs", query.include_docs)])
            .query(&[("descending", query.descending)]);
        if let Some(limit) = query.limit {
            req = req.query(&[("limit", limit)]);
        }
        let res = req
            .send()
            .await
            .map_err(|e| self.err(None, e.to_string()))?;
        // A database that was never created holds no documents.
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !res.status().is_success() {
            return Err(self.err(Some(res.status()), "range failed"));
        }
        let body: CouchAllDocsResponse = res
            .json()
            .await
            .map_err(|e| self.err(None, e.to_string()))?;
        Ok(body.rows.into_iter().map(|r| self.row_from(r)).collect())
    }

    async fn bulk(&self, docs: &[Doc]) -> Result<Vec<Result<PutResult, StoreError>>, StoreError> {
        let url = self.join("_bulk_docs")?;
        let res = self
            .client
            .post(url)
            .json(&json!({ "docs": docs }))
            .send()
            .await
            .map_err(|e| self.err(None, e.to_string()))?;
        if !res.status().is_success() {
            return Err(self.err(Some(res.status()), "bulk update failed"));
        }
        let body: Vec<CouchBulkRow> = res
            .json()
            .await
            .map_err(|e| self.err(None, e.to_string()))?;
        Ok(body
            .into_iter()
            .map(|row| {
                let id = row.id.unwrap_or_default();
                match (row.error.as_deref(), row.rev) {
                    (Some("conflict"), _) => Err(StoreError::conflict(id)),
                    (Some(e), _) => {
                        Err(self.err(None, format!("{e}: {}", row.reason.unwrap_or_default())))
                    }
                    (None, Some(rev)) => Ok(PutResult { id, rev }),
                    (None, None) => Err(self.err(None, "bulk row missing revision")),
                }
            })
            .collect())
    }
}
