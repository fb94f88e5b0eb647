//! The stored document model.
//!
//! Documents are schemaless JSON objects. The store adds three metadata
//! fields next to the application fields: the `_id` carrying the canonical
//! key/time id, an opaque `_rev` revision token used for optimistic
//! concurrency, and a `processed` millisecond timestamp recorded at write
//! time. On the wire this is CouchDB-compatible.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id;

/// A document as held by the partitioned store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    /// Canonical key/time id, see [`crate::id`].
    #[serde(rename = "_id")]
    pub id: String,

    /// Opaque revision token assigned by the backend; `None` until the
    /// document has been stored once.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Millisecond timestamp recorded when the document was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<i64>,

    /// Application fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Doc {
    /// Create a document with the given id and application fields.
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            processed: None,
            fields,
        }
    }

    /// Wrap an application JSON object under the given id, dropping any
    /// `id` field the object carries (the canonical id replaces it).
    pub fn dbify(id: impl Into<String>, body: &Map<String, Value>) -> Self {
        let mut fields = body.clone();
        fields.remove("id");
        let processed = fields
            .remove("processed")
            .and_then(|v| v.as_i64());
        Self {
            id: id.into(),
            rev: None,
            processed,
            fields,
        }
    }

    /// Convert back to an application JSON object: `_id` becomes `id`, the
    /// revision token is dropped, and the `processed` stamp is kept as a
    /// plain field.
    pub fn undbify(&self) -> Value {
        let mut body = self.fields.clone();
        body.insert("id".to_owned(), Value::String(self.id.clone()));
        if let Some(p) = self.processed {
            body.insert("processed".to_owned(), Value::from(p));
        }
        Value::Object(body)
    }

    /// The routing key encoded in this document's id.
    pub fn key(&self) -> Option<&str> {
        id::key(&self.id)
    }

    /// The time encoded in this document's id.
    pub fn time(&self) -> Option<&str> {
        id::time(&self.id)
    }

    /// Look up an application field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Set an application field, returning `self` for chaining.
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Set the revision token, returning `self` for chaining.
    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }
}

/// The outcome of a successful `put`/`remove`: the document id and its
/// newly assigned revision token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutResult {
    pub id: String,
    pub rev: String,
}

/// One row of an `all_docs` result.
///
/// Rows preserve request order; a row either carries the document (or just
/// its id and revision when bodies were not requested) or the error that
/// applied to it. An absent document is a row with neither revision nor
/// error.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: String,
    pub rev: Option<String>,
    pub doc: Option<Doc>,
    pub error: Option<crate::StoreError>,
}

impl Row {
    /// A row carrying a found document.
    pub fn found(doc: Doc) -> Self {
        Self {
            id: doc.id.clone(),
            rev: doc.rev.clone(),
            doc: Some(doc),
            error: None,
        }
    }

    /// A row for a document that exists but whose body was not requested.
    pub fn present(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev.into()),
            doc: None,
            error: None,
        }
    }

    /// A row for an id that resolved to no document.
    pub fn absent(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            doc: None,
            error: None,
        }
    }

    /// A row that failed with the given error.
    pub fn failed(id: impl Into<String>, error: crate::StoreError) -> Self {
        Self {
            id: id.into(),
            rev: None,
            doc: None,
            error: Some(error),
        }
    }

    /// Whether the row names a document that exists.
    pub fn exists(&self) -> bool {
        self.error.is_none() && (self.rev.is_some() || self.doc.is_some())
    }
}
