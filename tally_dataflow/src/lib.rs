//! Map and reduce dataflow transform services.
//!
//! A dataflow service accepts usage documents over its `play` operation,
//! durably logs each input, asynchronously produces output documents from
//! it, forwards the outputs to a downstream sink and persists them to the
//! output database. Two shapes are provided:
//!
//! * [`mapper::Mapper`] — each output is a pure function of one input;
//! * [`reducer::Reducer`] — outputs are computed against a running
//!   accumulation per group key, strictly serialized per group.
//!
//! The caller-visible guarantee is narrow by design: a `play` call either
//! fails fast with a clear classification (validation, authorization,
//! duplicate) or succeeds once the input is durably logged. Output
//! production happens after the response; a crash or sink failure in that
//! window is repaired by [`replay`] on the next start.
//!
//! Inputs are logged under time-major ids and outputs under key-major ids,
//! so replay can range-scan recent inputs while point lookups and per-key
//! accumulation scans stay cheap.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use tally_dedup::{DupFilter, Presence};
use tally_store::PartitionedStore;
use tally_types::{Doc, Retryable, StoreError, TimeProvider};

pub mod config;
pub mod lock;
pub mod mapper;
pub mod reducer;
pub mod replay;
pub mod sink;

pub use config::StorageConfig;
pub use replay::{replay, ReplayStats};
pub use sink::{HttpSink, MockSink, Sink, SinkConfig, SinkError, TokenProvider};

/// Application fields of a document, before storage metadata is attached.
pub type Body = Map<String, Value>;

/// Computes the routing key of an input document.
pub type KeyFn = Arc<dyn Fn(&Body) -> String + Send + Sync>;

/// Computes the time of an input document. Typically backed by a
/// [`tally_types::SeqIdGen`] so concurrent inputs get distinct times.
pub type TimeFn = Arc<dyn Fn(&Body) -> String + Send + Sync>;

/// Computes the routing keys of the outputs an input will produce.
pub type KeysFn = Arc<dyn Fn(&Body) -> Vec<String> + Send + Sync>;

/// Computes the times of the outputs an input will produce, given the
/// input's assigned time.
pub type TimesFn = Arc<dyn Fn(&Body, &str) -> Vec<String> + Send + Sync>;

/// Computes the authorization scopes required to submit a document.
pub type ScopeFn = Arc<dyn Fn(&Body) -> ScopeSpec + Send + Sync>;

/// Scopes required for an operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScopeSpec {
    pub system: Vec<String>,
}

/// Errors surfaced by dataflow services.
#[derive(Debug, Error)]
pub enum DataflowError {
    /// The input document failed schema validation.
    #[error("invalid input document: {0}")]
    Validation(String),

    /// The caller lacks the required scope.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The input was already processed; never retried, never counted
    /// against a circuit breaker.
    #[error("duplicate submission of {id}")]
    Duplicate { id: String },

    /// A storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The map or reduce function failed or misbehaved.
    #[error("transform failed: {0}")]
    Transform(String),
}

impl DataflowError {
    /// HTTP-equivalent classification of the error.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Unauthorized(_) => 403,
            Self::Duplicate { .. } => 409,
            Self::Store(StoreError::Conflict { .. }) => 409,
            Self::Store(_) | Self::Transform(_) => 500,
        }
    }

    /// Retry classification, mirroring [`StoreError::retryable`].
    pub fn retryable(&self) -> Retryable {
        match self {
            Self::Validation(_) | Self::Unauthorized(_) | Self::Duplicate { .. } => {
                Retryable::Never
            }
            Self::Store(e) => e.retryable(),
            Self::Transform(_) => Retryable::Fatal,
        }
    }
}

/// Synchronous schema validation of an input document.
pub trait Validator: Debug + Send + Sync {
    fn validate(&self, body: &Body) -> Result<(), DataflowError>;
}

/// Authorization of a caller's token against a scope specification.
pub trait Authorizer: Debug + Send + Sync {
    fn authorize(&self, token: Option<&str>, scope: &ScopeSpec) -> Result<(), DataflowError>;
}

/// An [`Authorizer`] for unsecured deployments: everything is allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _token: Option<&str>, _scope: &ScopeSpec) -> Result<(), DataflowError> {
        Ok(())
    }
}

/// The caller-supplied map function: one input, any number of outputs.
///
/// The number of outputs must match the ids projected by the output
/// key/time functions for this input.
#[async_trait]
pub trait MapFn: Debug + Send + Sync {
    async fn map(&self, input: &Doc) -> Result<Vec<Body>, DataflowError>;
}

/// The caller-supplied reduce function.
///
/// Invoked with the last accumulated output (if any) and a batch of input
/// documents sharing one group key; must return one result set per input,
/// in batch order.
#[async_trait]
pub trait ReduceFn: Debug + Send + Sync {
    async fn reduce(
        &self,
        accumulated: Option<&Doc>,
        batch: &[Doc],
    ) -> Result<Vec<Vec<Body>>, DataflowError>;
}

/// Configuration of a service's input side.
pub struct InputConfig {
    /// Document type, also naming the field linking outputs to their input
    /// (e.g. `metered-usage` produces a `metered_usage_id` link).
    pub doc_type: String,
    /// Logical name of the input database.
    pub db_name: String,
    /// Route template for input locations; `:id` is substituted.
    pub route: String,
    /// Routing key of an input.
    pub key: KeyFn,
    /// Time of an input.
    pub time: TimeFn,
    /// Group key for reduction; inputs with equal group keys are reduced
    /// serially. Defaults to the routing key.
    pub group: Option<KeyFn>,
    /// Scopes required to submit inputs, when secured.
    pub wscope: Option<ScopeFn>,
    /// Schema validation, when configured.
    pub schema: Option<Arc<dyn Validator>>,
}

impl Debug for InputConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputConfig")
            .field("doc_type", &self.doc_type)
            .field("db_name", &self.db_name)
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

/// Configuration of a service's output side.
pub struct OutputConfig {
    /// Document type of the outputs.
    pub doc_type: String,
    /// Logical name of the output database.
    pub db_name: String,
    /// Route template for output locations; `:id` is substituted.
    pub route: String,
    /// Routing keys of the outputs an input produces.
    pub keys: KeysFn,
    /// Times of the outputs an input produces.
    pub times: TimesFn,
}

impl Debug for OutputConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputConfig")
            .field("doc_type", &self.doc_type)
            .field("db_name", &self.db_name)
            .field("route", &self.route)
            .finish_non_exhaustive()
    }
}

/// Full configuration of one dataflow service.
#[derive(Debug)]
pub struct ServiceConfig {
    pub input: InputConfig,
    pub output: OutputConfig,
    /// Downstream sink; `None` for terminal stages.
    pub sink: Option<SinkConfig>,
    /// Duplicate detection sizing; `None` disables the in-memory filter
    /// (storage conflicts still reject duplicates).
    pub dedup: Option<tally_dedup::DedupConfig>,
}

/// Successful outcome of a `play` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Id of the logged input document.
    pub id: String,
    /// Location reference built from the input route template.
    pub location: String,
}

/// Substitute an id into a route template.
pub(crate) fn location(template: &str, id: &str) -> String {
    template.replace(":id", id)
}

/// The two-tier duplicate check over projected output ids.
///
/// The in-memory filter answers the common case; an unknown id falls back
/// to a storage existence check before the input is accepted and its ids
/// recorded as seen.
pub(crate) async fn check_duplicates(
    filter: Option<&DupFilter>,
    output_db: &PartitionedStore,
    oids: &[String],
) -> Result<(), DataflowError> {
    let Some(filter) = filter else {
        return Ok(());
    };
    for oid in oids {
        match filter.check(oid) {
            Presence::Seen => {
                return Err(DataflowError::Duplicate { id: oid.clone() });
            }
            Presence::Unknown => {
                if output_db.get(oid).await?.is_some() {
                    filter.mark_seen(oid);
                    return Err(DataflowError::Duplicate { id: oid.clone() });
                }
                filter.mark_seen(oid);
            }
        }
    }
    Ok(())
}

/// The service surface shared by mapper and reducer, as seen by [`replay`].
#[async_trait]
pub trait Service: Debug + Send + Sync {
    fn config(&self) -> &ServiceConfig;

    fn input_db(&self) -> &Arc<PartitionedStore>;

    fn output_db(&self) -> &Arc<PartitionedStore>;

    /// Re-drive output production for an already-logged input.
    ///
    /// Validation, authorization and input logging already happened when
    /// the input was first accepted, so replay re-enters directly at output
    /// production.
    async fn replay_input(&self, input: Doc) -> Result<(), DataflowError>;
}

/// Shared construction context of a dataflow service.
#[derive(Debug, Clone)]
pub struct Environment {
    pub clock: Arc<dyn TimeProvider>,
    pub authorizer: Arc<dyn Authorizer>,
    pub sink_client: Arc<dyn Sink>,
}

impl Environment {
    /// An unsecured environment over the system clock and an HTTP sink.
    pub fn new() -> Self {
        Self {
            clock: Arc::new(tally_types::SystemProvider::new()),
            authorizer: Arc::new(AllowAll),
            sink_client: Arc::new(HttpSink::new()),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

/// The field on an output document naming the input it was produced from.
pub(crate) fn link_field(input_doc_type: &str) -> String {
    format!("{}_id", input_doc_type.replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn errors_classify_for_retry_layers() {
        assert_eq!(DataflowError::Validation("bad".into()).status(), 400);
        assert_eq!(DataflowError::Unauthorized("scope".into()).status(), 403);
        let dup = DataflowError::Duplicate {
            id: "k/a/t/0000000000000001".into(),
        };
        assert_eq!(dup.status(), 409);
        assert_eq!(dup.retryable(), Retryable::Never);

        let conflict = DataflowError::Store(StoreError::conflict("k/a/t/0000000000000001"));
        assert_eq!(conflict.status(), 409);
        assert_eq!(conflict.retryable(), Retryable::Never);
    }

    #[test]
    fn link_fields_are_derived_from_the_doc_type() {
        assert_eq!(link_field("metered-usage"), "metered_usage_id");
        assert_eq!(link_field("usage"), "usage_id");
    }

    #[test]
    fn locations_substitute_the_id() {
        assert_eq!(
            location("/v1/metering/collected/usage/:id", "t/0000000000000001/k/a"),
            "/v1/metering/collected/usage/t/0000000000000001/k/a"
        );
    }
}
