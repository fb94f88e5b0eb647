//! Sink routing and forwarding.
//!
//! Output documents are forwarded to a downstream service. When the
//! deployment runs several downstream instances, the target instance is
//! derived from the output's routing key with the same bucket hash the
//! store shards by, under a dedicated sink partition count, so storage
//! sharding and downstream fan-out scale independently. The partition is
//! encoded as a port offset when the logical host carries an explicit
//! port, and as a hostname suffix on the first label otherwise.

use std::fmt::Debug;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;
use url::Url;

use tally_sharder::{bucket, MonthlyForward};
use tally_types::{id, Doc};

/// Supplies a bearer token for sink requests.
pub trait TokenProvider: Debug + Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Sink-side configuration of a dataflow service.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Logical downstream host, e.g. `http://aggregator:9300`.
    pub host: String,
    /// Number of downstream instances; `None` or 1 leaves the host as is.
    pub partitions: Option<NonZeroUsize>,
    /// Path posted to on the routed instance.
    pub post_path: String,
    /// Bearer token source, when the sink is secured.
    pub token: Option<Arc<dyn TokenProvider>>,
}

impl SinkConfig {
    pub fn new(host: impl Into<String>, post_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            partitions: None,
            post_path: post_path.into(),
            token: None,
        }
    }

    /// Compute the concrete instance URI for an output document id.
    pub fn route(&self, oid: &str) -> Result<String, SinkError> {
        let n = match self.partitions {
            Some(n) if n.get() > 1 => n.get(),
            _ => {
                return Ok(format!(
                    "{}{}",
                    self.host.trim_end_matches('/'),
                    self.post_path
                ));
            }
        };

        let key = id::key(oid).ok_or_else(|| SinkError::Route {
            message: format!("output id {oid} has no routing key"),
        })?;
        let forward = MonthlyForward::new(n).map_err(|e| SinkError::Route {
            message: e.to_string(),
        })?;
        let partition = forward.partition_number(bucket(key));

        let mut url = Url::parse(&self.host).map_err(|e| SinkError::Route {
            message: format!("invalid sink host {}: {e}", self.host),
        })?;
        match url.port() {
            Some(port) => {
                url.set_port(Some(port + partition as u16))
                    .map_err(|()| SinkError::Route {
                        message: format!("cannot set port on sink host {}", self.host),
                    })?;
            }
            None => {
                let host = url.host_str().ok_or_else(|| SinkError::Route {
                    message: format!("sink host {} has no hostname", self.host),
                })?;
                let routed = match host.split_once('.') {
                    Some((first, rest)) => format!("{first}-{partition}.{rest}"),
                    None => format!("{host}-{partition}"),
                };
                url.set_host(Some(&routed)).map_err(|e| SinkError::Route {
                    message: format!("cannot route sink host {}: {e}", self.host),
                })?;
            }
        }

        debug!(%oid, partition, uri = %url, "routed output to sink instance");
        Ok(format!(
            "{}{}",
            url.as_str().trim_end_matches('/'),
            self.post_path
        ))
    }

    fn bearer(&self) -> Option<String> {
        self.token.as_ref().and_then(|t| t.token())
    }
}

/// Errors produced while forwarding an output document.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// The instance URI could not be derived.
    #[error("sink routing failed: {message}")]
    Route { message: String },

    /// The request did not complete.
    #[error("sink request to {uri} failed: {message}")]
    Transport { uri: String, message: String },

    /// The sink answered outside 2xx.
    #[error("sink at {uri} responded with status {status}")]
    Status { uri: String, status: u16 },
}

/// Transport used to deliver output documents downstream.
#[async_trait]
pub trait Sink: Debug + Send + Sync {
    async fn post(&self, uri: &str, doc: &Doc, token: Option<String>) -> Result<(), SinkError>;
}

/// Plain HTTP POST delivery.
#[derive(Debug, Default)]
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn post(&self, uri: &str, doc: &Doc, token: Option<String>) -> Result<(), SinkError> {
        let mut req = self.client.post(uri).json(doc);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let res = req.send().await.map_err(|e| SinkError::Transport {
            uri: uri.to_owned(),
            message: e.to_string(),
        })?;
        if !res.status().is_success() {
            return Err(SinkError::Status {
                uri: uri.to_owned(),
                status: res.status().as_u16(),
            });
        }
        Ok(())
    }
}

/// A [`Sink`] recording posted documents, for tests.
#[derive(Debug, Default)]
pub struct MockSink {
    posted: Mutex<Vec<(String, Doc)>>,
    fail: Mutex<bool>,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent posts fail with a 503.
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock() = failing;
    }

    /// The `(uri, doc)` pairs posted so far.
    pub fn posted(&self) -> Vec<(String, Doc)> {
        self.posted.lock().clone()
    }
}

#[async_trait]
impl Sink for MockSink {
    async fn post(&self, uri: &str, doc: &Doc, _token: Option<String>) -> Result<(), SinkError> {
        if *self.fail.lock() {
            return Err(SinkError::Status {
                uri: uri.to_owned(),
                status: 503,
            });
        }
        self.posted.lock().push((uri.to_owned(), doc.clone()));
        Ok(())
    }
}

/// A routed sink ready to forward a service's outputs.
#[derive(Debug, Clone)]
pub(crate) struct SinkDispatch {
    config: SinkConfig,
    client: Arc<dyn Sink>,
}

impl SinkDispatch {
    pub(crate) fn new(config: SinkConfig, client: Arc<dyn Sink>) -> Self {
        Self { config, client }
    }

    pub(crate) async fn forward(&self, doc: &Doc) -> Result<(), SinkError> {
        let uri = self.config.route(&doc.id)?;
        self.client.post(&uri, doc, self.config.bearer()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tally_sharder::BUCKETS;

    fn config(host: &str, partitions: Option<usize>) -> SinkConfig {
        SinkConfig {
            host: host.into(),
            partitions: partitions.and_then(NonZeroUsize::new),
            post_path: "/v1/metering/metered/usage".into(),
            token: None,
        }
    }

    #[test]
    fn unpartitioned_sinks_pass_the_host_through() {
        let cfg = config("http://aggregator:9300", None);
        assert_eq!(
            cfg.route("k/org1/t/0000000000000001").unwrap(),
            "http://aggregator:9300/v1/metering/metered/usage"
        );

        let cfg = config("http://aggregator:9300", Some(1));
        assert_eq!(
            cfg.route("k/org1/t/0000000000000001").unwrap(),
            "http://aggregator:9300/v1/metering/metered/usage"
        );
    }

    #[test]
    fn explicit_ports_route_by_port_offset() {
        let cfg = config("http://localhost:9300", Some(4));
        let key = (0..)
            .map(|i| format!("org-{i}"))
            .find(|k| bucket(k) / (BUCKETS / 4) == 2)
            .unwrap();
        let uri = cfg
            .route(&tally_types::kturi(&key, "1420502400000"))
            .unwrap();
        assert_eq!(uri, "http://localhost:9302/v1/metering/metered/usage");
    }

    #[test]
    fn bare_hosts_route_by_hostname_suffix() {
        let cfg = config("https://aggregator.example.com", Some(2));
        let key = (0..)
            .map(|i| format!("org-{i}"))
            .find(|k| bucket(k) / (BUCKETS / 2) == 1)
            .unwrap();
        let uri = cfg
            .route(&tally_types::kturi(&key, "1420502400000"))
            .unwrap();
        assert_eq!(
            uri,
            "https://aggregator-1.example.com/v1/metering/metered/usage"
        );
    }

    #[test]
    fn routing_is_deterministic_per_key() {
        let cfg = config("http://localhost:9300", Some(4));
        let oid = tally_types::kturi("org-42/inst-1", "1420502400000");
        let first = cfg.route(&oid).unwrap();
        for _ in 0..20 {
            assert_eq!(cfg.route(&oid).unwrap(), first);
        }
    }
}
