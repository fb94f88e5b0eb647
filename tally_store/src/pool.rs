//! Lazy, memoized database handle pool.
//!
//! Handles are keyed by `(uri, mode)`. Construction of a not-yet-pooled
//! handle runs inside that key's [`OnceCell`], so concurrent first-callers
//! wait for a single construction and share the handle. A handle opened for
//! write is registered under the read key as well, since a write-capable
//! handle serves reads. In-memory databases are excluded from pooling and
//! handed out fresh on every call.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use tally_sharder::Partition;
use tally_types::StoreError;

use crate::backend::{DocDb, ErrDb};
use crate::mem::MemDb;

/// Whether a handle is needed for reading or writing.
///
/// Read-mode construction must not create a missing database; write-mode
/// construction may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Read,
    Write,
}

/// Constructs physical database handles for partition uris.
#[async_trait]
pub trait DbConnector: Debug + Send + Sync {
    /// Whether handles for this uri should be memoized by the pool.
    fn poolable(&self, uri: &str) -> bool;

    /// Construct a handle for the given uri.
    async fn connect(&self, uri: &str, mode: Mode) -> Result<Arc<dyn DocDb>, StoreError>;
}

/// Connector for named in-memory databases.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemConnector;

#[async_trait]
impl DbConnector for MemConnector {
    fn poolable(&self, _uri: &str) -> bool {
        false
    }

    async fn connect(&self, uri: &str, _mode: Mode) -> Result<Arc<dyn DocDb>, StoreError> {
        Ok(Arc::new(MemDb::open(uri)))
    }
}

type Cell = Arc<OnceCell<Arc<dyn DocDb>>>;

/// The `(uri, mode)`-keyed handle pool.
#[derive(Debug)]
pub(crate) struct DbPool {
    connector: Arc<dyn DbConnector>,
    cells: Mutex<HashMap<(String, Mode), Cell>>,
}

impl DbPool {
    pub(crate) fn new(connector: Arc<dyn DbConnector>) -> Self {
        Self {
            connector,
            cells: Default::default(),
        }
    }

    fn cell(&self, uri: &str, mode: Mode) -> Cell {
        Arc::clone(
            self.cells
                .lock()
                .entry((uri.to_owned(), mode))
                .or_insert_with(Default::default),
        )
    }

    /// Obtain the pooled handle for `uri`, constructing it on first use.
    ///
    /// Construction failures are not memoized: the caller receives a sticky
    /// [`ErrDb`] for this call while the pool slot stays empty, so a later
    /// call may retry the construction.
    pub(crate) async fn db(&self, uri: &str, mode: Mode) -> Arc<dyn DocDb> {
        if !self.connector.poolable(uri) {
            return match self.connector.connect(uri, mode).await {
                Ok(db) => db,
                Err(err) => Arc::new(ErrDb::new(format!("dbcons-err-{uri}"), err)),
            };
        }

        // Prefer an existing write handle for read requests.
        if mode == Mode::Read {
            if let Some(db) = self.cell(uri, Mode::Read).get() {
                return Arc::clone(db);
            }
        }

        let cell = self.cell(uri, mode);
        let connector = Arc::clone(&self.connector);
        let constructed = cell
            .get_or_try_init(|| async {
                debug!(%uri, ?mode, "constructing database handle");
                connector.connect(uri, mode).await
            })
            .await;

        match constructed {
            Ok(db) => {
                if mode == Mode::Write {
                    // A write handle serves reads as well.
                    let _ = self.cell(uri, Mode::Read).set(Arc::clone(db));
                }
                Arc::clone(db)
            }
            Err(err) => {
                warn!(%uri, ?mode, %err, "database handle construction failed");
                Arc::new(ErrDb::new(format!("dbcons-err-{uri}"), err))
            }
        }
    }
}

/// Names the physical database of each partition.
///
/// A base of `usage` with partition `(3, 201410)` yields `usage-3-201410`;
/// a server-qualified base yields `http://server:5984/usage-3-201410`.
#[derive(Debug, Clone)]
pub struct DbUri {
    base: String,
}

impl DbUri {
    pub fn new(server: Option<&str>, name: &str) -> Self {
        let base = match server {
            Some(server) => format!("{}/{name}", server.trim_end_matches('/')),
            None => name.to_owned(),
        };
        Self { base }
    }

    /// The uri of one partition's database.
    pub fn partition_uri(&self, partition: Partition) -> String {
        format!("{}-{}-{}", self.base, partition.number, partition.epoch)
    }
}
