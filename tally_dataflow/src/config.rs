//! Deployment configuration surface.
//!
//! Deployment glue owns these values (flags or environment); this core
//! only consumes them. The struct enumerates every recognized option with
//! its default resolved at parse time.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use tally_sharder::{KeyTimePartitioner, MonthlyForward, PartitionError, Partitioner, RandomBalance};
use tally_store::{CouchConnector, DbConnector, DbUri, MemConnector, PartitionedStore};
use tally_types::TimeProvider;

use crate::Body;

fn parse_db_options(s: &str) -> Result<Body, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid database options: {e}"))
}

/// Storage and sink wiring of one dataflow process.
#[derive(Debug, Clone, Parser)]
pub struct StorageConfig {
    /// Number of partitions each logical database is sharded into.
    #[clap(
        long = "db-partitions",
        env = "TALLY_DB_PARTITIONS",
        default_value = "1"
    )]
    pub db_partitions: usize,

    /// Storage server connection uri; unset means in-memory databases.
    #[clap(long = "db-uri", env = "TALLY_DB_URI")]
    pub db_uri: Option<String>,

    /// Number of downstream sink instances outputs are fanned out to.
    #[clap(long = "sink-partitions", env = "TALLY_SINK_PARTITIONS")]
    pub sink_partitions: Option<usize>,

    /// Replay window on start, e.g. "30m" or "2h"; unset disables replay.
    #[clap(
        long = "replay-window",
        env = "TALLY_REPLAY_WINDOW",
        value_parser = humantime::parse_duration
    )]
    pub replay_window: Option<Duration>,

    /// Raw per-database engine options, a JSON object passed through to
    /// the storage backend.
    #[clap(
        long = "db-options",
        env = "TALLY_DB_OPTIONS",
        value_parser = parse_db_options
    )]
    pub db_options: Option<Body>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_partitions: 1,
            db_uri: None,
            sink_partitions: None,
            replay_window: None,
            db_options: None,
        }
    }
}

impl StorageConfig {
    /// The partition function for the configured partition count.
    ///
    /// Fails for a partition count that does not evenly divide the bucket
    /// space, so misconfiguration stops the process at startup.
    pub fn partitioner(&self) -> Result<Arc<dyn Partitioner>, PartitionError> {
        Ok(Arc::new(KeyTimePartitioner::new(
            MonthlyForward::new(self.db_partitions)?,
            RandomBalance::new(),
        )))
    }

    /// The backend connector for the configured storage uri.
    pub fn connector(&self) -> Arc<dyn DbConnector> {
        match &self.db_uri {
            Some(uri) if uri.contains("://") => Arc::new(CouchConnector::new(
                self.db_options.clone().unwrap_or_default(),
            )),
            _ => Arc::new(MemConnector),
        }
    }

    /// Open the partitioned store of one logical database.
    pub fn open_store(
        &self,
        name: &str,
        clock: Arc<dyn TimeProvider>,
    ) -> Result<Arc<PartitionedStore>, PartitionError> {
        Ok(Arc::new(PartitionedStore::new(
            self.partitioner()?,
            DbUri::new(self.db_uri.as_deref(), name),
            self.connector(),
            clock,
        )))
    }

    /// Sink partition count, when fan-out is configured.
    pub fn sink_partitions(&self) -> Option<NonZeroUsize> {
        self.sink_partitions.and_then(NonZeroUsize::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_resolve_to_a_single_in_memory_partition() {
        let config = StorageConfig::try_parse_from(["tally"]).unwrap();
        assert_eq!(config.db_partitions, 1);
        assert_eq!(config.db_uri, None);
        assert_eq!(config.replay_window, None);
        assert!(config.partitioner().is_ok());
    }

    #[test]
    fn flags_parse() {
        let config = StorageConfig::try_parse_from([
            "tally",
            "--db-partitions",
            "4",
            "--db-uri",
            "http://db:5984",
            "--sink-partitions",
            "2",
            "--replay-window",
            "30m",
            "--db-options",
            r#"{"partitioned": false}"#,
        ])
        .unwrap();
        assert_eq!(config.db_partitions, 4);
        assert_eq!(config.replay_window, Some(Duration::from_secs(1800)));
        assert_eq!(config.sink_partitions().unwrap().get(), 2);
        assert_eq!(
            config.db_options.unwrap()["partitioned"],
            serde_json::json!(false)
        );
    }

    #[test]
    fn uneven_partition_counts_are_rejected_at_startup() {
        let config = StorageConfig {
            db_partitions: 3,
            ..Default::default()
        };
        assert_eq!(
            config.partitioner().unwrap_err(),
            PartitionError::UnevenPartitions { n: 3 }
        );
    }
}
