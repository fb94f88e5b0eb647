//! A mock [`Partitioner`] recording the calls made against it.

use parking_lot::Mutex;

use crate::{Candidates, Op, Partition, PartitionError, Partitioner};

/// One recorded call to the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub key: Option<String>,
    pub time: i64,
    pub op: Op,
}

/// A [`Partitioner`] that returns a canned partition and records calls.
#[derive(Debug)]
pub struct MockPartitioner {
    ret: Partition,
    calls: Mutex<Vec<MockCall>>,
}

impl Default for MockPartitioner {
    fn default() -> Self {
        Self {
            ret: Partition::new(0, 0),
            calls: Default::default(),
        }
    }
}

impl MockPartitioner {
    /// Return `partition` for every resolution.
    pub fn with_return(mut self, partition: Partition) -> Self {
        self.ret = partition;
        self
    }

    /// The calls recorded so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    fn record(&self, key: Option<&str>, time: i64, op: Op) {
        self.calls.lock().push(MockCall {
            key: key.map(str::to_owned),
            time,
            op,
        });
    }
}

impl Partitioner for MockPartitioner {
    fn partition(
        &self,
        key: Option<&str>,
        time: i64,
        op: Op,
    ) -> Result<Candidates, PartitionError> {
        self.record(key, time, op);
        Ok(Candidates::One(self.ret))
    }

    fn partition_range(
        &self,
        key: Option<&str>,
        start: i64,
        _end: i64,
        op: Op,
    ) -> Result<Vec<Candidates>, PartitionError> {
        self.record(key, start, op);
        Ok(vec![Candidates::One(self.ret)])
    }
}
