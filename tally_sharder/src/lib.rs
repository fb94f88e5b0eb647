//! Distributes operations on key/time documents over a set of partitions.
//!
//! A partition is a `(number, epoch)` pair naming one physical database:
//! the number is derived by hashing the routing key into a fixed space of
//! [`BUCKETS`] buckets divided evenly among the configured partitions, and
//! the epoch is a coarse time bucket (one calendar month). For a fixed
//! partition count the mapping from `(key, time)` to a partition is pure and
//! deterministic, which is what lets every process route a document to the
//! same physical database without coordination.
//!
//! Resolution composes four steps, each replaceable at a trait seam:
//!
//! 1. `bucket(key)` hashes the key into `[0, BUCKETS)`.
//! 2. `period(time)` maps a millisecond timestamp to a UTC day number.
//! 3. [`Forward`] maps `(bucket, period, op)` to candidate partitions.
//! 4. [`Balance`] selects exactly one candidate for single-doc operations.
//!
//! [`MonthlyForward`] and [`RandomBalance`] are the production steps;
//! [`Singleton`] collapses everything onto partition `(0, 0)` for
//! unpartitioned databases, and [`mock`] records calls for tests.

use std::fmt::Debug;
use std::hash::Hasher;

use chrono::{DateTime, Datelike, Utc};
use siphasher::sip::SipHasher13;
use thiserror::Error;

pub mod mock;
mod monthly;

pub use monthly::{MonthlyForward, RandomBalance};

/// Size of the bucket space keys are hashed into.
pub const BUCKETS: u32 = 4000;

/// Milliseconds per period (one UTC day).
const PERIOD_MILLIS: i64 = 86_400_000;

/// The operation a partition is being resolved for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
}

/// One physical database: a partition number and a `YYYYMM` month epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Partition {
    pub number: u32,
    pub epoch: i32,
}

impl Partition {
    pub fn new(number: u32, epoch: i32) -> Self {
        Self { number, epoch }
    }
}

/// The partitions resolved for one operation or one epoch of a range.
///
/// Single-doc operations and ranges over a known key balance down to exactly
/// one partition per epoch; a range without a key resolves to every
/// partition of the epoch, all of which must be queried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidates {
    One(Partition),
    Many(Vec<Partition>),
}

impl Candidates {
    /// View the candidates as a slice regardless of arity.
    pub fn partitions(&self) -> &[Partition] {
        match self {
            Self::One(p) => std::slice::from_ref(p),
            Self::Many(ps) => ps,
        }
    }
}

/// Errors produced while resolving a partition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    /// The configured partition count does not evenly divide the bucket
    /// space; accepting it would silently truncate sharding.
    #[error("{n} partitions do not evenly divide the {BUCKETS} bucket space")]
    UnevenPartitions { n: usize },

    /// A write operation cannot be forwarded without a routing key.
    #[error("cannot forward a write operation without a routing key")]
    MissingKey,

    /// A forwarding step failed.
    #[error("forwarding failed for bucket {bucket:?}, period {period}: {message}")]
    Forward {
        bucket: Option<u32>,
        period: i32,
        message: String,
    },

    /// A balancing step failed.
    #[error("balancing failed over partitions {candidates:?}: {message}")]
    Balance {
        candidates: Vec<Partition>,
        message: String,
    },
}

/// Maps a `(bucket, period, op)` to the candidate partitions holding it.
pub trait Forward: Debug + Send + Sync {
    fn forward(
        &self,
        bucket: Option<u32>,
        period: i32,
        op: Op,
    ) -> Result<Vec<Partition>, PartitionError>;
}

/// Selects exactly one partition among already-valid candidates.
///
/// Any selection policy is acceptable; the production implementation picks
/// uniformly at random to spread reads over replicas.
pub trait Balance: Debug + Send + Sync {
    fn balance(&self, candidates: &[Partition], op: Op) -> Result<Partition, PartitionError>;
}

/// Resolves keys and times to partitions.
pub trait Partitioner: Debug + Send + Sync {
    /// Resolve a single-document operation.
    fn partition(
        &self,
        key: Option<&str>,
        time: i64,
        op: Op,
    ) -> Result<Candidates, PartitionError>;

    /// Resolve every epoch intersecting `[start, end]`, in bound order
    /// (descending when `end < start`), one [`Candidates`] per epoch.
    fn partition_range(
        &self,
        key: Option<&str>,
        start: i64,
        end: i64,
        op: Op,
    ) -> Result<Vec<Candidates>, PartitionError>;
}

// A fixed siphash key so every process maps the same routing key to the
// same bucket.
const BUCKET_HASH_KEY: [u8; 16] = [
    0x6d, 0x83, 0x93, 0x52, 0xa3, 0x7c, 0xe6, 0x02, 0xac, 0x01, 0x11, 0x94, 0x79, 0x0c, 0x64,
    0x42,
];

/// Hash a routing key into `[0, BUCKETS)`.
pub fn bucket(key: &str) -> u32 {
    let mut hasher = SipHasher13::new_with_key(&BUCKET_HASH_KEY);
    hasher.write(key.as_bytes());
    (hasher.finish() % u64::from(BUCKETS)) as u32
}

/// Map a millisecond timestamp to a UTC day number.
pub fn period(time: i64) -> i32 {
    time.div_euclid(PERIOD_MILLIS) as i32
}

/// The `YYYYMM` month epoch containing the given period.
pub fn epoch(period: i32) -> i32 {
    let t = DateTime::<Utc>::from_timestamp(i64::from(period) * 86_400, 0)
        .expect("period out of range");
    t.year() * 100 + t.month() as i32
}

/// A [`Partitioner`] composing the bucket and period functions with a
/// [`Forward`] and a [`Balance`] step.
#[derive(Debug)]
pub struct KeyTimePartitioner<F, B> {
    forward: F,
    balance: B,
}

impl<F, B> KeyTimePartitioner<F, B>
where
    F: Forward,
    B: Balance,
{
    pub fn new(forward: F, balance: B) -> Self {
        Self { forward, balance }
    }

    fn resolve(
        &self,
        key: Option<&str>,
        pars: Vec<Partition>,
        op: Op,
    ) -> Result<Candidates, PartitionError> {
        // Without a key there is nothing to balance on: a read fans out to
        // all candidates.
        if key.is_none() && op == Op::Read {
            return Ok(Candidates::Many(pars));
        }
        let p = self.balance.balance(&pars, op)?;
        Ok(Candidates::One(p))
    }
}

impl<F, B> Partitioner for KeyTimePartitioner<F, B>
where
    F: Forward,
    B: Balance,
{
    fn partition(
        &self,
        key: Option<&str>,
        time: i64,
        op: Op,
    ) -> Result<Candidates, PartitionError> {
        let b = key.map(bucket);
        let pars = self.forward.forward(b, period(time), op)?;
        self.resolve(key, pars, op)
    }

    fn partition_range(
        &self,
        key: Option<&str>,
        start: i64,
        end: i64,
        op: Op,
    ) -> Result<Vec<Candidates>, PartitionError> {
        let b = key.map(bucket);
        let (lo, hi) = (period(start), period(end));
        let periods: Vec<i32> = if hi >= lo {
            (lo..=hi).collect()
        } else {
            (hi..=lo).rev().collect()
        };

        // Consecutive periods within one month forward identically; keep
        // one candidate group per distinct forwarding.
        let mut groups: Vec<Vec<Partition>> = Vec::new();
        for per in periods {
            let pars = self.forward.forward(b, per, op)?;
            if groups.last() != Some(&pars) {
                groups.push(pars);
            }
        }

        groups
            .into_iter()
            .map(|pars| self.resolve(key, pars, op))
            .collect()
    }
}

/// A partitioner for unpartitioned databases: everything lives in partition
/// `(0, 0)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Singleton;

impl Partitioner for Singleton {
    fn partition(
        &self,
        _key: Option<&str>,
        _time: i64,
        _op: Op,
    ) -> Result<Candidates, PartitionError> {
        Ok(Candidates::One(Partition::new(0, 0)))
    }

    fn partition_range(
        &self,
        _key: Option<&str>,
        _start: i64,
        _end: i64,
        _op: Op,
    ) -> Result<Vec<Candidates>, PartitionError> {
        Ok(vec![Candidates::One(Partition::new(0, 0))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const OCT: i64 = 1_412_640_000_000; // 2014-10-07 UTC
    const NOV: i64 = 1_415_318_400_000; // 2014-11-07 UTC
    const DEC: i64 = 1_417_910_400_000; // 2014-12-07 UTC

    fn partitioner(n: usize) -> KeyTimePartitioner<MonthlyForward, RandomBalance> {
        KeyTimePartitioner::new(MonthlyForward::new(n).unwrap(), RandomBalance::new())
    }

    #[test]
    fn epochs_are_calendar_months() {
        assert_eq!(epoch(period(OCT)), 201410);
        assert_eq!(epoch(period(NOV)), 201411);
        assert_eq!(epoch(period(DEC)), 201412);
    }

    #[test]
    fn partitioning_is_deterministic() {
        let p = partitioner(4);
        for key in ["Hello", "Hey", "Blah", "Awwww"] {
            let first = p.partition(Some(key), NOV, Op::Read).unwrap();
            for _ in 0..100 {
                assert_eq!(p.partition(Some(key), NOV, Op::Read).unwrap(), first);
            }
        }
    }

    #[test]
    fn buckets_are_stable_across_instances() {
        for key in ["Hello", "Hey", "Blah", "Awwww", "org/123/inst/456"] {
            assert_eq!(bucket(key), bucket(key));
            assert!(bucket(key) < BUCKETS);
        }
    }

    #[test]
    fn ranges_resolve_one_partition_per_month() {
        let p = partitioner(4);
        let got = p
            .partition_range(Some("Hey"), OCT, DEC, Op::Read)
            .unwrap();

        let number = bucket("Hey") / 1000;
        assert_eq!(
            got,
            vec![
                Candidates::One(Partition::new(number, 201410)),
                Candidates::One(Partition::new(number, 201411)),
                Candidates::One(Partition::new(number, 201412)),
            ]
        );
    }

    #[test]
    fn descending_ranges_resolve_in_bound_order() {
        let p = partitioner(4);
        let got = p
            .partition_range(Some("Blah"), DEC, OCT, Op::Read)
            .unwrap();

        let number = bucket("Blah") / 1000;
        assert_eq!(
            got,
            vec![
                Candidates::One(Partition::new(number, 201412)),
                Candidates::One(Partition::new(number, 201411)),
                Candidates::One(Partition::new(number, 201410)),
            ]
        );
    }

    #[test]
    fn keyless_reads_fan_out_to_all_partitions() {
        let p = partitioner(4);
        let got = p.partition(None, NOV, Op::Read).unwrap();
        assert_eq!(
            got,
            Candidates::Many(
                (0..4).map(|n| Partition::new(n, 201411)).collect()
            )
        );

        let ranged = p.partition_range(None, OCT, NOV, Op::Read).unwrap();
        assert_eq!(ranged.len(), 2);
        assert_eq!(ranged[0].partitions().len(), 4);
        assert_eq!(ranged[1].partitions().len(), 4);
    }

    #[test]
    fn keyless_writes_are_rejected() {
        let p = partitioner(4);
        assert_eq!(
            p.partition(None, NOV, Op::Write),
            Err(PartitionError::MissingKey)
        );
    }

    #[test]
    fn forwarding_and_balancing_errors_propagate() {
        #[derive(Debug)]
        struct FailingForward;
        impl Forward for FailingForward {
            fn forward(
                &self,
                bucket: Option<u32>,
                period: i32,
                _op: Op,
            ) -> Result<Vec<Partition>, PartitionError> {
                Err(PartitionError::Forward {
                    bucket,
                    period,
                    message: "cannot forward bucket".into(),
                })
            }
        }

        let p = KeyTimePartitioner::new(FailingForward, RandomBalance::new());
        let err = p.partition(Some("Awwww"), NOV, Op::Read).unwrap_err();
        assert!(matches!(err, PartitionError::Forward { .. }));
        let err = p
            .partition_range(Some("Awwww"), OCT, DEC, Op::Read)
            .unwrap_err();
        assert!(matches!(err, PartitionError::Forward { .. }));

        #[derive(Debug)]
        struct FailingBalance;
        impl Balance for FailingBalance {
            fn balance(
                &self,
                candidates: &[Partition],
                _op: Op,
            ) -> Result<Partition, PartitionError> {
                Err(PartitionError::Balance {
                    candidates: candidates.to_vec(),
                    message: "cannot balance".into(),
                })
            }
        }

        let p = KeyTimePartitioner::new(MonthlyForward::new(4).unwrap(), FailingBalance);
        let err = p.partition(Some("Blah"), OCT, Op::Read).unwrap_err();
        assert!(matches!(err, PartitionError::Balance { .. }));
    }

    #[test]
    fn singleton_maps_everything_to_partition_zero() {
        let p = Singleton;
        assert_eq!(
            p.partition(Some("anything"), NOV, Op::Write).unwrap(),
            Candidates::One(Partition::new(0, 0))
        );
        assert_eq!(
            p.partition_range(None, OCT, DEC, Op::Read).unwrap(),
            vec![Candidates::One(Partition::new(0, 0))]
        );
    }

    proptest! {
        #[test]
        fn buckets_stay_in_range(key in ".*") {
            prop_assert!(bucket(&key) < BUCKETS);
        }

        // Sample keys spread over partitions without clustering into one.
        #[test]
        fn keys_spread_over_partitions(seed in 0u32..1000) {
            let mut counts = [0usize; 4];
            for i in 0..100 {
                let b = bucket(&format!("org-{seed}-{i}"));
                counts[(b / 1000) as usize] += 1;
            }
            prop_assert!(counts.iter().all(|&c| c < 100));
        }
    }
}
