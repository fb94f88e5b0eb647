//! Production forwarding and balancing steps.

use rand::seq::SliceRandom;

use crate::{epoch, Balance, Forward, Op, Partition, PartitionError, BUCKETS};

/// Forwards buckets to `N` partitions with one epoch per calendar month.
///
/// Each partition owns a contiguous span of `BUCKETS / N` buckets. `N` must
/// evenly divide the bucket space; anything else is rejected at construction
/// so a misconfigured deployment fails at startup instead of silently
/// truncating sharding.
#[derive(Debug, Clone, Copy)]
pub struct MonthlyForward {
    partitions: u32,
    span: u32,
}

impl MonthlyForward {
    pub fn new(partitions: usize) -> Result<Self, PartitionError> {
        let n = u32::try_from(partitions)
            .ok()
            .filter(|&n| n > 0 && n <= BUCKETS && BUCKETS % n == 0)
            .ok_or(PartitionError::UnevenPartitions { n: partitions })?;
        Ok(Self {
            partitions: n,
            span: BUCKETS / n,
        })
    }

    /// The configured partition count.
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    /// The partition number owning the given bucket.
    pub fn partition_number(&self, bucket: u32) -> u32 {
        bucket / self.span
    }
}

impl Forward for MonthlyForward {
    fn forward(
        &self,
        bucket: Option<u32>,
        period: i32,
        op: Op,
    ) -> Result<Vec<Partition>, PartitionError> {
        let epoch = epoch(period);
        match bucket {
            Some(b) => Ok(vec![Partition::new(self.partition_number(b), epoch)]),
            // An unknown key forwards a read to every partition of the
            // epoch; a write has nowhere sound to go.
            None if op == Op::Read => Ok((0..self.partitions)
                .map(|n| Partition::new(n, epoch))
                .collect()),
            None => Err(PartitionError::MissingKey),
        }
    }
}

/// Picks a uniformly random candidate, spreading reads across replicas.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomBalance;

impl RandomBalance {
    pub fn new() -> Self {
        Self
    }
}

impl Balance for RandomBalance {
    fn balance(&self, candidates: &[Partition], _op: Op) -> Result<Partition, PartitionError> {
        candidates
            .choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| PartitionError::Balance {
                candidates: Vec::new(),
                message: "no partition candidates".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn rejects_partition_counts_that_do_not_divide_evenly() {
        for n in [0, 3, 7, 1001, 4001] {
            assert_eq!(
                MonthlyForward::new(n).unwrap_err(),
                PartitionError::UnevenPartitions { n }
            );
        }
        for n in [1, 2, 4, 5, 8, 10, 1000, 2000, 4000] {
            assert!(MonthlyForward::new(n).is_ok());
        }
    }

    #[test]
    fn every_bucket_maps_to_exactly_one_partition() {
        for n in [1usize, 2, 4, 8, 40, 4000] {
            let fwd = MonthlyForward::new(n).unwrap();
            let mut counts = vec![0usize; n];
            for b in 0..BUCKETS {
                let number = fwd.partition_number(b);
                assert!(number < n as u32, "bucket {b} escaped to {number}");
                counts[number as usize] += 1;
            }
            assert!(counts.iter().all(|&c| c == (BUCKETS as usize) / n));
        }
    }

    #[test]
    fn bucket_boundaries_land_on_partition_edges() {
        let fwd = MonthlyForward::new(4).unwrap();
        let got: Vec<u32> = [0u32, 1000, 2000, 3999]
            .iter()
            .map(|&b| fwd.partition_number(b))
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3]);
    }

    #[test]
    fn random_balance_stays_within_candidates() {
        let candidates = [
            Partition::new(0, 201411),
            Partition::new(1, 201411),
            Partition::new(2, 201411),
        ];
        let balance = RandomBalance::new();
        for _ in 0..100 {
            let p = balance.balance(&candidates, Op::Read).unwrap();
            assert!(candidates.contains(&p));
        }
    }

    #[test]
    fn balancing_an_empty_candidate_set_fails() {
        let balance = RandomBalance::new();
        assert!(matches!(
            balance.balance(&[], Op::Read),
            Err(PartitionError::Balance { .. })
        ));
    }
}
