//! The partition map: which partition owns which bucket.
//!
//! Membership and rebalancing are external concerns; the router only
//! consumes a resolved view of the bucket-to-partition assignment.

use mesh_core::{BucketId, PartitionId};

/// Resolved view of the cluster's bucket assignment.
pub trait PartitionMap: Send + Sync {
    /// Size of the virtual bucket space.
    fn bucket_count(&self) -> u32;

    /// Returns the partition owning a bucket, if the bucket is assigned.
    fn partition_for_bucket(&self, bucket: BucketId) -> Option<PartitionId>;

    /// All partitions of the cluster, in stable order.
    fn all_partitions(&self) -> Vec<PartitionId>;
}

/// A fixed assignment: bucket `b` belongs to partition `b mod n`.
///
/// Useful for embedding and tests; production deployments plug in a view
/// backed by the cluster's membership service.
#[derive(Debug, Clone)]
pub struct StaticPartitionMap {
    partitions: Vec<PartitionId>,
    bucket_count: u32,
}

impl StaticPartitionMap {
    /// Creates a map over the given partitions.
    pub fn new(partitions: Vec<PartitionId>, bucket_count: u32) -> Self {
        assert!(!partitions.is_empty(), "partition map cannot be empty");
        assert!(bucket_count > 0, "bucket count must be > 0");
        Self {
            partitions,
            bucket_count,
        }
    }

    /// Creates a map of `n` partitions numbered from zero.
    pub fn with_partitions(n: u32, bucket_count: u32) -> Self {
        Self::new((0..n).map(PartitionId::new).collect(), bucket_count)
    }
}

impl PartitionMap for StaticPartitionMap {
    fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    fn partition_for_bucket(&self, bucket: BucketId) -> Option<PartitionId> {
        if bucket.as_u32() >= self.bucket_count {
            return None;
        }
        let idx = bucket.as_u32() as usize % self.partitions.len();
        Some(self.partitions[idx])
    }

    fn all_partitions(&self) -> Vec<PartitionId> {
        self.partitions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_map_routes_all_buckets() {
        let map = StaticPartitionMap::with_partitions(3, 30);
        for b in 0..30 {
            let p = map.partition_for_bucket(BucketId::new(b)).unwrap();
            assert!(p.as_u32() < 3);
        }
        assert!(map.partition_for_bucket(BucketId::new(30)).is_none());
    }

    #[test]
    fn test_static_map_is_stable() {
        let map = StaticPartitionMap::with_partitions(4, 256);
        let a = map.partition_for_bucket(BucketId::new(17));
        let b = map.partition_for_bucket(BucketId::new(17));
        assert_eq!(a, b);
        assert_eq!(map.all_partitions().len(), 4);
    }
}
