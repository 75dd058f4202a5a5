//! The per-partition storage surface the router consumes.
//!
//! The storage engine itself is an external collaborator: single-node
//! insert/update/delete/scan, locally atomic and order-preserving. The
//! router only depends on this trait; [`crate::memory::MemoryCluster`]
//! provides an in-process implementation for tests and embedding.
//!
//! Every call carries an explicit timeout. An absent response within the
//! timeout is a timeout error, indistinguishable from transport loss.

use crate::error::StorageError;
use crate::schema::SpaceSchema;
use crate::sharding::ShardingMetadata;
use async_trait::async_trait;
use mesh_core::{Condition, PartitionId, Tuple, UpdateOp, Value};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Scan direction over an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Ascending index-key order.
    Asc,
    /// Descending index-key order.
    Desc,
}

impl Direction {
    /// Returns the opposite direction.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Asc => Direction::Desc,
            Direction::Desc => Direction::Asc,
        }
    }
}

/// Name of the implicit primary index of every space.
pub const PRIMARY_INDEX: &str = "primary";

/// One bounded scan request against a single partition.
///
/// The partition returns tuples matching `conditions`, sorted by the sort
/// key of `index` (the index key extended by the primary key), starting
/// strictly past `after` in scan direction, at most `limit` of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectQuery {
    /// Index to scan: [`PRIMARY_INDEX`] or a secondary index name.
    pub index: String,
    /// Scan direction.
    pub direction: Direction,
    /// Exclusive resume bound: a full sort key (index key ++ primary key).
    pub after: Option<Vec<Value>>,
    /// Filter predicates, applied by the partition.
    pub conditions: Vec<Condition>,
    /// Maximum number of tuples to return in this round.
    pub limit: u32,
}

/// Per-call context shared by data operations.
#[derive(Debug, Clone, Copy)]
pub struct StorageOpts {
    /// The schema version the router planned the call against. Partitions
    /// reject mismatches with [`StorageError::SchemaMismatch`].
    pub schema_version: u64,
    /// Per-call deadline.
    pub timeout: Duration,
}

/// The tuple a batch sub-transaction stopped at, with the error it hit.
#[derive(Debug, Clone)]
pub struct BatchFailure {
    /// The storage error reported for the failing tuple.
    pub error: StorageError,
    /// The first tuple of the sub-batch that was not applied.
    pub tuple: Tuple,
}

/// Result of one per-partition batch sub-transaction.
///
/// The sub-batch is applied in submitted order as one local transaction
/// with atomic-prefix semantics: on the first failing tuple, everything
/// applied before it stays committed, the failing tuple and everything
/// after it are not applied, and `failure` reports the failing tuple.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    /// Tuples applied before the failure point (all of them on success).
    pub applied: Vec<Tuple>,
    /// The failure that stopped the sub-batch, if any.
    pub failure: Option<BatchFailure>,
}

/// RPC surface of one storage partition.
///
/// Implementations suspend the calling task for the round trip. Methods
/// that mutate return the stored tuple (with the bucket id slot filled)
/// so callers can surface exactly what was written.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetches the schema of a space from cluster metadata.
    async fn fetch_schema(
        &self,
        space: &str,
        timeout: Duration,
    ) -> Result<SpaceSchema, StorageError>;

    /// Fetches the sharding metadata map for all spaces.
    ///
    /// This is the expensive cluster-metadata round trip that
    /// [`crate::sharding::ShardingCache`] single-flights.
    async fn fetch_sharding_metadata(
        &self,
        timeout: Duration,
    ) -> Result<ShardingMetadata, StorageError>;

    /// Inserts a tuple. Fails with [`StorageError::DuplicateKey`] if the
    /// primary key already exists.
    async fn insert(
        &self,
        partition: PartitionId,
        space: &str,
        tuple: Tuple,
        opts: &StorageOpts,
    ) -> Result<Tuple, StorageError>;

    /// Inserts or fully replaces a tuple by primary key.
    async fn replace(
        &self,
        partition: PartitionId,
        space: &str,
        tuple: Tuple,
        opts: &StorageOpts,
    ) -> Result<Tuple, StorageError>;

    /// Applies update operations to the tuple with the given primary key.
    /// Returns the updated tuple, or `None` if no such tuple exists.
    async fn update(
        &self,
        partition: PartitionId,
        space: &str,
        key: Vec<Value>,
        ops: Vec<UpdateOp>,
        opts: &StorageOpts,
    ) -> Result<Option<Tuple>, StorageError>;

    /// Inserts the tuple if its primary key is absent, otherwise applies
    /// the update operations to the existing tuple.
    async fn upsert(
        &self,
        partition: PartitionId,
        space: &str,
        tuple: Tuple,
        ops: Vec<UpdateOp>,
        opts: &StorageOpts,
    ) -> Result<(), StorageError>;

    /// Deletes by primary key. Returns the deleted tuple, or `None` if no
    /// such tuple existed.
    async fn delete(
        &self,
        partition: PartitionId,
        space: &str,
        key: Vec<Value>,
        opts: &StorageOpts,
    ) -> Result<Option<Tuple>, StorageError>;

    /// Applies a sub-batch of inserts as one local atomic transaction with
    /// atomic-prefix semantics.
    async fn batch_insert(
        &self,
        partition: PartitionId,
        space: &str,
        tuples: Vec<Tuple>,
        opts: &StorageOpts,
    ) -> Result<BatchOutcome, StorageError>;

    /// Applies a sub-batch of upserts as one local atomic transaction with
    /// atomic-prefix semantics. `operations[i]` belongs to `tuples[i]`.
    async fn batch_upsert(
        &self,
        partition: PartitionId,
        space: &str,
        tuples: Vec<Tuple>,
        operations: Vec<Vec<UpdateOp>>,
        opts: &StorageOpts,
    ) -> Result<BatchOutcome, StorageError>;

    /// Runs one bounded, locally sorted scan round.
    async fn select(
        &self,
        partition: PartitionId,
        space: &str,
        query: &SelectQuery,
        opts: &StorageOpts,
    ) -> Result<Vec<Tuple>, StorageError>;

    /// Returns the number of tuples the partition holds for a space.
    async fn space_len(
        &self,
        partition: PartitionId,
        space: &str,
        opts: &StorageOpts,
    ) -> Result<u64, StorageError>;

    /// Removes every tuple the partition holds for a space.
    async fn truncate_space(
        &self,
        partition: PartitionId,
        space: &str,
        opts: &StorageOpts,
    ) -> Result<(), StorageError>;
}
