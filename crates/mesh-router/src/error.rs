//! Error taxonomy for the router.
//!
//! Four families, matching how errors propagate:
//! - routing errors fail fast before any RPC is issued;
//! - [`RouterError::SchemaStale`] is recovered locally, once, by the retry
//!   combinator in [`crate::retry`];
//! - partition errors carry the identity of the failing partition (and the
//!   offending tuple for batch writes);
//! - validation errors reject malformed input before any RPC.

use mesh_core::{BucketId, PartitionId, Tuple};
use thiserror::Error;

/// Errors reported by a storage partition.
///
/// This is the error surface of [`crate::storage::StorageBackend`]. Variants
/// are tagged so the router can react to the *kind*, never to message text;
/// in particular [`StorageError::is_schema_stale`] drives the single local
/// retry after a schema change.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StorageError {
    /// The router's cached schema version does not match the partition's.
    #[error("schema version mismatch for space `{space}` (sent {sent}, partition has {actual})")]
    SchemaMismatch { space: String, sent: u64, actual: u64 },

    /// The request referenced a field the partition does not know.
    #[error("unknown field `{field}` in space `{space}`")]
    UnknownField { space: String, field: String },

    /// The space does not exist on the partition.
    #[error("space `{space}` does not exist")]
    SpaceNotFound { space: String },

    /// A uniqueness violation on the primary key.
    #[error("duplicate key {key} in space `{space}`")]
    DuplicateKey { space: String, key: String },

    /// The partition is unreachable or refused the request.
    #[error("partition unavailable: {message}")]
    Unavailable { message: String },

    /// No response arrived within the per-call timeout. Indistinguishable
    /// from transport loss.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Any other storage-side failure.
    #[error("storage error: {message}")]
    Other { message: String },
}

impl StorageError {
    /// True when the error indicates the router's cached schema is stale
    /// relative to the partition (schema-version mismatch or a field the
    /// partition no longer recognizes).
    pub fn is_schema_stale(&self) -> bool {
        matches!(
            self,
            StorageError::SchemaMismatch { .. } | StorageError::UnknownField { .. }
        )
    }
}

/// Errors returned by router operations.
#[derive(Debug, Clone, Error)]
pub enum RouterError {
    /// The cluster metadata has no such space.
    #[error("space `{space}` is unknown to the cluster")]
    UnknownSpace { space: String },

    /// A caller-supplied bucket id disagrees with the id already embedded
    /// in the tuple. Never silently overridden.
    #[error("bucket id {requested} conflicts with bucket id {embedded} already present in the tuple")]
    BucketIdConflict {
        requested: BucketId,
        embedded: BucketId,
    },

    /// The space schema does not designate a bucket field.
    #[error("space `{space}` has no bucket field `{field}` in its schema")]
    BucketFieldMissing { space: String, field: String },

    /// No partition owns the computed bucket.
    #[error("no partition owns bucket {bucket}")]
    UnroutableBucket { bucket: BucketId },

    /// Fetching sharding metadata from the cluster failed.
    #[error("failed to fetch sharding metadata: {message}")]
    MetadataFetch { message: String },

    /// The router's process-local schema cache for this space is stale.
    /// Recovered once by the retry combinator; surfaced on the second
    /// occurrence.
    #[error("cached schema for space `{space}` is stale")]
    SchemaStale { space: String },

    /// One partition's RPC failed (timeout, transport, or application).
    #[error("partition {partition} failed: {source}")]
    Partition {
        partition: PartitionId,
        #[source]
        source: StorageError,
    },

    /// Malformed conditions, operations or options; rejected before any RPC.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The whole operation exceeded its deadline.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

impl RouterError {
    /// True when recovery is a schema-cache invalidation plus one retry.
    pub fn is_schema_stale(&self) -> bool {
        match self {
            RouterError::SchemaStale { .. } => true,
            RouterError::Partition { source, .. } => source.is_schema_stale(),
            _ => false,
        }
    }

    /// Wraps a storage error with the partition that produced it.
    pub fn from_partition(partition: PartitionId, source: StorageError) -> Self {
        RouterError::Partition { partition, source }
    }
}

/// One failed partition of a batch write: the error plus the sub-batch tuple
/// the partition stopped at. At most one entry per partition per call.
#[derive(Debug, Clone, Error)]
#[error("partition {partition}: {source}")]
pub struct PartitionWriteError {
    /// The partition that reported the failure.
    pub partition: PartitionId,
    /// The storage error it reported.
    #[source]
    pub source: StorageError,
    /// The tuple the partition failed on, when the failure is tied to one.
    pub tuple: Option<Tuple>,
}

/// Outcome of a batch write: the union of rows every partition applied,
/// plus the per-partition error list. The error list is always present in
/// the contract, possibly empty.
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Successfully applied rows across all partitions. No cross-partition
    /// order guarantee.
    pub rows: Vec<Tuple>,
    /// One entry per failed partition.
    pub errors: Vec<PartitionWriteError>,
}

impl BatchResult {
    /// True when every partition applied its full sub-batch.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}
