//! Batch write execution with per-partition atomicity.
//!
//! A batch is split by target partition; each partition receives its
//! sub-batch as one local atomic transaction, all partitions in parallel.
//! Cross-partition atomicity is explicitly not provided: one partition
//! failing or timing out neither blocks nor cancels the others, and the
//! caller receives every applied row together with one error entry per
//! failed partition.

use crate::bucket::BucketRouter;
use crate::error::{BatchResult, PartitionWriteError, RouterError, StorageError};
use crate::schema::SpaceSchema;
use crate::sharding::SpaceSharding;
use crate::storage::{BatchOutcome, StorageBackend, StorageOpts};
use crate::topology::PartitionMap;
use futures::future::join_all;
use mesh_core::{BucketId, PartitionId, Tuple, UpdateOp};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One partition's share of a batch: tuples in submitted order, with the
/// upsert operations riding along when present.
#[derive(Debug, Default)]
struct SubBatch {
    tuples: Vec<Tuple>,
    operations: Vec<Vec<UpdateOp>>,
}

/// Resolves every tuple's bucket and groups the batch by target partition.
///
/// Any resolution error aborts the whole call here, before a single RPC
/// is issued. Groups iterate in partition-id order for determinism.
fn group_by_partition(
    bucket_router: &BucketRouter,
    partitions: &dyn PartitionMap,
    schema: &SpaceSchema,
    sharding: Option<&SpaceSharding>,
    tuples: Vec<Tuple>,
    operations: Option<Vec<Vec<UpdateOp>>>,
    bucket_id: Option<BucketId>,
) -> Result<BTreeMap<PartitionId, SubBatch>, RouterError> {
    if let Some(ops) = &operations {
        if ops.len() != tuples.len() {
            return Err(RouterError::Validation(format!(
                "batch has {} tuples but {} operation lists",
                tuples.len(),
                ops.len()
            )));
        }
    }

    let mut groups: BTreeMap<PartitionId, SubBatch> = BTreeMap::new();
    let mut operations = operations.map(|ops| ops.into_iter());

    for mut tuple in tuples {
        let bucket = bucket_router.bucket_for_tuple(&mut tuple, schema, sharding, bucket_id)?;
        let partition = partitions
            .partition_for_bucket(bucket)
            .ok_or(RouterError::UnroutableBucket { bucket })?;
        let group = groups.entry(partition).or_default();
        group.tuples.push(tuple);
        if let Some(ops) = &mut operations {
            // Length equality was checked above.
            if let Some(op) = ops.next() {
                group.operations.push(op);
            }
        }
    }
    Ok(groups)
}

/// What one partition reported for its sub-batch.
type PartitionOutcome = (PartitionId, Result<BatchOutcome, StorageError>);

/// Folds per-partition outcomes into the aggregate batch result.
///
/// Rows are the union of every partition's applied prefix; errors carry at
/// most one entry per partition. When every outcome is a stale-schema
/// rejection and nothing was applied anywhere, the whole batch is safe to
/// re-plan, so a retryable error is returned instead of a partial result.
fn collect_outcomes(outcomes: Vec<PartitionOutcome>) -> Result<BatchResult, RouterError> {
    let mut result = BatchResult::default();

    for (partition, outcome) in outcomes {
        match outcome {
            Ok(BatchOutcome { applied, failure }) => {
                result.rows.extend(applied);
                if let Some(failure) = failure {
                    result.errors.push(PartitionWriteError {
                        partition,
                        source: failure.error,
                        tuple: Some(failure.tuple),
                    });
                }
            }
            Err(e) => result.errors.push(PartitionWriteError {
                partition,
                source: e,
                tuple: None,
            }),
        }
    }

    let all_stale = !result.errors.is_empty()
        && result.errors.iter().all(|e| e.source.is_schema_stale());
    if all_stale && result.rows.is_empty() {
        let first = result.errors.remove(0);
        return Err(RouterError::from_partition(first.partition, first.source));
    }

    Ok(result)
}

/// Executes a batch insert: one atomic sub-batch per partition, in
/// parallel.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute_batch_insert<B: StorageBackend>(
    backend: &Arc<B>,
    partitions: &dyn PartitionMap,
    bucket_router: &BucketRouter,
    schema: &SpaceSchema,
    sharding: Option<&SpaceSharding>,
    tuples: Vec<Tuple>,
    bucket_id: Option<BucketId>,
    storage_opts: StorageOpts,
) -> Result<BatchResult, RouterError> {
    let groups = group_by_partition(
        bucket_router,
        partitions,
        schema,
        sharding,
        tuples,
        None,
        bucket_id,
    )?;
    dispatch(backend, &schema.name, groups, storage_opts, false).await
}

/// Executes a batch upsert; `operations[i]` belongs to `tuples[i]`.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute_batch_upsert<B: StorageBackend>(
    backend: &Arc<B>,
    partitions: &dyn PartitionMap,
    bucket_router: &BucketRouter,
    schema: &SpaceSchema,
    sharding: Option<&SpaceSharding>,
    tuples: Vec<Tuple>,
    operations: Vec<Vec<UpdateOp>>,
    bucket_id: Option<BucketId>,
    storage_opts: StorageOpts,
) -> Result<BatchResult, RouterError> {
    let groups = group_by_partition(
        bucket_router,
        partitions,
        schema,
        sharding,
        tuples,
        Some(operations),
        bucket_id,
    )?;
    dispatch(backend, &schema.name, groups, storage_opts, true).await
}

/// Issues one RPC per partition without serial waiting and joins them all.
async fn dispatch<B: StorageBackend>(
    backend: &Arc<B>,
    space: &str,
    groups: BTreeMap<PartitionId, SubBatch>,
    storage_opts: StorageOpts,
    upsert: bool,
) -> Result<BatchResult, RouterError> {
    let calls = groups
        .into_iter()
        .map(|(partition, sub_batch)| {
            let backend = Arc::clone(backend);
            let space = space.to_string();
            async move {
                let sent = tokio::time::timeout(storage_opts.timeout, async {
                    if upsert {
                        backend
                            .batch_upsert(
                                partition,
                                &space,
                                sub_batch.tuples,
                                sub_batch.operations,
                                &storage_opts,
                            )
                            .await
                    } else {
                        backend
                            .batch_insert(partition, &space, sub_batch.tuples, &storage_opts)
                            .await
                    }
                })
                .await;
                let outcome = match sent {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StorageError::Timeout {
                        timeout_ms: timeout_ms(storage_opts.timeout),
                    }),
                };
                (partition, outcome)
            }
        })
        .collect::<Vec<_>>();

    collect_outcomes(join_all(calls).await)
}

fn timeout_ms(timeout: Duration) -> u64 {
    timeout.as_millis() as u64
}

// =============================================================================
// Tests
// =============================================================================
