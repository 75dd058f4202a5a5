//! In-process cluster for embedding and tests, without a network.
//!
//! `MemoryCluster` implements both the storage surface and the partition
//! map over per-partition in-memory tables, with the same contracts a
//! real cluster gives the router: locally sorted bounded scans,
//! atomic-prefix batch transactions, schema-version checking, and a
//! metadata endpoint with an optional artificial delay for exercising the
//! single-flight path.

use crate::error::StorageError;
use crate::schema::SpaceSchema;
use crate::sharding::{ShardingMetadata, SpaceSharding};
use crate::storage::{
    BatchFailure, BatchOutcome, Direction, SelectQuery, StorageBackend, StorageOpts,
    PRIMARY_INDEX,
};
use crate::topology::PartitionMap;
use async_trait::async_trait;
use mesh_core::{compare_keys, BucketId, PartitionId, Tuple, UpdateOp, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct SpaceState {
    schema: SpaceSchema,
    rows: HashMap<PartitionId, Vec<Tuple>>,
}

/// An in-process, partitioned tuple store.
///
/// Shared freely behind an `Arc`; every method takes `&self`.
#[derive(Debug)]
pub struct MemoryCluster {
    partitions: Vec<PartitionId>,
    bucket_count: u32,
    spaces: Mutex<HashMap<String, SpaceState>>,
    sharding: Mutex<ShardingMetadata>,
    metadata_fetches: AtomicU64,
    schema_fetches: AtomicU64,
    metadata_delay: Mutex<Duration>,
    metadata_failures: AtomicU32,
}

impl MemoryCluster {
    /// Creates a cluster of `num_partitions` partitions over a bucket
    /// space of `bucket_count`.
    pub fn new(num_partitions: u32, bucket_count: u32) -> Self {
        assert!(num_partitions > 0, "need at least one partition");
        Self {
            partitions: (0..num_partitions).map(PartitionId::new).collect(),
            bucket_count,
            spaces: Mutex::new(HashMap::new()),
            sharding: Mutex::new(ShardingMetadata::default()),
            metadata_fetches: AtomicU64::new(0),
            schema_fetches: AtomicU64::new(0),
            metadata_delay: Mutex::new(Duration::ZERO),
            metadata_failures: AtomicU32::new(0),
        }
    }

    /// Registers a space.
    pub fn add_space(&self, schema: SpaceSchema) {
        let mut spaces = self.spaces.lock().unwrap();
        let rows = self.partitions.iter().map(|p| (*p, Vec::new())).collect();
        spaces.insert(schema.name.clone(), SpaceState { schema, rows });
    }

    /// Declares custom sharding for a space.
    pub fn set_sharding(&self, space: &str, sharding: SpaceSharding) {
        self.sharding
            .lock()
            .unwrap()
            .spaces
            .insert(space.to_string(), sharding);
    }

    /// Bumps a space's schema version, simulating a schema change the
    /// router has not observed yet.
    pub fn bump_schema_version(&self, space: &str) {
        if let Some(state) = self.spaces.lock().unwrap().get_mut(space) {
            state.schema.version += 1;
        }
    }

    /// Sets an artificial delay on metadata fetches.
    pub fn set_metadata_delay(&self, delay: Duration) {
        *self.metadata_delay.lock().unwrap() = delay;
    }

    /// Makes the next `n` metadata fetches fail.
    pub fn fail_metadata_fetches(&self, n: u32) {
        self.metadata_failures.store(n, AtomicOrdering::SeqCst);
    }

    /// Number of sharding-metadata round trips served.
    pub fn metadata_fetches(&self) -> u64 {
        self.metadata_fetches.load(AtomicOrdering::SeqCst)
    }

    /// Number of schema fetches served.
    pub fn schema_fetches(&self) -> u64 {
        self.schema_fetches.load(AtomicOrdering::SeqCst)
    }

    /// Total rows of a space across all partitions.
    pub fn total_rows(&self, space: &str) -> usize {
        self.spaces
            .lock()
            .unwrap()
            .get(space)
            .map(|s| s.rows.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Rows a single partition holds for a space.
    pub fn partition_rows(&self, space: &str, partition: PartitionId) -> usize {
        self.spaces
            .lock()
            .unwrap()
            .get(space)
            .and_then(|s| s.rows.get(&partition))
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn check_version(state: &SpaceState, opts: &StorageOpts) -> Result<(), StorageError> {
        if opts.schema_version != state.schema.version {
            return Err(StorageError::SchemaMismatch {
                space: state.schema.name.clone(),
                sent: opts.schema_version,
                actual: state.schema.version,
            });
        }
        Ok(())
    }

    fn pk_positions(state: &SpaceState) -> Result<Vec<usize>, StorageError> {
        field_positions(&state.schema, &state.schema.primary_key)
    }

    fn find_row(rows: &[Tuple], pk_positions: &[usize], key: &[Value]) -> Option<usize> {
        rows.iter().position(|row| {
            let row_key: Vec<Value> = pk_positions
                .iter()
                .map(|&p| row.get(p).cloned().unwrap_or(Value::Null))
                .collect();
            compare_keys(&row_key, key) == Ordering::Equal && row_key.len() == key.len()
        })
    }

    fn insert_one(
        state: &mut SpaceState,
        partition: PartitionId,
        tuple: Tuple,
    ) -> Result<Tuple, StorageError> {
        let pk_positions = Self::pk_positions(state)?;
        let key: Vec<Value> = pk_positions
            .iter()
            .map(|&p| tuple.get(p).cloned().unwrap_or(Value::Null))
            .collect();

        // The primary key is unique across the whole space, not just the
        // target partition.
        for rows in state.rows.values() {
            if Self::find_row(rows, &pk_positions, &key).is_some() {
                return Err(StorageError::DuplicateKey {
                    space: state.schema.name.clone(),
                    key: format_key(&key),
                });
            }
        }

        let rows = state.rows.entry(partition).or_default();
        rows.push(tuple.clone());
        Ok(tuple)
    }

    fn apply_ops(
        state: &SpaceState,
        tuple: &mut Tuple,
        ops: &[UpdateOp],
    ) -> Result<(), StorageError> {
        for op in ops {
            let position = state.schema.field_position(op.field()).ok_or_else(|| {
                StorageError::UnknownField {
                    space: state.schema.name.clone(),
                    field: op.field().to_string(),
                }
            })?;
            op.apply(tuple, position)
                .map_err(|e| StorageError::Other {
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

fn field_positions(schema: &SpaceSchema, fields: &[String]) -> Result<Vec<usize>, StorageError> {
    fields
        .iter()
        .map(|f| {
            schema
                .field_position(f)
                .ok_or_else(|| StorageError::UnknownField {
                    space: schema.name.clone(),
                    field: f.clone(),
                })
        })
        .collect()
}

fn format_key(key: &[Value]) -> String {
    let parts: Vec<String> = key.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

fn sort_key_of(tuple: &Tuple, positions: &[usize]) -> Vec<Value> {
    positions
        .iter()
        .map(|&p| tuple.get(p).cloned().unwrap_or(Value::Null))
        .collect()
}

#[async_trait]
impl StorageBackend for MemoryCluster {
    async fn fetch_schema(
        &self,
        space: &str,
        _timeout: Duration,
    ) -> Result<SpaceSchema, StorageError> {
        self.schema_fetches.fetch_add(1, AtomicOrdering::SeqCst);
        let spaces = self.spaces.lock().unwrap();
        spaces
            .get(space)
            .map(|s| s.schema.clone())
            .ok_or_else(|| StorageError::SpaceNotFound {
                space: space.to_string(),
            })
    }

    async fn fetch_sharding_metadata(
        &self,
        _timeout: Duration,
    ) -> Result<ShardingMetadata, StorageError> {
        let delay = *self.metadata_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.metadata_fetches.fetch_add(1, AtomicOrdering::SeqCst);

        let failures = self.metadata_failures.load(AtomicOrdering::SeqCst);
        if failures > 0 {
            self.metadata_failures
                .store(failures - 1, AtomicOrdering::SeqCst);
            return Err(StorageError::Unavailable {
                message: "metadata endpoint is down".into(),
            });
        }
        Ok(self.sharding.lock().unwrap().clone())
    }

    async fn insert(
        &self,
        partition: PartitionId,
        space: &str,
        tuple: Tuple,
        opts: &StorageOpts,
    ) -> Result<Tuple, StorageError> {
        let mut spaces = self.spaces.lock().unwrap();
        let state = lookup_mut(&mut spaces, space)?;
        Self::check_version(state, opts)?;
        Self::insert_one(state, partition, tuple)
    }

    async fn replace(
        &self,
        partition: PartitionId,
        space: &str,
        tuple: Tuple,
        opts: &StorageOpts,
    ) -> Result<Tuple, StorageError> {
        let mut spaces = self.spaces.lock().unwrap();
        let state = lookup_mut(&mut spaces, space)?;
        Self::check_version(state, opts)?;

        let pk_positions = Self::pk_positions(state)?;
        let key = sort_key_of(&tuple, &pk_positions);
        for rows in state.rows.values_mut() {
            if let Some(i) = Self::find_row(rows, &pk_positions, &key) {
                rows.remove(i);
                break;
            }
        }
        let rows = state.rows.entry(partition).or_default();
        rows.push(tuple.clone());
        Ok(tuple)
    }

    async fn update(
        &self,
        partition: PartitionId,
        space: &str,
        key: Vec<Value>,
        ops: Vec<UpdateOp>,
        opts: &StorageOpts,
    ) -> Result<Option<Tuple>, StorageError> {
        let mut spaces = self.spaces.lock().unwrap();
        let state = lookup_mut(&mut spaces, space)?;
        Self::check_version(state, opts)?;

        let pk_positions = Self::pk_positions(state)?;
        let index = {
            let rows = state.rows.entry(partition).or_default();
            Self::find_row(rows, &pk_positions, &key)
        };
        match index {
            None => Ok(None),
            Some(i) => {
                let mut updated = state.rows[&partition][i].clone();
                Self::apply_ops(state, &mut updated, &ops)?;
                let rows = state.rows.entry(partition).or_default();
                rows[i] = updated.clone();
                Ok(Some(updated))
            }
        }
    }

    async fn upsert(
        &self,
        partition: PartitionId,
        space: &str,
        tuple: Tuple,
        ops: Vec<UpdateOp>,
        opts: &StorageOpts,
    ) -> Result<(), StorageError> {
        let mut spaces = self.spaces.lock().unwrap();
        let state = lookup_mut(&mut spaces, space)?;
        Self::check_version(state, opts)?;

        let pk_positions = Self::pk_positions(state)?;
        let key = sort_key_of(&tuple, &pk_positions);
        let index = {
            let rows = state.rows.entry(partition).or_default();
            Self::find_row(rows, &pk_positions, &key)
        };
        match index {
            None => {
                Self::insert_one(state, partition, tuple)?;
            }
            Some(i) => {
                let mut updated = state.rows[&partition][i].clone();
                Self::apply_ops(state, &mut updated, &ops)?;
                let rows = state.rows.entry(partition).or_default();
                rows[i] = updated;
            }
        }
        Ok(())
    }

    async fn delete(
        &self,
        partition: PartitionId,
        space: &str,
        key: Vec<Value>,
        opts: &StorageOpts,
    ) -> Result<Option<Tuple>, StorageError> {
        let mut spaces = self.spaces.lock().unwrap();
        let state = lookup_mut(&mut spaces, space)?;
        Self::check_version(state, opts)?;

        let pk_positions = Self::pk_positions(state)?;
        let rows = state.rows.entry(partition).or_default();
        match Self::find_row(rows, &pk_positions, &key) {
            None => Ok(None),
            Some(i) => Ok(Some(rows.remove(i))),
        }
    }

    async fn batch_insert(
        &self,
        partition: PartitionId,
        space: &str,
        tuples: Vec<Tuple>,
        opts: &StorageOpts,
    ) -> Result<BatchOutcome, StorageError> {
        let mut spaces = self.spaces.lock().unwrap();
        let state = lookup_mut(&mut spaces, space)?;
        Self::check_version(state, opts)?;

        let mut outcome = BatchOutcome::default();
        for tuple in tuples {
            match Self::insert_one(state, partition, tuple.clone()) {
                Ok(row) => outcome.applied.push(row),
                Err(e) => {
                    // Atomic prefix: everything before the failure stays,
                    // the failing tuple and the rest are not applied.
                    outcome.failure = Some(BatchFailure { error: e, tuple });
                    break;
                }
            }
        }
        Ok(outcome)
    }

    async fn batch_upsert(
        &self,
        partition: PartitionId,
        space: &str,
        tuples: Vec<Tuple>,
        operations: Vec<Vec<UpdateOp>>,
        opts: &StorageOpts,
    ) -> Result<BatchOutcome, StorageError> {
        let mut spaces = self.spaces.lock().unwrap();
        let state = lookup_mut(&mut spaces, space)?;
        Self::check_version(state, opts)?;

        let pk_positions = Self::pk_positions(state)?;
        let mut outcome = BatchOutcome::default();
        for (tuple, ops) in tuples.into_iter().zip(operations.into_iter()) {
            let key = sort_key_of(&tuple, &pk_positions);
            let index = {
                let rows = state.rows.entry(partition).or_default();
                Self::find_row(rows, &pk_positions, &key)
            };
            let applied = match index {
                None => Self::insert_one(state, partition, tuple.clone()).map(Some),
                Some(i) => {
                    let mut updated = state.rows[&partition][i].clone();
                    match Self::apply_ops(state, &mut updated, &ops) {
                        Ok(()) => {
                            let rows = state.rows.entry(partition).or_default();
                            rows[i] = updated.clone();
                            Ok(Some(updated))
                        }
                        Err(e) => Err(e),
                    }
                }
            };
            match applied {
                Ok(Some(row)) => outcome.applied.push(row),
                Ok(None) => {}
                Err(e) => {
                    outcome.failure = Some(BatchFailure { error: e, tuple });
                    break;
                }
            }
        }
        Ok(outcome)
    }

    async fn select(
        &self,
        partition: PartitionId,
        space: &str,
        query: &SelectQuery,
        opts: &StorageOpts,
    ) -> Result<Vec<Tuple>, StorageError> {
        let spaces = self.spaces.lock().unwrap();
        let state = spaces
            .get(space)
            .ok_or_else(|| StorageError::SpaceNotFound {
                space: space.to_string(),
            })?;
        Self::check_version(state, opts)?;
        let schema = &state.schema;

        // Resolve the scan order: index key extended by the primary key.
        let index_fields: Vec<String> = if query.index == PRIMARY_INDEX {
            schema.primary_key.clone()
        } else {
            schema
                .indexes
                .iter()
                .find(|i| i.name == query.index)
                .map(|i| i.fields.clone())
                .ok_or_else(|| StorageError::UnknownField {
                    space: schema.name.clone(),
                    field: query.index.clone(),
                })?
        };
        let mut sort_fields = index_fields;
        for pk in &schema.primary_key {
            if !sort_fields.contains(pk) {
                sort_fields.push(pk.clone());
            }
        }
        let sort_positions = field_positions(schema, &sort_fields)?;

        let filters: Vec<(usize, &mesh_core::Condition)> = query
            .conditions
            .iter()
            .map(|c| {
                schema
                    .field_position(&c.field)
                    .map(|p| (p, c))
                    .ok_or_else(|| StorageError::UnknownField {
                        space: schema.name.clone(),
                        field: c.field.clone(),
                    })
            })
            .collect::<Result<_, _>>()?;

        let empty = Vec::new();
        let rows = state.rows.get(&partition).unwrap_or(&empty);
        let mut matching: Vec<Tuple> = rows
            .iter()
            .filter(|row| {
                filters.iter().all(|(p, c)| {
                    let value = row.get(*p).cloned().unwrap_or(Value::Null);
                    c.matches(&value)
                })
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            let ka = sort_key_of(a, &sort_positions);
            let kb = sort_key_of(b, &sort_positions);
            match query.direction {
                Direction::Asc => compare_keys(&ka, &kb),
                Direction::Desc => compare_keys(&kb, &ka),
            }
        });

        if let Some(bound) = &query.after {
            matching.retain(|row| {
                let key = sort_key_of(row, &sort_positions);
                match query.direction {
                    Direction::Asc => compare_keys(&key, bound) == Ordering::Greater,
                    Direction::Desc => compare_keys(&key, bound) == Ordering::Less,
                }
            });
        }

        matching.truncate(query.limit as usize);
        Ok(matching)
    }

    async fn space_len(
        &self,
        partition: PartitionId,
        space: &str,
        opts: &StorageOpts,
    ) -> Result<u64, StorageError> {
        let spaces = self.spaces.lock().unwrap();
        let state = spaces
            .get(space)
            .ok_or_else(|| StorageError::SpaceNotFound {
                space: space.to_string(),
            })?;
        Self::check_version(state, opts)?;
        Ok(state.rows.get(&partition).map(Vec::len).unwrap_or(0) as u64)
    }

    async fn truncate_space(
        &self,
        partition: PartitionId,
        space: &str,
        opts: &StorageOpts,
    ) -> Result<(), StorageError> {
        let mut spaces = self.spaces.lock().unwrap();
        let state = lookup_mut(&mut spaces, space)?;
        Self::check_version(state, opts)?;
        state.rows.entry(partition).or_default().clear();
        Ok(())
    }
}

fn lookup_mut<'a>(
    spaces: &'a mut HashMap<String, SpaceState>,
    space: &str,
) -> Result<&'a mut SpaceState, StorageError> {
    spaces
        .get_mut(space)
        .ok_or_else(|| StorageError::SpaceNotFound {
            space: space.to_string(),
        })
}

impl PartitionMap for MemoryCluster {
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

// =============================================================================
// Tests
// =============================================================================
