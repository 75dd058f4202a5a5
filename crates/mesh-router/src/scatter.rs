//! Scatter-gather read execution.
//!
//! Reads are planned as either a single-partition call (when the target
//! bucket is known or derivable from equality conditions on the sharding
//! key) or a fan-out over every partition. Fan-out rounds are issued
//! without serial waiting - all per-partition requests go out, then the
//! executor joins them - and the locally sorted partial sequences are
//! combined with a k-way heap merge under the active index order.
//!
//! Any partition error or timeout fails the whole read: a partial merge
//! could return out-of-order results, so partial success is deliberately
//! disallowed for reads.

use crate::bucket::BucketRouter;
use crate::error::{RouterError, StorageError};
use crate::schema::SpaceSchema;
use crate::sharding::SpaceSharding;
use crate::stats::StatsSink;
use crate::storage::{Direction, SelectQuery, StorageBackend, StorageOpts};
use crate::topology::PartitionMap;
use futures::future::join_all;
use mesh_core::{compare_keys, BucketId, Condition, ConditionOp, PartitionId, Tuple, Value};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Read Options
// =============================================================================

/// Caller options of `select`/`pairs` and the other read paths.
#[derive(Debug, Clone, Default)]
pub struct ReadOpts {
    /// Signed result limit. Negative means tail mode: the last `|first|`
    /// tuples before `after`, returned in ascending order. Requires
    /// `after`.
    pub first: Option<i64>,
    /// Resume tuple: results start strictly past it in scan direction.
    pub after: Option<Tuple>,
    /// Maximum tuples per partition per scan round.
    pub batch_size: Option<u32>,
    /// Explicit target bucket, skipping plan analysis.
    pub bucket_id: Option<BucketId>,
    /// Output projection. Merge always runs on full tuples; projection is
    /// applied afterwards.
    pub fields: Option<Vec<String>>,
    /// Skip the single-partition fast path even when an equality condition
    /// on the sharding key would allow it.
    pub force_map_call: bool,
    /// Per-call deadline override.
    pub timeout: Option<Duration>,
}

impl ReadOpts {
    /// Creates default read options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the signed result limit.
    pub fn with_first(mut self, first: i64) -> Self {
        self.first = Some(first);
        self
    }

    /// Sets the resume tuple.
    pub fn with_after(mut self, after: Tuple) -> Self {
        self.after = Some(after);
        self
    }

    /// Sets the per-partition round size.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Targets an explicit bucket.
    pub fn with_bucket_id(mut self, bucket_id: BucketId) -> Self {
        self.bucket_id = Some(bucket_id);
        self
    }

    /// Sets the output projection.
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Forces fan-out execution.
    pub fn with_force_map_call(mut self) -> Self {
        self.force_map_call = true;
        self
    }

    /// Sets the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// =============================================================================
// Planning
// =============================================================================

/// Where a read executes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadPlan {
    /// The sharding key pinned the read to one partition.
    Single(PartitionId),
    /// Fan out to every partition and merge.
    Broadcast(Vec<PartitionId>),
}

impl ReadPlan {
    /// The partitions the plan touches.
    pub fn targets(&self) -> Vec<PartitionId> {
        match self {
            ReadPlan::Single(p) => vec![*p],
            ReadPlan::Broadcast(ps) => ps.clone(),
        }
    }

    /// True when the plan is a fan-out.
    pub fn is_map_reduce(&self) -> bool {
        matches!(self, ReadPlan::Broadcast(_))
    }
}

/// Plans a read: single partition when the bucket is known or derivable,
/// fan-out otherwise.
pub fn plan_read(
    schema: &SpaceSchema,
    sharding: Option<&SpaceSharding>,
    conditions: &[Condition],
    opts: &ReadOpts,
    bucket_router: &BucketRouter,
    partitions: &dyn PartitionMap,
) -> Result<ReadPlan, RouterError> {
    if let Some(bucket) = opts.bucket_id {
        let partition = partitions
            .partition_for_bucket(bucket)
            .ok_or(RouterError::UnroutableBucket { bucket })?;
        return Ok(ReadPlan::Single(partition));
    }

    if !opts.force_map_call {
        if let Some(key) = equality_sharding_key(schema, sharding, conditions) {
            let func = sharding.and_then(|s| s.func.as_deref());
            let bucket = bucket_router.bucket_for_key(&key, func, None)?;
            let partition = partitions
                .partition_for_bucket(bucket)
                .ok_or(RouterError::UnroutableBucket { bucket })?;
            return Ok(ReadPlan::Single(partition));
        }
    }

    Ok(ReadPlan::Broadcast(partitions.all_partitions()))
}

/// Extracts the full sharding key from equality conditions, if every
/// sharding-key field has one.
fn equality_sharding_key(
    schema: &SpaceSchema,
    sharding: Option<&SpaceSharding>,
    conditions: &[Condition],
) -> Option<Vec<Value>> {
    let key_fields = sharding
        .and_then(|s| s.key_fields.as_ref())
        .unwrap_or(&schema.primary_key);
    key_fields
        .iter()
        .map(|field| {
            conditions
                .iter()
                .find(|c| c.op == ConditionOp::Eq && &c.field == field)
                .map(|c| c.value.clone())
        })
        .collect()
}

/// Derives the sharding-key values from a primary key, when the sharding
/// key is a subset of the primary key.
pub fn sharding_key_from_primary(
    schema: &SpaceSchema,
    sharding: Option<&SpaceSharding>,
    key: &[Value],
) -> Option<Vec<Value>> {
    let key_fields = sharding
        .and_then(|s| s.key_fields.as_ref())
        .unwrap_or(&schema.primary_key);
    key_fields
        .iter()
        .map(|field| {
            schema
                .primary_key
                .iter()
                .position(|pk| pk == field)
                .and_then(|i| key.get(i).cloned())
        })
        .collect()
}

/// Picks the index a scan runs on.
///
/// Prefers an index whose leading field a condition constrains; falls
/// back to a primary full scan with post-filtering.
pub fn pick_index(schema: &SpaceSchema, conditions: &[Condition]) -> String {
    for condition in conditions {
        if schema
            .primary_key
            .first()
            .is_some_and(|pk| pk == &condition.field)
        {
            return crate::storage::PRIMARY_INDEX.to_string();
        }
        if let Some(index) = schema
            .indexes
            .iter()
            .find(|i| i.fields.first() == Some(&condition.field))
        {
            return index.name.clone();
        }
    }
    crate::storage::PRIMARY_INDEX.to_string()
}

// =============================================================================
// K-way Merge Stream
// =============================================================================

/// One partition's buffered slice of the merge.
#[derive(Debug)]
struct PartitionCursor {
    partition: PartitionId,
    buffer: VecDeque<Tuple>,
    /// Sort key of the last tuple received; the exclusive bound of the
    /// next refill round.
    last_bound: Option<Vec<Value>>,
    /// The partition returned fewer tuples than requested, so it has no
    /// more matches past `last_bound`.
    exhausted: bool,
}

impl PartitionCursor {
    fn new(partition: PartitionId, bound: Option<Vec<Value>>) -> Self {
        Self {
            partition,
            buffer: VecDeque::new(),
            last_bound: bound,
            exhausted: false,
        }
    }
}

/// Heap entry: the sort key of one partition's current head tuple.
///
/// Ordered so that the heap pops the global minimum (maximum in
/// descending mode), with ties broken by primary key inside the sort key
/// and then by partition id for cross-partition determinism.
struct HeapEntry {
    key: Vec<Value>,
    partition: PartitionId,
    cursor_idx: usize,
    desc: bool,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        let natural =
            compare_keys(&self.key, &other.key).then(self.partition.cmp(&other.partition));
        let directed = if self.desc { natural.reverse() } else { natural };
        // BinaryHeap pops the maximum; reverse to pop the scan-order head.
        directed.reverse()
    }
}

/// A restartable, finite lazy sequence over the merged read.
///
/// Each [`TupleStream::next`] suspends the caller; when a partition's
/// buffered batch empties, the stream issues one additional fetch round
/// for that partition, bounded by the batch size. `select` drains the
/// same sequence internally; `pairs` hands it to the caller.
pub struct TupleStream<B> {
    backend: Arc<B>,
    stats: Arc<dyn StatsSink>,
    schema: Arc<SpaceSchema>,
    index: String,
    direction: Direction,
    conditions: Vec<Condition>,
    /// Positions forming the sort key: index key extended by primary key.
    sort_positions: Vec<usize>,
    /// Resolved condition positions for the router-side post-filter.
    filters: Vec<(usize, Condition)>,
    cursors: Vec<PartitionCursor>,
    heap: BinaryHeap<HeapEntry>,
    batch_size: u32,
    storage_opts: StorageOpts,
    remaining: Option<u64>,
    tuples_fetched: u64,
    tuples_looked_up: u64,
    stats_reported: bool,
}

impl<B: StorageBackend> TupleStream<B> {
    /// Opens the stream: resolves the sort order and runs the first fetch
    /// round against every target partition in parallel.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn open(
        backend: Arc<B>,
        stats: Arc<dyn StatsSink>,
        schema: Arc<SpaceSchema>,
        targets: Vec<PartitionId>,
        index: String,
        direction: Direction,
        after: Option<Vec<Value>>,
        conditions: Vec<Condition>,
        limit: Option<u64>,
        batch_size: u32,
        storage_opts: StorageOpts,
    ) -> Result<Self, RouterError> {
        let sort_positions = sort_positions(&schema, &index)?;

        let filters = conditions
            .iter()
            .map(|c| {
                schema
                    .field_position(&c.field)
                    .map(|p| (p, c.clone()))
                    .ok_or_else(|| {
                        RouterError::Validation(format!(
                            "space `{}` has no field `{}`",
                            schema.name, c.field
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let cursors = targets
            .iter()
            .map(|p| PartitionCursor::new(*p, after.clone()))
            .collect();

        let mut stream = Self {
            backend,
            stats,
            schema,
            index,
            direction,
            conditions,
            sort_positions,
            filters,
            cursors,
            heap: BinaryHeap::new(),
            batch_size,
            storage_opts,
            remaining: limit,
            tuples_fetched: 0,
            tuples_looked_up: 0,
            stats_reported: false,
        };
        stream.initial_round().await?;
        Ok(stream)
    }

    /// Issues the first fetch round to all partitions without serial
    /// waiting, then seeds the merge heap.
    async fn initial_round(&mut self) -> Result<(), RouterError> {
        let round = self
            .cursors
            .iter()
            .map(|cursor| {
                let backend = Arc::clone(&self.backend);
                let space = self.schema.name.clone();
                let query = SelectQuery {
                    index: self.index.clone(),
                    direction: self.direction,
                    after: cursor.last_bound.clone(),
                    conditions: self.conditions.clone(),
                    limit: self.batch_size,
                };
                let opts = self.storage_opts;
                let partition = cursor.partition;
                async move {
                    let sent =
                        tokio::time::timeout(opts.timeout, async {
                            backend.select(partition, &space, &query, &opts).await
                        })
                        .await;
                    (partition, flatten_rpc(partition, sent, opts.timeout))
                }
            })
            .collect::<Vec<_>>();

        for (idx, (_, outcome)) in join_all(round).await.into_iter().enumerate() {
            let rows = outcome?;
            self.ingest(idx, rows);
        }
        Ok(())
    }

    /// Fetches one more round for a single partition whose buffer emptied.
    async fn refill(&mut self, idx: usize) -> Result<(), RouterError> {
        let cursor = &self.cursors[idx];
        let query = SelectQuery {
            index: self.index.clone(),
            direction: self.direction,
            after: cursor.last_bound.clone(),
            conditions: self.conditions.clone(),
            limit: self.batch_size,
        };
        let opts = self.storage_opts;
        let partition = cursor.partition;
        let sent = tokio::time::timeout(opts.timeout, async {
            self.backend
                .select(partition, &self.schema.name, &query, &opts)
                .await
        })
        .await;
        let rows = flatten_rpc(partition, sent, opts.timeout)?;
        self.ingest(idx, rows);
        Ok(())
    }

    /// Buffers one round of rows and exposes the partition's head to the
    /// heap if it was previously empty.
    fn ingest(&mut self, idx: usize, rows: Vec<Tuple>) {
        let had_head = !self.cursors[idx].buffer.is_empty();
        let cursor = &mut self.cursors[idx];
        cursor.exhausted = (rows.len() as u32) < self.batch_size;
        self.tuples_fetched += rows.len() as u64;
        if let Some(last) = rows.last() {
            cursor.last_bound = Some(sort_key(last, &self.sort_positions));
        }
        cursor.buffer.extend(rows);

        if !had_head {
            self.push_head(idx);
        }
    }

    fn push_head(&mut self, idx: usize) {
        if let Some(front) = self.cursors[idx].buffer.front() {
            self.heap.push(HeapEntry {
                key: sort_key(front, &self.sort_positions),
                partition: self.cursors[idx].partition,
                cursor_idx: idx,
                desc: self.direction == Direction::Desc,
            });
        }
    }

    /// Produces the next merged tuple, or `None` once the limit is
    /// reached or every partition is exhausted.
    pub async fn next(&mut self) -> Result<Option<Tuple>, RouterError> {
        loop {
            if self.remaining == Some(0) {
                self.report_stats();
                return Ok(None);
            }
            let entry = match self.heap.pop() {
                Some(entry) => entry,
                None => {
                    self.report_stats();
                    return Ok(None);
                }
            };
            let idx = entry.cursor_idx;
            let tuple = match self.cursors[idx].buffer.pop_front() {
                Some(tuple) => tuple,
                None => continue,
            };

            if self.cursors[idx].buffer.is_empty() && !self.cursors[idx].exhausted {
                // The refill re-exposes the partition's head itself.
                self.refill(idx).await?;
            } else {
                self.push_head(idx);
            }

            self.tuples_looked_up += 1;
            if !self.matches_filters(&tuple) {
                continue;
            }
            if let Some(remaining) = &mut self.remaining {
                *remaining -= 1;
            }
            return Ok(Some(tuple));
        }
    }

    /// Drains the stream into a vector.
    pub async fn collect(mut self) -> Result<Vec<Tuple>, RouterError> {
        let mut out = Vec::new();
        while let Some(tuple) = self.next().await? {
            out.push(tuple);
        }
        Ok(out)
    }

    fn matches_filters(&self, tuple: &Tuple) -> bool {
        self.filters.iter().all(|(position, condition)| match tuple.get(*position) {
            Some(value) => condition.matches(value),
            None => condition.matches(&Value::Null),
        })
    }

    fn report_stats(&mut self) {
        if !self.stats_reported {
            self.stats_reported = true;
            self.stats.observe_fetch(
                self.tuples_fetched,
                self.tuples_looked_up,
                &self.schema.name,
            );
        }
    }
}

impl<B> Drop for TupleStream<B> {
    fn drop(&mut self) {
        if !self.stats_reported {
            self.stats.observe_fetch(
                self.tuples_fetched,
                self.tuples_looked_up,
                &self.schema.name,
            );
        }
    }
}

/// Resolves the positions forming a scan's total sort order: the index
/// key extended by the primary key for uniqueness.
pub(crate) fn sort_positions(
    schema: &SpaceSchema,
    index: &str,
) -> Result<Vec<usize>, RouterError> {
    let index_fields = schema.index_fields(index).ok_or_else(|| {
        RouterError::Validation(format!("space `{}` has no index `{}`", schema.name, index))
    })?;
    let mut sort_fields: Vec<String> = index_fields.to_vec();
    for pk in &schema.primary_key {
        if !sort_fields.contains(pk) {
            sort_fields.push(pk.clone());
        }
    }
    schema.positions_of(&sort_fields)
}

/// Computes the sort key of a tuple: values at the sort positions, with
/// absent slots treated as null.
pub(crate) fn sort_key(tuple: &Tuple, positions: &[usize]) -> Vec<Value> {
    positions
        .iter()
        .map(|&p| tuple.get(p).cloned().unwrap_or(Value::Null))
        .collect()
}

fn flatten_rpc(
    partition: PartitionId,
    sent: Result<Result<Vec<Tuple>, StorageError>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<Vec<Tuple>, RouterError> {
    match sent {
        Ok(Ok(rows)) => Ok(rows),
        Ok(Err(e)) => Err(RouterError::from_partition(partition, e)),
        Err(_) => Err(RouterError::from_partition(
            partition,
            StorageError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            },
        )),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType, IndexDef};
    use crate::sharding::ShardingFnRegistry;
    use crate::topology::StaticPartitionMap;

    fn schema() -> SpaceSchema {
        SpaceSchema {
            name: "events".into(),
            fields: vec![
                FieldDef::new("id", FieldType::Int),
                FieldDef::new("bucket_id", FieldType::Int).nullable(),
                FieldDef::new("kind", FieldType::Str),
                FieldDef::new("ts", FieldType::Int),
            ],
            primary_key: vec!["id".into()],
            indexes: vec![IndexDef::new("by_ts", vec!["ts"])],
            bucket_field: "bucket_id".into(),
            version: 1,
        }
    }

    fn bucket_router() -> BucketRouter {
        BucketRouter::new(Arc::new(ShardingFnRegistry::new()), 256)
    }

    #[test]
    fn test_plan_explicit_bucket_is_single() {
        let map = StaticPartitionMap::with_partitions(4, 256);
        let opts = ReadOpts::new().with_bucket_id(BucketId::new(9));
        let plan = plan_read(&schema(), None, &[], &opts, &bucket_router(), &map).unwrap();
        assert!(matches!(plan, ReadPlan::Single(_)));
        assert!(!plan.is_map_reduce());
    }

    #[test]
    fn test_plan_equality_on_sharding_key_is_single() {
        let map = StaticPartitionMap::with_partitions(4, 256);
        let conditions = vec![Condition::eq("id", 42i64)];
        let plan = plan_read(
            &schema(),
            None,
            &conditions,
            &ReadOpts::new(),
            &bucket_router(),
            &map,
        )
        .unwrap();
        assert!(matches!(plan, ReadPlan::Single(_)));
    }

    #[test]
    fn test_plan_range_condition_broadcasts() {
        let map = StaticPartitionMap::with_partitions(4, 256);
        let conditions = vec![Condition::gt("id", 0i64)];
        let plan = plan_read(
            &schema(),
            None,
            &conditions,
            &ReadOpts::new(),
            &bucket_router(),
            &map,
        )
        .unwrap();
        assert!(plan.is_map_reduce());
        assert_eq!(plan.targets().len(), 4);
    }

    #[test]
    fn test_plan_force_map_call_overrides_fast_path() {
        let map = StaticPartitionMap::with_partitions(4, 256);
        let conditions = vec![Condition::eq("id", 42i64)];
        let opts = ReadOpts::new().with_force_map_call();
        let plan = plan_read(&schema(), None, &conditions, &opts, &bucket_router(), &map).unwrap();
        assert!(plan.is_map_reduce());
    }

    #[test]
    fn test_plan_custom_sharding_key_needs_all_fields() {
        let map = StaticPartitionMap::with_partitions(4, 256);
        let sharding = SpaceSharding {
            key_fields: Some(vec!["kind".into(), "ts".into()]),
            func: None,
        };

        // Only one of the two sharding-key fields is pinned
        let partial = vec![Condition::eq("kind", "click")];
        let plan = plan_read(
            &schema(),
            Some(&sharding),
            &partial,
            &ReadOpts::new(),
            &bucket_router(),
            &map,
        )
        .unwrap();
        assert!(plan.is_map_reduce());

        // Both fields pinned routes to one partition
        let full = vec![
            Condition::eq("kind", "click"),
            Condition::eq("ts", 1000i64),
        ];
        let plan = plan_read(
            &schema(),
            Some(&sharding),
            &full,
            &ReadOpts::new(),
            &bucket_router(),
            &map,
        )
        .unwrap();
        assert!(matches!(plan, ReadPlan::Single(_)));
    }

    #[test]
    fn test_pick_index_prefers_condition_match() {
        let schema = schema();
        assert_eq!(pick_index(&schema, &[Condition::gt("ts", 5i64)]), "by_ts");
        assert_eq!(
            pick_index(&schema, &[Condition::gt("id", 5i64)]),
            crate::storage::PRIMARY_INDEX
        );
        // No matching index falls back to a primary scan with post-filter
        assert_eq!(
            pick_index(&schema, &[Condition::eq("kind", "click")]),
            crate::storage::PRIMARY_INDEX
        );
    }

    #[test]
    fn test_sharding_key_from_primary() {
        let schema = schema();
        // Default sharding key is the primary key itself
        let key = sharding_key_from_primary(&schema, None, &[Value::Int(9)]);
        assert_eq!(key, Some(vec![Value::Int(9)]));

        // A sharding key outside the primary key cannot be derived
        let sharding = SpaceSharding {
            key_fields: Some(vec!["kind".into()]),
            func: None,
        };
        assert_eq!(
            sharding_key_from_primary(&schema, Some(&sharding), &[Value::Int(9)]),
            None
        );
    }

    #[test]
    fn test_heap_entry_order_ascending() {
        let a = HeapEntry {
            key: vec![Value::Int(1)],
            partition: PartitionId::new(1),
            cursor_idx: 0,
            desc: false,
        };
        let b = HeapEntry {
            key: vec![Value::Int(2)],
            partition: PartitionId::new(0),
            cursor_idx: 1,
            desc: false,
        };
        // Pop order is reversed, so the smaller key is the greater entry
        assert_eq!(a.cmp(&b), Ordering::Greater);

        let mut heap = BinaryHeap::new();
        heap.push(b);
        heap.push(a);
        assert_eq!(heap.pop().unwrap().key, vec![Value::Int(1)]);
    }

    #[test]
    fn test_heap_entry_tie_breaks_by_partition() {
        let p0 = HeapEntry {
            key: vec![Value::Int(7)],
            partition: PartitionId::new(0),
            cursor_idx: 0,
            desc: false,
        };
        let p1 = HeapEntry {
            key: vec![Value::Int(7)],
            partition: PartitionId::new(1),
            cursor_idx: 1,
            desc: false,
        };
        let mut heap = BinaryHeap::new();
        heap.push(p1);
        heap.push(p0);
        assert_eq!(heap.pop().unwrap().partition, PartitionId::new(0));
    }

    #[test]
    fn test_heap_entry_order_descending() {
        let small = HeapEntry {
            key: vec![Value::Int(1)],
            partition: PartitionId::new(0),
            cursor_idx: 0,
            desc: true,
        };
        let big = HeapEntry {
            key: vec![Value::Int(9)],
            partition: PartitionId::new(1),
            cursor_idx: 1,
            desc: true,
        };
        let mut heap = BinaryHeap::new();
        heap.push(small);
        heap.push(big);
        assert_eq!(heap.pop().unwrap().key, vec![Value::Int(9)]);
    }
}
