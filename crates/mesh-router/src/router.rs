//! The router façade: the public CRUD surface over a partitioned cluster.
//!
//! Every operation resolves routing through the process-local caches, is
//! wrapped in the one-shot stale-schema retry, and reports an observation
//! to the stats sink on completion. Caches are owned by the router
//! instance - nothing here is a hidden singleton.

use crate::batch;
use crate::bucket::BucketRouter;
use crate::config::RouterConfig;
use crate::error::{BatchResult, RouterError, StorageError};
use crate::retry::with_schema_retry;
use crate::scatter::{
    pick_index, plan_read, sharding_key_from_primary, sort_key, sort_positions, ReadOpts,
    TupleStream,
};
use crate::schema::{cut_rows, SchemaCache, SpaceSchema};
use crate::sharding::{ShardingCache, ShardingFnRegistry, SpaceSharding};
use crate::stats::{NoopStats, OpStatus, StatsSink};
use crate::storage::{Direction, StorageBackend, StorageOpts};
use crate::topology::PartitionMap;
use mesh_core::{BucketId, Condition, PartitionId, Tuple, UpdateOp, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Caller options shared by the write paths.
#[derive(Debug, Clone, Default)]
pub struct WriteOpts {
    /// Per-call deadline override.
    pub timeout: Option<Duration>,
    /// Explicit bucket override. Conflicts with an id already embedded in
    /// the tuple are rejected.
    pub bucket_id: Option<BucketId>,
    /// Projection applied to returned rows.
    pub fields: Option<Vec<String>>,
}

impl WriteOpts {
    /// Creates default write options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
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
}

/// A named record accepted by the `*_object` operation variants.
pub type Object = serde_json::Map<String, serde_json::Value>;

/// The source of a write: a positional tuple or a named record that is
/// flattened through the space schema once the schema is known.
enum TupleSource<'a> {
    Tuple(&'a Tuple),
    Object(&'a Object),
}

impl TupleSource<'_> {
    fn resolve(&self, schema: &SpaceSchema) -> Result<Tuple, RouterError> {
        match self {
            TupleSource::Tuple(t) => Ok((*t).clone()),
            TupleSource::Object(o) => schema.tuple_from_object(o),
        }
    }
}

/// The query router.
///
/// Generic over the storage backend; the partition map and stats sink are
/// injected trait objects. Share it behind an `Arc` - every operation
/// takes `&self`.
pub struct Router<B> {
    backend: Arc<B>,
    partitions: Arc<dyn PartitionMap>,
    stats: Arc<dyn StatsSink>,
    schemas: SchemaCache,
    sharding: ShardingCache,
    registry: Arc<ShardingFnRegistry>,
    bucket_router: BucketRouter,
    config: RouterConfig,
}

impl<B: StorageBackend> Router<B> {
    /// Creates a router over a backend and partition map.
    pub fn new(backend: Arc<B>, partitions: Arc<dyn PartitionMap>, config: RouterConfig) -> Self {
        let registry = Arc::new(ShardingFnRegistry::new());
        let bucket_router = BucketRouter::new(Arc::clone(&registry), partitions.bucket_count());
        Self {
            backend,
            partitions,
            stats: Arc::new(NoopStats),
            schemas: SchemaCache::new(),
            sharding: ShardingCache::new(),
            registry,
            bucket_router,
            config,
        }
    }

    /// Replaces the stats sink.
    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    /// The registry custom sharding functions are registered in.
    pub fn sharding_functions(&self) -> &ShardingFnRegistry {
        &self.registry
    }

    /// Drops all process-local metadata caches. The next operation
    /// refetches schemas and sharding metadata.
    pub fn invalidate_caches(&self) {
        self.schemas.clear();
        self.sharding.invalidate();
    }

    // =========================================================================
    // Point Writes
    // =========================================================================

    /// Inserts a tuple. Fails if the primary key already exists.
    pub async fn insert(
        &self,
        space: &str,
        tuple: Tuple,
        opts: &WriteOpts,
    ) -> Result<Tuple, RouterError> {
        self.observed(space, "insert", async {
            let source = TupleSource::Tuple(&tuple);
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.write_inner(space, &source, opts, WriteKind::Insert)
            })
            .await
        })
        .await
    }

    /// Inserts a named record.
    pub async fn insert_object(
        &self,
        space: &str,
        object: Object,
        opts: &WriteOpts,
    ) -> Result<Tuple, RouterError> {
        self.observed(space, "insert_object", async {
            let source = TupleSource::Object(&object);
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.write_inner(space, &source, opts, WriteKind::Insert)
            })
            .await
        })
        .await
    }

    /// Inserts or fully replaces a tuple by primary key.
    pub async fn replace(
        &self,
        space: &str,
        tuple: Tuple,
        opts: &WriteOpts,
    ) -> Result<Tuple, RouterError> {
        self.observed(space, "replace", async {
            let source = TupleSource::Tuple(&tuple);
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.write_inner(space, &source, opts, WriteKind::Replace)
            })
            .await
        })
        .await
    }

    /// Replaces by a named record.
    pub async fn replace_object(
        &self,
        space: &str,
        object: Object,
        opts: &WriteOpts,
    ) -> Result<Tuple, RouterError> {
        self.observed(space, "replace_object", async {
            let source = TupleSource::Object(&object);
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.write_inner(space, &source, opts, WriteKind::Replace)
            })
            .await
        })
        .await
    }

    /// Applies update operations to the tuple with the given primary key.
    /// Returns the updated tuple, or `None` when no such tuple exists.
    pub async fn update(
        &self,
        space: &str,
        key: Vec<Value>,
        ops: Vec<UpdateOp>,
        opts: &WriteOpts,
    ) -> Result<Option<Tuple>, RouterError> {
        self.observed(space, "update", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.update_inner(space, &key, &ops, opts)
            })
            .await
        })
        .await
    }

    /// Inserts the tuple if absent, otherwise applies the update
    /// operations to the stored tuple.
    pub async fn upsert(
        &self,
        space: &str,
        tuple: Tuple,
        ops: Vec<UpdateOp>,
        opts: &WriteOpts,
    ) -> Result<(), RouterError> {
        self.observed(space, "upsert", async {
            let source = TupleSource::Tuple(&tuple);
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.upsert_inner(space, &source, &ops, opts)
            })
            .await
        })
        .await
    }

    /// Upserts by a named record.
    pub async fn upsert_object(
        &self,
        space: &str,
        object: Object,
        ops: Vec<UpdateOp>,
        opts: &WriteOpts,
    ) -> Result<(), RouterError> {
        self.observed(space, "upsert_object", async {
            let source = TupleSource::Object(&object);
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.upsert_inner(space, &source, &ops, opts)
            })
            .await
        })
        .await
    }

    /// Deletes by primary key. Returns the deleted tuple, or `None` when
    /// no such tuple existed.
    pub async fn delete(
        &self,
        space: &str,
        key: Vec<Value>,
        opts: &WriteOpts,
    ) -> Result<Option<Tuple>, RouterError> {
        self.observed(space, "delete", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.delete_inner(space, &key, opts)
            })
            .await
        })
        .await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Fetches one tuple by primary key.
    pub async fn get(
        &self,
        space: &str,
        key: Vec<Value>,
        opts: &ReadOpts,
    ) -> Result<Option<Tuple>, RouterError> {
        self.observed(space, "get", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.get_inner(space, &key, opts)
            })
            .await
        })
        .await
    }

    /// Runs a filtered, ordered, limited read and returns the merged rows.
    pub async fn select(
        &self,
        space: &str,
        conditions: Vec<Condition>,
        opts: &ReadOpts,
    ) -> Result<Vec<Tuple>, RouterError> {
        self.observed(space, "select", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.select_inner(space, &conditions, opts)
            })
            .await
        })
        .await
    }

    /// Opens the merged read as a lazy stream. Each `next()` may suspend
    /// for one per-partition fetch round. Tail mode is not supported here;
    /// use [`Router::select`] with a negative `first`.
    pub async fn pairs(
        &self,
        space: &str,
        conditions: Vec<Condition>,
        opts: &ReadOpts,
    ) -> Result<TupleStream<B>, RouterError> {
        self.observed(space, "pairs", async {
            if opts.first.is_some_and(|f| f < 0) {
                return Err(RouterError::Validation(
                    "pairs does not support tail mode; use select with a negative first".into(),
                ));
            }
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.open_stream(space, &conditions, opts, Direction::Asc)
            })
            .await
        })
        .await
    }

    /// Returns the tuple with the smallest key of an index (the primary
    /// index when `index` is `None`).
    pub async fn min(
        &self,
        space: &str,
        index: Option<&str>,
        opts: &ReadOpts,
    ) -> Result<Option<Tuple>, RouterError> {
        self.observed(space, "min", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.extremum_inner(space, index, opts, Direction::Asc)
            })
            .await
        })
        .await
    }

    /// Returns the tuple with the greatest key of an index (the primary
    /// index when `index` is `None`).
    pub async fn max(
        &self,
        space: &str,
        index: Option<&str>,
        opts: &ReadOpts,
    ) -> Result<Option<Tuple>, RouterError> {
        self.observed(space, "max", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.extremum_inner(space, index, opts, Direction::Desc)
            })
            .await
        })
        .await
    }

    /// Counts the tuples of a space across all partitions.
    pub async fn len(&self, space: &str, opts: &ReadOpts) -> Result<u64, RouterError> {
        self.observed(space, "len", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.len_inner(space, opts)
            })
            .await
        })
        .await
    }

    // =========================================================================
    // Batches and Space-wide Writes
    // =========================================================================

    /// Inserts a batch: one atomic sub-batch per partition, partial
    /// failure tolerated across partitions.
    pub async fn batch_insert(
        &self,
        space: &str,
        tuples: Vec<Tuple>,
        opts: &WriteOpts,
    ) -> Result<BatchResult, RouterError> {
        self.observed(space, "batch_insert", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.batch_insert_inner(space, &tuples, opts)
            })
            .await
        })
        .await
    }

    /// Inserts a batch of named records.
    pub async fn batch_insert_object(
        &self,
        space: &str,
        objects: Vec<Object>,
        opts: &WriteOpts,
    ) -> Result<BatchResult, RouterError> {
        self.observed(space, "batch_insert_object", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.batch_insert_object_inner(space, &objects, opts)
            })
            .await
        })
        .await
    }

    /// Upserts a batch; `operations[i]` belongs to `tuples[i]`.
    pub async fn batch_upsert(
        &self,
        space: &str,
        tuples: Vec<Tuple>,
        operations: Vec<Vec<UpdateOp>>,
        opts: &WriteOpts,
    ) -> Result<BatchResult, RouterError> {
        self.observed(space, "batch_upsert", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.batch_upsert_inner(space, &tuples, &operations, opts)
            })
            .await
        })
        .await
    }

    /// Removes every tuple of a space on every partition.
    pub async fn truncate(&self, space: &str, opts: &WriteOpts) -> Result<(), RouterError> {
        self.observed(space, "truncate", async {
            with_schema_retry(&self.schemas, &self.sharding, space, || {
                self.truncate_inner(space, opts)
            })
            .await
        })
        .await
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn effective_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.config.request_timeout())
    }

    fn partition_for(&self, bucket: BucketId) -> Result<PartitionId, RouterError> {
        self.partitions
            .partition_for_bucket(bucket)
            .ok_or(RouterError::UnroutableBucket { bucket })
    }

    async fn space_context(
        &self,
        space: &str,
        timeout: Duration,
    ) -> Result<(Arc<SpaceSchema>, Option<SpaceSharding>), RouterError> {
        let schema = self.schemas.get(self.backend.as_ref(), space, timeout).await?;
        let sharding = self
            .sharding
            .sharding_for(self.backend.as_ref(), space, timeout)
            .await?;
        Ok((schema, sharding))
    }

    /// Wraps one partition RPC with its deadline and error context.
    async fn rpc<T>(
        &self,
        partition: PartitionId,
        timeout: Duration,
        call: impl Future<Output = Result<T, StorageError>>,
    ) -> Result<T, RouterError> {
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(RouterError::from_partition(partition, e)),
            Err(_) => Err(RouterError::from_partition(
                partition,
                StorageError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                },
            )),
        }
    }

    /// Measures an operation and reports it to the stats sink.
    async fn observed<T>(
        &self,
        space: &str,
        op: &str,
        body: impl Future<Output = Result<T, RouterError>>,
    ) -> Result<T, RouterError> {
        let start = Instant::now();
        let result = body.await;
        if matches!(result, Err(RouterError::UnknownSpace { .. })) {
            self.stats.observe_space_not_found();
        }
        let status = if result.is_ok() {
            OpStatus::Ok
        } else {
            OpStatus::Error
        };
        self.stats.observe(start.elapsed(), space, op, status);
        result
    }

    fn project_row(
        &self,
        row: Tuple,
        schema: &SpaceSchema,
        fields: Option<&Vec<String>>,
    ) -> Result<Tuple, RouterError> {
        match fields {
            None => Ok(row),
            Some(fields) => {
                let mut cut = cut_rows(vec![row], schema, fields)?;
                Ok(cut.remove(0))
            }
        }
    }

    fn validate_ops(&self, schema: &SpaceSchema, ops: &[UpdateOp]) -> Result<(), RouterError> {
        for op in ops {
            if schema.field_position(op.field()).is_none() {
                return Err(RouterError::Validation(format!(
                    "space `{}` has no field `{}`",
                    schema.name,
                    op.field()
                )));
            }
        }
        Ok(())
    }

    async fn write_inner(
        &self,
        space: &str,
        source: &TupleSource<'_>,
        opts: &WriteOpts,
        kind: WriteKind,
    ) -> Result<Tuple, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, sharding) = self.space_context(space, timeout).await?;
        let mut tuple = source.resolve(&schema)?;
        let bucket = self.bucket_router.bucket_for_tuple(
            &mut tuple,
            &schema,
            sharding.as_ref(),
            opts.bucket_id,
        )?;
        let partition = self.partition_for(bucket)?;
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        let row = match kind {
            WriteKind::Insert => {
                self.rpc(
                    partition,
                    timeout,
                    self.backend.insert(partition, space, tuple, &storage_opts),
                )
                .await?
            }
            WriteKind::Replace => {
                self.rpc(
                    partition,
                    timeout,
                    self.backend.replace(partition, space, tuple, &storage_opts),
                )
                .await?
            }
        };
        self.project_row(row, &schema, opts.fields.as_ref())
    }

    async fn upsert_inner(
        &self,
        space: &str,
        source: &TupleSource<'_>,
        ops: &[UpdateOp],
        opts: &WriteOpts,
    ) -> Result<(), RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, sharding) = self.space_context(space, timeout).await?;
        self.validate_ops(&schema, ops)?;
        let mut tuple = source.resolve(&schema)?;
        let bucket = self.bucket_router.bucket_for_tuple(
            &mut tuple,
            &schema,
            sharding.as_ref(),
            opts.bucket_id,
        )?;
        let partition = self.partition_for(bucket)?;
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        self.rpc(
            partition,
            timeout,
            self.backend
                .upsert(partition, space, tuple, ops.to_vec(), &storage_opts),
        )
        .await
    }

    async fn update_inner(
        &self,
        space: &str,
        key: &[Value],
        ops: &[UpdateOp],
        opts: &WriteOpts,
    ) -> Result<Option<Tuple>, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, sharding) = self.space_context(space, timeout).await?;
        self.validate_key(&schema, key)?;
        self.validate_ops(&schema, ops)?;

        let partition = match self
            .point_partition(&schema, sharding.as_ref(), key, opts.bucket_id)?
        {
            Some(partition) => partition,
            None => {
                // The sharding key is not derivable from the primary key:
                // locate the row first, then address its partition.
                match self.lookup_by_key(&schema, key, timeout).await? {
                    Some((partition, _)) => partition,
                    None => return Ok(None),
                }
            }
        };

        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        let row = self
            .rpc(
                partition,
                timeout,
                self.backend
                    .update(partition, space, key.to_vec(), ops.to_vec(), &storage_opts),
            )
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(self.project_row(row, &schema, opts.fields.as_ref())?)),
        }
    }

    async fn delete_inner(
        &self,
        space: &str,
        key: &[Value],
        opts: &WriteOpts,
    ) -> Result<Option<Tuple>, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, sharding) = self.space_context(space, timeout).await?;
        self.validate_key(&schema, key)?;

        let partition = match self
            .point_partition(&schema, sharding.as_ref(), key, opts.bucket_id)?
        {
            Some(partition) => partition,
            None => match self.lookup_by_key(&schema, key, timeout).await? {
                Some((partition, _)) => partition,
                None => return Ok(None),
            },
        };

        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        let row = self
            .rpc(
                partition,
                timeout,
                self.backend
                    .delete(partition, space, key.to_vec(), &storage_opts),
            )
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(self.project_row(row, &schema, opts.fields.as_ref())?)),
        }
    }

    async fn get_inner(
        &self,
        space: &str,
        key: &[Value],
        opts: &ReadOpts,
    ) -> Result<Option<Tuple>, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, sharding) = self.space_context(space, timeout).await?;
        self.validate_key(&schema, key)?;

        let row = match self
            .point_partition(&schema, sharding.as_ref(), key, opts.bucket_id)?
        {
            Some(partition) => {
                self.fetch_by_key(&schema, key, vec![partition], timeout)
                    .await?
            }
            None => {
                let targets = self.partitions.all_partitions();
                self.fetch_by_key(&schema, key, targets, timeout)
                    .await?
            }
        };
        match row {
            None => Ok(None),
            Some(row) => {
                let row = match &opts.fields {
                    None => row,
                    Some(fields) => self.project_row(row, &schema, Some(fields))?,
                };
                Ok(Some(row))
            }
        }
    }

    async fn select_inner(
        &self,
        space: &str,
        conditions: &[Condition],
        opts: &ReadOpts,
    ) -> Result<Vec<Tuple>, RouterError> {
        let tail = opts.first.is_some_and(|f| f < 0);
        if tail && opts.after.is_none() {
            return Err(RouterError::Validation(
                "a negative first requires an after tuple to anchor the tail".into(),
            ));
        }
        let direction = if tail { Direction::Desc } else { Direction::Asc };

        let stream = self.open_stream(space, conditions, opts, direction).await?;
        let mut rows = stream.collect().await?;
        if tail {
            // The reverse scan produced the tail backwards.
            rows.reverse();
        }

        match &opts.fields {
            None => Ok(rows),
            Some(fields) => {
                let timeout = self.effective_timeout(opts.timeout);
                let schema = self
                    .schemas
                    .get(self.backend.as_ref(), space, timeout)
                    .await?;
                cut_rows(rows, &schema, fields)
            }
        }
    }

    /// Plans a read and opens the merge stream over its targets.
    async fn open_stream(
        &self,
        space: &str,
        conditions: &[Condition],
        opts: &ReadOpts,
        direction: Direction,
    ) -> Result<TupleStream<B>, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, sharding) = self.space_context(space, timeout).await?;

        let plan = plan_read(
            &schema,
            sharding.as_ref(),
            conditions,
            opts,
            &self.bucket_router,
            self.partitions.as_ref(),
        )?;
        if plan.is_map_reduce() {
            self.stats.observe_map_reduce(1, space);
            tracing::debug!(space, "read planned as map-reduce");
        }

        let index = pick_index(&schema, conditions);
        let limit = match opts.first {
            None => None,
            Some(f) => Some(f.unsigned_abs()),
        };
        let bound = match &opts.after {
            None => None,
            Some(after) => {
                let positions = sort_positions(&schema, &index)?;
                Some(sort_key(after, &positions))
            }
        };
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };

        TupleStream::open(
            Arc::clone(&self.backend),
            Arc::clone(&self.stats),
            Arc::clone(&schema),
            plan.targets(),
            index,
            direction,
            bound,
            conditions.to_vec(),
            limit,
            opts.batch_size.unwrap_or(self.config.request.batch_size),
            storage_opts,
        )
        .await
    }

    async fn extremum_inner(
        &self,
        space: &str,
        index: Option<&str>,
        opts: &ReadOpts,
        direction: Direction,
    ) -> Result<Option<Tuple>, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, _) = self.space_context(space, timeout).await?;
        let index = index
            .unwrap_or(crate::storage::PRIMARY_INDEX)
            .to_string();
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        let stream = TupleStream::open(
            Arc::clone(&self.backend),
            Arc::clone(&self.stats),
            Arc::clone(&schema),
            self.partitions.all_partitions(),
            index,
            direction,
            None,
            Vec::new(),
            Some(1),
            1,
            storage_opts,
        )
        .await?;
        let mut rows = stream.collect().await?;
        match rows.pop() {
            None => Ok(None),
            Some(row) => {
                let row = match &opts.fields {
                    None => row,
                    Some(fields) => self.project_row(row, &schema, Some(fields))?,
                };
                Ok(Some(row))
            }
        }
    }

    async fn len_inner(&self, space: &str, opts: &ReadOpts) -> Result<u64, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, _) = self.space_context(space, timeout).await?;
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        let counts = self
            .for_each_partition(timeout, |partition| {
                let backend = Arc::clone(&self.backend);
                let space = space.to_string();
                async move { backend.space_len(partition, &space, &storage_opts).await }
            })
            .await?;
        Ok(counts.into_iter().sum())
    }

    async fn truncate_inner(&self, space: &str, opts: &WriteOpts) -> Result<(), RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, _) = self.space_context(space, timeout).await?;
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        self.for_each_partition(timeout, |partition| {
            let backend = Arc::clone(&self.backend);
            let space = space.to_string();
            async move { backend.truncate_space(partition, &space, &storage_opts).await }
        })
        .await?;
        Ok(())
    }

    async fn batch_insert_inner(
        &self,
        space: &str,
        tuples: &[Tuple],
        opts: &WriteOpts,
    ) -> Result<BatchResult, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, sharding) = self.space_context(space, timeout).await?;
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        batch::execute_batch_insert(
            &self.backend,
            self.partitions.as_ref(),
            &self.bucket_router,
            &schema,
            sharding.as_ref(),
            tuples.to_vec(),
            opts.bucket_id,
            storage_opts,
        )
        .await
    }

    async fn batch_insert_object_inner(
        &self,
        space: &str,
        objects: &[Object],
        opts: &WriteOpts,
    ) -> Result<BatchResult, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, sharding) = self.space_context(space, timeout).await?;
        let tuples = objects
            .iter()
            .map(|o| schema.tuple_from_object(o))
            .collect::<Result<Vec<_>, _>>()?;
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        batch::execute_batch_insert(
            &self.backend,
            self.partitions.as_ref(),
            &self.bucket_router,
            &schema,
            sharding.as_ref(),
            tuples,
            opts.bucket_id,
            storage_opts,
        )
        .await
    }

    async fn batch_upsert_inner(
        &self,
        space: &str,
        tuples: &[Tuple],
        operations: &[Vec<UpdateOp>],
        opts: &WriteOpts,
    ) -> Result<BatchResult, RouterError> {
        let timeout = self.effective_timeout(opts.timeout);
        let (schema, sharding) = self.space_context(space, timeout).await?;
        for ops in operations {
            self.validate_ops(&schema, ops)?;
        }
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        batch::execute_batch_upsert(
            &self.backend,
            self.partitions.as_ref(),
            &self.bucket_router,
            &schema,
            sharding.as_ref(),
            tuples.to_vec(),
            operations.to_vec(),
            opts.bucket_id,
            storage_opts,
        )
        .await
    }

    // ---- point-routing helpers ----

    fn validate_key(&self, schema: &SpaceSchema, key: &[Value]) -> Result<(), RouterError> {
        if key.len() != schema.primary_key.len() {
            return Err(RouterError::Validation(format!(
                "space `{}` primary key has {} fields, got {}",
                schema.name,
                schema.primary_key.len(),
                key.len()
            )));
        }
        Ok(())
    }

    /// Resolves the partition of a primary key, when it is derivable
    /// without touching storage.
    fn point_partition(
        &self,
        schema: &SpaceSchema,
        sharding: Option<&SpaceSharding>,
        key: &[Value],
        bucket_id: Option<BucketId>,
    ) -> Result<Option<PartitionId>, RouterError> {
        if let Some(bucket) = bucket_id {
            return Ok(Some(self.partition_for(bucket)?));
        }
        match sharding_key_from_primary(schema, sharding, key) {
            None => Ok(None),
            Some(sharding_key) => {
                let func = sharding.and_then(|s| s.func.as_deref());
                let bucket = self
                    .bucket_router
                    .bucket_for_key(&sharding_key, func, None)?;
                Ok(Some(self.partition_for(bucket)?))
            }
        }
    }

    /// Runs a bounded primary-key lookup over the given partitions.
    async fn fetch_by_key(
        &self,
        schema: &Arc<SpaceSchema>,
        key: &[Value],
        targets: Vec<PartitionId>,
        timeout: Duration,
    ) -> Result<Option<Tuple>, RouterError> {
        let conditions: Vec<Condition> = schema
            .primary_key
            .iter()
            .zip(key.iter())
            .map(|(field, value)| Condition::eq(field.clone(), value.clone()))
            .collect();
        let storage_opts = StorageOpts {
            schema_version: schema.version,
            timeout,
        };
        let stream = TupleStream::open(
            Arc::clone(&self.backend),
            Arc::clone(&self.stats),
            Arc::clone(schema),
            targets,
            crate::storage::PRIMARY_INDEX.to_string(),
            Direction::Asc,
            None,
            conditions,
            Some(1),
            2,
            storage_opts,
        )
        .await?;
        let mut rows = stream.collect().await?;
        Ok(rows.pop())
    }

    /// Locates a row by primary key across partitions and returns the
    /// owning partition together with the row.
    async fn lookup_by_key(
        &self,
        schema: &Arc<SpaceSchema>,
        key: &[Value],
        timeout: Duration,
    ) -> Result<Option<(PartitionId, Tuple)>, RouterError> {
        let row = self
            .fetch_by_key(schema, key, self.partitions.all_partitions(), timeout)
            .await?;
        let row = match row {
            None => return Ok(None),
            Some(row) => row,
        };
        let position = schema.bucket_position().ok_or_else(|| {
            RouterError::BucketFieldMissing {
                space: schema.name.clone(),
                field: schema.bucket_field.clone(),
            }
        })?;
        let bucket = match row.get(position) {
            Some(Value::Int(i)) if *i >= 0 => BucketId::new(*i as u32),
            _ => {
                return Err(RouterError::Validation(format!(
                    "stored row of space `{}` carries no bucket id",
                    schema.name
                )))
            }
        };
        let partition = self.partition_for(bucket)?;
        Ok(Some((partition, row)))
    }
}

#[derive(Debug, Clone, Copy)]
enum WriteKind {
    Insert,
    Replace,
}

/// Fans one call out to every partition without serial waiting and fails
/// the whole operation on the first partition error.
impl<B: StorageBackend> Router<B> {
    async fn for_each_partition<T, F, Fut>(
        &self,
        timeout: Duration,
        f: F,
    ) -> Result<Vec<T>, RouterError>
    where
        F: Fn(PartitionId) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let calls = self
            .partitions
            .all_partitions()
            .into_iter()
            .map(|partition| {
                let call = f(partition);
                async move {
                    let sent = tokio::time::timeout(timeout, call).await;
                    let outcome = match sent {
                        Ok(outcome) => outcome,
                        Err(_) => Err(StorageError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    };
                    (partition, outcome)
                }
            })
            .collect::<Vec<_>>();

        let mut values = Vec::with_capacity(calls.len());
        for (partition, outcome) in futures::future::join_all(calls).await {
            values.push(outcome.map_err(|e| RouterError::from_partition(partition, e))?);
        }
        Ok(values)
    }
}
