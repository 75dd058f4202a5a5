//! Bucket resolution: from a key or tuple to the routing bucket.
//!
//! Every write resolves to exactly one bucket. A caller-supplied override
//! wins over computation, but never over an id already embedded in the
//! tuple - a disagreement between the two is an error, not a silent
//! overwrite.

use crate::error::RouterError;
use crate::schema::SpaceSchema;
use crate::sharding::{ShardingFnRegistry, SpaceSharding};
use mesh_core::{BucketId, Tuple, Value};
use std::sync::Arc;

/// Computes bucket ids for keys and tuples.
#[derive(Debug, Clone)]
pub struct BucketRouter {
    registry: Arc<ShardingFnRegistry>,
    bucket_count: u32,
}

impl BucketRouter {
    /// Creates a bucket router over a function registry and the cluster's
    /// bucket count.
    pub fn new(registry: Arc<ShardingFnRegistry>, bucket_count: u32) -> Self {
        Self {
            registry,
            bucket_count,
        }
    }

    /// Number of buckets in the virtual key space.
    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Resolves a bucket for an already-extracted sharding key.
    ///
    /// An explicit override short-circuits computation.
    pub fn bucket_for_key(
        &self,
        key: &[Value],
        func: Option<&str>,
        bucket_id: Option<BucketId>,
    ) -> Result<BucketId, RouterError> {
        if let Some(id) = bucket_id {
            return Ok(id);
        }
        let f = self.registry.resolve(func)?;
        Ok(f(key, self.bucket_count))
    }

    /// Resolves a tuple's bucket and injects it into the schema's bucket
    /// slot.
    ///
    /// Resolution order: caller override, then an id already embedded in
    /// the tuple, then the sharding function over the sharding key (the
    /// primary key when the space declares none). A tuple may arrive with
    /// the bucket slot omitted entirely; the slot is inserted then.
    pub fn bucket_for_tuple(
        &self,
        tuple: &mut Tuple,
        schema: &SpaceSchema,
        sharding: Option<&SpaceSharding>,
        bucket_id: Option<BucketId>,
    ) -> Result<BucketId, RouterError> {
        let position = schema.bucket_position().ok_or_else(|| {
            RouterError::BucketFieldMissing {
                space: schema.name.clone(),
                field: schema.bucket_field.clone(),
            }
        })?;

        // The caller may submit the tuple without the bucket slot.
        if tuple.len() + 1 == schema.fields.len() && position <= tuple.len() {
            tuple.insert(position, Value::Null);
        }
        if tuple.len() != schema.fields.len() {
            return Err(RouterError::Validation(format!(
                "tuple has {} fields, space `{}` expects {}",
                tuple.len(),
                schema.name,
                schema.fields.len()
            )));
        }

        let embedded = match tuple.get(position) {
            Some(Value::Null) | None => None,
            Some(Value::Int(i)) if *i >= 0 => Some(BucketId::new(*i as u32)),
            Some(other) => {
                return Err(RouterError::Validation(format!(
                    "bucket field `{}` holds non-bucket value {}",
                    schema.bucket_field, other
                )))
            }
        };

        if let (Some(embedded), Some(requested)) = (embedded, bucket_id) {
            if embedded != requested {
                return Err(RouterError::BucketIdConflict {
                    requested,
                    embedded,
                });
            }
        }

        let resolved = match bucket_id.or(embedded) {
            Some(id) => id,
            None => {
                let key_fields = sharding
                    .and_then(|s| s.key_fields.as_ref())
                    .unwrap_or(&schema.primary_key);
                let key = schema.extract_key(tuple, key_fields)?;
                let func = sharding.and_then(|s| s.func.as_deref());
                let f = self.registry.resolve(func)?;
                f(&key, self.bucket_count)
            }
        };

        tuple.set(position, Value::Int(resolved.as_u32() as i64));
        Ok(resolved)
    }
}

// =============================================================================
// Tests
// =============================================================================
