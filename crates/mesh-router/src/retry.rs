//! One-shot recovery from stale schema caches.
//!
//! A partition that observes a schema change ahead of the router rejects
//! requests with a tagged stale-schema error kind. The combinator here
//! drops the process-local schema and sharding caches for the space and
//! re-runs the operation exactly once; a second failure is returned
//! verbatim. The single retry bounds retry storms under concurrent schema
//! change. Transient-network retries are the transport's job, not ours.

use crate::error::RouterError;
use crate::schema::SchemaCache;
use crate::sharding::ShardingCache;
use std::future::Future;

/// Runs `op`; on a stale-schema error, invalidates the caches for `space`
/// and re-runs it once.
pub async fn with_schema_retry<T, F, Fut>(
    schemas: &SchemaCache,
    sharding: &ShardingCache,
    space: &str,
    mut op: F,
) -> Result<T, RouterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RouterError>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(e) if e.is_schema_stale() => {
            tracing::debug!(space, error = %e, "stale schema reported, reloading caches");
            schemas.invalidate(space);
            sharding.invalidate();
            op().await
        }
        Err(e) => Err(e),
    }
}

// =============================================================================
// Tests
// =============================================================================
