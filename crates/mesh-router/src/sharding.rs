//! Sharding metadata: key definitions, sharding functions, and the
//! single-flight metadata cache.
//!
//! A space may declare a custom sharding key (a subset of its fields) and a
//! custom sharding function; both default to the primary key hashed with
//! crc32. The definitions live in cluster metadata and are expensive to
//! fetch, so the cache fetches them once per process and only refetches
//! after an explicit invalidation.

use crate::error::RouterError;
use crate::storage::StorageBackend;
use dashmap::DashMap;
use mesh_core::{BucketId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// Metadata Types
// =============================================================================

/// Sharding declaration of one space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceSharding {
    /// Ordered field names of the sharding key. `None` means the primary
    /// key is the sharding key.
    pub key_fields: Option<Vec<String>>,
    /// Name of a registered sharding function. `None` means the built-in
    /// crc32 hash.
    pub func: Option<String>,
}

/// The cluster-wide sharding metadata map, one round trip to fetch.
///
/// Spaces absent from the map shard by primary key with the default
/// function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardingMetadata {
    /// Per-space declarations, keyed by space name.
    pub spaces: HashMap<String, SpaceSharding>,
}

impl ShardingMetadata {
    /// Returns the declaration for a space, if any.
    pub fn space(&self, name: &str) -> Option<&SpaceSharding> {
        self.spaces.get(name)
    }
}

// =============================================================================
// Sharding Functions
// =============================================================================

/// A sharding function: key values in, bucket id out.
///
/// Implementations must be deterministic and stable across processes -
/// every router in the cluster must agree on the bucket of a key.
pub type ShardingFn = Arc<dyn Fn(&[Value], u32) -> BucketId + Send + Sync>;

/// The built-in sharding function: crc32 over a canonical key encoding,
/// modulo the bucket count.
pub fn default_bucket_for_key(key: &[Value], bucket_count: u32) -> BucketId {
    let mut hasher = crc32fast::Hasher::new();
    for value in key {
        match value {
            Value::Null => hasher.update(&[0]),
            Value::Bool(b) => hasher.update(&[1, *b as u8]),
            Value::Int(i) => {
                hasher.update(&[2]);
                hasher.update(&i.to_le_bytes());
            }
            Value::Float(f) => {
                hasher.update(&[3]);
                hasher.update(&f.to_bits().to_le_bytes());
            }
            Value::Str(s) => {
                hasher.update(&[4]);
                hasher.update(&(s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
    }
    BucketId::new(hasher.finalize() % bucket_count.max(1))
}

/// Process-local registry of named sharding functions.
///
/// Cluster metadata refers to custom functions by name; the embedding
/// process registers the matching implementations here.
#[derive(Default)]
pub struct ShardingFnRegistry {
    fns: DashMap<String, ShardingFn>,
}

impl ShardingFnRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function under a name, replacing any previous one.
    pub fn register<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value], u32) -> BucketId + Send + Sync + 'static,
    {
        self.fns.insert(name.into(), Arc::new(f));
    }

    /// Looks up a registered function.
    pub fn get(&self, name: &str) -> Option<ShardingFn> {
        self.fns.get(name).map(|f| Arc::clone(&f))
    }

    /// Resolves a metadata declaration to a callable function.
    ///
    /// `None` resolves to the built-in hash; a named function must have
    /// been registered.
    pub fn resolve(&self, func: Option<&str>) -> Result<ShardingFn, RouterError> {
        match func {
            None => Ok(Arc::new(default_bucket_for_key)),
            Some(name) => self.get(name).ok_or_else(|| {
                RouterError::Validation(format!(
                    "sharding function `{}` is not registered in this process",
                    name
                ))
            }),
        }
    }
}

impl std::fmt::Debug for ShardingFnRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardingFnRegistry")
            .field("registered", &self.fns.len())
            .finish()
    }
}

// =============================================================================
// Single-flight Metadata Cache
// =============================================================================

/// What an in-flight fetch publishes to its waiters.
type FlightSlot = Option<Result<Arc<ShardingMetadata>, RouterError>>;

/// Process-wide cache of the sharding metadata map.
///
/// The map is fetched at most once per epoch: the first caller performs
/// the cluster round trip under its own deadline and publishes the outcome
/// - success or error - to every caller that arrived while the fetch was
/// in flight. Waiters are bounded by their *own* timeout, independent of
/// the fetch's deadline; a late joiner may time out while the fetch
/// continues. A failed fetch leaves the cache unpopulated, so the next
/// caller after the failure starts a fresh fetch. Only
/// [`ShardingCache::invalidate`] drops a populated cache.
#[derive(Debug, Default)]
pub struct ShardingCache {
    metadata: RwLock<Option<Arc<ShardingMetadata>>>,
    flight: Mutex<Option<watch::Receiver<FlightSlot>>>,
}

enum Role {
    Fetcher(watch::Sender<FlightSlot>),
    Waiter(watch::Receiver<FlightSlot>),
}

impl ShardingCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when the metadata map is populated.
    pub fn is_populated(&self) -> bool {
        self.metadata.read().unwrap().is_some()
    }

    /// Drops all cached entries. The next caller refetches.
    pub fn invalidate(&self) {
        *self.metadata.write().unwrap() = None;
    }

    /// Returns the sharding declaration of one space, fetching the
    /// metadata map first if needed.
    pub async fn sharding_for<B: StorageBackend>(
        &self,
        backend: &B,
        space: &str,
        timeout: Duration,
    ) -> Result<Option<SpaceSharding>, RouterError> {
        let metadata = self.metadata(backend, timeout).await?;
        Ok(metadata.space(space).cloned())
    }

    /// Returns the metadata map, fetching it on first use.
    ///
    /// Concurrent first-time callers share a single underlying RPC.
    pub async fn metadata<B: StorageBackend>(
        &self,
        backend: &B,
        timeout: Duration,
    ) -> Result<Arc<ShardingMetadata>, RouterError> {
        if let Some(m) = self.metadata.read().unwrap().clone() {
            return Ok(m);
        }
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let role = {
                let mut flight = self.flight.lock().unwrap();
                // Re-check under the gate: a fetch may have completed
                // while this task was queued on the lock.
                if let Some(m) = self.metadata.read().unwrap().clone() {
                    return Ok(m);
                }
                match &*flight {
                    Some(rx) => Role::Waiter(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        *flight = Some(rx);
                        Role::Fetcher(tx)
                    }
                }
            };

            match role {
                Role::Fetcher(tx) => {
                    let outcome = self.fetch(backend, timeout).await;
                    // Clear the flight before publishing so the next epoch
                    // starts fresh even if no waiter is listening.
                    *self.flight.lock().unwrap() = None;
                    let _ = tx.send(Some(outcome.clone()));
                    return outcome;
                }
                Role::Waiter(mut rx) => {
                    let remaining =
                        deadline.saturating_duration_since(tokio::time::Instant::now());
                    let published = tokio::time::timeout(remaining, async {
                        loop {
                            if let Some(result) = rx.borrow_and_update().clone() {
                                return Some(result);
                            }
                            if rx.changed().await.is_err() {
                                // Fetcher vanished without publishing.
                                return None;
                            }
                        }
                    })
                    .await;

                    match published {
                        Err(_) => {
                            return Err(RouterError::Timeout {
                                timeout_ms: timeout.as_millis() as u64,
                            })
                        }
                        Ok(Some(result)) => return result,
                        Ok(None) => continue,
                    }
                }
            }
        }
    }

    async fn fetch<B: StorageBackend>(
        &self,
        backend: &B,
        timeout: Duration,
    ) -> Result<Arc<ShardingMetadata>, RouterError> {
        let fetched =
            tokio::time::timeout(timeout, backend.fetch_sharding_metadata(timeout)).await;
        match fetched {
            Ok(Ok(map)) => {
                let map = Arc::new(map);
                *self.metadata.write().unwrap() = Some(Arc::clone(&map));
                Ok(map)
            }
            Ok(Err(e)) => Err(RouterError::MetadataFetch {
                message: e.to_string(),
            }),
            Err(_) => Err(RouterError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
