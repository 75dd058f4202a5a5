//! # Mesh Router
//!
//! A distributed CRUD query router in front of a horizontally-partitioned
//! tuple store. Callers issue logical operations against a named space
//! without knowing which physical partition owns which rows.
//!
//! The router:
//! - computes and caches the sharding key and function of a space, with a
//!   single-flight metadata fetch ([`sharding`]);
//! - resolves the target partition of point operations ([`bucket`]);
//! - fans range and secondary-index reads out across partitions and
//!   merges the locally sorted partial sequences under ordering and
//!   pagination constraints ([`scatter`]);
//! - retries exactly once when a partition reports the cached schema is
//!   stale ([`retry`]);
//! - gives batch writes per-partition atomicity while tolerating partial
//!   failure across partitions ([`batch`]).
//!
//! The storage engine, partition map and stats sink are external
//! collaborators behind the [`storage::StorageBackend`],
//! [`topology::PartitionMap`] and [`stats::StatsSink`] seams;
//! [`memory::MemoryCluster`] provides an in-process implementation of the
//! first two.
//!
//! # Example
//!
//! ```
//! use mesh_core::tuple;
//! use mesh_router::config::RouterConfig;
//! use mesh_router::memory::MemoryCluster;
//! use mesh_router::router::{Router, WriteOpts};
//! use mesh_router::scatter::ReadOpts;
//! use mesh_router::schema::{FieldDef, FieldType, SpaceSchema};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), mesh_router::error::RouterError> {
//! let cluster = Arc::new(MemoryCluster::new(2, 256));
//! cluster.add_space(SpaceSchema {
//!     name: "users".into(),
//!     fields: vec![
//!         FieldDef::new("id", FieldType::Int),
//!         FieldDef::new("bucket_id", FieldType::Int).nullable(),
//!         FieldDef::new("name", FieldType::Str),
//!     ],
//!     primary_key: vec!["id".into()],
//!     indexes: vec![],
//!     bucket_field: "bucket_id".into(),
//!     version: 1,
//! });
//!
//! let router = Router::new(
//!     Arc::clone(&cluster),
//!     cluster.clone(),
//!     RouterConfig::default(),
//! );
//! router.insert("users", tuple![1i64, "ada"], &WriteOpts::new()).await?;
//! let row = router.get("users", vec![1i64.into()], &ReadOpts::new()).await?;
//! assert!(row.is_some());
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod bucket;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod retry;
pub mod router;
pub mod scatter;
pub mod schema;
pub mod sharding;
pub mod stats;
pub mod storage;
pub mod topology;

pub use error::{BatchResult, PartitionWriteError, RouterError, StorageError};
pub use router::{Object, Router, WriteOpts};
pub use scatter::{ReadOpts, TupleStream};
pub use storage::{Direction, SelectQuery, StorageBackend, StorageOpts};
pub use topology::PartitionMap;
