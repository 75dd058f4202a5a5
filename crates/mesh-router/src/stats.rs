//! Statistics events emitted by the router.
//!
//! The router only *produces* observations; the sink consuming them is an
//! external collaborator injected at construction. Emission is
//! fire-and-forget and never affects an operation's return value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Success/failure tag of one completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// The operation returned a result.
    Ok,
    /// The operation returned an error.
    Error,
}

/// Sink for router observations.
pub trait StatsSink: Send + Sync {
    /// One completed public operation.
    fn observe(&self, latency: Duration, space: &str, op: &str, status: OpStatus);

    /// A request referenced a space the cluster does not know.
    fn observe_space_not_found(&self);

    /// Fetch accounting of one completed read: tuples received from
    /// partitions and tuples examined by the merge (including ones the
    /// post-filter dropped).
    fn observe_fetch(&self, tuples_fetched: u64, tuples_looked_up: u64, space: &str);

    /// A read was planned as a full fan-out (map-reduce) over all
    /// partitions.
    fn observe_map_reduce(&self, count: u64, space: &str);
}

/// A sink that drops every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsSink for NoopStats {
    fn observe(&self, _latency: Duration, _space: &str, _op: &str, _status: OpStatus) {}
    fn observe_space_not_found(&self) {}
    fn observe_fetch(&self, _tuples_fetched: u64, _tuples_looked_up: u64, _space: &str) {}
    fn observe_map_reduce(&self, _count: u64, _space: &str) {}
}

/// A sink that forwards observations to structured logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStats;

impl StatsSink for LogStats {
    fn observe(&self, latency: Duration, space: &str, op: &str, status: OpStatus) {
        tracing::debug!(
            space,
            op,
            status = ?status,
            latency_us = latency.as_micros() as u64,
            "operation finished"
        );
    }

    fn observe_space_not_found(&self) {
        tracing::debug!("request referenced an unknown space");
    }

    fn observe_fetch(&self, tuples_fetched: u64, tuples_looked_up: u64, space: &str) {
        tracing::debug!(space, tuples_fetched, tuples_looked_up, "read fetch accounting");
    }

    fn observe_map_reduce(&self, count: u64, space: &str) {
        tracing::debug!(space, count, "read planned as map-reduce");
    }
}

/// A sink that records everything it sees. Intended for tests and local
/// inspection.
#[derive(Debug, Default)]
pub struct RecordingStats {
    map_reduces: AtomicU64,
    tuples_fetched: AtomicU64,
    tuples_looked_up: AtomicU64,
    space_not_found: AtomicU64,
    observations: Mutex<Vec<(String, String, OpStatus)>>,
}

impl RecordingStats {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total map-reduce plans observed.
    pub fn map_reduces(&self) -> u64 {
        self.map_reduces.load(Ordering::SeqCst)
    }

    /// Total tuples fetched from partitions.
    pub fn tuples_fetched(&self) -> u64 {
        self.tuples_fetched.load(Ordering::SeqCst)
    }

    /// Total tuples examined by merges.
    pub fn tuples_looked_up(&self) -> u64 {
        self.tuples_looked_up.load(Ordering::SeqCst)
    }

    /// Total unknown-space observations.
    pub fn space_not_found(&self) -> u64 {
        self.space_not_found.load(Ordering::SeqCst)
    }

    /// Completed operations as `(space, op, status)` triples.
    pub fn operations(&self) -> Vec<(String, String, OpStatus)> {
        self.observations.lock().unwrap().clone()
    }
}

impl StatsSink for RecordingStats {
    fn observe(&self, _latency: Duration, space: &str, op: &str, status: OpStatus) {
        self.observations
            .lock()
            .unwrap()
            .push((space.to_string(), op.to_string(), status));
    }

    fn observe_space_not_found(&self) {
        self.space_not_found.fetch_add(1, Ordering::SeqCst);
    }

    fn observe_fetch(&self, tuples_fetched: u64, tuples_looked_up: u64, _space: &str) {
        self.tuples_fetched.fetch_add(tuples_fetched, Ordering::SeqCst);
        self.tuples_looked_up
            .fetch_add(tuples_looked_up, Ordering::SeqCst);
    }

    fn observe_map_reduce(&self, count: u64, _space: &str) {
        self.map_reduces.fetch_add(count, Ordering::SeqCst);
    }
}
