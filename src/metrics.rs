//! Lightweight operational counters.
//!
//! Each component owns one of these structs and bumps its counters with
//! relaxed atomics. `snapshot()` produces a plain copy for inspection.

use std::sync::atomic::{AtomicU64, Ordering};

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Connection pool counters.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub connect_failures: AtomicU64,
    pub borrows: AtomicU64,
    pub exhausted: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMetricsSnapshot {
    pub connections_created: u64,
    pub connections_closed: u64,
    pub connect_failures: u64,
    pub borrows: u64,
    pub exhausted: u64,
}

impl PoolMetrics {
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        PoolMetricsSnapshot {
            connections_created: load(&self.connections_created),
            connections_closed: load(&self.connections_closed),
            connect_failures: load(&self.connect_failures),
            borrows: load(&self.borrows),
            exhausted: load(&self.exhausted),
        }
    }
}

/// Router and retry driver counters.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    /// Transports handed out to callers.
    pub routed: AtomicU64,
    /// Key routings that could not use the primary owner.
    pub owner_fallbacks: AtomicU64,
    /// Operation attempts reissued after a retryable failure.
    pub retries: AtomicU64,
    /// Successful cluster switches.
    pub cluster_switches: AtomicU64,
    /// Topology updates installed.
    pub updates_accepted: AtomicU64,
    /// Topology updates dropped as stale or from a retired cluster.
    pub updates_discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterMetricsSnapshot {
    pub routed: u64,
    pub owner_fallbacks: u64,
    pub retries: u64,
    pub cluster_switches: u64,
    pub updates_accepted: u64,
    pub updates_discarded: u64,
}

impl RouterMetrics {
    pub fn snapshot(&self) -> RouterMetricsSnapshot {
        RouterMetricsSnapshot {
            routed: load(&self.routed),
            owner_fallbacks: load(&self.owner_fallbacks),
            retries: load(&self.retries),
            cluster_switches: load(&self.cluster_switches),
            updates_accepted: load(&self.updates_accepted),
            updates_discarded: load(&self.updates_discarded),
        }
    }
}

/// Inbound dispatcher counters.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    pub received: AtomicU64,
    pub rejected: AtomicU64,
    /// Commands that had to wait on a ready action or topology.
    pub parked: AtomicU64,
    pub executed: AtomicU64,
    pub failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherMetricsSnapshot {
    pub received: u64,
    pub rejected: u64,
    pub parked: u64,
    pub executed: u64,
    pub failed: u64,
}

impl DispatcherMetrics {
    pub fn snapshot(&self) -> DispatcherMetricsSnapshot {
        DispatcherMetricsSnapshot {
            received: load(&self.received),
            rejected: load(&self.rejected),
            parked: load(&self.parked),
            executed: load(&self.executed),
            failed: load(&self.failed),
        }
    }
}

/// Increment a counter by one.
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
