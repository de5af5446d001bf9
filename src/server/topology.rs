//! Server-side record of installed topologies for one cache.

use crate::types::TopologyId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Callback fired on every topology change.
pub type TopologyListener = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`TopologyTracker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Tracks the installed topology id and the topology for which transaction
/// data has been received. Both only move forward.
pub struct TopologyTracker {
    cache_name: String,
    installed: AtomicI32,
    tx_data_received: AtomicI32,
    stopped: AtomicBool,
    listeners: Mutex<HashMap<u64, TopologyListener>>,
    next_subscription: AtomicU64,
}

impl TopologyTracker {
    pub fn new(cache_name: impl Into<String>, initial: TopologyId) -> Self {
        Self {
            cache_name: cache_name.into(),
            installed: AtomicI32::new(initial),
            tx_data_received: AtomicI32::new(initial),
            stopped: AtomicBool::new(false),
            listeners: Mutex::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn installed(&self) -> TopologyId {
        self.installed.load(Ordering::Acquire)
    }

    pub fn tx_data_received(&self) -> TopologyId {
        self.tx_data_received.load(Ordering::Acquire)
    }

    /// Record a newly installed topology. Returns false if not newer.
    pub fn install(&self, topology_id: TopologyId) -> bool {
        let previous = self.installed.fetch_max(topology_id, Ordering::AcqRel);
        if topology_id <= previous {
            return false;
        }
        info!(cache = %self.cache_name, topology_id, "Topology installed");
        self.notify_all();
        true
    }

    /// Record that transaction data for `topology_id` is available.
    pub fn mark_tx_data_received(&self, topology_id: TopologyId) -> bool {
        let previous = self.tx_data_received.fetch_max(topology_id, Ordering::AcqRel);
        if topology_id <= previous {
            return false;
        }
        debug!(cache = %self.cache_name, topology_id, "Transaction data received");
        self.notify_all();
        true
    }

    /// Install a topology together with its transaction data.
    pub fn install_with_tx_data(&self, topology_id: TopologyId) {
        self.install(topology_id);
        self.mark_tx_data_received(topology_id);
    }

    pub fn subscribe(&self, listener: TopologyListener) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.lock().remove(&id.0);
    }

    /// Mark the cache as stopping and wake every subscriber.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            info!(cache = %self.cache_name, "Topology tracker stopped");
            self.notify_all();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn notify_all(&self) {
        let listeners: Vec<TopologyListener> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener();
        }
    }
}

impl std::fmt::Debug for TopologyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyTracker")
            .field("cache_name", &self.cache_name)
            .field("installed", &self.installed())
            .field("tx_data_received", &self.tx_data_received())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
