//! Cluster views and cluster switchover.

use super::cache::CacheTopology;
use super::events::TopologyEvent;
use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::hash::ConsistentHash;
use crate::types::{Endpoint, TopologyId};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Servers that joined or left a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServersDelta {
    pub added: Vec<Endpoint>,
    pub removed: Vec<Endpoint>,
}

impl ServersDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct CacheSlot {
    current: ArcSwap<CacheTopology>,
    // Serializes writers; readers go through `current` without locking.
    write: Mutex<()>,
}

impl CacheSlot {
    fn new(servers: Vec<Endpoint>) -> Self {
        Self {
            current: ArcSwap::from_pointee(CacheTopology::initial(servers)),
            write: Mutex::new(()),
        }
    }
}

/// Per-cache topologies against one cluster.
///
/// A view is tied to one cluster generation (`epoch`). Switching clusters
/// replaces the whole view, so writes that land on a retired view are lost.
pub struct ClusterView {
    name: String,
    index: usize,
    epoch: u64,
    initial_servers: Vec<Endpoint>,
    caches: DashMap<String, Arc<CacheSlot>>,
}

impl ClusterView {
    fn new(index: usize, epoch: u64, cluster: &ClusterConfig) -> Self {
        Self {
            name: cluster.name.clone(),
            index,
            epoch,
            initial_servers: cluster.servers.clone(),
            caches: DashMap::new(),
        }
    }

    /// Name of the cluster.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cluster generation. Bumped on every switch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn initial_servers(&self) -> &[Endpoint] {
        &self.initial_servers
    }

    fn slot(&self, cache: &str) -> Arc<CacheSlot> {
        self.caches
            .entry(cache.to_string())
            .or_insert_with(|| Arc::new(CacheSlot::new(self.initial_servers.clone())))
            .clone()
    }

    /// Current snapshot for a cache.
    pub fn topology(&self, cache: &str) -> Arc<CacheTopology> {
        self.slot(cache).current.load_full()
    }

    /// Replace the live servers of a cache, keeping its topology id and hash.
    pub fn update_servers(&self, cache: &str, servers: Vec<Endpoint>) -> ServersDelta {
        let slot = self.slot(cache);
        let _guard = slot.write.lock();
        let current = slot.current.load();

        let delta = diff(current.servers(), &servers);
        if !delta.is_empty() {
            slot.current.store(Arc::new(current.with_servers(servers)));
        }
        delta
    }

    /// Install a topology if `topology_id` is newer than the stored one.
    ///
    /// Returns the server delta when installed, `None` when discarded.
    pub fn install(
        &self,
        cache: &str,
        topology_id: TopologyId,
        servers: Option<Vec<Endpoint>>,
        hash: Option<Arc<ConsistentHash>>,
    ) -> Option<ServersDelta> {
        let slot = self.slot(cache);
        let _guard = slot.write.lock();
        let current = slot.current.load();

        if topology_id <= current.topology_id() {
            debug!(
                cache,
                topology_id,
                current = current.topology_id(),
                "Discarding stale topology"
            );
            return None;
        }

        let delta = match &servers {
            Some(servers) => diff(current.servers(), servers),
            None => ServersDelta::default(),
        };
        slot.current
            .store(Arc::new(current.advance(topology_id, servers, hash)));
        Some(delta)
    }

    /// Back to bootstrap servers and topology 0.
    pub fn reset(&self, cache: &str) {
        let slot = self.slot(cache);
        let _guard = slot.write.lock();
        slot.current
            .store(Arc::new(CacheTopology::initial(self.initial_servers.clone())));
    }

    /// Every server this view knows of, across all caches.
    pub fn all_servers(&self) -> HashSet<Endpoint> {
        let mut servers: HashSet<Endpoint> = self.initial_servers.iter().cloned().collect();
        for slot in self.caches.iter() {
            let topology = slot.current.load();
            servers.extend(topology.servers().iter().cloned());
        }
        servers
    }
}

fn diff(old: &[Endpoint], new: &[Endpoint]) -> ServersDelta {
    ServersDelta {
        added: new.iter().filter(|s| !old.contains(s)).cloned().collect(),
        removed: old.iter().filter(|s| !new.contains(s)).cloned().collect(),
    }
}

/// Owns the active [`ClusterView`] and the list of clusters to fail over to.
pub struct TopologyRegistry {
    clusters: Vec<ClusterConfig>,
    view: ArcSwap<ClusterView>,
    switch_lock: Mutex<()>,
    failures: DashMap<String, u32>,
    events: broadcast::Sender<TopologyEvent>,
}

impl TopologyRegistry {
    /// Start on the first cluster.
    pub fn new(clusters: Vec<ClusterConfig>) -> Result<Self> {
        let first = clusters
            .first()
            .ok_or_else(|| Error::Config("at least one cluster is required".into()))?;
        let view = ClusterView::new(0, 0, first);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            view: ArcSwap::from_pointee(view),
            clusters,
            switch_lock: Mutex::new(()),
            failures: DashMap::new(),
            events,
        })
    }

    /// The active view.
    pub fn view(&self) -> Arc<ClusterView> {
        self.view.load_full()
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: TopologyEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Move to the next configured cluster, wrapping around.
    ///
    /// Fails when there is no other cluster or the next one has no servers.
    /// On success returns the retired and the new view; `cache` starts from
    /// the new cluster's bootstrap servers at topology 0.
    pub fn try_switch(&self, cache: &str) -> Option<(Arc<ClusterView>, Arc<ClusterView>)> {
        let _guard = self.switch_lock.lock();
        let current = self.view.load_full();

        if self.clusters.len() <= 1 {
            debug!(cache, "No failover cluster configured");
            return None;
        }

        let next = (current.index + 1) % self.clusters.len();
        let target = &self.clusters[next];
        if target.servers.is_empty() {
            warn!(cache, cluster = %target.name, "Failover cluster has no servers");
            return None;
        }

        let view = Arc::new(ClusterView::new(next, current.epoch + 1, target));
        view.reset(cache);
        self.view.store(view.clone());
        self.failures.clear();

        info!(
            cache,
            from = %current.name,
            to = %view.name,
            epoch = view.epoch,
            "Switched cluster"
        );
        self.publish(TopologyEvent::ClusterSwitched {
            from: current.name.clone(),
            to: view.name.clone(),
            epoch: view.epoch,
        });
        Some((current, view))
    }

    /// Count one cluster-level routing failure. Returns the new count.
    pub fn record_failure(&self, cache: &str) -> u32 {
        let mut count = self.failures.entry(cache.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn reset_failures(&self, cache: &str) {
        self.failures.remove(cache);
    }

    pub fn consecutive_failures(&self, cache: &str) -> u32 {
        self.failures.get(cache).map(|c| *c).unwrap_or(0)
    }
}
