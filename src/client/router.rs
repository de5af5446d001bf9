//! Topology-aware transport routing.
//!
//! Picks the server for a cache operation from the current topology, leases a
//! transport to it from the pool, and applies topology updates pushed by
//! servers.

use super::balancer::RoundRobinBalancer;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::hash::{ConsistentHash, ConsistentHashFactory};
use crate::metrics::{inc, PoolMetricsSnapshot, RouterMetrics, RouterMetricsSnapshot};
use crate::pool::{ConnectionPool, Connector, EndpointStats, TcpConnector, Transport};
use crate::topology::{
    CacheTopologyInfo, ClusterView, HashUpdate, ServersDelta, TopologyEvent, TopologyRegistry,
    TopologyUpdate,
};
use crate::types::{Endpoint, TopologyId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Routes cache operations to servers.
///
/// # Locking Strategy
///
/// ## Read path (`transport`, `transport_for_key`)
/// 1. Load the active `ClusterView` and the cache's `CacheTopology` snapshot.
///    Both are `ArcSwap` loads, no locks.
/// 2. Order candidates: live owners of the key's segment, then every other
///    live server round-robin. Servers in `failed` are skipped.
/// 3. Borrow from the pool, which only locks the endpoint's idle queue.
///
/// ## Write path (topology updates)
/// - Each cache has a writer mutex. An update is installed only if its
///   topology id is strictly newer, then published with a single store.
/// - A cluster switch replaces the whole view. Updates read off a transport
///   leased under an older view are discarded.
pub struct Router {
    config: ClientConfig,
    pool: ConnectionPool,
    registry: TopologyRegistry,
    hash_factory: ConsistentHashFactory,
    balancer: RoundRobinBalancer,
    metrics: RouterMetrics,
}

impl Router {
    /// Create a router connecting over TCP.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connector = Arc::new(TcpConnector::from_config(&config));
        Self::with_connector(config, connector)
    }

    /// Create a router with a custom connector.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(&config, connector);
        let registry = TopologyRegistry::new(config.clusters())?;

        info!(
            servers = config.servers.len(),
            failover_clusters = config.failover_clusters.len(),
            "Router created"
        );

        Ok(Self {
            config,
            pool,
            registry,
            hash_factory: ConsistentHashFactory::new(),
            balancer: RoundRobinBalancer::new(),
            metrics: RouterMetrics::default(),
        })
    }

    /// Lease a transport to any live server of the cache.
    pub async fn transport(&self, failed: &HashSet<Endpoint>, cache: &str) -> Result<Transport> {
        self.lease(None, failed, cache, &mut Vec::new()).await
    }

    /// Lease a transport to the owner of `key`.
    ///
    /// Tries the live owners of the key's segment in order, then falls back
    /// to any other live server.
    pub async fn transport_for_key(
        &self,
        key: &[u8],
        failed: &HashSet<Endpoint>,
        cache: &str,
    ) -> Result<Transport> {
        self.lease(Some(key), failed, cache, &mut Vec::new()).await
    }

    /// Lease a transport, recording in `unreachable` every candidate whose
    /// connection attempt failed. Exhausted pools are not recorded.
    pub(crate) async fn lease(
        &self,
        key: Option<&[u8]>,
        failed: &HashSet<Endpoint>,
        cache: &str,
        unreachable: &mut Vec<Endpoint>,
    ) -> Result<Transport> {
        let view = self.registry.view();
        let topology = view.topology(cache);
        let Some(key) = key else {
            let candidates = self.balancer.order(topology.servers(), failed);
            return self.borrow_first(&view, cache, candidates, unreachable).await;
        };

        let owners = topology.live_owners_for_key(key);
        let primary = owners.first().cloned();
        let mut candidates: Vec<Endpoint> = owners
            .into_iter()
            .filter(|owner| !failed.contains(owner))
            .collect();
        for server in self.balancer.order(topology.servers(), failed) {
            if !candidates.contains(&server) {
                candidates.push(server);
            }
        }

        if primary.is_some() && candidates.first() != primary.as_ref() {
            inc(&self.metrics.owner_fallbacks);
            debug!(cache, primary = ?primary, "Primary owner unavailable, falling back");
        }
        self.borrow_first(&view, cache, candidates, unreachable).await
    }

    /// Lease a transport to a specific server.
    pub async fn address_transport(&self, endpoint: &Endpoint) -> Result<Transport> {
        let mut transport = self.pool.borrow(endpoint).await?;
        transport.set_cluster_epoch(self.registry.view().epoch());
        inc(&self.metrics.routed);
        Ok(transport)
    }

    async fn borrow_first(
        &self,
        view: &ClusterView,
        cache: &str,
        candidates: Vec<Endpoint>,
        unreachable: &mut Vec<Endpoint>,
    ) -> Result<Transport> {
        let mut last_error = None;
        for endpoint in candidates {
            match self.pool.borrow(&endpoint).await {
                Ok(mut transport) => {
                    transport.set_cluster_epoch(view.epoch());
                    inc(&self.metrics.routed);
                    debug!(cache, %endpoint, "Routed");
                    return Ok(transport);
                }
                Err(e @ Error::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!(cache, %endpoint, error = %e, "Unable to borrow transport");
                    if matches!(e, Error::TransientEndpoint { .. }) {
                        unreachable.push(endpoint);
                    }
                    last_error = Some(e);
                }
            }
        }

        let failures = self.registry.record_failure(cache);
        warn!(cache, cluster = view.name(), failures, "No server could be reached");
        Err(last_error.unwrap_or_else(|| Error::NoReachableServers(cache.to_string())))
    }

    /// Return a transport to the pool.
    pub fn release_transport(&self, transport: Transport) {
        self.pool.release(transport);
    }

    /// Discard a transport whose connection is no longer usable.
    pub fn invalidate_transport(&self, endpoint: &Endpoint, transport: Transport) {
        debug!(%endpoint, "Invalidating transport");
        self.pool.invalidate(transport);
    }

    /// Replace the live servers of a cache.
    ///
    /// Idle connections to servers that are gone are closed. New servers are
    /// connected lazily. `quiet` suppresses the `ServersChanged` event.
    pub fn update_servers(&self, servers: Vec<Endpoint>, cache: &str, quiet: bool) {
        if servers.is_empty() {
            warn!(cache, "Ignoring empty server list");
            return;
        }
        let view = self.registry.view();
        let delta = view.update_servers(cache, servers);
        self.after_servers_changed(&view, cache, delta, quiet);
    }

    /// Install a segmented hash if `topology_id` is newer than the stored one.
    pub fn update_hash_function(
        &self,
        topology_id: TopologyId,
        segment_owners: Vec<Vec<Endpoint>>,
        num_segments: u32,
        version: u8,
        cache: &str,
    ) -> Result<bool> {
        let hash = self
            .hash_factory
            .segmented(version, segment_owners, num_segments)?;
        Ok(self.install_hash(&self.registry.view(), cache, topology_id, hash))
    }

    /// Install a hash from the legacy `server -> positions` form.
    pub fn update_hash_function_legacy(
        &self,
        topology_id: TopologyId,
        servers_to_hash: &[(Endpoint, Vec<u32>)],
        num_key_owners: u32,
        version: u8,
        hash_space: u32,
        cache: &str,
    ) -> Result<bool> {
        let hash = self
            .hash_factory
            .legacy(version, servers_to_hash, num_key_owners, hash_space)?;
        Ok(self.install_hash(&self.registry.view(), cache, topology_id, hash))
    }

    fn install_hash(
        &self,
        view: &ClusterView,
        cache: &str,
        topology_id: TopologyId,
        hash: ConsistentHash,
    ) -> bool {
        match view.install(cache, topology_id, None, Some(Arc::new(hash))) {
            Some(_) => {
                self.installed(cache, topology_id);
                true
            }
            None => {
                inc(&self.metrics.updates_discarded);
                false
            }
        }
    }

    /// Apply a topology update read off `transport`.
    ///
    /// Discarded when the transport was leased before a cluster switch, or
    /// when the update is not newer than the installed topology.
    pub fn apply_update(&self, transport: &Transport, update: TopologyUpdate) -> Result<bool> {
        let view = self.registry.view();
        if transport.cluster_epoch() != view.epoch() {
            inc(&self.metrics.updates_discarded);
            debug!(
                cache = %update.cache_name,
                topology_id = update.topology_id,
                leased_epoch = transport.cluster_epoch(),
                epoch = view.epoch(),
                "Discarding update from previous cluster"
            );
            return Ok(false);
        }

        let cache = update.cache_name.as_str();
        if update.topology_id <= view.topology(cache).topology_id() {
            inc(&self.metrics.updates_discarded);
            debug!(cache, topology_id = update.topology_id, "Discarding stale update");
            return Ok(false);
        }

        let hash = match update.hash {
            Some(HashUpdate::Segmented {
                version,
                num_segments,
                segment_owners,
            }) => Some(
                self.hash_factory
                    .segmented(version, segment_owners, num_segments)?,
            ),
            Some(HashUpdate::Legacy {
                version,
                num_key_owners,
                hash_space,
                servers_to_hash,
            }) => Some(self.hash_factory.legacy(
                version,
                &servers_to_hash,
                num_key_owners,
                hash_space,
            )?),
            None => None,
        };
        let servers = (!update.servers.is_empty()).then_some(update.servers);

        match view.install(cache, update.topology_id, servers, hash.map(Arc::new)) {
            Some(delta) => {
                self.after_servers_changed(&view, cache, delta, false);
                self.installed(cache, update.topology_id);
                Ok(true)
            }
            None => {
                inc(&self.metrics.updates_discarded);
                Ok(false)
            }
        }
    }

    fn installed(&self, cache: &str, topology_id: TopologyId) {
        inc(&self.metrics.updates_accepted);
        info!(cache, topology_id, "Installed topology");
        self.registry.publish(TopologyEvent::TopologyInstalled {
            cache: cache.to_string(),
            topology_id,
        });
    }

    fn after_servers_changed(&self, view: &ClusterView, cache: &str, delta: ServersDelta, quiet: bool) {
        if delta.is_empty() {
            return;
        }

        let still_used = view.all_servers();
        for endpoint in delta.removed.iter().filter(|e| !still_used.contains(*e)) {
            self.pool.drain(endpoint);
        }

        info!(
            cache,
            added = ?delta.added,
            removed = ?delta.removed,
            "Servers changed"
        );
        if !quiet {
            self.registry.publish(TopologyEvent::ServersChanged {
                cache: cache.to_string(),
                added: delta.added,
                removed: delta.removed,
            });
        }
    }

    /// Topology id, segment count and live owners of a cache.
    pub fn cache_topology_info(&self, cache: &str) -> CacheTopologyInfo {
        self.registry.view().topology(cache).info()
    }

    pub fn consistent_hash(&self, cache: &str) -> Option<Arc<ConsistentHash>> {
        self.registry.view().topology(cache).hash().cloned()
    }

    pub fn topology_id(&self, cache: &str) -> TopologyId {
        self.registry.view().topology(cache).topology_id()
    }

    /// Live servers of a cache in the active cluster.
    pub fn servers(&self, cache: &str) -> Vec<Endpoint> {
        self.registry.view().topology(cache).servers().to_vec()
    }

    /// Force a cache back to its bootstrap servers and topology 0.
    pub fn reset(&self, cache: &str) {
        self.registry.view().reset(cache);
        info!(cache, "Topology reset");
        self.registry.publish(TopologyEvent::Reset {
            cache: cache.to_string(),
        });
    }

    /// Move to the next failover cluster.
    pub fn try_switch_cluster(&self, cache: &str) -> bool {
        let Some((old, new)) = self.registry.try_switch(cache) else {
            return false;
        };

        let keep = new.all_servers();
        for endpoint in old.all_servers().difference(&keep) {
            self.pool.drain(endpoint);
        }
        inc(&self.metrics.cluster_switches);
        true
    }

    /// Name of the active cluster.
    pub fn cluster_name(&self) -> String {
        self.registry.view().name().to_string()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.registry.subscribe()
    }

    /// Cluster-level routing failures since the last success.
    pub fn consecutive_failures(&self, cache: &str) -> u32 {
        self.registry.consecutive_failures(cache)
    }

    pub(crate) fn record_success(&self, cache: &str) {
        self.registry.reset_failures(cache);
    }

    pub(crate) fn record_retry(&self) {
        inc(&self.metrics.retries);
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn hash_factory(&self) -> &ConsistentHashFactory {
        &self.hash_factory
    }

    pub fn metrics(&self) -> RouterMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn pool_metrics(&self) -> PoolMetricsSnapshot {
        self.pool.metrics()
    }

    pub fn pool_stats(&self, endpoint: &Endpoint) -> Option<EndpointStats> {
        self.pool.stats(endpoint)
    }

    /// Close all pooled connections. Later borrows fail with `Cancelled`.
    pub fn shutdown(&self) {
        info!("Router shutting down");
        self.pool.shutdown();
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("cluster", &self.cluster_name())
            .field("pool", &self.pool)
            .finish()
    }
}
