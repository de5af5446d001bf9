//! Immutable per-cache topology snapshots.

use crate::hash::ConsistentHash;
use crate::types::{Endpoint, SegmentId, TopologyId};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// What the client currently believes about one cache.
///
/// Snapshots are never mutated. Updates build a new one and swap it in, so a
/// router holding an old snapshot keeps routing against a consistent view.
#[derive(Debug, Clone)]
pub struct CacheTopology {
    topology_id: TopologyId,
    servers: Arc<Vec<Endpoint>>,
    hash: Option<Arc<ConsistentHash>>,
}

impl CacheTopology {
    /// Bootstrap topology: id 0, no hash.
    pub fn initial(servers: Vec<Endpoint>) -> Self {
        Self {
            topology_id: 0,
            servers: Arc::new(servers),
            hash: None,
        }
    }

    pub fn topology_id(&self) -> TopologyId {
        self.topology_id
    }

    /// Live servers of the cache.
    pub fn servers(&self) -> &[Endpoint] {
        &self.servers
    }

    pub fn hash(&self) -> Option<&Arc<ConsistentHash>> {
        self.hash.as_ref()
    }

    pub fn is_live(&self, endpoint: &Endpoint) -> bool {
        self.servers.contains(endpoint)
    }

    /// Same id and hash, different live servers.
    pub(crate) fn with_servers(&self, servers: Vec<Endpoint>) -> Self {
        Self {
            topology_id: self.topology_id,
            servers: Arc::new(servers),
            hash: self.hash.clone(),
        }
    }

    /// A newer topology. Missing parts are carried over from `self`.
    pub(crate) fn advance(
        &self,
        topology_id: TopologyId,
        servers: Option<Vec<Endpoint>>,
        hash: Option<Arc<ConsistentHash>>,
    ) -> Self {
        Self {
            topology_id,
            servers: servers.map(Arc::new).unwrap_or_else(|| self.servers.clone()),
            hash: hash.or_else(|| self.hash.clone()),
        }
    }

    /// Owners of the key's segment that are currently live, primary first.
    pub fn live_owners_for_key(&self, key: &[u8]) -> Vec<Endpoint> {
        match &self.hash {
            Some(hash) => hash
                .owners_for_key(key)
                .iter()
                .filter(|owner| self.is_live(owner))
                .cloned()
                .collect(),
            None => Vec::new(),
        }
    }

    /// Public summary of this snapshot.
    pub fn info(&self) -> CacheTopologyInfo {
        let segment_owners = match &self.hash {
            Some(hash) => hash
                .segment_owners()
                .into_iter()
                .map(|(segment, owners)| {
                    let live = owners.into_iter().filter(|o| self.is_live(o)).collect();
                    (segment, live)
                })
                .collect(),
            None => BTreeMap::new(),
        };

        CacheTopologyInfo {
            topology_id: self.topology_id,
            num_segments: self.hash.as_ref().map(|h| h.num_segments()),
            segment_owners,
        }
    }
}

/// Topology id, segment count and live owners of a cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTopologyInfo {
    pub topology_id: TopologyId,
    pub num_segments: Option<u32>,
    pub segment_owners: BTreeMap<SegmentId, Vec<Endpoint>>,
}

impl CacheTopologyInfo {
    /// Distinct owners across all segments.
    pub fn owners(&self) -> Vec<Endpoint> {
        let mut seen = HashSet::new();
        self.segment_owners
            .values()
            .flatten()
            .filter(|owner| seen.insert(*owner))
            .cloned()
            .collect()
    }
}
