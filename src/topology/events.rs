//! Topology change notifications.

use crate::types::{Endpoint, TopologyId};

/// Events published when the client's view of the grid changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// The live server set of a cache changed.
    ServersChanged {
        cache: String,
        added: Vec<Endpoint>,
        removed: Vec<Endpoint>,
    },

    /// A newer topology was installed for a cache.
    TopologyInstalled {
        cache: String,
        topology_id: TopologyId,
    },

    /// The client moved to another cluster.
    ClusterSwitched {
        from: String,
        to: String,
        epoch: u64,
    },

    /// A cache went back to its bootstrap servers.
    Reset { cache: String },
}

impl TopologyEvent {
    /// The cache this event is about, if it is cache specific.
    pub fn cache(&self) -> Option<&str> {
        match self {
            TopologyEvent::ServersChanged { cache, .. }
            | TopologyEvent::TopologyInstalled { cache, .. }
            | TopologyEvent::Reset { cache } => Some(cache),
            TopologyEvent::ClusterSwitched { .. } => None,
        }
    }
}
