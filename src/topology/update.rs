//! Topology updates piggy-backed on server responses.

use crate::types::{Endpoint, TopologyId};
use serde::{Deserialize, Serialize};

/// A topology pushed by a server for one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyUpdate {
    pub cache_name: String,
    pub topology_id: TopologyId,
    /// Live servers. Empty means unchanged.
    pub servers: Vec<Endpoint>,
    pub hash: Option<HashUpdate>,
}

/// Ownership data in one of the two supported forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashUpdate {
    /// `segment -> ordered owners`.
    Segmented {
        version: u8,
        num_segments: u32,
        segment_owners: Vec<Vec<Endpoint>>,
    },
    /// `server -> positions` on a hash wheel.
    Legacy {
        version: u8,
        num_key_owners: u32,
        hash_space: u32,
        servers_to_hash: Vec<(Endpoint, Vec<u32>)>,
    },
}

impl TopologyUpdate {
    pub fn new(cache_name: impl Into<String>, topology_id: TopologyId) -> Self {
        Self {
            cache_name: cache_name.into(),
            topology_id,
            servers: Vec::new(),
            hash: None,
        }
    }

    pub fn with_servers(mut self, servers: Vec<Endpoint>) -> Self {
        self.servers = servers;
        self
    }

    pub fn with_segment_owners(mut self, version: u8, segment_owners: Vec<Vec<Endpoint>>) -> Self {
        self.hash = Some(HashUpdate::Segmented {
            version,
            num_segments: segment_owners.len() as u32,
            segment_owners,
        });
        self
    }

    pub fn with_legacy_hash(
        mut self,
        version: u8,
        num_key_owners: u32,
        hash_space: u32,
        servers_to_hash: Vec<(Endpoint, Vec<u32>)>,
    ) -> Self {
        self.hash = Some(HashUpdate::Legacy {
            version,
            num_key_owners,
            hash_space,
            servers_to_hash,
        });
        self
    }

    pub fn to_bytes(&self) -> crate::error::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
