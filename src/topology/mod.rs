//! Client-side cluster topology.
//!
//! The [`TopologyRegistry`] owns the active [`ClusterView`], which holds one
//! copy-on-write [`CacheTopology`] per cache. Readers load snapshots without
//! locking; writers install a new snapshot only when its topology id is
//! strictly greater than the stored one.

mod cache;
mod events;
mod registry;
mod update;

pub use cache::{CacheTopology, CacheTopologyInfo};
pub use events::TopologyEvent;
pub use registry::{ClusterView, ServersDelta, TopologyRegistry};
pub use update::{HashUpdate, TopologyUpdate};
