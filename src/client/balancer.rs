//! Round-robin server selection.

use crate::types::Endpoint;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Rotates the starting server on every call.
///
/// The start index is randomized so that many clients created at once do
/// not all hit the first configured server.
#[derive(Debug)]
pub struct RoundRobinBalancer {
    next: AtomicUsize,
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            next: AtomicUsize::new(rand::rng().random_range(0..1024)),
        }
    }

    /// All servers not in `failed`, starting at the next round-robin slot.
    pub fn order(&self, servers: &[Endpoint], failed: &HashSet<Endpoint>) -> Vec<Endpoint> {
        if servers.is_empty() {
            return Vec::new();
        }
        let start = self.next.fetch_add(1, Ordering::Relaxed) % servers.len();
        servers
            .iter()
            .cycle()
            .skip(start)
            .take(servers.len())
            .filter(|server| !failed.contains(*server))
            .cloned()
            .collect()
    }
}
