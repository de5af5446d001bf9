//! Version-tagged key hash functions.
//!
//! Servers announce the hash function they use with a single version byte.
//! The factory maps that byte to a hasher and to the layout the accompanying
//! update uses (hash wheel positions or owners per segment).

use super::consistent::ConsistentHash;
use crate::error::{Error, Result};
use crate::types::Endpoint;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::{XxHash32, XxHash64};

/// Legacy hash wheel, 32-bit xxHash.
pub const HASH_VERSION_WHEEL_V1: u8 = 1;

/// Legacy hash wheel, 64-bit xxHash folded to 31 bits.
pub const HASH_VERSION_WHEEL_V2: u8 = 2;

/// Owners per segment, 64-bit xxHash folded to 31 bits.
pub const HASH_VERSION_SEGMENTED: u8 = 3;

/// Maps key bytes to a non-negative 31-bit hash.
pub trait KeyHasher: Send + Sync + fmt::Debug {
    fn hash(&self, key: &[u8]) -> u32;
}

/// 32-bit xxHash.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxHash32Hasher {
    seed: u32,
}

impl XxHash32Hasher {
    pub fn with_seed(seed: u32) -> Self {
        Self { seed }
    }
}

impl KeyHasher for XxHash32Hasher {
    fn hash(&self, key: &[u8]) -> u32 {
        let mut hasher = XxHash32::with_seed(self.seed);
        hasher.write(key);
        (hasher.finish() as u32) & 0x7FFF_FFFF
    }
}

/// 64-bit xxHash, folded into 31 bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxHash64Hasher {
    seed: u64,
}

impl XxHash64Hasher {
    pub fn with_seed(seed: u64) -> Self {
        Self { seed }
    }
}

impl KeyHasher for XxHash64Hasher {
    fn hash(&self, key: &[u8]) -> u32 {
        let mut hasher = XxHash64::with_seed(self.seed);
        hasher.write(key);
        let h = hasher.finish();
        ((h ^ (h >> 32)) as u32) & 0x7FFF_FFFF
    }
}

/// Shape of the ownership data a hash version is delivered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashLayout {
    /// `server -> positions on a hash wheel`.
    Wheel,
    /// `segment -> ordered owners`.
    Segmented,
}

/// A hasher bound to its version tag and layout.
#[derive(Debug, Clone)]
pub struct HashFunction {
    version: u8,
    layout: HashLayout,
    hasher: Arc<dyn KeyHasher>,
}

impl HashFunction {
    pub fn new(version: u8, layout: HashLayout, hasher: Arc<dyn KeyHasher>) -> Self {
        Self {
            version,
            layout,
            hasher,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn layout(&self) -> HashLayout {
        self.layout
    }

    /// Hash key bytes.
    pub fn hash(&self, key: &[u8]) -> u32 {
        self.hasher.hash(key)
    }
}

/// Registry of hash functions keyed by version byte.
#[derive(Debug)]
pub struct ConsistentHashFactory {
    functions: RwLock<HashMap<u8, HashFunction>>,
}

impl Default for ConsistentHashFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsistentHashFactory {
    /// Create a factory with the built-in versions registered.
    pub fn new() -> Self {
        let factory = Self {
            functions: RwLock::new(HashMap::new()),
        };
        factory.register(
            HASH_VERSION_WHEEL_V1,
            HashLayout::Wheel,
            Arc::new(XxHash32Hasher::default()),
        );
        factory.register(
            HASH_VERSION_WHEEL_V2,
            HashLayout::Wheel,
            Arc::new(XxHash64Hasher::default()),
        );
        factory.register(
            HASH_VERSION_SEGMENTED,
            HashLayout::Segmented,
            Arc::new(XxHash64Hasher::default()),
        );
        factory
    }

    /// Register (or replace) the hasher for a version byte.
    pub fn register(&self, version: u8, layout: HashLayout, hasher: Arc<dyn KeyHasher>) {
        self.functions
            .write()
            .insert(version, HashFunction::new(version, layout, hasher));
    }

    /// Look up the function for a version byte.
    pub fn function(&self, version: u8) -> Result<HashFunction> {
        self.functions
            .read()
            .get(&version)
            .cloned()
            .ok_or_else(|| Error::protocol(None, format!("unknown hash function version {}", version)))
    }

    /// Build a consistent hash from `segment -> owners`.
    pub fn segmented(
        &self,
        version: u8,
        segment_owners: Vec<Vec<Endpoint>>,
        num_segments: u32,
    ) -> Result<ConsistentHash> {
        let function = self.expect_layout(version, HashLayout::Segmented)?;
        ConsistentHash::segmented(function, segment_owners, num_segments)
    }

    /// Build a consistent hash from the legacy `server -> positions` form.
    pub fn legacy(
        &self,
        version: u8,
        servers_to_hash: &[(Endpoint, Vec<u32>)],
        num_key_owners: u32,
        hash_space: u32,
    ) -> Result<ConsistentHash> {
        let function = self.expect_layout(version, HashLayout::Wheel)?;
        ConsistentHash::legacy(function, servers_to_hash, num_key_owners, hash_space)
    }

    fn expect_layout(&self, version: u8, layout: HashLayout) -> Result<HashFunction> {
        let function = self.function(version)?;
        if function.layout() != layout {
            return Err(Error::protocol(
                None,
                format!(
                    "hash function version {} uses {:?} layout, update carried {:?}",
                    version,
                    function.layout(),
                    layout
                ),
            ));
        }
        Ok(function)
    }
}
