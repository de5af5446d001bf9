//! Consistent hashing for key routing.
//!
//! A [`ConsistentHash`] maps key bytes to a segment and a segment to an
//! ordered list of owners, the first being the primary. Hashes are built by a
//! [`ConsistentHashFactory`] from either of the two update forms a server may
//! push:
//!
//! ```text
//! modern:  segment  -> [owner, owner, ...]     (version 3)
//! legacy:  server   -> {position, position}    (versions 1, 2)
//! ```
//!
//! Both produce the same type, so routing code never branches on version.

mod consistent;
mod function;

pub use consistent::ConsistentHash;
pub use function::{
    ConsistentHashFactory, HashFunction, HashLayout, KeyHasher, XxHash32Hasher, XxHash64Hasher,
    HASH_VERSION_SEGMENTED, HASH_VERSION_WHEEL_V1, HASH_VERSION_WHEEL_V2,
};
