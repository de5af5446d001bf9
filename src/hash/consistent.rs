//! Consistent hash built from server-pushed ownership data.

use super::function::HashFunction;
use crate::error::{Error, Result};
use crate::types::{Endpoint, SegmentId};
use std::collections::{BTreeMap, HashSet};

/// Immutable mapping from keys to segments and from segments to owners.
///
/// The modern form carries the owners of every segment. The legacy form
/// carries positions on a hash wheel of size `hash_space`; each advertised
/// position acts as a segment whose id is the position itself.
#[derive(Debug, Clone)]
pub struct ConsistentHash {
    function: HashFunction,
    layout: Layout,
}

#[derive(Debug, Clone)]
enum Layout {
    Segmented {
        owners: Vec<Vec<Endpoint>>,
    },
    Wheel {
        positions: BTreeMap<u32, Vec<Endpoint>>,
        hash_space: u32,
        num_key_owners: u32,
    },
}

impl ConsistentHash {
    /// Build from `segment -> ordered owners`. `owners[s][0]` is the primary.
    pub fn segmented(
        function: HashFunction,
        segment_owners: Vec<Vec<Endpoint>>,
        num_segments: u32,
    ) -> Result<Self> {
        if num_segments == 0 {
            return Err(Error::protocol(None, "number of segments must be positive"));
        }
        if segment_owners.len() != num_segments as usize {
            return Err(Error::protocol(
                None,
                format!(
                    "expected owners for {} segments, got {}",
                    num_segments,
                    segment_owners.len()
                ),
            ));
        }

        let owners = segment_owners
            .into_iter()
            .map(|owners| {
                let mut seen = HashSet::new();
                owners
                    .into_iter()
                    .filter(|owner| seen.insert(owner.clone()))
                    .collect()
            })
            .collect();

        Ok(Self {
            function,
            layout: Layout::Segmented { owners },
        })
    }

    /// Build from the legacy `server -> positions` form.
    ///
    /// Servers advertising the same position own it in input order.
    pub fn legacy(
        function: HashFunction,
        servers_to_hash: &[(Endpoint, Vec<u32>)],
        num_key_owners: u32,
        hash_space: u32,
    ) -> Result<Self> {
        if hash_space == 0 {
            return Err(Error::protocol(None, "hash space must be positive"));
        }

        let mut positions: BTreeMap<u32, Vec<Endpoint>> = BTreeMap::new();
        for (server, hashes) in servers_to_hash {
            for &position in hashes {
                if position >= hash_space {
                    return Err(Error::protocol(
                        None,
                        format!(
                            "position {} of {} is outside hash space {}",
                            position, server, hash_space
                        ),
                    ));
                }
                let owners = positions.entry(position).or_default();
                if !owners.contains(server) {
                    owners.push(server.clone());
                }
            }
        }

        Ok(Self {
            function,
            layout: Layout::Wheel {
                positions,
                hash_space,
                num_key_owners,
            },
        })
    }

    /// Version byte of the hash function.
    pub fn version(&self) -> u8 {
        self.function.version()
    }

    /// Whether this hash was built from the legacy wheel form.
    pub fn is_legacy(&self) -> bool {
        matches!(self.layout, Layout::Wheel { .. })
    }

    /// Size of the segment id space.
    pub fn num_segments(&self) -> u32 {
        match &self.layout {
            Layout::Segmented { owners } => owners.len() as u32,
            Layout::Wheel { hash_space, .. } => *hash_space,
        }
    }

    /// Owners per key announced with a legacy update.
    pub fn num_key_owners(&self) -> Option<u32> {
        match &self.layout {
            Layout::Segmented { .. } => None,
            Layout::Wheel { num_key_owners, .. } => Some(*num_key_owners),
        }
    }

    /// Segment a key belongs to.
    pub fn key_to_segment(&self, key: &[u8]) -> SegmentId {
        let hash = self.function.hash(key);
        match &self.layout {
            Layout::Segmented { owners } => hash % owners.len() as u32,
            Layout::Wheel {
                positions,
                hash_space,
                ..
            } => {
                let point = hash % hash_space;
                positions
                    .range(point..)
                    .next()
                    .or_else(|| positions.iter().next())
                    .map(|(&position, _)| position)
                    .unwrap_or(0)
            }
        }
    }

    /// Ordered owners of a segment. Empty for unknown segments.
    pub fn owners_of(&self, segment: SegmentId) -> &[Endpoint] {
        match &self.layout {
            Layout::Segmented { owners } => owners
                .get(segment as usize)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
            Layout::Wheel { positions, .. } => positions
                .get(&segment)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        }
    }

    /// Primary owner of a segment.
    pub fn primary_owner(&self, segment: SegmentId) -> Option<&Endpoint> {
        self.owners_of(segment).first()
    }

    /// Ordered owners of the segment a key maps to.
    pub fn owners_for_key(&self, key: &[u8]) -> &[Endpoint] {
        self.owners_of(self.key_to_segment(key))
    }

    /// Every known segment with its owners.
    pub fn segment_owners(&self) -> BTreeMap<SegmentId, Vec<Endpoint>> {
        match &self.layout {
            Layout::Segmented { owners } => owners
                .iter()
                .enumerate()
                .map(|(segment, owners)| (segment as SegmentId, owners.clone()))
                .collect(),
            Layout::Wheel { positions, .. } => positions.clone(),
        }
    }

    /// Distinct owners in first-seen order.
    pub fn servers(&self) -> Vec<Endpoint> {
        let lists: Vec<&Vec<Endpoint>> = match &self.layout {
            Layout::Segmented { owners } => owners.iter().collect(),
            Layout::Wheel { positions, .. } => positions.values().collect(),
        };
        let mut seen = HashSet::new();
        lists
            .into_iter()
            .flatten()
            .filter(|owner| seen.insert((*owner).clone()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ep, key_in_segment};
    use crate::hash::{ConsistentHashFactory, HASH_VERSION_SEGMENTED, HASH_VERSION_WHEEL_V2};

    #[test]
    fn test_segmented_routing() {
        let factory = ConsistentHashFactory::new();
        let ch = factory
            .segmented(
                HASH_VERSION_SEGMENTED,
                vec![vec![ep("a"), ep("b")], vec![ep("c"), ep("d")]],
                2,
            )
            .unwrap();

        assert_eq!(ch.num_segments(), 2);
        assert_eq!(ch.primary_owner(0), Some(&ep("a")));
        assert_eq!(ch.owners_of(1), &[ep("c"), ep("d")]);
        assert!(ch.owners_of(2).is_empty());

        let key = key_in_segment(&ch, 1);
        assert_eq!(ch.owners_for_key(&key)[0], ep("c"));
        assert_eq!(ch.servers(), vec![ep("a"), ep("b"), ep("c"), ep("d")]);
    }

    #[test]
    fn test_servers_shared_across_segments_listed_once() {
        let factory = ConsistentHashFactory::new();
        let ch = factory
            .segmented(
                HASH_VERSION_SEGMENTED,
                vec![vec![ep("b"), ep("a")], vec![ep("a"), ep("c")], vec![ep("c"), ep("b")]],
                3,
            )
            .unwrap();
        assert_eq!(ch.servers(), vec![ep("b"), ep("a"), ep("c")]);
    }

    #[test]
    fn test_segmented_rejects_bad_shapes() {
        let factory = ConsistentHashFactory::new();
        assert!(factory.segmented(HASH_VERSION_SEGMENTED, vec![], 0).is_err());
        assert!(factory
            .segmented(HASH_VERSION_SEGMENTED, vec![vec![ep("a")]], 2)
            .is_err());
    }

    #[test]
    fn test_duplicate_owners_collapsed() {
        let factory = ConsistentHashFactory::new();
        let ch = factory
            .segmented(HASH_VERSION_SEGMENTED, vec![vec![ep("a"), ep("a"), ep("b")]], 1)
            .unwrap();
        assert_eq!(ch.owners_of(0), &[ep("a"), ep("b")]);
    }

    #[test]
    fn test_legacy_inverts_servers_in_input_order() {
        let factory = ConsistentHashFactory::new();
        let input = vec![
            (ep("b"), vec![10, 500]),
            (ep("a"), vec![10, 900]),
            (ep("c"), vec![500]),
        ];
        let ch = factory.legacy(HASH_VERSION_WHEEL_V2, &input, 2, 1000).unwrap();

        assert!(ch.is_legacy());
        assert_eq!(ch.num_key_owners(), Some(2));
        assert_eq!(ch.owners_of(10), &[ep("b"), ep("a")]);
        assert_eq!(ch.owners_of(500), &[ep("b"), ep("c")]);
        assert_eq!(ch.owners_of(900), &[ep("a")]);
        assert_eq!(ch.servers(), vec![ep("b"), ep("a"), ep("c")]);

        // Every segment reports exactly the servers that advertised it.
        for (position, owners) in ch.segment_owners() {
            let expected: Vec<Endpoint> = input
                .iter()
                .filter(|(_, hashes)| hashes.contains(&position))
                .map(|(server, _)| server.clone())
                .collect();
            assert_eq!(owners, expected);
        }
    }

    #[test]
    fn test_legacy_wheel_wraps() {
        let factory = ConsistentHashFactory::new();
        let ch = factory
            .legacy(HASH_VERSION_WHEEL_V2, &[(ep("a"), vec![100]), (ep("b"), vec![200])], 1, 1000)
            .unwrap();
        for i in 0..500 {
            let segment = ch.key_to_segment(format!("k{}", i).as_bytes());
            assert!(segment == 100 || segment == 200);
        }
    }

    #[test]
    fn test_legacy_rejects_out_of_space_positions() {
        let factory = ConsistentHashFactory::new();
        assert!(factory
            .legacy(HASH_VERSION_WHEEL_V2, &[(ep("a"), vec![1000])], 1, 1000)
            .is_err());
        assert!(factory
            .legacy(HASH_VERSION_WHEEL_V2, &[(ep("a"), vec![1])], 1, 0)
            .is_err());
    }

    #[test]
    fn test_distribution_across_segments() {
        let factory = ConsistentHashFactory::new();
        let owners = (0..8).map(|i| vec![ep(&format!("s{}", i))]).collect();
        let ch = factory.segmented(HASH_VERSION_SEGMENTED, owners, 8).unwrap();

        let mut counts = [0usize; 8];
        for i in 0..8000 {
            counts[ch.key_to_segment(format!("sample_key_{}", i).as_bytes()) as usize] += 1;
        }
        for count in counts {
            assert!(count > 700 && count < 1300, "skewed segment: {}", count);
        }
    }
}
