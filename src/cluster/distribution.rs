//! Hash-bucket distribution for partitioned topologies.
//!
//! Keys hash into [`BUCKET_COUNT`] buckets; every bucket has one owner. The
//! first map deals buckets round-robin over the members in ring order. Later
//! maps keep surviving owners where possible and deal the rest round-robin,
//! so a membership change moves only the buckets it has to.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::NodeId;

pub const BUCKET_COUNT: u32 = 1000;

/// FNV-1a, stable across processes and releases
pub fn bucket_of(key: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash % BUCKET_COUNT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionMap {
    owners: Vec<NodeId>,
    version: u64,
}

impl DistributionMap {
    /// Round-robin over `members`, in the given order
    pub fn round_robin(members: &[NodeId]) -> Self {
        let owners = if members.is_empty() {
            Vec::new()
        } else {
            (0..BUCKET_COUNT as usize)
                .map(|bucket| members[bucket % members.len()].clone())
                .collect()
        };
        Self { owners, version: 1 }
    }

    pub fn from_owners(owners: Vec<NodeId>, version: u64) -> Self {
        Self { owners, version }
    }

    pub fn owners(&self) -> &[NodeId] {
        &self.owners
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn owner_of_bucket(&self, bucket: u32) -> Option<&NodeId> {
        self.owners.get(bucket as usize)
    }

    pub fn owner_of(&self, key: &str) -> Option<&NodeId> {
        self.owner_of_bucket(bucket_of(key))
    }

    pub fn buckets_of(&self, node: &NodeId) -> Vec<u32> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| *owner == node)
            .map(|(bucket, _)| bucket as u32)
            .collect()
    }

    /// Bucket count per owner
    pub fn load(&self) -> BTreeMap<NodeId, usize> {
        let mut load = BTreeMap::new();
        for owner in &self.owners {
            *load.entry(owner.clone()).or_insert(0) += 1;
        }
        load
    }

    /// Next map for `members` (in ring order), moving as few buckets as possible
    pub fn rebalance(&self, members: &[NodeId]) -> Self {
        if self.owners.is_empty() || members.is_empty() {
            let mut next = Self::round_robin(members);
            next.version = self.version + 1;
            return next;
        }

        let share = BUCKET_COUNT as usize / members.len();
        let extra = BUCKET_COUNT as usize % members.len();
        let quota: BTreeMap<&NodeId, usize> = members
            .iter()
            .enumerate()
            .map(|(i, member)| (member, share + usize::from(i < extra)))
            .collect();

        let mut held: BTreeMap<&NodeId, usize> = BTreeMap::new();
        let mut owners: Vec<Option<NodeId>> = Vec::with_capacity(self.owners.len());
        for owner in &self.owners {
            let keep = match quota.get(owner) {
                Some(limit) => {
                    let count = held.entry(owner).or_insert(0);
                    if *count < *limit {
                        *count += 1;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            owners.push(keep.then(|| owner.clone()));
        }

        // Deal freed buckets to members below quota, in ring order
        let mut cursor = 0usize;
        for slot in owners.iter_mut().filter(|slot| slot.is_none()) {
            for _ in 0..members.len() {
                let member = &members[cursor % members.len()];
                cursor += 1;
                let count = held.entry(member).or_insert(0);
                if *count < quota[member] {
                    *count += 1;
                    *slot = Some(member.clone());
                    break;
                }
            }
        }

        Self {
            owners: owners
                .into_iter()
                .map(|owner| owner.unwrap_or_else(|| members[0].clone()))
                .collect(),
            version: self.version + 1,
        }
    }

    /// Hand every bucket of `failed` to `heir`
    pub fn reassign(&self, failed: &NodeId, heir: &NodeId) -> Self {
        Self {
            owners: self
                .owners
                .iter()
                .map(|owner| if owner == failed { heir.clone() } else { owner.clone() })
                .collect(),
            version: self.version + 1,
        }
    }

    /// Buckets `node` owns here but not in `previous`, with their previous owner
    pub fn gained_by(&self, previous: &DistributionMap, node: &NodeId) -> BTreeMap<NodeId, Vec<u32>> {
        let mut gained: BTreeMap<NodeId, Vec<u32>> = BTreeMap::new();
        for (bucket, owner) in self.owners.iter().enumerate() {
            if owner != node {
                continue;
            }
            if let Some(before) = previous.owners.get(bucket) {
                if before != node {
                    gained.entry(before.clone()).or_default().push(bucket as u32);
                }
            }
        }
        gained
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<NodeId> {
        names.iter().map(|n| NodeId::from(*n)).collect()
    }

    #[test]
    fn test_bucket_is_stable() {
        assert_eq!(bucket_of("order:1"), bucket_of("order:1"));
        assert!(bucket_of("anything") < BUCKET_COUNT);
        // Known FNV-1a value for the empty string
        assert_eq!(bucket_of(""), 0x811c_9dc5 % BUCKET_COUNT);
    }

    #[test]
    fn test_round_robin() {
        let map = DistributionMap::round_robin(&ids(&["a", "b"]));
        assert_eq!(map.owner_of_bucket(0), Some(&NodeId::from("a")));
        assert_eq!(map.owner_of_bucket(1), Some(&NodeId::from("b")));
        assert_eq!(map.buckets_of(&NodeId::from("a")).len(), 500);
    }

    #[test]
    fn test_rebalance_on_join_moves_only_new_share() {
        let before = DistributionMap::round_robin(&ids(&["a", "b"]));
        let after = before.rebalance(&ids(&["a", "b", "c"]));

        let load = after.load();
        assert_eq!(load[&NodeId::from("a")], 334);
        assert_eq!(load[&NodeId::from("b")], 333);
        assert_eq!(load[&NodeId::from("c")], 333);

        let moved = before
            .owners()
            .iter()
            .zip(after.owners())
            .filter(|(x, y)| x != y)
            .count();
        assert_eq!(moved, 333);

        let gained = after.gained_by(&before, &NodeId::from("c"));
        let total: usize = gained.values().map(Vec::len).sum();
        assert_eq!(total, 333);
        assert!(gained.contains_key(&NodeId::from("a")));
        assert!(gained.contains_key(&NodeId::from("b")));
        assert_eq!(after.version(), before.version() + 1);
    }

    #[test]
    fn test_rebalance_on_leave_keeps_survivors() {
        let before = DistributionMap::round_robin(&ids(&["a", "b", "c"]));
        let after = before.rebalance(&ids(&["a", "b"]));
        for (bucket, owner) in before.owners().iter().enumerate() {
            if owner.as_str() != "c" {
                assert_eq!(&after.owners()[bucket], owner);
            }
        }
        assert!(after.buckets_of(&NodeId::from("c")).is_empty());
        assert_eq!(after.load().values().sum::<usize>(), BUCKET_COUNT as usize);
    }

    #[test]
    fn test_reassign_to_heir() {
        let before = DistributionMap::round_robin(&ids(&["a", "b", "c"]));
        let after = before.reassign(&NodeId::from("b"), &NodeId::from("c"));
        assert!(after.buckets_of(&NodeId::from("b")).is_empty());
        assert_eq!(after.buckets_of(&NodeId::from("c")).len(), 666);
    }
}
