//! Consistent hashing with bounded loads
//!
//! Keys hash into a fixed number of partitions; partitions are placed on
//! members by walking a ring of virtual nodes. A member is skipped once it
//! holds `ceil(partitions / members * load)` partitions, which caps any
//! single member's share while keeping most partitions in place when
//! membership changes.
//!
//! Every replica builds the ring from the same ready set with the same
//! parameters and hash, so all of them agree on each key's owner.

use crate::config::HashRingConfig;
use crate::hash::ring_hash;
use hashring::HashRing;
use std::collections::{BTreeSet, HashMap};
use std::hash::{BuildHasherDefault, Hasher};

/// Feeds `hashring` with the fleet-wide ring hash instead of SipHash
#[derive(Default)]
pub struct RingHasher {
    bytes: Vec<u8>,
}

impl Hasher for RingHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    fn finish(&self) -> u64 {
        ring_hash(&self.bytes)
    }
}

type VNodeRing = HashRing<String, BuildHasherDefault<RingHasher>>;

fn vnode_key(member: &str, index: usize) -> String {
    format!("{member}#{index}")
}

fn vnode_member(vnode: &str) -> &str {
    vnode.rsplit_once('#').map_or(vnode, |(member, _)| member)
}

pub struct ConsistentRing {
    config: HashRingConfig,
    members: BTreeSet<String>,
    /// Virtual nodes keyed `member#i`
    vnodes: VNodeRing,
    vnode_count: usize,
    /// Owner of each partition; empty when there are no members
    partitions: Vec<String>,
    loads: HashMap<String, usize>,
}

impl Clone for ConsistentRing {
    fn clone(&self) -> Self {
        Self::with_members(self.config, self.members.iter().cloned())
    }
}

impl std::fmt::Debug for ConsistentRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsistentRing")
            .field("config", &self.config)
            .field("members", &self.members)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl ConsistentRing {
    pub fn new(config: HashRingConfig) -> Self {
        Self {
            config,
            members: BTreeSet::new(),
            vnodes: HashRing::with_hasher(BuildHasherDefault::default()),
            vnode_count: 0,
            partitions: Vec::new(),
            loads: HashMap::new(),
        }
    }

    pub fn with_members<I, S>(config: HashRingConfig, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::new(config);
        ring.set_members(members);
        ring
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.contains(member)
    }

    /// Add a member; returns false if it was already present
    pub fn add(&mut self, member: impl Into<String>) -> bool {
        let member = member.into();
        if !self.members.insert(member.clone()) {
            return false;
        }
        self.add_vnodes(&member);
        self.distribute();
        true
    }

    /// Remove a member; returns false if it was absent
    pub fn remove(&mut self, member: &str) -> bool {
        if !self.members.remove(member) {
            return false;
        }
        self.remove_vnodes(member);
        self.distribute();
        true
    }

    /// Replace the member set; returns whether it changed
    pub fn set_members<I, S>(&mut self, members: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members: BTreeSet<String> = members.into_iter().map(Into::into).collect();
        if members == self.members {
            return false;
        }
        let gone: Vec<String> = self.members.difference(&members).cloned().collect();
        for member in &gone {
            self.remove_vnodes(member);
        }
        let joined: Vec<String> = members.difference(&self.members).cloned().collect();
        self.members = members;
        for member in &joined {
            self.add_vnodes(member);
        }
        self.distribute();
        true
    }

    /// Member owning `key`, `None` on an empty ring
    pub fn owner(&self, key: &str) -> Option<&str> {
        let partition = self.partition_of(key)?;
        self.partitions.get(partition).map(String::as_str)
    }

    /// Partition `key` hashes into; `None` when the ring has no partitions
    pub fn partition_of(&self, key: &str) -> Option<usize> {
        let count = self.config.partition_count as u64;
        if count == 0 {
            return None;
        }
        Some((ring_hash(key.as_bytes()) % count) as usize)
    }

    /// Partitions held by each member
    pub fn loads(&self) -> &HashMap<String, usize> {
        &self.loads
    }

    /// Upper bound on partitions per member
    pub fn average_load(&self) -> usize {
        if self.members.is_empty() {
            return 0;
        }
        let per_member = self.config.partition_count as f64 / self.members.len() as f64;
        (per_member * self.config.load).ceil() as usize
    }

    fn add_vnodes(&mut self, member: &str) {
        for i in 0..self.config.replication_factor {
            self.vnodes.add(vnode_key(member, i));
            self.vnode_count += 1;
        }
    }

    fn remove_vnodes(&mut self, member: &str) {
        for i in 0..self.config.replication_factor {
            if self.vnodes.remove(&vnode_key(member, i)).is_some() {
                self.vnode_count -= 1;
            }
        }
    }

    fn distribute(&mut self) {
        self.loads = self.members.iter().map(|m| (m.clone(), 0)).collect();
        self.partitions.clear();
        if self.vnode_count == 0 {
            return;
        }

        let cap = self.average_load();
        for partition in 0..self.config.partition_count {
            let owner = self.place(partition, cap);
            if let Some(load) = self.loads.get_mut(&owner) {
                *load += 1;
            }
            self.partitions.push(owner);
        }
    }

    /// First member clockwise from the partition's position with room,
    /// else the least loaded
    fn place(&self, partition: usize, cap: usize) -> String {
        let key = partition.to_string();
        // asking for every other vnode as a replica yields the full clockwise walk
        let walk = self
            .vnodes
            .get_with_replicas(&key, self.vnode_count.saturating_sub(1))
            .unwrap_or_default();
        for vnode in &walk {
            let member = vnode_member(vnode);
            if self.loads.get(member).copied().unwrap_or(0) < cap {
                return member.to_string();
            }
        }
        // only reached when cap * members < partitions
        self.members
            .iter()
            .min_by_key(|m| self.loads.get(*m).copied().unwrap_or(0))
            .cloned()
            .or_else(|| walk.first().map(|v| vnode_member(v).to_string()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HashRingConfig {
        HashRingConfig::default()
    }

    #[test]
    fn test_empty_ring_has_no_owner() {
        let ring = ConsistentRing::new(config());
        assert!(ring.owner("cluster-1").is_none());
        assert_eq!(ring.average_load(), 0);
    }

    #[test]
    fn test_single_member_owns_everything() {
        let ring = ConsistentRing::with_members(config(), ["a"]);
        for i in 0..50 {
            assert_eq!(ring.owner(&format!("cluster-{i}")), Some("a"));
        }
    }

    #[test]
    fn test_load_is_bounded() {
        let ring = ConsistentRing::with_members(config(), ["a", "b", "c"]);
        let cap = ring.average_load();
        // 7 partitions over 3 members at load 1.25
        assert_eq!(cap, 3);
        let total: usize = ring.loads().values().sum();
        assert_eq!(total, 7);
        assert!(ring.loads().values().all(|&l| l <= cap));
    }

    #[test]
    fn test_owner_is_deterministic_across_builds() {
        let a = ConsistentRing::with_members(config(), ["x", "y", "z"]);
        let b = ConsistentRing::with_members(config(), ["z", "x", "y"]);
        for i in 0..100 {
            let key = format!("consumer-{i}");
            assert_eq!(a.owner(&key), b.owner(&key));
        }
    }

    #[test]
    fn test_membership_change_moves_bounded_share() {
        let cfg = HashRingConfig {
            partition_count: 271,
            ..config()
        };
        let before = ConsistentRing::with_members(cfg, ["a", "b", "c"]);
        let mut after = before.clone();
        assert!(after.add("d"));

        let keys: Vec<String> = (0..1000).map(|i| format!("consumer-{i}")).collect();
        let moved = keys
            .iter()
            .filter(|k| before.owner(k) != after.owner(k))
            .count();
        assert!(moved < 600, "{moved} of 1000 keys moved");
        assert!(keys.iter().any(|k| after.owner(k) == Some("d")));
    }

    #[test]
    fn test_vnode_member_keeps_hashes_in_ids() {
        assert_eq!(vnode_member(&vnode_key("a", 3)), "a");
        assert_eq!(vnode_member(&vnode_key("pod#1", 0)), "pod#1");
    }

    #[test]
    fn test_incremental_changes_match_fresh_build() {
        let mut ring = ConsistentRing::with_members(config(), ["a", "b"]);
        ring.add("c");
        ring.remove("a");
        ring.set_members(["b", "c", "d"]);
        let fresh = ConsistentRing::with_members(config(), ["d", "c", "b"]);
        for i in 0..100 {
            let key = format!("consumer-{i}");
            assert_eq!(ring.owner(&key), fresh.owner(&key));
        }
    }

    #[test]
    fn test_zero_partitions_has_no_owner() {
        let cfg = HashRingConfig {
            partition_count: 0,
            ..config()
        };
        let ring = ConsistentRing::with_members(cfg, ["a", "b"]);
        assert_eq!(ring.partition_of("cluster-1"), None);
        assert!(ring.owner("cluster-1").is_none());
    }

    #[test]
    fn test_set_members_reports_change() {
        let mut ring = ConsistentRing::new(config());
        assert!(ring.set_members(["a", "b"]));
        assert!(!ring.set_members(["b", "a"]));
        assert!(ring.remove("a"));
        assert!(!ring.remove("a"));
        assert_eq!(ring.members().collect::<Vec<_>>(), vec!["b"]);
    }
}
