//! Pure in-memory bijection between `SubNQN`, attached node, and local
//! device path for one fabric failure domain.
//!
//! No concurrency inside the structure; serial access is guaranteed by the
//! reconciler that owns it.

use fabric_types::FabricPort;
use std::collections::BTreeMap;

/// `{SubNQN, Port, AttachedNode, DevicePath}`. `SubNQN` is the primary key;
/// it is stable across host moves. `DevicePath` is local to `AttachedNode`
/// and changes on every reconnect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FabricDescriptor {
    pub sub_nqn: String,
    pub port: FabricPort,
    pub attached_node: String,
    pub device_path: String,
}

/// In-memory bijection described in spec.md §4.1.
///
/// Invariants maintained by construction:
/// 1. `sub_nqn -> FabricDescriptor` is a partial function; every entry is
///    also reachable via `attached_node -> [descriptors]`.
/// 2. No two descriptors share `(attached_node, device_path)`.
/// 3. An empty node bucket is deleted.
#[derive(Clone, Debug, Default)]
pub struct FabricMap {
    by_sub_nqn: BTreeMap<String, FabricDescriptor>,
    by_node: BTreeMap<String, Vec<FabricDescriptor>>,
}

impl FabricMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by `sub_nqn`; appends to (or replaces within) the
    /// `attached_node` bucket.
    pub fn add(&mut self, fd: FabricDescriptor) {
        if let Some(previous) = self.by_sub_nqn.insert(fd.sub_nqn.clone(), fd.clone()) {
            self.remove_from_bucket(&previous);
        }
        self.by_node
            .entry(fd.attached_node.clone())
            .or_default()
            .push(fd);
    }

    /// Removes by `sub_nqn`; shrinks the bucket and drops it if it becomes
    /// empty. A no-op if `fd.sub_nqn` is not present.
    pub fn remove(&mut self, fd: &FabricDescriptor) {
        if self.by_sub_nqn.remove(&fd.sub_nqn).is_some() {
            self.remove_from_bucket(fd);
        }
    }

    fn remove_from_bucket(&mut self, fd: &FabricDescriptor) {
        if let Some(bucket) = self.by_node.get_mut(&fd.attached_node) {
            bucket.retain(|d| d.sub_nqn != fd.sub_nqn);
            if bucket.is_empty() {
                self.by_node.remove(&fd.attached_node);
            }
        }
    }

    /// Defensive copy: callers cannot alias interior state.
    pub fn by_sub_nqn(&self) -> BTreeMap<String, FabricDescriptor> {
        self.by_sub_nqn.clone()
    }

    /// Defensive copy: callers cannot alias interior state.
    pub fn by_node(&self) -> BTreeMap<String, Vec<FabricDescriptor>> {
        self.by_node.clone()
    }

    /// Nodes with at least one device currently attached.
    pub fn nodes(&self) -> Vec<String> {
        self.by_node.keys().cloned().collect()
    }

    pub fn find_by_node(&self, node: &str) -> (Vec<FabricDescriptor>, bool) {
        match self.by_node.get(node) {
            Some(descriptors) => (descriptors.clone(), true),
            None => (Vec::new(), false),
        }
    }

    pub fn get(&self, sub_nqn: &str) -> Option<FabricDescriptor> {
        self.by_sub_nqn.get(sub_nqn).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd(sub_nqn: &str, node: &str, path: &str) -> FabricDescriptor {
        FabricDescriptor {
            sub_nqn: sub_nqn.into(),
            port: FabricPort(4420),
            attached_node: node.into(),
            device_path: path.into(),
        }
    }

    #[test]
    fn add_then_remove_restores_pre_state() {
        let mut map = FabricMap::new();
        let before = map.by_sub_nqn();
        map.add(fd("s0", "n1", "/dev/nvme0n1"));
        map.remove(&fd("s0", "n1", "/dev/nvme0n1"));
        assert_eq!(map.by_sub_nqn(), before);
        assert!(map.nodes().is_empty());
    }

    #[test]
    fn by_node_and_by_sub_nqn_agree_as_sets() {
        let mut map = FabricMap::new();
        map.add(fd("s0", "n1", "/dev/nvme0n1"));
        map.add(fd("s1", "n1", "/dev/nvme1n1"));
        map.add(fd("s2", "n2", "/dev/nvme0n1"));

        let mut from_nodes: Vec<_> = map
            .by_node()
            .into_values()
            .flatten()
            .map(|d| d.sub_nqn)
            .collect();
        from_nodes.sort();
        let mut from_subnqn: Vec<_> = map.by_sub_nqn().into_keys().collect();
        from_subnqn.sort();
        assert_eq!(from_nodes, from_subnqn);
    }

    #[test]
    fn connect_sets_attached_node_for_subnqn() {
        let mut map = FabricMap::new();
        map.add(fd("s0", "n1", "/dev/nvme0n1"));
        assert_eq!(map.get("s0").unwrap().attached_node, "n1");
    }

    #[test]
    fn no_two_descriptors_share_node_and_device_path() {
        let mut map = FabricMap::new();
        map.add(fd("s0", "n1", "/dev/nvme0n1"));
        map.add(fd("s1", "n1", "/dev/nvme1n1"));
        let (descriptors, exists) = map.find_by_node("n1");
        assert!(exists);
        let mut seen = std::collections::HashSet::new();
        for d in &descriptors {
            assert!(seen.insert((d.attached_node.clone(), d.device_path.clone())));
        }
    }

    #[test]
    fn nodes_only_lists_non_empty_buckets() {
        let mut map = FabricMap::new();
        map.add(fd("s0", "n1", "/dev/nvme0n1"));
        map.remove(&fd("s0", "n1", "/dev/nvme0n1"));
        map.add(fd("s1", "n2", "/dev/nvme0n1"));
        assert_eq!(map.nodes(), vec!["n2".to_string()]);
    }

    #[test]
    fn re_adding_an_existing_subnqn_moves_it_between_buckets() {
        let mut map = FabricMap::new();
        map.add(fd("s0", "n1", "/dev/nvme0n1"));
        map.add(fd("s0", "n2", "/dev/nvme0n1"));
        assert_eq!(map.get("s0").unwrap().attached_node, "n2");
        assert_eq!(map.nodes(), vec!["n2".to_string()]);
    }
}
