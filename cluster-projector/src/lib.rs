//! Builds the canonical `CephCluster.spec.storage.nodes` list from a
//! [`FabricMap`] and submits it, with a skip-if-equal guard so steady-state
//! reconciles issue zero updates (spec.md §4.4).

mod error;

pub use error::{Error, Result};

use fabric_map::FabricMap;
use fabric_types::{CephCluster, CephDeviceConfig, CephStorageDevice, CephStorageNode};
use kube::api::{Api, PostParams};
use kube::Client;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, instrument};

/// Builds the projected node list for `fabric_host` out of `map`. Returns
/// an error if two descriptors on the same node claim the same device
/// path — a guard against a corrupt [`FabricMap`] that should never
/// produce one in the first place.
pub fn project(map: &FabricMap, fabric_host: &str) -> Result<Vec<CephStorageNode>> {
    let mut nodes = Vec::new();
    for (node, descriptors) in map.by_node() {
        let mut seen_paths = BTreeSet::new();
        let mut devices = Vec::new();
        for d in descriptors {
            if !seen_paths.insert(d.device_path.clone()) {
                return Err(error::Error::DuplicateDevice {
                    node: node.clone(),
                    device_path: d.device_path,
                });
            }
            devices.push(CephStorageDevice {
                name: d.device_path,
                config: Some(CephDeviceConfig {
                    failure_domain: Some(fabric_host.to_string()),
                }),
            });
        }
        nodes.push(CephStorageNode {
            name: node,
            devices,
            extra: Default::default(),
        });
    }
    Ok(nodes)
}

/// Device-name-only equality, order of nodes and devices within a node
/// both irrelevant (spec.md §4.4 "Skip-if-equal rule").
pub fn equivalent(current: &[CephStorageNode], projected: &[CephStorageNode]) -> bool {
    fn device_names(nodes: &[CephStorageNode]) -> HashMap<String, BTreeSet<String>> {
        nodes
            .iter()
            .map(|n| {
                (
                    n.name.clone(),
                    n.devices.iter().map(|d| d.name.clone()).collect(),
                )
            })
            .collect()
    }
    device_names(current) == device_names(projected)
}

/// Fetches the CR (to capture `resourceVersion`), overwrites
/// `spec.storage.nodes` for the nodes this controller tracks, and submits
/// the update — unless the projection is unchanged, in which case no
/// request is made. Conflicts are surfaced unchanged for the reconciler to
/// requeue.
#[instrument(skip(client, map))]
pub async fn apply(
    client: &Client,
    namespace: &str,
    cluster_name: &str,
    map: &FabricMap,
    fabric_host: &str,
) -> Result<bool> {
    let projected = project(map, fabric_host)?;

    let api: Api<CephCluster> = Api::namespaced(client.clone(), namespace);
    let mut cluster = api
        .get(cluster_name)
        .await
        .map_err(|source| error::Error::GetCluster {
            namespace: namespace.to_string(),
            name: cluster_name.to_string(),
            source,
        })?;

    // Nodes this controller doesn't track (no fabric devices on them) are
    // preserved untouched; only nodes the fabric map knows about are
    // replaced or added.
    let tracked: BTreeSet<_> = projected.iter().map(|n| n.name.clone()).collect();
    let mut merged: Vec<CephStorageNode> = cluster
        .spec
        .storage
        .nodes
        .iter()
        .filter(|n| !tracked.contains(&n.name))
        .cloned()
        .collect();
    merged.extend(projected);

    if equivalent(&cluster.spec.storage.nodes, &merged) {
        debug!("projected topology unchanged, skipping update");
        return Ok(false);
    }

    cluster.spec.storage.nodes = merged;

    api.replace(cluster_name, &PostParams::default(), &cluster)
        .await
        .map_err(|source| error::Error::UpdateCluster {
            namespace: namespace.to_string(),
            name: cluster_name.to_string(),
            source,
        })?;
    debug!("submitted updated CephCluster storage topology");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_map::FabricDescriptor;
    use fabric_types::FabricPort;

    fn fd(sub_nqn: &str, node: &str, path: &str) -> FabricDescriptor {
        FabricDescriptor {
            sub_nqn: sub_nqn.into(),
            port: FabricPort(4420),
            attached_node: node.into(),
            device_path: path.into(),
        }
    }

    #[test]
    fn project_groups_devices_by_node() {
        let mut map = FabricMap::new();
        map.add(fd("s0", "n1", "/dev/nvme0n1"));
        map.add(fd("s1", "n2", "/dev/nvme0n1"));
        let projected = project(&map, "fabric-host-p1").unwrap();
        assert_eq!(projected.len(), 2);
        for node in &projected {
            assert_eq!(node.devices.len(), 1);
            assert_eq!(
                node.devices[0].config.as_ref().unwrap().failure_domain,
                Some("fabric-host-p1".to_string())
            );
        }
    }

    #[test]
    fn project_rejects_duplicate_device_on_same_node() {
        let mut map = FabricMap::new();
        // FabricMap itself only guarantees uniqueness of sub_nqn, not of
        // (node, device_path) — that invariant is the caller's
        // responsibility (spec.md §3 invariant 2). Two distinct SubNQNs
        // both claiming the same path on the same node is the corrupt
        // state the projector's guard defends against.
        map.add(fd("s0", "n1", "/dev/nvme0n1"));
        map.add(fd("s1", "n1", "/dev/nvme0n1"));
        let err = project(&map, "fabric-host-p1").unwrap_err();
        assert!(matches!(err, Error::DuplicateDevice { .. }));
    }

    #[test]
    fn equivalent_ignores_node_and_device_order() {
        let a = vec![
            CephStorageNode {
                name: "n1".into(),
                devices: vec![
                    CephStorageDevice { name: "/dev/nvme0n1".into(), config: None },
                    CephStorageDevice { name: "/dev/nvme1n1".into(), config: None },
                ],
                extra: Default::default(),
            },
            CephStorageNode {
                name: "n2".into(),
                devices: vec![CephStorageDevice { name: "/dev/nvme0n1".into(), config: None }],
                extra: Default::default(),
            },
        ];
        let mut b = a.clone();
        b.reverse();
        b[0].devices.reverse();
        assert!(equivalent(&a, &b));
    }

    #[test]
    fn equivalent_detects_a_changed_device_name() {
        let a = vec![CephStorageNode {
            name: "n1".into(),
            devices: vec![CephStorageDevice { name: "/dev/nvme0n1".into(), config: None }],
            extra: Default::default(),
        }];
        let mut b = a.clone();
        b[0].devices[0].name = "/dev/nvme1n1".into();
        assert!(!equivalent(&a, &b));
    }
}
