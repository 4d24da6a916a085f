//! Shared CRD and wire types for the NVMe-oF OSD recoverer.
//!
//! Factored out of the reconciler the way the teacher factors `rpc` and
//! `mbus_api` types out of its agents: every crate in the workspace needs
//! the same `NvmeOfStorage` shape and nobody should own a second copy of it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// NVMe-oF transport port. Stringified everywhere it crosses the fabric
/// boundary (CRD field, job command line) but kept as a real integer
/// internally so it can't silently hold a non-numeric value.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(transparent)]
pub struct FabricPort(pub u16);

impl fmt::Display for FabricPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FabricPort {
    type Err = std::num::ParseIntError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(FabricPort(s.parse()?))
    }
}

/// One device declared in a `NvmeOfStorage` CR.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FabricDeviceSpec {
    /// Globally unique NVMe Subsystem Qualified Name.
    pub sub_nqn: String,
    pub port: FabricPort,
    /// Preferred initial host; only consulted on first attach.
    pub target_node: String,
    /// Populated by the controller after first attach; read back for CRUSH
    /// lookup. Absent until the device has been reconciled at least once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

/// `NvmeOfStorage.spec` — one fabric failure domain.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "NvmeOfStorage",
    namespaced,
    status = "NvmeOfStorageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct NvmeOfStorageSpec {
    /// Identifier of the failure domain; the pseudo-host written into CRUSH
    /// is `fabric-host-<name>`.
    pub name: String,
    /// NVMe-oF target IP, common to all devices in the domain.
    pub ip: String,
    pub cluster_name: String,
    pub devices: Vec<FabricDeviceSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NvmeOfStorageStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated: Option<bool>,
}

impl NvmeOfStorageSpec {
    pub fn fabric_host(&self) -> String {
        format!("fabric-host-{}", self.name)
    }
}

/// One device entry under `CephCluster.spec.storage.nodes[*].devices`.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephStorageDevice {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<CephDeviceConfig>,
}

#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephDeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_domain: Option<String>,
}

/// One entry under `CephCluster.spec.storage.nodes`. Only the fields this
/// controller reads or mutates are modelled; everything else the CRD
/// carries is preserved verbatim by round-tripping through
/// `serde_json::Value` at the call site (see `cluster-projector`).
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephStorageNode {
    pub name: String,
    #[serde(default)]
    pub devices: Vec<CephStorageDevice>,
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephStorageScopeSpec {
    #[serde(default)]
    pub nodes: Vec<CephStorageNode>,
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, serde_json::Value>,
}

/// `CephCluster.spec` — consumed, not owned. Only `storage` is modelled;
/// every other field round-trips through `extra`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephCluster",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CephClusterSpec {
    #[serde(default)]
    pub storage: CephStorageScopeSpec,
    #[serde(flatten)]
    pub extra: std::collections::BTreeMap<String, serde_json::Value>,
}

/// Best-effort side channel (spec.md §6): a hint to the OSD-provisioning
/// subsystem that an OSD has moved, so it can skip re-creating the
/// deployment on the old host. Written, never read back by this crate.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
pub struct OsdTransferInfo {
    pub id: u32,
    pub node: String,
    pub fault_domain: String,
}

pub const OSD_TRANSFER_CONFIGMAP_NAME: &str = "osd-transfer-config";
pub const OSD_TRANSFER_CONFIGMAP_KEY: &str = "osd-transfer-config";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fabric_port_round_trips_through_string() {
        let p = FabricPort(4420);
        let s = p.to_string();
        assert_eq!(s, "4420");
        assert_eq!(FabricPort::from_str(&s).unwrap(), p);
    }

    #[test]
    fn fabric_host_name_uses_domain_prefix() {
        let spec = NvmeOfStorageSpec {
            name: "p1".into(),
            ip: "10.0.0.1".into(),
            cluster_name: "rook-ceph".into(),
            devices: vec![],
        };
        assert_eq!(spec.fabric_host(), "fabric-host-p1");
    }
}
