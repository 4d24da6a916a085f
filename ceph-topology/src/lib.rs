//! Reads OSD placement from the pod inventory and issues CRUSH mutations
//! through the Ceph admin interface, treated as a typed RPC per spec.md §1
//! (the `ceph` binary invocation itself is the out-of-scope collaborator;
//! this crate only owns the typed request/response shape and JSON parsing
//! around it).

mod error;

pub use error::{Error, Result};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};
use std::time::Duration;
use tracing::{debug, instrument};

pub const OSD_APP_LABEL: &str = "app=rook-ceph-osd";
const BLOCK_PATH_ENV: &str = "ROOK_BLOCK_PATH";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OsdLocation {
    pub node: String,
    pub device_path: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OsdInventoryEntry {
    pub osd_id: String,
    pub cluster_name: String,
    pub node: String,
    pub device_path: String,
    pub ready: bool,
}

/// `LocatePod` / `LocateAllOSDs` (spec.md §4.3).
#[async_trait]
pub trait CephTopology: Send + Sync {
    async fn locate_pod(&self, osd_id: &str) -> Result<OsdLocation>;
    async fn locate_all_osds(&self) -> Result<Vec<OsdInventoryEntry>>;
}

/// `CrushMove` (spec.md §4.3): `osd crush move osd.<id> root=<root>
/// host=<hostBucket>`, JSON output, fatal on non-zero exit.
#[async_trait]
pub trait CephAdmin: Send + Sync {
    async fn crush_move(
        &self,
        cluster: &str,
        osd_id: &str,
        root_bucket: &str,
        host_bucket: &str,
    ) -> Result<()>;
}

pub struct K8sCephTopology {
    client: Client,
    namespace: String,
}

impl K8sCephTopology {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn block_path(pod: &Pod) -> Option<String> {
        pod.spec
            .as_ref()?
            .containers
            .first()?
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == BLOCK_PATH_ENV)
            .and_then(|e| e.value.clone())
    }

    fn is_ready(pod: &Pod) -> bool {
        pod.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false)
    }
}

#[async_trait]
impl CephTopology for K8sCephTopology {
    #[instrument(skip(self))]
    async fn locate_pod(&self, osd_id: &str) -> Result<OsdLocation> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let selector = format!("{},ceph-osd-id={}", OSD_APP_LABEL, osd_id);
        let list = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|source| error::Error::ListPods { source })?;

        if list.items.len() != 1 {
            return Err(error::Error::OsdNotFound {
                osd_id: osd_id.to_string(),
                found: list.items.len(),
            });
        }
        let pod = &list.items[0];
        let node = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .ok_or_else(|| error::Error::MissingNode {
                osd_id: osd_id.to_string(),
            })?;
        let device_path = Self::block_path(pod).ok_or_else(|| error::Error::MissingBlockPath {
            osd_id: osd_id.to_string(),
        })?;
        debug!(node, device_path, "located OSD pod");
        Ok(OsdLocation { node, device_path })
    }

    #[instrument(skip(self))]
    async fn locate_all_osds(&self) -> Result<Vec<OsdInventoryEntry>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pods
            .list(&ListParams::default().labels(OSD_APP_LABEL))
            .await
            .map_err(|source| error::Error::ListPods { source })?;

        let mut entries = Vec::new();
        for pod in &list.items {
            let (Some(osd_id), Some(cluster_name)) = (
                pod.metadata.labels.as_ref().and_then(|l| l.get("ceph-osd-id")),
                pod.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("app.kubernetes.io/part-of")),
            ) else {
                continue;
            };
            let (Some(node), Some(device_path)) =
                (pod.spec.as_ref().and_then(|s| s.node_name.clone()), Self::block_path(pod))
            else {
                continue;
            };
            entries.push(OsdInventoryEntry {
                osd_id: osd_id.clone(),
                cluster_name: cluster_name.clone(),
                node,
                device_path,
                ready: Self::is_ready(pod),
            });
        }
        Ok(entries)
    }
}

/// Polls [`CephTopology::locate_all_osds`] until every `osd_id` in
/// `expected` has a `Ready=True` pod, or `deadline` elapses (spec.md
/// §4.5.4). Returns `true` if all became ready in time.
pub async fn wait_for_all_ready(
    topology: &dyn CephTopology,
    expected: &[String],
    deadline: Duration,
    interval: Duration,
) -> Result<bool> {
    let start = std::time::Instant::now();
    loop {
        let entries = topology.locate_all_osds().await?;
        let all_ready = expected.iter().all(|osd_id| {
            entries
                .iter()
                .any(|e| &e.osd_id == osd_id && e.ready)
        });
        if all_ready {
            return Ok(true);
        }
        if start.elapsed() >= deadline {
            return Ok(false);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Variant of [`wait_for_all_ready`] for the cold-start case, where the OSD
/// ids aren't known yet — only the `(node, device_path)` pairs the fabric
/// devices were just connected to. Matches declared devices to pod
/// inventory entries by location rather than by id, polling until every
/// target has a matching `Ready=True` entry or `deadline` elapses. Returns
/// whichever entries became ready in time; the caller decides what to do
/// with the rest (spec.md §4.5.4 treats this as best-effort, picked up by
/// the next reconcile).
pub async fn wait_for_devices_ready(
    topology: &dyn CephTopology,
    targets: &[(String, String)],
    deadline: Duration,
    interval: Duration,
) -> Result<Vec<OsdInventoryEntry>> {
    let start = std::time::Instant::now();
    loop {
        let entries = topology.locate_all_osds().await?;
        let matched: Vec<_> = entries
            .into_iter()
            .filter(|e| {
                e.ready
                    && targets
                        .iter()
                        .any(|(node, path)| &e.node == node && &e.device_path == path)
            })
            .collect();
        if matched.len() == targets.len() || start.elapsed() >= deadline {
            return Ok(matched);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Production [`CephAdmin`]: shells out to the `ceph` binary available in
/// the operator's own container image, the way the source execs the Ceph
/// CLI directly rather than routing it through a job on a remote host —
/// CRUSH mutation doesn't need a specific host, only Ceph admin
/// credentials already mounted into this pod.
pub struct CliCephAdmin {
    ceph_binary: String,
}

impl Default for CliCephAdmin {
    fn default() -> Self {
        Self {
            ceph_binary: "ceph".to_string(),
        }
    }
}

impl CliCephAdmin {
    pub fn new(ceph_binary: impl Into<String>) -> Self {
        Self {
            ceph_binary: ceph_binary.into(),
        }
    }
}

#[async_trait]
impl CephAdmin for CliCephAdmin {
    #[instrument(skip(self))]
    async fn crush_move(
        &self,
        cluster: &str,
        osd_id: &str,
        root_bucket: &str,
        host_bucket: &str,
    ) -> Result<()> {
        let output = tokio::process::Command::new(&self.ceph_binary)
            .args([
                "--cluster",
                cluster,
                "osd",
                "crush",
                "move",
                &format!("osd.{}", osd_id),
                &format!("root={}", root_bucket),
                &format!("host={}", host_bucket),
                "--format",
                "json",
            ])
            .output()
            .await
            .map_err(|source| error::Error::SpawnCephCommand { source })?;

        if !output.status.success() {
            return Err(error::Error::CrushMoveFailed {
                osd_id: osd_id.to_string(),
                root_bucket: root_bucket.to_string(),
                host_bucket: host_bucket.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        // The command's JSON payload is diagnostic only; we only need to
        // confirm it parses, not interpret its fields.
        let _: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|source| error::Error::ParseCephOutput { source })?;
        debug!(osd_id, root_bucket, host_bucket, "moved OSD in CRUSH map");
        Ok(())
    }
}

pub mod fake {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct FakeCephTopology {
        pub entries: Mutex<Vec<OsdInventoryEntry>>,
    }

    impl FakeCephTopology {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn push(&self, entry: OsdInventoryEntry) {
            self.entries.lock().await.push(entry);
        }

        pub async fn set_ready(&self, osd_id: &str, ready: bool) {
            let mut entries = self.entries.lock().await;
            if let Some(e) = entries.iter_mut().find(|e| e.osd_id == osd_id) {
                e.ready = ready;
            }
        }
    }

    #[async_trait]
    impl CephTopology for FakeCephTopology {
        async fn locate_pod(&self, osd_id: &str) -> Result<OsdLocation> {
            let entries = self.entries.lock().await;
            let matches: Vec<_> = entries.iter().filter(|e| e.osd_id == osd_id).collect();
            if matches.len() != 1 {
                return Err(error::Error::OsdNotFound {
                    osd_id: osd_id.to_string(),
                    found: matches.len(),
                });
            }
            Ok(OsdLocation {
                node: matches[0].node.clone(),
                device_path: matches[0].device_path.clone(),
            })
        }

        async fn locate_all_osds(&self) -> Result<Vec<OsdInventoryEntry>> {
            Ok(self.entries.lock().await.clone())
        }
    }

    #[derive(Default)]
    pub struct FakeCephAdmin {
        pub calls: Mutex<Vec<(String, String, String, String)>>,
    }

    impl FakeCephAdmin {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl CephAdmin for FakeCephAdmin {
        async fn crush_move(
            &self,
            cluster: &str,
            osd_id: &str,
            root_bucket: &str,
            host_bucket: &str,
        ) -> Result<()> {
            self.calls.lock().await.push((
                cluster.to_string(),
                osd_id.to_string(),
                root_bucket.to_string(),
                host_bucket.to_string(),
            ));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeCephTopology;
    use super::*;

    #[tokio::test]
    async fn locate_pod_requires_exactly_one_match() {
        let topology = FakeCephTopology::new();
        assert!(topology.locate_pod("0").await.is_err());
        topology
            .push(OsdInventoryEntry {
                osd_id: "0".into(),
                cluster_name: "rook-ceph".into(),
                node: "n1".into(),
                device_path: "/dev/nvme0n1".into(),
                ready: true,
            })
            .await;
        assert_eq!(topology.locate_pod("0").await.unwrap().node, "n1");
    }

    #[tokio::test]
    async fn wait_for_all_ready_returns_true_once_ready() {
        let topology = FakeCephTopology::new();
        topology
            .push(OsdInventoryEntry {
                osd_id: "0".into(),
                cluster_name: "rook-ceph".into(),
                node: "n1".into(),
                device_path: "/dev/nvme0n1".into(),
                ready: false,
            })
            .await;
        topology.set_ready("0", true).await;
        let ready = wait_for_all_ready(
            &topology,
            &["0".to_string()],
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert!(ready);
    }

    #[tokio::test]
    async fn wait_for_devices_ready_matches_by_location_not_id() {
        let topology = FakeCephTopology::new();
        topology
            .push(OsdInventoryEntry {
                osd_id: "7".into(),
                cluster_name: "rook-ceph".into(),
                node: "n1".into(),
                device_path: "/dev/nvme0n1".into(),
                ready: false,
            })
            .await;
        let targets = vec![("n1".to_string(), "/dev/nvme0n1".to_string())];

        let none_yet = wait_for_devices_ready(
            &topology,
            &targets,
            Duration::from_millis(20),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert!(none_yet.is_empty());

        topology.set_ready("7", true).await;
        let ready = wait_for_devices_ready(
            &topology,
            &targets,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].osd_id, "7");
    }
}
