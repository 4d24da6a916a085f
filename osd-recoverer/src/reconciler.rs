//! Event-classifying state machine that owns the recovery protocol
//! (spec.md §4.5). One [`Reconciler`] per fabric failure domain, holding
//! the single [`NvmeOfStorage`] descriptor and the [`FabricMap`] it has
//! projected. Single-threaded: the caller (the watch loop in `main`)
//! serialises calls to [`Reconciler::reconcile`], matching the "underlying
//! controller framework serialises reconciles for the same object key"
//! assumption of spec.md §5.

use crate::error::{self, Error, Result};
use crate::event::{self, Event};
use ceph_topology::{wait_for_devices_ready, CephAdmin, CephTopology};
use fabric_agent::FabricAgent;
use fabric_map::{FabricDescriptor, FabricMap};
use fabric_types::{
    FabricDeviceSpec, NvmeOfStorage, NvmeOfStorageSpec, OsdTransferInfo,
    OSD_TRANSFER_CONFIGMAP_KEY, OSD_TRANSFER_CONFIGMAP_NAME,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const CRUSH_ROOT: &str = "default";
const READINESS_DEADLINE: Duration = Duration::from_secs(60);
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// spec.md §3 "Controller state": a two-state variable per failure domain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// No CR observed yet.
    Initialization,
    /// The CR has been projected into the FabricMap at least once.
    Activated,
}

pub struct Reconciler {
    client: Client,
    namespace: String,
    fabric_agent: Arc<dyn FabricAgent>,
    ceph_topology: Arc<dyn CephTopology>,
    ceph_admin: Arc<dyn CephAdmin>,
    state: State,
    map: FabricMap,
    storage: Option<NvmeOfStorageSpec>,
    readiness_deadline: Duration,
    readiness_poll_interval: Duration,
}

impl Reconciler {
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        fabric_agent: Arc<dyn FabricAgent>,
        ceph_topology: Arc<dyn CephTopology>,
        ceph_admin: Arc<dyn CephAdmin>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            fabric_agent,
            ceph_topology,
            ceph_admin,
            state: State::Initialization,
            map: FabricMap::new(),
            storage: None,
            readiness_deadline: READINESS_DEADLINE,
            readiness_poll_interval: READINESS_POLL_INTERVAL,
        }
    }

    /// Overrides the default readiness deadline/poll interval used before
    /// the init-time CRUSH move (spec.md §4.5.4). Exposed so the CLI can
    /// tune them per cluster the way `operators/node` exposes its own
    /// polling period.
    pub fn with_readiness_timing(mut self, deadline: Duration, poll_interval: Duration) -> Self {
        self.readiness_deadline = deadline;
        self.readiness_poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn fabric_map(&self) -> &FabricMap {
        &self.map
    }

    fn domain_label(&self) -> String {
        self.storage
            .as_ref()
            .map(|s| s.name.clone())
            .unwrap_or_else(|| "<unactivated>".to_string())
    }

    /// Top-level entry point: classify `name` and dispatch (spec.md §4.5).
    #[instrument(skip(self), fields(namespace, name))]
    pub async fn reconcile(&mut self, namespace: &str, name: &str) -> Result<()> {
        match event::classify(namespace, name) {
            Event::CrUpdated { namespace, name } => self.handle_cr_updated(&namespace, &name).await,
            Event::OsdStateChanged {
                namespace, osd_id, ..
            } => {
                if self.state != State::Activated {
                    return error::EventBeforeActivationSnafu {
                        domain: self.domain_label(),
                    }
                    .fail();
                }
                self.handle_osd_state_changed(&namespace, &osd_id).await
            }
            Event::Ignored => Ok(()),
        }
    }

    /// spec.md §4.5.2 — CR_UPDATED handler (initialization).
    #[instrument(skip(self))]
    async fn handle_cr_updated(&mut self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<NvmeOfStorage> = Api::namespaced(self.client.clone(), namespace);
        let cr = api
            .get(name)
            .await
            .context(error::GetNvmeOfStorageSnafu {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        let spec = cr.spec.clone();

        self.rediscover_attached_devices(&spec).await?;
        let newly_attached = self.connect_undiscovered_devices(&spec).await?;
        self.storage = Some(spec.clone());

        cluster_projector::apply(
            &self.client,
            namespace,
            &spec.cluster_name,
            &self.map,
            &spec.fabric_host(),
        )
        .await?;

        if !newly_attached.is_empty() {
            self.crush_move_once_ready(&spec, &newly_attached).await;
        }

        self.state = State::Activated;
        info!(domain = %spec.name, "fabric domain activated");
        Ok(())
    }

    /// Step 2: repopulate the map from whatever is already attached, so a
    /// controller restart never re-attaches a device that survived it.
    async fn rediscover_attached_devices(&mut self, spec: &NvmeOfStorageSpec) -> Result<()> {
        let declared: Vec<String> = spec.devices.iter().map(|d| d.sub_nqn.clone()).collect();
        if declared.is_empty() {
            return Ok(());
        }
        // Node is cluster-scoped; Api::namespaced would target a
        // nonexistent /namespaces/<ns>/nodes path.
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes
            .list(&ListParams::default())
            .await
            .context(error::ListNodesSnafu)?;

        for node in &list.items {
            let Some(node_name) = node.metadata.name.as_ref() else {
                continue;
            };
            let connected = self
                .fabric_agent
                .list_connected(node_name, &declared)
                .await?;
            for (sub_nqn, device_path) in connected {
                let Some(device) = spec.devices.iter().find(|d| d.sub_nqn == sub_nqn) else {
                    continue;
                };
                self.map.add(FabricDescriptor {
                    sub_nqn,
                    port: device.port,
                    attached_node: node_name.clone(),
                    device_path,
                });
            }
        }
        Ok(())
    }

    /// Step 3: connect every declared device not already rediscovered.
    /// Returns the devices that were freshly connected by this call, for
    /// the readiness-gated CRUSH move in step 5.
    async fn connect_undiscovered_devices(
        &mut self,
        spec: &NvmeOfStorageSpec,
    ) -> Result<Vec<FabricDeviceSpec>> {
        let mut newly_attached = Vec::new();
        for device in &spec.devices {
            if self.map.get(&device.sub_nqn).is_some() {
                continue;
            }
            let device_path = self
                .fabric_agent
                .connect(&device.target_node, &spec.ip, device.port, &device.sub_nqn)
                .await?;
            self.map.add(FabricDescriptor {
                sub_nqn: device.sub_nqn.clone(),
                port: device.port,
                attached_node: device.target_node.clone(),
                device_path,
            });
            newly_attached.push(device.clone());
        }
        Ok(newly_attached)
    }

    /// Step 5 + §4.5.4: the safe CRUSH-move timing per spec.md §9 — at
    /// init, after OSD readiness is confirmed, never at recovery. Best
    /// effort: devices that never become ready within the deadline are
    /// simply skipped and picked up by the next reconcile.
    async fn crush_move_once_ready(&self, spec: &NvmeOfStorageSpec, devices: &[FabricDeviceSpec]) {
        let targets: Vec<(String, String)> = devices
            .iter()
            .filter_map(|d| self.map.get(&d.sub_nqn))
            .map(|fd| (fd.attached_node, fd.device_path))
            .collect();

        let ready = match wait_for_devices_ready(
            self.ceph_topology.as_ref(),
            &targets,
            self.readiness_deadline,
            self.readiness_poll_interval,
        )
        .await
        {
            Ok(entries) => entries,
            Err(source) => {
                warn!(%source, "failed polling OSD readiness before CRUSH move");
                return;
            }
        };

        for entry in ready {
            if let Err(source) = self
                .ceph_admin
                .crush_move(
                    &spec.cluster_name,
                    &entry.osd_id,
                    CRUSH_ROOT,
                    &spec.fabric_host(),
                )
                .await
            {
                warn!(%source, osd_id = %entry.osd_id, "CRUSH move failed after readiness");
            }
        }
    }

    /// spec.md §4.5.3 — OSD_STATE_CHANGED handler (recovery).
    #[instrument(skip(self))]
    async fn handle_osd_state_changed(&mut self, namespace: &str, osd_id: &str) -> Result<()> {
        let Some(spec) = self.storage.clone() else {
            return error::EventBeforeActivationSnafu {
                domain: self.domain_label(),
            }
            .fail();
        };

        // Step 2: locate the failing descriptor.
        let location = self.ceph_topology.locate_pod(osd_id).await?;
        let old = self
            .descriptor_at(&location.node, &location.device_path)
            .ok_or_else(|| Error::NoAttachableHost {
                sub_nqn: format!("osd.{}", osd_id),
                faulty_node: location.node.clone(),
            })?;

        // Step 3: cleanup. Both failures are fatal — the pod would
        // otherwise flap back up and reclaim the device.
        let deployment_name = format!("rook-ceph-osd-{}", osd_id);
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        deployments
            .delete(&deployment_name, &DeleteParams::default())
            .await
            .context(error::DeleteDeploymentSnafu {
                name: deployment_name.clone(),
            })?;
        self.fabric_agent
            .disconnect(&old.attached_node, &old.sub_nqn)
            .await?;

        // Step 4: least-loaded reselection.
        let new_host = match self.select_least_loaded_host(&old.attached_node) {
            Some(host) => host,
            None => {
                self.map.remove(&old);
                cluster_projector::apply(
                    &self.client,
                    namespace,
                    &spec.cluster_name,
                    &self.map,
                    &spec.fabric_host(),
                )
                .await?;
                info!(
                    sub_nqn = %old.sub_nqn,
                    "no attachable host left, leaving Ceph to rebalance from surviving OSDs"
                );
                return Ok(());
            }
        };

        // Step 5: connect on the new host.
        let new_device_path = self
            .fabric_agent
            .connect(&new_host, &spec.ip, old.port, &old.sub_nqn)
            .await?;

        // Step 6.
        self.map.remove(&old);
        self.map.add(FabricDescriptor {
            sub_nqn: old.sub_nqn.clone(),
            port: old.port,
            attached_node: new_host.clone(),
            device_path: new_device_path.clone(),
        });

        // Step 7: signal the outer cluster operator to schedule the OSD on
        // its new host with its new device path.
        cluster_projector::apply(
            &self.client,
            namespace,
            &spec.cluster_name,
            &self.map,
            &spec.fabric_host(),
        )
        .await?;

        // §6 ConfigMap side channel: best-effort, never read back by this
        // crate (spec.md §9 Open Question "Eviction vs. transfer").
        self.write_transfer_hint(namespace, osd_id, &new_host, &spec.fabric_host())
            .await;

        info!(
            sub_nqn = %old.sub_nqn,
            from = %old.attached_node,
            to = %new_host,
            "recovered OSD onto surviving host"
        );
        Ok(())
    }

    fn descriptor_at(&self, node: &str, device_path: &str) -> Option<FabricDescriptor> {
        descriptor_at(&self.map, node, device_path)
    }

    fn select_least_loaded_host(&self, faulty_node: &str) -> Option<String> {
        select_least_loaded_host(&self.map, faulty_node)
    }

    async fn write_transfer_hint(&self, namespace: &str, osd_id: &str, node: &str, fault_domain: &str) {
        let Ok(id) = osd_id.parse::<u32>() else {
            return;
        };
        let info = OsdTransferInfo {
            id,
            node: node.to_string(),
            fault_domain: fault_domain.to_string(),
        };
        let Ok(payload) = serde_json::to_string(&info) else {
            return;
        };
        let mut data = BTreeMap::new();
        data.insert(OSD_TRANSFER_CONFIGMAP_KEY.to_string(), payload);
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(OSD_TRANSFER_CONFIGMAP_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        if let Err(source) = api
            .replace(OSD_TRANSFER_CONFIGMAP_NAME, &PostParams::default(), &configmap)
            .await
        {
            match api.create(&PostParams::default(), &configmap).await {
                Ok(_) => {}
                Err(create_err) => {
                    warn!(%source, %create_err, "failed to write osd-transfer-config hint (best-effort)")
                }
            }
        }
    }
}

/// spec.md §4.5.3 step 2 helper: find the descriptor parked at
/// `(node, device_path)`. A free function (rather than a method taking
/// `&self`) so it's testable without a live [`kube::Client`].
fn descriptor_at(map: &FabricMap, node: &str, device_path: &str) -> Option<FabricDescriptor> {
    map.find_by_node(node)
        .0
        .into_iter()
        .find(|d| d.device_path == device_path)
}

/// Least-loaded policy (spec.md §4.5.3 step 4): candidate set is every
/// attachable node except the faulty one; pick the fewest currently
/// attached descriptors, ties broken by iteration order (the map's nodes
/// are sorted, so this is deterministic).
fn select_least_loaded_host(map: &FabricMap, faulty_node: &str) -> Option<String> {
    map.nodes()
        .into_iter()
        .filter(|n| n != faulty_node)
        .min_by_key(|n| map.find_by_node(n).0.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_types::FabricPort;

    fn fd(sub_nqn: &str, node: &str, path: &str) -> FabricDescriptor {
        FabricDescriptor {
            sub_nqn: sub_nqn.into(),
            port: FabricPort(4420),
            attached_node: node.into(),
            device_path: path.into(),
        }
    }

    fn map_with(entries: &[(&str, &str, &str)]) -> FabricMap {
        let mut map = FabricMap::new();
        for (sub_nqn, node, path) in entries {
            map.add(fd(sub_nqn, node, path));
        }
        map
    }

    #[test]
    fn least_loaded_selection_excludes_faulty_node() {
        // spec.md §8: A=2 devices, B=1, C=1, faulty on A -> B or C.
        let map = map_with(&[
            ("s0", "a", "/dev/nvme0n1"),
            ("s1", "a", "/dev/nvme1n1"),
            ("s2", "b", "/dev/nvme0n1"),
            ("s3", "c", "/dev/nvme0n1"),
        ]);
        let selected = select_least_loaded_host(&map, "a").unwrap();
        assert!(selected == "b" || selected == "c");
    }

    #[test]
    fn least_loaded_selection_none_when_no_survivors() {
        let map = map_with(&[("s0", "a", "/dev/nvme0n1")]);
        assert_eq!(select_least_loaded_host(&map, "a"), None);
    }

    #[test]
    fn descriptor_at_matches_node_and_device_path() {
        let map = map_with(&[("s0", "a", "/dev/nvme0n1"), ("s1", "a", "/dev/nvme1n1")]);
        let found = descriptor_at(&map, "a", "/dev/nvme1n1").unwrap();
        assert_eq!(found.sub_nqn, "s1");
        assert!(descriptor_at(&map, "a", "/dev/nvme9n1").is_none());
    }

    #[test]
    fn unrelated_event_name_is_ignored_not_an_error() {
        // classify() returning Ignored never reaches the activation guard.
        assert_eq!(
            event::classify("rook-ceph", "some-configmap"),
            Event::Ignored
        );
    }

    #[test]
    fn osd_pod_event_classifies_with_its_id() {
        let event = event::classify("rook-ceph", "rook-ceph-osd-0-abc123-xyz");
        assert!(matches!(event, Event::OsdStateChanged { osd_id, .. } if osd_id == "0"));
    }
}
