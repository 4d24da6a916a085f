//! Watches `NvmeOfStorage` (all events) and `Pod` (crashloop updates only)
//! and drives a single [`Reconciler`] off the merged stream, the way the
//! teacher's node operator drives a polling loop off its own REST/k8s
//! sources — except here the event source is a real watch, not a timer.

use ceph_topology::{CliCephAdmin, K8sCephTopology};
use fabric_agent::K8sFabricAgent;
use fabric_types::NvmeOfStorage;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use osd_recoverer::{watch as pod_watch, Kind, Reconciler};
use std::sync::Arc;
use structopt::StructOpt;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug, StructOpt)]
#[structopt(name = "osd-recoverer")]
struct CliArgs {
    /// Namespace the NvmeOfStorage CR, CephCluster and rook-ceph-osd pods
    /// live in.
    #[structopt(long, short, default_value = "rook-ceph")]
    namespace: String,

    /// Ceph binary used for CRUSH mutations; must already have admin
    /// credentials mounted into this pod.
    #[structopt(long, default_value = "ceph")]
    ceph_binary: String,

    /// How long to wait for a freshly connected device's OSD to report
    /// ready before giving up on the init-time CRUSH move (spec.md §4.5.4).
    #[structopt(long, default_value = "60s")]
    readiness_deadline: humantime::Duration,

    /// Poll interval while waiting on OSD readiness.
    #[structopt(long, default_value = "3s")]
    readiness_poll_interval: humantime::Duration,
}

fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = CliArgs::from_args();

    let client = Client::try_default().await?;
    let fabric_agent = Arc::new(K8sFabricAgent::new(client.clone(), args.namespace.clone()));
    let ceph_topology = Arc::new(K8sCephTopology::new(client.clone(), args.namespace.clone()));
    let ceph_admin = Arc::new(CliCephAdmin::new(args.ceph_binary.clone()));

    // Single-threaded per failure domain (spec.md §5): the mutex is held
    // across the whole reconcile body, not released between suspension
    // points, so two watch events are never processed concurrently.
    let reconciler = Mutex::new(
        Reconciler::new(
            client.clone(),
            args.namespace.clone(),
            fabric_agent,
            ceph_topology,
            ceph_admin,
        )
        .with_readiness_timing(
            args.readiness_deadline.into(),
            args.readiness_poll_interval.into(),
        ),
    );

    let storage_api: Api<NvmeOfStorage> = Api::namespaced(client.clone(), &args.namespace);
    let pod_api: Api<Pod> = Api::namespaced(client.clone(), &args.namespace);

    let storage_events = watcher::watcher(storage_api, WatcherConfig::default())
        .applied_objects()
        .map(|res| res.map(|obj| (obj.namespace().unwrap_or_default(), obj.name_any())));

    let pod_events = watcher::watcher(pod_api, WatcherConfig::default())
        .applied_objects()
        .filter_map(|res| async move {
            match res {
                Ok(pod) if pod_watch::passes_filter(&pod) => {
                    Some(Ok((pod.namespace().unwrap_or_default(), pod.name_any())))
                }
                Ok(_) => None,
                Err(source) => Some(Err(source)),
            }
        });

    let mut events = stream::select(storage_events, pod_events);
    info!(namespace = %args.namespace, "osd-recoverer started, watching NvmeOfStorage and Pod");

    while let Some(event) = events.next().await {
        let (namespace, name) = match event {
            Ok(pair) => pair,
            Err(source) => {
                error!(%source, "watch stream error, will retry on the next event");
                continue;
            }
        };

        let mut reconciler = reconciler.lock().await;
        if let Err(err) = reconciler.reconcile(&namespace, &name).await {
            match err.kind() {
                Kind::Transient => {
                    info!(%err, namespace, name, "transient error, requeued by the next watch event")
                }
                Kind::Fatal => {
                    error!(%err, namespace, name, "fatal reconcile error, needs human intervention")
                }
                Kind::Programming => panic!("programming error in reconcile({namespace}/{name}): {err}"),
            }
        }
    }

    Ok(())
}
