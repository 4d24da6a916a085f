use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to list OSD pods: {}", source))]
    ListPods { source: kube::Error },
    #[snafu(display("OSD {} not found (expected exactly one pod, found {})", osd_id, found))]
    OsdNotFound { osd_id: String, found: usize },
    #[snafu(display("pod for OSD {} has no ROOK_BLOCK_PATH set on its first container", osd_id))]
    MissingBlockPath { osd_id: String },
    #[snafu(display("pod for OSD {} has no scheduled node", osd_id))]
    MissingNode { osd_id: String },
    #[snafu(display(
        "ceph osd crush move osd.{} root={} host={} failed: {}",
        osd_id,
        root_bucket,
        host_bucket,
        reason
    ))]
    CrushMoveFailed {
        osd_id: String,
        root_bucket: String,
        host_bucket: String,
        reason: String,
    },
    #[snafu(display("failed to spawn ceph admin command: {}", source))]
    SpawnCephCommand { source: std::io::Error },
    #[snafu(display("failed to parse ceph admin command JSON output: {}", source))]
    ParseCephOutput { source: serde_json::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
