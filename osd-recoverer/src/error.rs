use snafu::Snafu;

/// Error-handling policy (spec.md §7): every fallible reconcile step is
/// classified so the caller knows whether to requeue with backoff, abort
/// loudly with a status condition, or panic.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Kind {
    /// CR Get not-found, Update conflict, retryable Ceph command error:
    /// the framework requeues with backoff.
    Transient,
    /// Connect/Disconnect failed, CRUSH move failed, OSD pod not found,
    /// job timeout: abort the reconcile, leave state untouched, surface
    /// for human intervention.
    Fatal,
    /// Event name matched neither known prefix while in a state that
    /// requires one, or `OSD_STATE_CHANGED` arrived in `INITIALIZATION`:
    /// a programming error, not an operational one.
    Programming,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to get NvmeOfStorage {}/{}: {}", namespace, name, source))]
    GetNvmeOfStorage {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[snafu(display("failed to list cluster nodes: {}", source))]
    ListNodes { source: kube::Error },
    #[snafu(display("fabric agent error: {}", source))]
    FabricAgent { source: fabric_agent::Error },
    #[snafu(display("ceph topology error: {}", source))]
    CephTopology { source: ceph_topology::Error },
    #[snafu(display("cluster projector error: {}", source))]
    ClusterProjector { source: cluster_projector::Error },
    #[snafu(display("failed to delete OSD deployment {}: {}", name, source))]
    DeleteDeployment { name: String, source: kube::Error },
    #[snafu(display("no attachable host left for SubNQN {} after node {} failed", sub_nqn, faulty_node))]
    NoAttachableHost { sub_nqn: String, faulty_node: String },
    #[snafu(display(
        "OSD_STATE_CHANGED received while controller is still in INITIALIZATION for domain {}",
        domain
    ))]
    EventBeforeActivation { domain: String },
    #[snafu(display("unrecognised event name '{}' matches neither known prefix", name))]
    UnrecognisedEvent { name: String },
}

impl From<fabric_agent::Error> for Error {
    fn from(source: fabric_agent::Error) -> Self {
        Error::FabricAgent { source }
    }
}

impl From<ceph_topology::Error> for Error {
    fn from(source: ceph_topology::Error) -> Self {
        Error::CephTopology { source }
    }
}

impl From<cluster_projector::Error> for Error {
    fn from(source: cluster_projector::Error) -> Self {
        Error::ClusterProjector { source }
    }
}

impl Error {
    pub fn kind(&self) -> Kind {
        match self {
            Error::GetNvmeOfStorage { source, .. } if is_not_found(source) => Kind::Transient,
            Error::ClusterProjector {
                source: cluster_projector::Error::UpdateCluster { source, .. },
            } if is_conflict(source) => Kind::Transient,
            Error::EventBeforeActivation { .. } | Error::UnrecognisedEvent { .. } => {
                Kind::Programming
            }
            _ => Kind::Fatal,
        }
    }
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
