use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to get CephCluster {}/{}: {}", namespace, name, source))]
    GetCluster {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[snafu(display("failed to update CephCluster {}/{}: {}", namespace, name, source))]
    UpdateCluster {
        namespace: String,
        name: String,
        source: kube::Error,
    },
    #[snafu(display(
        "duplicate device {} on node {} in fabric map — refusing to project a corrupt topology",
        device_path,
        node
    ))]
    DuplicateDevice { node: String, device_path: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
