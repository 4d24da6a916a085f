use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("failed to submit job {} on host {}: {}", job, host, source))]
    JobSubmit {
        job: String,
        host: String,
        source: kube::Error,
    },
    #[snafu(display("job {} on host {} did not complete within {:?}", job, host, timeout))]
    JobTimeout {
        job: String,
        host: String,
        timeout: std::time::Duration,
    },
    #[snafu(display("failed to read logs for job {} on host {}: {}", job, host, source))]
    JobLogs {
        job: String,
        host: String,
        source: kube::Error,
    },
    #[snafu(display("failed to connect SubNQN {} on host {}: {}", sub_nqn, host, reason))]
    ConnectFailed {
        sub_nqn: String,
        host: String,
        reason: String,
    },
    #[snafu(display("failed to disconnect SubNQN {} on host {}: {}", sub_nqn, host, reason))]
    DisconnectFailed {
        sub_nqn: String,
        host: String,
        reason: String,
    },
    #[snafu(display("failed to clean up job {} on host {}: {}", job, host, source))]
    JobCleanup {
        job: String,
        host: String,
        source: kube::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
