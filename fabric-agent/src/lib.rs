//! Executes connect / disconnect / list-connected on a chosen host via a
//! one-shot privileged job (spec.md §4.2).

mod error;
pub mod job;
mod output;
pub mod script;

pub use error::{Error, Result};
pub use output::last_marker;

use async_trait::async_trait;
use fabric_types::FabricPort;
use kube::Client;
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Connect / disconnect / list-connected on a *specified* host, each
/// implemented as a one-shot privileged workload pinned to that host.
#[async_trait]
pub trait FabricAgent: Send + Sync {
    /// Idempotent on the fabric side: connecting an already-connected
    /// SubNQN is a no-op or yields the same device. A zero-new-device
    /// result falls back to [`FabricAgent::list_connected`] before the
    /// call is declared failed.
    async fn connect(
        &self,
        host: &str,
        ip: &str,
        port: FabricPort,
        sub_nqn: &str,
    ) -> Result<String>;

    async fn disconnect(&self, host: &str, sub_nqn: &str) -> Result<()>;

    async fn list_connected(
        &self,
        host: &str,
        sub_nqns: &[String],
    ) -> Result<HashMap<String, String>>;
}

/// Production [`FabricAgent`] backed by Kubernetes `Job`s.
#[derive(Clone)]
pub struct K8sFabricAgent {
    client: Client,
    namespace: String,
}

impl K8sFabricAgent {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl FabricAgent for K8sFabricAgent {
    #[instrument(skip(self), fields(host, sub_nqn))]
    async fn connect(
        &self,
        host: &str,
        ip: &str,
        port: FabricPort,
        sub_nqn: &str,
    ) -> Result<String> {
        let port = port.to_string();
        let log = job::run(
            &self.client,
            &self.namespace,
            host,
            &script::connect(ip, &port, sub_nqn),
        )
        .await?;

        match output::last_marker(&log) {
            Some((true, device_path)) => {
                debug!(device_path, "connected NVMe-oF device");
                Ok(device_path.to_string())
            }
            _ => {
                // Open Question (spec.md §9): the kernel may not hand out
                // a fresh device path on reconnect (NVMe multipath). Fall
                // back to ListConnected before declaring failure.
                let wanted = vec![sub_nqn.to_string()];
                let connected = self.list_connected(host, &wanted).await?;
                connected
                    .get(sub_nqn)
                    .cloned()
                    .ok_or_else(|| error::Error::ConnectFailed {
                        sub_nqn: sub_nqn.to_string(),
                        host: host.to_string(),
                        reason: "no new device appeared and none found via list-connected"
                            .to_string(),
                    })
            }
        }
    }

    #[instrument(skip(self), fields(host, sub_nqn))]
    async fn disconnect(&self, host: &str, sub_nqn: &str) -> Result<()> {
        let log = job::run(&self.client, &self.namespace, host, &script::disconnect(sub_nqn))
            .await?;
        match output::last_marker(&log) {
            Some((true, _)) => Ok(()),
            Some((false, reason)) => Err(error::Error::DisconnectFailed {
                sub_nqn: sub_nqn.to_string(),
                host: host.to_string(),
                reason: reason.to_string(),
            }),
            None => Err(error::Error::DisconnectFailed {
                sub_nqn: sub_nqn.to_string(),
                host: host.to_string(),
                reason: "no SUCCESS/FAILED marker in job output".to_string(),
            }),
        }
    }

    #[instrument(skip(self, sub_nqns), fields(host))]
    async fn list_connected(
        &self,
        host: &str,
        sub_nqns: &[String],
    ) -> Result<HashMap<String, String>> {
        if sub_nqns.is_empty() {
            return Ok(HashMap::new());
        }
        let log = job::run(
            &self.client,
            &self.namespace,
            host,
            &script::list_connected(sub_nqns),
        )
        .await?;
        Ok(output::parse_connected(&log))
    }
}

/// Test double satisfying [`FabricAgent`] over a canned in-memory script of
/// expected calls, the way the teacher's node operator is tested against a
/// fake `RestClient` rather than a real REST server.
pub mod fake {
    use super::*;
    use std::collections::HashMap as Map;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct FakeFabricAgent {
        /// host -> (already-connected subnqn -> device path)
        pub connected: Mutex<Map<String, Map<String, String>>>,
        pub connect_calls: Mutex<Vec<(String, String)>>,
        pub disconnect_calls: Mutex<Vec<(String, String)>>,
        pub next_device_suffix: Mutex<u32>,
        pub fail_connect: Mutex<Option<String>>,
    }

    impl FakeFabricAgent {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn seed_connected(&self, host: &str, sub_nqn: &str, device_path: &str) {
            self.connected
                .lock()
                .await
                .entry(host.to_string())
                .or_default()
                .insert(sub_nqn.to_string(), device_path.to_string());
        }
    }

    #[async_trait]
    impl FabricAgent for FakeFabricAgent {
        async fn connect(
            &self,
            host: &str,
            _ip: &str,
            _port: FabricPort,
            sub_nqn: &str,
        ) -> Result<String> {
            self.connect_calls
                .lock()
                .await
                .push((host.to_string(), sub_nqn.to_string()));
            if let Some(reason) = self.fail_connect.lock().await.clone() {
                return Err(error::Error::ConnectFailed {
                    sub_nqn: sub_nqn.to_string(),
                    host: host.to_string(),
                    reason,
                });
            }
            let mut suffix = self.next_device_suffix.lock().await;
            let device_path = format!("/dev/nvme{}n1", *suffix);
            *suffix += 1;
            self.connected
                .lock()
                .await
                .entry(host.to_string())
                .or_default()
                .insert(sub_nqn.to_string(), device_path.clone());
            Ok(device_path)
        }

        async fn disconnect(&self, host: &str, sub_nqn: &str) -> Result<()> {
            self.disconnect_calls
                .lock()
                .await
                .push((host.to_string(), sub_nqn.to_string()));
            let mut connected = self.connected.lock().await;
            match connected.get_mut(host).and_then(|m| m.remove(sub_nqn)) {
                Some(_) => Ok(()),
                None => Err(error::Error::DisconnectFailed {
                    sub_nqn: sub_nqn.to_string(),
                    host: host.to_string(),
                    reason: "disconnected 0 controller(s)".to_string(),
                }),
            }
        }

        async fn list_connected(
            &self,
            host: &str,
            sub_nqns: &[String],
        ) -> Result<Map<String, String>> {
            let connected = self.connected.lock().await;
            let Some(on_host) = connected.get(host) else {
                return Ok(Map::new());
            };
            Ok(on_host
                .iter()
                .filter(|(nqn, _)| sub_nqns.contains(nqn))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeFabricAgent;
    use super::*;

    #[tokio::test]
    async fn connect_returns_new_device_path() {
        let agent = FakeFabricAgent::new();
        let path = agent
            .connect("n1", "10.0.0.1", FabricPort(4420), "nqn.s0")
            .await
            .unwrap();
        assert_eq!(path, "/dev/nvme0n1");
    }

    #[tokio::test]
    async fn list_connected_reports_only_requested_subnqns() {
        let agent = FakeFabricAgent::new();
        agent.seed_connected("n1", "nqn.s0", "/dev/nvme0n1").await;
        agent.seed_connected("n1", "nqn.s1", "/dev/nvme1n1").await;
        let found = agent
            .list_connected("n1", &["nqn.s0".to_string()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found.get("nqn.s0").unwrap(), "/dev/nvme0n1");
    }
}
