//! Builds and runs the one-shot privileged workload that talks `nvme-cli`
//! on a chosen host (spec.md §6 "Job template"), and fetches its logs.

use crate::error::{self, Result};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, ListParams, LogParams, PostParams};
use kube::{Api, Client};
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::time::Duration;

/// Matches the teacher's one-shot-job naming; reused (and replaced) across
/// invocations rather than given a fresh name each time, per spec.md §6.
pub const JOB_NAME: &str = "nvmeof-conn-control-job";
const JOB_IMAGE: &str = "quay.io/ceph/ceph:v18";
pub const JOB_COMPLETION_DEADLINE: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Runs `script` (a `python3 -c` program emitting `SUCCESS:`/`FAILED:`
/// lines, per spec.md §4.2) on `target_host` inside `namespace`, waits up
/// to [`JOB_COMPLETION_DEADLINE`], and returns the combined pod log.
pub async fn run(
    client: &Client,
    namespace: &str,
    target_host: &str,
    script: &str,
) -> Result<String> {
    let jobs: Api<Job> = Api::namespaced(client.clone(), namespace);

    // RunReplaceableJob semantics: a stale job from a prior crash must not
    // block this one from being created.
    let _ = jobs
        .delete(JOB_NAME, &DeleteParams::background())
        .await;

    let job = build_job(namespace, target_host, script);
    jobs.create(&PostParams::default(), &job)
        .await
        .context(error::JobSubmitSnafu {
            job: JOB_NAME,
            host: target_host,
        })?;

    let completed = wait_for_completion(&jobs, JOB_COMPLETION_DEADLINE).await;

    let pods: Api<k8s_openapi::api::core::v1::Pod> = Api::namespaced(client.clone(), namespace);
    let log = fetch_logs(&pods, namespace, target_host).await?;

    let _ = jobs.delete(JOB_NAME, &DeleteParams::background()).await;

    if !completed {
        return error::JobTimeoutSnafu {
            job: JOB_NAME,
            host: target_host,
            timeout: JOB_COMPLETION_DEADLINE,
        }
        .fail();
    }
    Ok(log)
}

async fn wait_for_completion(jobs: &Api<Job>, deadline: Duration) -> bool {
    let start = std::time::Instant::now();
    loop {
        if let Ok(job) = jobs.get(JOB_NAME).await {
            let succeeded = job
                .status
                .as_ref()
                .and_then(|s| s.succeeded)
                .unwrap_or(0)
                > 0;
            let failed = job.status.as_ref().and_then(|s| s.failed).unwrap_or(0) > 0;
            if succeeded || failed {
                return true;
            }
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn fetch_logs(
    pods: &Api<k8s_openapi::api::core::v1::Pod>,
    _namespace: &str,
    target_host: &str,
) -> Result<String> {
    let list = pods
        .list(&ListParams::default().labels(&format!("job-name={}", JOB_NAME)))
        .await
        .context(error::JobLogsSnafu {
            job: JOB_NAME,
            host: target_host,
        })?;
    let Some(pod) = list.items.into_iter().next() else {
        return Ok(String::new());
    };
    let name = pod.metadata.name.unwrap_or_default();
    pods.logs(&name, &LogParams::default())
        .await
        .context(error::JobLogsSnafu {
            job: JOB_NAME,
            host: target_host,
        })
}

fn build_job(namespace: &str, target_host: &str, script: &str) -> Job {
    let mut node_selector = BTreeMap::new();
    node_selector.insert("kubernetes.io/hostname".to_string(), target_host.to_string());

    let container = Container {
        name: "nvmeof-conn-control".to_string(),
        image: Some(JOB_IMAGE.to_string()),
        command: Some(vec![
            "python3".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: "devices".to_string(),
            mount_path: "/dev".to_string(),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        env: Some(vec![EnvVar {
            name: "NVME_HOST".to_string(),
            value: Some(target_host.to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(JOB_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some("nvmeof-conn-control".to_string()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "devices".to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: "/dev".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    restart_policy: Some("Never".to_string()),
                    host_network: Some(true),
                    node_selector: Some(node_selector),
                    ..Default::default()
                }),
            },
            backoff_limit: Some(0),
            ..Default::default()
        }),
        status: None,
    }
}
