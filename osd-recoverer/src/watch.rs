//! Pod watch filter (spec.md §4.5.1): a pod update is only forwarded to the
//! reconciler when it carries the OSD label with an id, some container
//! status reports a crashloop, and it isn't already being torn down.

use k8s_openapi::api::core::v1::Pod;

const OSD_APP_LABEL_KEY: &str = "app";
const OSD_APP_LABEL_VALUE: &str = "rook-ceph-osd";
const OSD_ID_LABEL_KEY: &str = "ceph-osd-id";
const CRASHLOOP_REASON: &str = "CrashLoopBackOff";

/// True when `pod` should be forwarded as an `OSD_STATE_CHANGED` event.
/// Create/Delete/Generic watch events never reach this function; only the
/// latest observed state of an Update is checked (spec.md §4.5.1).
pub fn passes_filter(pod: &Pod) -> bool {
    has_osd_labels(pod) && is_crashlooping(pod) && pod.metadata.deletion_timestamp.is_none()
}

fn has_osd_labels(pod: &Pod) -> bool {
    let Some(labels) = pod.metadata.labels.as_ref() else {
        return false;
    };
    labels.get(OSD_APP_LABEL_KEY).map(String::as_str) == Some(OSD_APP_LABEL_VALUE)
        && labels
            .get(OSD_ID_LABEL_KEY)
            .is_some_and(|id| !id.is_empty())
}

fn is_crashlooping(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().any(|cs| {
                cs.state
                    .as_ref()
                    .and_then(|s| s.waiting.as_ref())
                    .and_then(|w| w.reason.as_deref())
                    == Some(CRASHLOOP_REASON)
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateWaiting, ContainerStatus, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;

    fn crashlooping_pod() -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "rook-ceph-osd".to_string());
        labels.insert("ceph-osd-id".to_string(), "3".to_string());
        Pod {
            metadata: ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "osd".to_string(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some("CrashLoopBackOff".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn passes_when_crashlooping_with_osd_labels() {
        assert!(passes_filter(&crashlooping_pod()));
    }

    #[test]
    fn rejects_pod_without_osd_label() {
        let mut pod = crashlooping_pod();
        pod.metadata.labels = None;
        assert!(!passes_filter(&pod));
    }

    #[test]
    fn rejects_pod_with_empty_osd_id() {
        let mut pod = crashlooping_pod();
        pod.metadata
            .labels
            .as_mut()
            .unwrap()
            .insert("ceph-osd-id".to_string(), "".to_string());
        assert!(!passes_filter(&pod));
    }

    #[test]
    fn rejects_pod_not_crashlooping() {
        let mut pod = crashlooping_pod();
        pod.status.as_mut().unwrap().container_statuses.as_mut().unwrap()[0]
            .state
            .as_mut()
            .unwrap()
            .waiting
            .as_mut()
            .unwrap()
            .reason = Some("ContainerCreating".to_string());
        assert!(!passes_filter(&pod));
    }

    #[test]
    fn rejects_pod_already_marked_for_deletion() {
        let mut pod = crashlooping_pod();
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!passes_filter(&pod));
    }
}
