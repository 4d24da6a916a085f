//! Event discrimination by substring of `request.Name` (spec.md §4.5,
//! §9). The source matches inline in the reconcile function; we classify
//! once at the entry point into an explicit enum instead, so the string
//! matching doesn't leak into the handlers.

const CR_TOKEN: &str = "nvmeofstorage";
const OSD_POD_TOKEN: &str = "rook-ceph-osd";

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    CrUpdated { namespace: String, name: String },
    OsdStateChanged {
        namespace: String,
        pod_name: String,
        osd_id: String,
    },
    Ignored,
}

pub fn classify(namespace: &str, name: &str) -> Event {
    if name.contains(CR_TOKEN) {
        return Event::CrUpdated {
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
    }
    if name.contains(OSD_POD_TOKEN) {
        return match osd_id_from_pod_name(name) {
            Some(osd_id) => Event::OsdStateChanged {
                namespace: namespace.to_string(),
                pod_name: name.to_string(),
                osd_id,
            },
            None => Event::Ignored,
        };
    }
    Event::Ignored
}

/// Parses the OSD id out of a pod name: everything between
/// `rook-ceph-osd-` and the next `-` (spec.md §4.5.3 step 1).
fn osd_id_from_pod_name(name: &str) -> Option<String> {
    let rest = name.split(&format!("{}-", OSD_POD_TOKEN)).nth(1)?;
    let id = rest.split('-').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_cr_update() {
        let event = classify("rook-ceph", "my-nvmeofstorage");
        assert_eq!(
            event,
            Event::CrUpdated {
                namespace: "rook-ceph".into(),
                name: "my-nvmeofstorage".into(),
            }
        );
    }

    #[test]
    fn classifies_osd_pod_and_extracts_id() {
        let event = classify("rook-ceph", "rook-ceph-osd-12-7f8d9c6b5-abcde");
        assert_eq!(
            event,
            Event::OsdStateChanged {
                namespace: "rook-ceph".into(),
                pod_name: "rook-ceph-osd-12-7f8d9c6b5-abcde".into(),
                osd_id: "12".into(),
            }
        );
    }

    #[test]
    fn ignores_unrelated_names() {
        assert_eq!(classify("rook-ceph", "some-other-configmap"), Event::Ignored);
    }
}
