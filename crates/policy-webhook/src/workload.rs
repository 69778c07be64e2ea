use std::collections::BTreeMap;

/// The pod-like kinds admission understands. Anything else is passed
/// through untouched.
pub const SUPPORTED_KINDS: &[&str] = &[
    "Pod",
    "ReplicaSet",
    "Deployment",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "CronJob",
];

/// JSON path from the object root to the pod spec.
pub fn pod_spec_path(kind: &str) -> Option<&'static [&'static str]> {
    match kind {
        "Pod" => Some(&["spec"]),
        "ReplicaSet" | "Deployment" | "StatefulSet" | "DaemonSet" | "Job" => {
            Some(&["spec", "template", "spec"])
        }
        "CronJob" => Some(&["spec", "jobTemplate", "spec", "template", "spec"]),
        _ => None,
    }
}

/// Field error prefix for the pod spec of the kind, e.g.
/// `spec.template.spec` for a Deployment.
pub fn field_path_prefix(kind: &str) -> Option<&'static str> {
    match kind {
        "Pod" => Some("spec"),
        "ReplicaSet" | "Deployment" | "StatefulSet" | "DaemonSet" | "Job" => {
            Some("spec.template.spec")
        }
        "CronJob" => Some("spec.jobTemplate.spec.template.spec"),
        _ => None,
    }
}

pub fn extract_pod_spec<'a>(
    object: &'a serde_json::Value,
    kind: &str,
) -> Option<&'a serde_json::Value> {
    let mut current = object;
    for segment in pod_spec_path(kind)? {
        current = current.get(segment)?;
    }
    Some(current)
}

/// The container list fields of a pod spec, in validation order.
pub const CONTAINER_FIELDS: &[&str] = &["initContainers", "containers", "ephemeralContainers"];

/// Every container image of the pod spec: `(field, index, image)`.
pub fn container_images(pod_spec: &serde_json::Value) -> Vec<(&'static str, usize, String)> {
    let mut images = Vec::new();
    for field in CONTAINER_FIELDS {
        let Some(containers) = pod_spec.get(*field).and_then(|c| c.as_array()) else {
            continue;
        };
        for (i, container) in containers.iter().enumerate() {
            if let Some(image) = container.get("image").and_then(|v| v.as_str()) {
                images.push((*field, i, image.to_string()));
            }
        }
    }
    images
}

pub fn labels_of(object: &serde_json::Value) -> BTreeMap<String, String> {
    object
        .get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| l.as_object())
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

pub fn namespace_of(object: &serde_json::Value) -> Option<&str> {
    object
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(|n| n.as_str())
}

pub fn is_being_deleted(object: &serde_json::Value) -> bool {
    object
        .get("metadata")
        .and_then(|m| m.get("deletionTimestamp"))
        .map(|t| !t.is_null())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pod_spec_paths_cover_all_workload_kinds() {
        for kind in SUPPORTED_KINDS {
            assert!(pod_spec_path(kind).is_some(), "{kind}");
            assert!(field_path_prefix(kind).is_some(), "{kind}");
        }
        assert!(pod_spec_path("ConfigMap").is_none());
    }

    #[test]
    fn extracts_cronjob_pod_spec() {
        let cronjob = json!({
            "kind": "CronJob",
            "spec": {"jobTemplate": {"spec": {"template": {"spec": {
                "containers": [{"name": "main", "image": "gcr.io/x/y:v1"}]
            }}}}}
        });
        let spec = extract_pod_spec(&cronjob, "CronJob").unwrap();
        let images = container_images(spec);
        assert_eq!(images, vec![("containers", 0, "gcr.io/x/y:v1".to_string())]);
    }

    #[test]
    fn init_containers_come_first() {
        let pod_spec = json!({
            "initContainers": [{"image": "gcr.io/x/init"}],
            "containers": [{"image": "gcr.io/x/main"}, {"image": "gcr.io/x/sidecar"}]
        });
        let images = container_images(&pod_spec);
        assert_eq!(images[0].0, "initContainers");
        assert_eq!(images.len(), 3);
        assert_eq!(images[2].1, 1);
    }

    #[test]
    fn deletion_timestamp_is_detected() {
        assert!(is_being_deleted(&json!({
            "metadata": {"deletionTimestamp": "2024-01-01T00:00:00Z"}
        })));
        assert!(!is_being_deleted(&json!({"metadata": {}})));
    }
}
