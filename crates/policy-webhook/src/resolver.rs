use tracing::debug;

use image_policy::reference::ImageReference;

use crate::admission::Operation;
use crate::verify::contract::{DigestResolver, Keychain};
use crate::workload;

/// Rewrites every tag-form container image of a pod-like object to its
/// digest form, using the same keychain verification will use.
///
/// Runs on create and update only, never on objects being deleted.
/// Resolution failures are skipped silently: the validating side will
/// reject the still-tag-form image if a policy applies to it.
pub async fn resolve_tag_references(
    object: &mut serde_json::Value,
    kind: &str,
    operation: Operation,
    resolver: &dyn DigestResolver,
    keychain: &Keychain,
) {
    if operation == Operation::Delete {
        return;
    }
    if workload::is_being_deleted(object) {
        return;
    }
    let Some(path) = workload::pod_spec_path(kind) else {
        return;
    };

    let mut pod_spec = &mut *object;
    for segment in path {
        let Some(next) = pod_spec.get_mut(segment) else {
            return;
        };
        pod_spec = next;
    }

    for field in workload::CONTAINER_FIELDS {
        let Some(containers) = pod_spec.get_mut(*field).and_then(|c| c.as_array_mut()) else {
            continue;
        };
        for container in containers {
            let Some(image) = container.get("image").and_then(|v| v.as_str()) else {
                continue;
            };
            match ImageReference::parse(image) {
                Ok(reference) if reference.is_digest() => continue,
                Ok(_) => {}
                Err(error) => {
                    debug!(image, %error, "skipping unparseable image reference");
                    continue;
                }
            }
            match resolver.resolve_digest(image, keychain).await {
                Ok(digest) => {
                    let resolved = format!("{image}@{digest}");
                    debug!(image, resolved, "resolved tag to digest");
                    container["image"] = serde_json::Value::String(resolved);
                }
                Err(error) => {
                    debug!(image, %error, "digest resolution failed, leaving tag in place");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::contract::VerifyError;
    use async_trait::async_trait;
    use serde_json::json;

    const DIGEST: &str = "sha256:be5d77c62dbe7fedfb0a4e5ec2f91078080800ab1f18358e5f31fcc8faa023c4";

    struct StubResolver {
        fail_for: Option<String>,
    }

    #[async_trait]
    impl DigestResolver for StubResolver {
        async fn resolve_digest(
            &self,
            image: &str,
            _keychain: &Keychain,
        ) -> Result<String, VerifyError> {
            if self.fail_for.as_deref() == Some(image) {
                return Err(VerifyError::Registry("manifest unknown".to_string()));
            }
            Ok(DIGEST.to_string())
        }
    }

    #[tokio::test]
    async fn rewrites_tags_and_keeps_digests() {
        let mut object = json!({
            "kind": "Pod",
            "metadata": {},
            "spec": {"containers": [
                {"image": "gcr.io/distroless/static:nonroot"},
                {"image": format!("gcr.io/distroless/base@{DIGEST}")}
            ]}
        });
        resolve_tag_references(
            &mut object,
            "Pod",
            Operation::Create,
            &StubResolver { fail_for: None },
            &Keychain::default(),
        )
        .await;
        assert_eq!(
            object["spec"]["containers"][0]["image"],
            format!("gcr.io/distroless/static:nonroot@{DIGEST}")
        );
        assert_eq!(
            object["spec"]["containers"][1]["image"],
            format!("gcr.io/distroless/base@{DIGEST}")
        );
    }

    #[tokio::test]
    async fn resolution_failures_are_skipped_silently() {
        let mut object = json!({
            "kind": "Pod",
            "metadata": {},
            "spec": {"containers": [{"image": "gcr.io/broken/image:v1"}]}
        });
        resolve_tag_references(
            &mut object,
            "Pod",
            Operation::Create,
            &StubResolver {
                fail_for: Some("gcr.io/broken/image:v1".to_string()),
            },
            &Keychain::default(),
        )
        .await;
        assert_eq!(
            object["spec"]["containers"][0]["image"],
            "gcr.io/broken/image:v1"
        );
    }

    #[tokio::test]
    async fn objects_being_deleted_are_left_alone() {
        let mut object = json!({
            "kind": "Pod",
            "metadata": {"deletionTimestamp": "2024-01-01T00:00:00Z"},
            "spec": {"containers": [{"image": "gcr.io/x/y:v1"}]}
        });
        resolve_tag_references(
            &mut object,
            "Pod",
            Operation::Update,
            &StubResolver { fail_for: None },
            &Keychain::default(),
        )
        .await;
        assert_eq!(object["spec"]["containers"][0]["image"], "gcr.io/x/y:v1");
    }

    #[tokio::test]
    async fn workload_templates_are_resolved_in_place() {
        let mut object = json!({
            "kind": "CronJob",
            "metadata": {},
            "spec": {"jobTemplate": {"spec": {"template": {"spec": {
                "containers": [{"image": "gcr.io/x/y:v1"}]
            }}}}}
        });
        resolve_tag_references(
            &mut object,
            "CronJob",
            Operation::Create,
            &StubResolver { fail_for: None },
            &Keychain::default(),
        )
        .await;
        assert_eq!(
            object["spec"]["jobTemplate"]["spec"]["template"]["spec"]["containers"][0]["image"],
            format!("gcr.io/x/y:v1@{DIGEST}")
        );
    }
}
