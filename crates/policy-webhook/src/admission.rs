use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use image_policy::reference::ImageReference;

use crate::matcher::{matching_policies, ResourceDescriptor};
use crate::store::Snapshot;
use crate::verify::errors::FailureKind;
use crate::verify::{verify_image, VerificationContext};
use crate::workload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
}

/// What to do with images no policy matches.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NoMatchPolicy {
    Allow,
    Warn,
    #[default]
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Warning,
    Error,
}

/// A structured admission finding, bound to the field path of the
/// offending container image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub level: Level,
    pub message: String,
    pub details: Option<String>,
}

impl FieldError {
    fn error(path: String, message: String, details: Option<String>) -> FieldError {
        FieldError {
            path,
            level: Level::Error,
            message,
            details,
        }
    }

    fn warning(path: String, message: String, details: Option<String>) -> FieldError {
        FieldError {
            path,
            level: Level::Warning,
            message,
            details,
        }
    }
}

/// True when no error-level finding is present, i.e. the request is
/// admissible (possibly with warnings).
pub fn is_allowed(errors: &[FieldError]) -> bool {
    errors.iter().all(|e| e.level == Level::Warning)
}

/// One parsed admission request, reduced to what the decider consumes. The
/// plural `resource` is derived from the kind by the admission framework.
#[derive(Debug, Clone)]
pub struct AdmissionRequest<'a> {
    pub object: &'a serde_json::Value,
    pub old_object: Option<&'a serde_json::Value>,
    pub kind: &'a str,
    pub group: &'a str,
    pub version: &'a str,
    pub resource: &'a str,
    pub operation: Operation,
    pub subresource: Option<&'a str>,
}

/// Validates every container image of a pod-like admission request against
/// the policies in the snapshot. An empty result admits the request;
/// warning-level findings admit it with warnings attached.
pub async fn validate(
    request: &AdmissionRequest<'_>,
    snapshot: Arc<Snapshot>,
    ctx: Arc<VerificationContext>,
    no_match_policy: NoMatchPolicy,
    cancel: CancellationToken,
) -> Vec<FieldError> {
    // Deletions, status flushes and resources already on their way out are
    // none of our business.
    if request.operation == Operation::Delete {
        return vec![];
    }
    if matches!(request.subresource, Some("status")) {
        return vec![];
    }
    if workload::is_being_deleted(request.object) {
        return vec![];
    }
    if is_scale_down(request) {
        return vec![];
    }

    let Some(pod_spec) = workload::extract_pod_spec(request.object, request.kind) else {
        return vec![];
    };
    let Some(prefix) = workload::field_path_prefix(request.kind) else {
        return vec![];
    };

    let descriptor = ResourceDescriptor {
        group: request.group.to_string(),
        version: request.version.to_string(),
        resource: request.resource.to_string(),
        labels: workload::labels_of(request.object),
    };

    let mut errors = Vec::new();
    for (field, index, image) in workload::container_images(pod_spec) {
        let path = format!("{prefix}.{field}[{index}].image");
        validate_image(
            &image,
            path,
            &descriptor,
            &snapshot,
            &ctx,
            no_match_policy,
            &cancel,
            &mut errors,
        )
        .await;
    }
    errors
}

#[allow(clippy::too_many_arguments)]
async fn validate_image(
    image: &str,
    path: String,
    descriptor: &ResourceDescriptor,
    snapshot: &Arc<Snapshot>,
    ctx: &Arc<VerificationContext>,
    no_match_policy: NoMatchPolicy,
    cancel: &CancellationToken,
    errors: &mut Vec<FieldError>,
) {
    let reference = match ImageReference::parse(image) {
        Ok(reference) if reference.is_digest() => reference,
        _ => {
            errors.push(FieldError::error(
                path,
                format!("invalid value: {image} must be an image digest"),
                None,
            ));
            return;
        }
    };

    let matched = matching_policies(snapshot, image, descriptor);
    if matched.is_empty() {
        match no_match_policy {
            NoMatchPolicy::Allow => {}
            NoMatchPolicy::Warn => errors.push(FieldError::warning(
                path,
                "no matching policies".to_string(),
                Some(image.to_string()),
            )),
            NoMatchPolicy::Deny => errors.push(FieldError::error(
                path,
                "no matching policies".to_string(),
                Some(image.to_string()),
            )),
        }
        return;
    }

    debug!(image, policies = matched.len(), "validating image");
    let owned: BTreeMap<_, _> = matched
        .into_iter()
        .map(|(name, policy)| (name, policy.clone()))
        .collect();
    let (_, failures) = verify_image(
        &reference,
        owned,
        snapshot.clone(),
        ctx.clone(),
        cancel.clone(),
    )
    .await;

    for failure in failures {
        match failure.kind {
            FailureKind::Internal => errors.push(FieldError::error(
                path.clone(),
                failure.message,
                Some(image.to_string()),
            )),
            FailureKind::Verification | FailureKind::Policy => {
                let message = format!("failed policy: {}", failure.policy);
                let details = Some(format!("{image} {}", failure.message));
                match failure.mode {
                    image_policy::api::Mode::Warn => {
                        errors.push(FieldError::warning(path.clone(), message, details))
                    }
                    image_policy::api::Mode::Enforce => {
                        errors.push(FieldError::error(path.clone(), message, details))
                    }
                }
            }
        }
    }
}

/// An update that only lowers `spec.replicas` (the pod template untouched)
/// is a scale-down and always admitted; the running pods were admitted
/// when they were created.
fn is_scale_down(request: &AdmissionRequest<'_>) -> bool {
    if request.operation != Operation::Update {
        return false;
    }
    let Some(old_object) = request.old_object else {
        return false;
    };
    let replicas = |o: &serde_json::Value| o.get("spec").and_then(|s| s.get("replicas")).and_then(|r| r.as_i64());
    let template = |o: &serde_json::Value| o.get("spec").and_then(|s| s.get("template")).cloned();
    match (replicas(request.object), replicas(old_object)) {
        (Some(new), Some(old)) if new < old => template(request.object) == template(old_object),
        _ => false,
    }
}
