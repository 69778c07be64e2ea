use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use image_policy::compiled::CompiledClusterImagePolicy;
use image_policy::glob::Glob;

use crate::store::Snapshot;

/// The admitted resource, described the way `match` entries select it. The
/// plural `resource` is derived from the kind by the admission framework
/// and injected here.
#[derive(Debug, Clone, Default)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub resource: String,
    pub labels: BTreeMap<String, String>,
}

/// Returns every compiled policy that applies to `image` on the given
/// resource, keyed by policy name.
pub fn matching_policies<'a>(
    snapshot: &'a Snapshot,
    image: &str,
    resource: &ResourceDescriptor,
) -> BTreeMap<String, &'a CompiledClusterImagePolicy> {
    let mut matches = BTreeMap::new();
    for (name, policy) in &snapshot.policies {
        if !image_matches(policy, image) {
            continue;
        }
        if !resource_matches(policy, resource) {
            continue;
        }
        matches.insert(name.clone(), policy);
    }
    matches
}

fn image_matches(policy: &CompiledClusterImagePolicy, image: &str) -> bool {
    policy.images.iter().any(|pattern| {
        Glob::compile(&pattern.glob)
            .map(|glob| glob.matches(image))
            .unwrap_or(false)
    })
}

fn resource_matches(policy: &CompiledClusterImagePolicy, resource: &ResourceDescriptor) -> bool {
    let Some(match_resources) = &policy.match_resources else {
        return true;
    };
    if match_resources.is_empty() {
        return true;
    }
    match_resources.iter().any(|m| {
        m.group == resource.group
            && m.version == resource.version
            && m.resource == resource.resource
            && m.selector
                .as_ref()
                .map(|s| selector_matches(s, &resource.labels))
                .unwrap_or(true)
    })
}

/// matchLabels plus matchExpressions, the Kubernetes label selector
/// semantics. An empty selector matches everything.
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return false;
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expression in expressions {
            let values = expression.values.clone().unwrap_or_default();
            let actual = labels.get(&expression.key);
            let satisfied = match expression.operator.as_str() {
                "In" => actual.map(|v| values.contains(v)).unwrap_or(false),
                "NotIn" => actual.map(|v| !values.contains(v)).unwrap_or(true),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                _ => false,
            };
            if !satisfied {
                return false;
            }
        }
    }
    true
}
