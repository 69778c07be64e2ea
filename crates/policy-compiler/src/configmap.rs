use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Patch, PatchParams, PostParams};
use kube::Api;
use tracing::debug;

use crate::errors::CompileError;

/// RFC 6901 escaping for the entry key inside the JSON pointer.
fn escape_pointer_segment(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}

/// The RFC 6902 patch that brings `data[key]` to `value`, or `None` when
/// the stored entry is already identical (no patch is issued then, so
/// re-reconciling an unchanged resource is a no-op).
pub fn entry_patch(
    data: Option<&BTreeMap<String, String>>,
    key: &str,
    value: &str,
) -> Result<Option<json_patch::Patch>, CompileError> {
    let pointer = format!("/data/{}", escape_pointer_segment(key));
    let operation = match data {
        None => serde_json::json!(
            [{"op": "add", "path": "/data", "value": {key: value}}]
        ),
        Some(data) => match data.get(key) {
            Some(existing) if existing == value => return Ok(None),
            Some(_) => serde_json::json!(
                [{"op": "replace", "path": pointer, "value": value}]
            ),
            None => serde_json::json!(
                [{"op": "add", "path": pointer, "value": value}]
            ),
        },
    };
    Ok(Some(serde_json::from_value(operation)?))
}

/// The patch removing `data[key]`, or `None` when the entry is absent.
pub fn removal_patch(
    data: Option<&BTreeMap<String, String>>,
    key: &str,
) -> Result<Option<json_patch::Patch>, CompileError> {
    match data {
        Some(data) if data.contains_key(key) => {
            let pointer = format!("/data/{}", escape_pointer_segment(key));
            let operation = serde_json::json!([{"op": "remove", "path": pointer}]);
            Ok(Some(serde_json::from_value(operation)?))
        }
        _ => Ok(None),
    }
}

/// Creates the ConfigMap with a single entry, or JSON-Patches the entry
/// in. Returns true when the API server was written to.
pub async fn upsert_entry(
    api: &Api<ConfigMap>,
    configmap: &str,
    key: &str,
    value: &str,
) -> Result<bool, CompileError> {
    match api.get(configmap).await {
        Ok(existing) => {
            let Some(patch) = entry_patch(existing.data.as_ref(), key, value)? else {
                debug!(configmap, key, "entry unchanged, skipping patch");
                return Ok(false);
            };
            api.patch(configmap, &PatchParams::default(), &Patch::Json::<()>(patch))
                .await?;
            Ok(true)
        }
        Err(kube::Error::Api(response)) if response.code == 404 => {
            let mut data = BTreeMap::new();
            data.insert(key.to_string(), value.to_string());
            let fresh = ConfigMap {
                metadata: kube::api::ObjectMeta {
                    name: Some(configmap.to_string()),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            api.create(&PostParams::default(), &fresh).await?;
            Ok(true)
        }
        Err(e) => Err(e.into()),
    }
}

/// Removes the entry. An absent ConfigMap or entry counts as success so
/// finalization never wedges on missing state.
pub async fn remove_entry(
    api: &Api<ConfigMap>,
    configmap: &str,
    key: &str,
) -> Result<(), CompileError> {
    match api.get(configmap).await {
        Ok(existing) => {
            let Some(patch) = removal_patch(existing.data.as_ref(), key)? else {
                return Ok(());
            };
            api.patch(configmap, &PatchParams::default(), &Patch::Json::<()>(patch))
                .await?;
            Ok(())
        }
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
