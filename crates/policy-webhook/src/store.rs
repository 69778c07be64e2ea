use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use tracing::{debug, info, warn};

use image_policy::compiled::CompiledClusterImagePolicy;
use image_policy::trust::SigstoreKeys;

/// ConfigMap entries starting with `_` (notably `_example`) are
/// documentation, not policies.
const EXAMPLE_KEY_PREFIX: char = '_';

/// One consistent view of the compiled policies and trust roots. Admission
/// requests bind to the snapshot observed at request entry and never see
/// intra-request updates.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub policies: BTreeMap<String, CompiledClusterImagePolicy>,
    pub trust_roots: BTreeMap<String, SigstoreKeys>,
}

/// Process-wide double-buffered snapshot holder. Writers parse the new
/// ConfigMap contents off the hot path and swap the pointer; readers take a
/// single lock-guarded `Arc` clone.
#[derive(Default)]
pub struct SnapshotStore {
    inner: RwLock<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new() -> SnapshotStore {
        SnapshotStore::default()
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.inner
            .read()
            .expect("snapshot lock poisoned")
            .clone()
    }

    /// Replaces the compiled policies, keeping the trust roots of the
    /// previous snapshot.
    pub fn replace_policies(&self, data: &BTreeMap<String, String>) {
        let policies = parse_policies(data);
        let mut guard = self.inner.write().expect("snapshot lock poisoned");
        let next = Snapshot {
            policies,
            trust_roots: guard.trust_roots.clone(),
        };
        *guard = Arc::new(next);
    }

    /// Replaces the trust roots, keeping the policies of the previous
    /// snapshot.
    pub fn replace_trust_roots(&self, data: &BTreeMap<String, String>) {
        let trust_roots = parse_trust_roots(data);
        let mut guard = self.inner.write().expect("snapshot lock poisoned");
        let next = Snapshot {
            policies: guard.policies.clone(),
            trust_roots,
        };
        *guard = Arc::new(next);
    }
}

fn parse_policies(data: &BTreeMap<String, String>) -> BTreeMap<String, CompiledClusterImagePolicy> {
    let mut policies = BTreeMap::new();
    for (name, body) in data {
        if name.starts_with(EXAMPLE_KEY_PREFIX) {
            continue;
        }
        match serde_json::from_str::<CompiledClusterImagePolicy>(body) {
            Ok(policy) => {
                policies.insert(name.clone(), policy);
            }
            Err(error) => {
                // One broken entry must not take down the rest of the
                // snapshot.
                warn!(policy = %name, %error, "skipping unparseable policy entry");
            }
        }
    }
    policies
}

fn parse_trust_roots(data: &BTreeMap<String, String>) -> BTreeMap<String, SigstoreKeys> {
    let mut trust_roots = BTreeMap::new();
    for (name, body) in data {
        if name.starts_with(EXAMPLE_KEY_PREFIX) {
            continue;
        }
        match serde_json::from_str::<SigstoreKeys>(body) {
            Ok(keys) => {
                trust_roots.insert(name.clone(), keys);
            }
            Err(error) => {
                warn!(trust_root = %name, %error, "skipping unparseable trust root entry");
            }
        }
    }
    trust_roots
}

/// Watches the image-policies and sigstore-keys ConfigMaps in the
/// controller namespace and keeps the snapshot current. Runs until the
/// watch stream ends.
pub async fn run_config_watcher(
    client: kube::Client,
    namespace: String,
    image_policies_cm: String,
    sigstore_keys_cm: String,
    store: Arc<SnapshotStore>,
) {
    let api: Api<ConfigMap> = Api::namespaced(client, &namespace);
    info!(
        %namespace,
        image_policies = %image_policies_cm,
        sigstore_keys = %sigstore_keys_cm,
        "starting configuration watcher"
    );

    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .touched_objects();
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        let cm = match event {
            Ok(cm) => cm,
            Err(error) => {
                warn!(%error, "configuration watch error");
                continue;
            }
        };
        let name = cm.name_any();
        let data = cm.data.unwrap_or_default();
        if name == image_policies_cm {
            debug!(entries = data.len(), "reloading compiled policies");
            store.replace_policies(&data);
        } else if name == sigstore_keys_cm {
            debug!(entries = data.len(), "reloading trust roots");
            store.replace_trust_roots(&data);
        }
    }
}
