pub mod clusterimagepolicy;
pub mod configmap;
pub mod errors;
pub mod kms;
pub mod resolve;
pub mod tracker;
pub mod trustroot;
pub mod tuf;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use kms::KmsKeyProvider;
use tracker::Tracker;
use tuf::TufFetcher;

/// Default names of the published ConfigMaps.
pub const IMAGE_POLICIES_CONFIGMAP: &str = "config-image-policies";
pub const SIGSTORE_KEYS_CONFIGMAP: &str = "config-sigstore-keys";

/// Shared state of both reconcilers.
pub struct Context {
    pub client: kube::Client,
    /// Namespace holding the published ConfigMaps and the Secrets policies
    /// may reference.
    pub namespace: String,
    pub image_policies_configmap: String,
    pub sigstore_keys_configmap: String,
    pub resync: Duration,
    pub kms: Arc<dyn KmsKeyProvider>,
    pub tuf: Arc<dyn TufFetcher>,
    pub http: reqwest::Client,
    pub tracker: Arc<Tracker>,
    pub(crate) backoff: Backoff,
}

impl Context {
    pub fn new(
        client: kube::Client,
        namespace: String,
        resync: Duration,
        kms: Arc<dyn KmsKeyProvider>,
        tuf: Arc<dyn TufFetcher>,
    ) -> Context {
        Context {
            client,
            namespace,
            image_policies_configmap: IMAGE_POLICIES_CONFIGMAP.to_string(),
            sigstore_keys_configmap: SIGSTORE_KEYS_CONFIGMAP.to_string(),
            resync,
            kms,
            tuf,
            http: reqwest::Client::new(),
            tracker: Arc::new(Tracker::default()),
            backoff: Backoff::default(),
        }
    }
}

/// Per-resource exponential requeue delays, reset on a successful pass.
#[derive(Default)]
pub(crate) struct Backoff {
    attempts: RwLock<HashMap<String, u32>>,
}

impl Backoff {
    const BASE: Duration = Duration::from_secs(5);
    const MAX: Duration = Duration::from_secs(300);

    pub(crate) fn next(&self, name: &str) -> Duration {
        let mut guard = self.attempts.write().expect("backoff lock poisoned");
        let attempt = guard.entry(name.to_string()).or_insert(0);
        let delay = Self::BASE * 2u32.saturating_pow(*attempt);
        *attempt = attempt.saturating_add(1);
        delay.min(Self::MAX)
    }

    pub(crate) fn reset(&self, name: &str) {
        self.attempts
            .write()
            .expect("backoff lock poisoned")
            .remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let backoff = Backoff::default();
        assert_eq!(backoff.next("cip"), Duration::from_secs(5));
        assert_eq!(backoff.next("cip"), Duration::from_secs(10));
        assert_eq!(backoff.next("cip"), Duration::from_secs(20));
        for _ in 0..10 {
            backoff.next("cip");
        }
        assert_eq!(backoff.next("cip"), Duration::from_secs(300));

        backoff.reset("cip");
        assert_eq!(backoff.next("cip"), Duration::from_secs(5));

        // Independent per resource.
        assert_eq!(backoff.next("other"), Duration::from_secs(5));
    }
}
