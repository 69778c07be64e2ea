use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// A referenced Secret or ConfigMap in the controller namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedObject {
    pub kind: TrackedKind,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedKind {
    Secret,
    ConfigMap,
}

impl TrackedObject {
    pub fn secret(namespace: &str, name: &str) -> TrackedObject {
        TrackedObject {
            kind: TrackedKind::Secret,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn config_map(namespace: &str, name: &str) -> TrackedObject {
        TrackedObject {
            kind: TrackedKind::ConfigMap,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// Back-reference index from referenced objects to the policies that
/// inlined them, so a change to a Secret or ConfigMap re-enqueues every
/// dependent policy without the policies holding pointers.
#[derive(Default)]
pub struct Tracker {
    inner: RwLock<HashMap<TrackedObject, BTreeSet<String>>>,
}

impl Tracker {
    pub fn track(&self, object: TrackedObject, dependent: &str) {
        self.inner
            .write()
            .expect("tracker lock poisoned")
            .entry(object)
            .or_default()
            .insert(dependent.to_string());
    }

    /// Policies to re-enqueue when `object` changes.
    pub fn dependents(&self, object: &TrackedObject) -> Vec<String> {
        self.inner
            .read()
            .expect("tracker lock poisoned")
            .get(object)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops every back-reference of a deleted policy.
    pub fn forget(&self, dependent: &str) {
        let mut guard = self.inner.write().expect("tracker lock poisoned");
        guard.retain(|_, dependents| {
            dependents.remove(dependent);
            !dependents.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_and_resolves_dependents() {
        let tracker = Tracker::default();
        let secret = TrackedObject::secret("cosign-system", "signing-key");
        tracker.track(secret.clone(), "cip-a");
        tracker.track(secret.clone(), "cip-b");
        tracker.track(
            TrackedObject::config_map("cosign-system", "policies"),
            "cip-a",
        );

        assert_eq!(tracker.dependents(&secret), vec!["cip-a", "cip-b"]);
        assert!(tracker
            .dependents(&TrackedObject::secret("cosign-system", "other"))
            .is_empty());
    }

    #[test]
    fn forget_removes_a_dependent_everywhere() {
        let tracker = Tracker::default();
        let secret = TrackedObject::secret("cosign-system", "signing-key");
        tracker.track(secret.clone(), "cip-a");
        tracker.track(secret.clone(), "cip-b");

        tracker.forget("cip-a");
        assert_eq!(tracker.dependents(&secret), vec!["cip-b"]);

        tracker.forget("cip-b");
        assert!(tracker.dependents(&secret).is_empty());
    }
}
