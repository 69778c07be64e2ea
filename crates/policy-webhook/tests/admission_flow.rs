//! End-to-end admission flows: ConfigMap entries are parsed into a
//! snapshot, matched against a pod and verified with a scripted
//! collaborator, exactly the way the webhook drives the library.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use image_policy::reference::ImageReference;
use policy_webhook::admission::{
    is_allowed, validate, AdmissionRequest, Level, NoMatchPolicy, Operation,
};
use policy_webhook::store::SnapshotStore;
use policy_webhook::verify::contract::{
    CheckOpts, Keychain, SignatureSource, SignatureVerifier, VerifiedAttestation,
    VerifiedSignature, VerifyError,
};
use policy_webhook::verify::VerificationContext;

const DIGEST: &str = "sha256:be5d77c62dbe7fedfb0a4e5ec2f91078080800ab1f18358e5f31fcc8faa023c4";

const P256_PEM: &str = "-----BEGIN PUBLIC KEY-----\nMFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEW2U0K8c1RdwJXqiqGRpRIcUSdu8t\nxx8g5+xPaD0oxJ4KrATSjsgyxkCYq62a1KwrZ1FledUlvg7aN5VoKryM9g==\n-----END PUBLIC KEY-----\n";

struct Scripted {
    signatures: Result<Vec<VerifiedSignature>, VerifyError>,
    attestations: Result<Vec<VerifiedAttestation>, VerifyError>,
}

#[async_trait]
impl SignatureVerifier for Scripted {
    async fn verify_signatures(
        &self,
        _image: &ImageReference,
        _opts: &CheckOpts,
        _sources: &[SignatureSource],
        _keychain: &Keychain,
    ) -> Result<Vec<VerifiedSignature>, VerifyError> {
        self.signatures.clone()
    }

    async fn verify_attestations(
        &self,
        _image: &ImageReference,
        _opts: &CheckOpts,
        _sources: &[SignatureSource],
        _keychain: &Keychain,
    ) -> Result<Vec<VerifiedAttestation>, VerifyError> {
        self.attestations.clone()
    }
}

fn keyless_signature() -> VerifiedSignature {
    VerifiedSignature {
        subject: Some("https://github.com/example/app/.github/workflows/release.yml@refs/heads/main".to_string()),
        issuer: Some("https://token.actions.githubusercontent.com".to_string()),
        payload_digest: Some(DIGEST.to_string()),
        ..Default::default()
    }
}

fn snapshot_from_configmap(entries: &[(&str, serde_json::Value)]) -> Arc<SnapshotStore> {
    let store = Arc::new(SnapshotStore::new());
    let data: BTreeMap<String, String> = entries
        .iter()
        .map(|(name, body)| (name.to_string(), body.to_string()))
        .collect();
    store.replace_policies(&data);
    store
}

fn pod(image: &str) -> serde_json::Value {
    json!({
        "kind": "Pod",
        "metadata": {"name": "workload", "namespace": "default", "labels": {"env": "prod"}},
        "spec": {"containers": [{"name": "main", "image": image}]}
    })
}

fn request(object: &serde_json::Value) -> AdmissionRequest<'_> {
    AdmissionRequest {
        object,
        old_object: None,
        kind: "Pod",
        group: "",
        version: "v1",
        resource: "pods",
        operation: Operation::Create,
        subresource: None,
    }
}

fn ctx(verifier: Scripted) -> Arc<VerificationContext> {
    Arc::new(VerificationContext {
        verifier: Arc::new(verifier),
        keychain: Keychain {
            namespace: "default".to_string(),
            service_account_name: None,
            image_pull_secrets: vec![],
        },
        use_referrers: false,
        fail_on_empty_authorities: true,
        admission_object: None,
    })
}

fn keyless_policy_entry(cue_policy: Option<&str>) -> serde_json::Value {
    let mut entry = json!({
        "uid": "uid-1",
        "resourceVersion": "7",
        "images": [{"glob": "gcr.io/*/*"}],
        "authorities": [{
            "name": "keyless-authority",
            "keyless": {
                "url": "https://fulcio.sigstore.dev",
                "identities": [{
                    "issuer": "https://token.actions.githubusercontent.com",
                    "subjectRegExp": "^https://github\\.com/example/.*$"
                }]
            }
        }],
        "mode": "enforce"
    });
    if let Some(policy) = cue_policy {
        entry["policy"] = json!({"type": "cue", "data": policy});
    }
    entry
}

#[tokio::test]
async fn keyless_pass_through_configmap_snapshot() {
    let store = snapshot_from_configmap(&[("cip-keyless", keyless_policy_entry(None))]);
    let object = pod(&format!("gcr.io/distroless/static@{DIGEST}"));
    let errors = validate(
        &request(&object),
        store.current(),
        ctx(Scripted {
            signatures: Ok(vec![keyless_signature()]),
            attestations: Ok(vec![]),
        }),
        NoMatchPolicy::Deny,
        CancellationToken::new(),
    )
    .await;
    assert!(errors.is_empty(), "{errors:?}");
}

#[tokio::test]
async fn keyless_identity_mismatch_denies() {
    let store = snapshot_from_configmap(&[("cip-keyless", keyless_policy_entry(None))]);
    let object = pod(&format!("gcr.io/distroless/static@{DIGEST}"));
    let mut signature = keyless_signature();
    signature.subject = Some("https://github.com/forked/app".to_string());
    let errors = validate(
        &request(&object),
        store.current(),
        ctx(Scripted {
            signatures: Ok(vec![signature]),
            attestations: Ok(vec![]),
        }),
        NoMatchPolicy::Deny,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].level, Level::Error);
    assert!(errors[0]
        .details
        .as_deref()
        .unwrap()
        .contains("none of the expected identities matched"));
}

#[tokio::test]
async fn cue_policy_over_aggregated_result() {
    let accepting = r#"
authorityMatches: {
    "keyless-authority": {
        signatures: [...{
            issuer: "https://token.actions.githubusercontent.com"
        }]
    }
}
"#;
    let store = snapshot_from_configmap(&[("cip-cue", keyless_policy_entry(Some(accepting)))]);
    let object = pod(&format!("gcr.io/distroless/static@{DIGEST}"));
    let errors = validate(
        &request(&object),
        store.current(),
        ctx(Scripted {
            signatures: Ok(vec![keyless_signature()]),
            attestations: Ok(vec![]),
        }),
        NoMatchPolicy::Deny,
        CancellationToken::new(),
    )
    .await;
    assert!(errors.is_empty(), "{errors:?}");

    let rejecting = r#"authorityMatches: { "other-authority": { static: true } }"#;
    let store = snapshot_from_configmap(&[("cip-cue", keyless_policy_entry(Some(rejecting)))]);
    let errors = validate(
        &request(&object),
        store.current(),
        ctx(Scripted {
            signatures: Ok(vec![keyless_signature()]),
            attestations: Ok(vec![]),
        }),
        NoMatchPolicy::Deny,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(errors.len(), 1);
    assert!(errors[0]
        .details
        .as_deref()
        .unwrap()
        .contains("failed to evaluate the cue policy"));
}

#[tokio::test]
async fn attestation_policy_filters_payloads() {
    let entry = json!({
        "uid": "uid-2",
        "resourceVersion": "9",
        "images": [{"glob": "gcr.io/*/*"}],
        "authorities": [{
            "name": "provenance",
            "key": {"data": P256_PEM, "hashAlgorithm": "sha256"},
            "attestations": [{
                "name": "must-be-slsa",
                "predicateType": "slsaprovenance",
                "policy": {
                    "type": "cue",
                    "data": "predicateType: \"https://slsa.dev/provenance/v0.2\""
                }
            }]
        }],
        "mode": "enforce"
    });
    let store = snapshot_from_configmap(&[("cip-att", entry)]);
    let object = pod(&format!("gcr.io/distroless/static@{DIGEST}"));

    let statement = json!({
        "_type": "https://in-toto.io/Statement/v0.1",
        "predicateType": "https://slsa.dev/provenance/v0.2",
        "subject": [{"name": "gcr.io/distroless/static"}],
        "predicate": {"builder": {"id": "https://github.com/actions"}}
    });
    let attestation = VerifiedAttestation {
        signature: VerifiedSignature {
            payload_digest: Some(DIGEST.to_string()),
            ..Default::default()
        },
        predicate_type: "https://slsa.dev/provenance/v0.2".to_string(),
        payload: serde_json::to_vec(&statement).unwrap(),
    };

    let errors = validate(
        &request(&object),
        store.current(),
        ctx(Scripted {
            signatures: Ok(vec![]),
            attestations: Ok(vec![attestation]),
        }),
        NoMatchPolicy::Deny,
        CancellationToken::new(),
    )
    .await;
    assert!(errors.is_empty(), "{errors:?}");

    // No attestation of the declared type at all.
    let errors = validate(
        &request(&object),
        store.current(),
        ctx(Scripted {
            signatures: Ok(vec![]),
            attestations: Ok(vec![]),
        }),
        NoMatchPolicy::Deny,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(errors.len(), 1);
    assert!(!is_allowed(&errors));
    assert!(errors[0]
        .details
        .as_deref()
        .unwrap()
        .contains("no matching attestations"));
}

#[tokio::test]
async fn multiple_policies_must_all_pass() {
    let store = snapshot_from_configmap(&[
        ("cip-keyless", keyless_policy_entry(None)),
        (
            "cip-static-fail",
            json!({
                "uid": "uid-3",
                "resourceVersion": "1",
                "images": [{"glob": "**"}],
                "authorities": [{"name": "no", "static": {"action": "fail"}}],
                "mode": "enforce"
            }),
        ),
    ]);
    let object = pod(&format!("gcr.io/distroless/static@{DIGEST}"));
    let errors = validate(
        &request(&object),
        store.current(),
        ctx(Scripted {
            signatures: Ok(vec![keyless_signature()]),
            attestations: Ok(vec![]),
        }),
        NoMatchPolicy::Deny,
        CancellationToken::new(),
    )
    .await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "failed policy: cip-static-fail");
}
