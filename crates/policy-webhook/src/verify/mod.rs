pub mod authority;
pub mod contract;
pub mod cosign;
pub mod errors;

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use image_policy::compiled::{CompiledClusterImagePolicy, CompiledPolicy};
use image_policy::reference::ImageReference;

use crate::policy;
use crate::store::Snapshot;
use contract::{
    GithubExtensions, Keychain, SignatureVerifier, VerifiedAttestation, VerifiedSignature,
};
use errors::{AuthorityError, PolicyFailure};

/// Everything an admission request needs to run verifications: the
/// collaborator doing registry and crypto I/O, the registry credentials in
/// scope, and global toggles.
pub struct VerificationContext {
    pub verifier: Arc<dyn SignatureVerifier>,
    pub keychain: Keychain,
    /// Enumerate OCI 1.1 referrers during signature discovery.
    pub use_referrers: bool,
    /// Fail policies whose compiled authority list is empty.
    pub fail_on_empty_authorities: bool,
    /// The admission object, for CIP-level policies that splice fragments
    /// of it into their input.
    pub admission_object: Option<serde_json::Value>,
}

/// Aggregated verification outcome of a single policy over one image: for
/// every satisfied authority, what satisfied it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResult {
    pub authority_matches: BTreeMap<String, AuthorityMatch>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum AuthorityMatch {
    Static {
        r#static: bool,
    },
    Attestations {
        attestations: BTreeMap<String, Vec<AttestationAttributes>>,
    },
    Signatures {
        signatures: Vec<SignatureAttributes>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignatureAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default)]
    pub github_extensions: GithubExtensions,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttestationAttributes {
    #[serde(flatten)]
    pub signature: SignatureAttributes,
    pub predicate_type: String,
    /// base64 of the in-toto statement JSON.
    pub payload: String,
}

impl From<&VerifiedSignature> for SignatureAttributes {
    fn from(signature: &VerifiedSignature) -> SignatureAttributes {
        SignatureAttributes {
            subject: signature.subject.clone(),
            issuer: signature.issuer.clone(),
            github_extensions: signature.github_extensions.clone(),
        }
    }
}

impl From<&VerifiedAttestation> for AttestationAttributes {
    fn from(attestation: &VerifiedAttestation) -> AttestationAttributes {
        AttestationAttributes {
            signature: SignatureAttributes::from(&attestation.signature),
            predicate_type: attestation.predicate_type.clone(),
            payload: BASE64.encode(&attestation.payload),
        }
    }
}

/// Verifies one image against every matched policy.
///
/// Policies verify in parallel, and authorities verify in parallel inside
/// each policy. Every task delivers exactly one message; the aggregator
/// reads exactly as many messages as it spawned tasks, or returns early
/// with a single internal failure when the admission context is canceled.
/// The image is admissible iff the result map holds an entry for every
/// matched policy.
pub async fn verify_image(
    image: &ImageReference,
    policies: BTreeMap<String, CompiledClusterImagePolicy>,
    snapshot: Arc<Snapshot>,
    ctx: Arc<VerificationContext>,
    cancel: CancellationToken,
) -> (BTreeMap<String, PolicyResult>, Vec<PolicyFailure>) {
    let mut results = BTreeMap::new();
    let mut failures = Vec::new();
    if policies.is_empty() {
        return (results, failures);
    }

    let expected = policies.len();
    let (tx, mut rx) = mpsc::channel(expected);
    for (name, cip) in policies {
        let tx = tx.clone();
        let image = image.clone();
        let snapshot = snapshot.clone();
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = verify_policy(&image, &name, &cip, snapshot, ctx, cancel).await;
            // The aggregator reads exactly one message per policy; a closed
            // receiver means it already gave up on this request.
            let _ = tx.send((name, outcome)).await;
        });
    }
    drop(tx);

    let mut received = 0;
    while received < expected {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(image = %image, "admission context canceled before validation completed");
                failures.push(PolicyFailure {
                    policy: "internalerror".to_string(),
                    mode: image_policy::api::Mode::Enforce,
                    kind: errors::FailureKind::Internal,
                    message: "context was canceled before validation completed".to_string(),
                });
                return (results, failures);
            }
            message = rx.recv() => {
                match message {
                    Some((name, Ok(result))) => {
                        results.insert(name, result);
                        received += 1;
                    }
                    Some((_, Err(failure))) => {
                        failures.push(failure);
                        received += 1;
                    }
                    None => break,
                }
            }
        }
    }
    (results, failures)
}

/// Verifies one policy: authority fan-out, aggregation, then the optional
/// CIP-level declarative policy over the aggregated result.
async fn verify_policy(
    image: &ImageReference,
    name: &str,
    cip: &CompiledClusterImagePolicy,
    snapshot: Arc<Snapshot>,
    ctx: Arc<VerificationContext>,
    cancel: CancellationToken,
) -> Result<PolicyResult, PolicyFailure> {
    if cip.authorities.is_empty() {
        if ctx.fail_on_empty_authorities {
            return Err(PolicyFailure::verification(
                name,
                cip.mode,
                format!("policy {name} has no authorities for {image}"),
            ));
        }
        return Ok(PolicyResult::default());
    }

    let expected = cip.authorities.len();
    let (tx, mut rx) = mpsc::channel(expected);
    for authority in cip.authorities.clone() {
        let tx = tx.clone();
        let image = image.clone();
        let snapshot = snapshot.clone();
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AuthorityError::Config(
                    "context was canceled before validation completed".to_string(),
                )),
                outcome = authority::verify_authority(&image, &authority, &snapshot, &ctx) => outcome,
            };
            let _ = tx.send((authority.name.clone(), outcome)).await;
        });
    }
    drop(tx);

    let mut result = PolicyResult::default();
    let mut errors: Vec<AuthorityError> = Vec::new();
    let mut received = 0;
    while received < expected {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(PolicyFailure::internal(name, cip.mode));
            }
            message = rx.recv() => {
                match message {
                    Some((authority_name, Ok(authority_match))) => {
                        debug!(policy = name, authority = %authority_name, image = %image, "authority satisfied");
                        result.authority_matches.insert(authority_name, authority_match);
                        received += 1;
                    }
                    Some((authority_name, Err(error))) => {
                        debug!(policy = name, authority = %authority_name, image = %image, %error, "authority failed");
                        errors.push(error);
                        received += 1;
                    }
                    None => break,
                }
            }
        }
    }

    if result.authority_matches.is_empty() {
        let joined = errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        return Err(PolicyFailure::verification(name, cip.mode, joined));
    }

    if let Some(cip_policy) = &cip.policy {
        evaluate_cip_policy(image, name, cip, cip_policy, &result, &ctx).await?;
    }

    Ok(result)
}

/// Serializes the aggregated result (plus any requested fragments of the
/// admission object) and hands it to the CUE/Rego evaluator.
async fn evaluate_cip_policy(
    image: &ImageReference,
    name: &str,
    cip: &CompiledClusterImagePolicy,
    cip_policy: &CompiledPolicy,
    result: &PolicyResult,
    ctx: &VerificationContext,
) -> Result<(), PolicyFailure> {
    let mut input = serde_json::to_value(result).map_err(|e| {
        PolicyFailure::policy(name, cip.mode, format!("cannot serialize policy input: {e}"))
    })?;

    let object = ctx.admission_object.as_ref();
    if cip_policy.include_spec {
        if let Some(spec) = object.and_then(|o| o.get("spec")) {
            input["spec"] = spec.clone();
        }
    }
    if cip_policy.include_object_meta {
        if let Some(metadata) = object.and_then(|o| o.get("metadata")) {
            input["metadata"] = metadata.clone();
        }
    }
    if cip_policy.include_type_meta {
        if let Some(object) = object {
            input["typemeta"] = serde_json::json!({
                "apiVersion": object.get("apiVersion").cloned().unwrap_or_default(),
                "kind": object.get("kind").cloned().unwrap_or_default(),
            });
        }
    }
    if cip_policy.fetch_config_file {
        let config = ctx
            .verifier
            .fetch_config_file(image, &ctx.keychain)
            .await
            .map_err(|e| {
                PolicyFailure::policy(
                    name,
                    cip.mode,
                    format!("failed to fetch the config file for {image}: {e}"),
                )
            })?;
        input["config"] = config;
    }

    policy::evaluate(cip_policy.r#type, &cip_policy.data, &input)
        .map_err(|e| PolicyFailure::policy(name, cip.mode, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use super::contract::{CheckOpts, SignatureSource, VerifyError};
    use image_policy::api::{
        HashAlgorithm, ImagePattern, Mode, PolicyType, StaticAction, StaticRef,
    };
    use image_policy::compiled::{AuthorityKind, CompiledAuthority, CompiledKey};

    const IMAGE: &str = "gcr.io/distroless/static@sha256:be5d77c62dbe7fedfb0a4e5ec2f91078080800ab1f18358e5f31fcc8faa023c4";

    const P256_PEM: &str = "-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEW2U0K8c1RdwJXqiqGRpRIcUSdu8t
xx8g5+xPaD0oxJ4KrATSjsgyxkCYq62a1KwrZ1FledUlvg7aN5VoKryM9g==
-----END PUBLIC KEY-----
";

    /// Stub collaborator: scripted responses, no I/O.
    pub(crate) struct StubVerifier {
        pub signatures: Result<Vec<VerifiedSignature>, VerifyError>,
        pub attestations: Result<Vec<VerifiedAttestation>, VerifyError>,
        pub delay: Option<std::time::Duration>,
    }

    impl Default for StubVerifier {
        fn default() -> StubVerifier {
            StubVerifier {
                signatures: Ok(vec![]),
                attestations: Ok(vec![]),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl SignatureVerifier for StubVerifier {
        async fn verify_signatures(
            &self,
            _image: &ImageReference,
            _opts: &CheckOpts,
            _sources: &[SignatureSource],
            _keychain: &Keychain,
        ) -> Result<Vec<VerifiedSignature>, VerifyError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
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

    pub(crate) fn context_with(verifier: StubVerifier) -> Arc<VerificationContext> {
        Arc::new(VerificationContext {
            verifier: Arc::new(verifier),
            keychain: Keychain::default(),
            use_referrers: false,
            fail_on_empty_authorities: true,
            admission_object: None,
        })
    }

    pub(crate) fn key_policy(mode: Mode) -> CompiledClusterImagePolicy {
        CompiledClusterImagePolicy {
            uid: "uid".to_string(),
            resource_version: "1".to_string(),
            images: vec![ImagePattern {
                glob: "gcr.io/*/*".to_string(),
            }],
            authorities: vec![CompiledAuthority {
                name: "authority-0".to_string(),
                verifier: AuthorityKind::Key(CompiledKey {
                    data: P256_PEM.to_string(),
                    hash_algorithm: HashAlgorithm::Sha256,
                }),
                sources: vec![],
                ctlog: None,
                attestations: vec![],
                rfc3161timestamp: None,
            }],
            policy: None,
            match_resources: None,
            mode,
        }
    }

    fn static_policy(action: StaticAction) -> CompiledClusterImagePolicy {
        let mut policy = key_policy(Mode::Enforce);
        policy.authorities[0].verifier = AuthorityKind::Static(StaticRef { action });
        policy
    }

    fn image() -> ImageReference {
        ImageReference::parse(IMAGE).unwrap()
    }

    fn good_signature() -> VerifiedSignature {
        VerifiedSignature {
            payload_digest: Some(
                "sha256:be5d77c62dbe7fedfb0a4e5ec2f91078080800ab1f18358e5f31fcc8faa023c4"
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn key_based_pass() {
        let ctx = context_with(StubVerifier {
            signatures: Ok(vec![good_signature()]),
            ..Default::default()
        });
        let policies = BTreeMap::from([("cip-key".to_string(), key_policy(Mode::Enforce))]);
        let (results, failures) = verify_image(
            &image(),
            policies,
            Arc::new(Snapshot::default()),
            ctx,
            CancellationToken::new(),
        )
        .await;
        assert!(failures.is_empty());
        assert!(matches!(
            results["cip-key"].authority_matches["authority-0"],
            AuthorityMatch::Signatures { .. }
        ));
    }

    #[tokio::test]
    async fn key_based_fail_names_the_authority_and_image() {
        let ctx = context_with(StubVerifier {
            signatures: Err(VerifyError::Verification("bad signature".to_string())),
            ..Default::default()
        });
        let policies = BTreeMap::from([("cip-key".to_string(), key_policy(Mode::Enforce))]);
        let (results, failures) = verify_image(
            &image(),
            policies,
            Arc::new(Snapshot::default()),
            ctx,
            CancellationToken::new(),
        )
        .await;
        assert!(results.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].message,
            format!("signature key validation failed for authority authority-0 for {IMAGE}: bad signature")
        );
        assert_eq!(failures[0].mode, Mode::Enforce);
    }

    #[tokio::test]
    async fn warn_mode_travels_with_the_failure() {
        let ctx = context_with(StubVerifier {
            signatures: Err(VerifyError::Verification("bad signature".to_string())),
            ..Default::default()
        });
        let policies = BTreeMap::from([("cip-key".to_string(), key_policy(Mode::Warn))]);
        let (_, failures) = verify_image(
            &image(),
            policies,
            Arc::new(Snapshot::default()),
            ctx,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(failures[0].mode, Mode::Warn);
    }

    #[tokio::test]
    async fn static_pass_and_fail() {
        let ctx = context_with(StubVerifier::default());
        let policies = BTreeMap::from([
            ("pass".to_string(), static_policy(StaticAction::Pass)),
            ("fail".to_string(), static_policy(StaticAction::Fail)),
        ]);
        let (results, failures) = verify_image(
            &image(),
            policies,
            Arc::new(Snapshot::default()),
            ctx,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(
            results["pass"].authority_matches["authority-0"],
            AuthorityMatch::Static { r#static: true }
        );
        assert_eq!(failures.len(), 1);
        assert!(failures[0].message.contains("disallowed by static policy"));
    }

    #[tokio::test]
    async fn one_satisfied_authority_masks_sibling_failures() {
        let ctx = context_with(StubVerifier {
            signatures: Err(VerifyError::Verification("bad signature".to_string())),
            ..Default::default()
        });
        let mut cip = key_policy(Mode::Enforce);
        cip.authorities.push(CompiledAuthority {
            name: "authority-1".to_string(),
            verifier: AuthorityKind::Static(StaticRef {
                action: StaticAction::Pass,
            }),
            sources: vec![],
            ctlog: None,
            attestations: vec![],
            rfc3161timestamp: None,
        });
        let policies = BTreeMap::from([("cip".to_string(), cip)]);
        let (results, failures) = verify_image(
            &image(),
            policies,
            Arc::new(Snapshot::default()),
            ctx,
            CancellationToken::new(),
        )
        .await;
        assert!(failures.is_empty());
        assert_eq!(results["cip"].authority_matches.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_produces_exactly_one_internal_error() {
        let ctx = context_with(StubVerifier {
            signatures: Ok(vec![good_signature()]),
            delay: Some(std::time::Duration::from_secs(30)),
            ..Default::default()
        });
        let policies = BTreeMap::from([
            ("cip-a".to_string(), key_policy(Mode::Enforce)),
            ("cip-b".to_string(), key_policy(Mode::Enforce)),
        ]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = std::time::Instant::now();
        let (results, failures) = verify_image(
            &image(),
            policies,
            Arc::new(Snapshot::default()),
            ctx,
            cancel,
        )
        .await;
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(results.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].message,
            "context was canceled before validation completed"
        );
        assert_eq!(failures[0].kind, errors::FailureKind::Internal);
    }

    #[tokio::test]
    async fn empty_authorities_follow_the_runtime_flag() {
        let mut cip = key_policy(Mode::Enforce);
        cip.authorities.clear();
        let policies = BTreeMap::from([("empty".to_string(), cip.clone())]);

        let ctx = context_with(StubVerifier::default());
        let (_, failures) = verify_image(
            &image(),
            policies.clone(),
            Arc::new(Snapshot::default()),
            ctx,
            CancellationToken::new(),
        )
        .await;
        assert_eq!(failures.len(), 1);

        let lenient = VerificationContext {
            verifier: Arc::new(StubVerifier::default()),
            keychain: Keychain::default(),
            use_referrers: false,
            fail_on_empty_authorities: false,
            admission_object: None,
        };
        let (results, failures) = verify_image(
            &image(),
            policies,
            Arc::new(Snapshot::default()),
            Arc::new(lenient),
            CancellationToken::new(),
        )
        .await;
        assert!(failures.is_empty());
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn malformed_cue_policy_fails_with_the_compiler_message() {
        let ctx = context_with(StubVerifier {
            signatures: Ok(vec![good_signature()]),
            ..Default::default()
        });
        let mut cip = key_policy(Mode::Enforce);
        cip.policy = Some(CompiledPolicy {
            r#type: PolicyType::Cue,
            data: "{\"wontgo".to_string(),
            fetch_config_file: false,
            include_spec: false,
            include_object_meta: false,
            include_type_meta: false,
        });
        let policies = BTreeMap::from([("cip".to_string(), cip)]);
        let (results, failures) = verify_image(
            &image(),
            policies,
            Arc::new(Snapshot::default()),
            ctx,
            CancellationToken::new(),
        )
        .await;
        assert!(results.is_empty());
        assert!(failures[0]
            .message
            .contains("failed to compile the cue policy with error: string literal not terminated"));
    }

    #[tokio::test]
    async fn cip_policy_sees_the_requested_object_fragments() {
        let ctx = Arc::new(VerificationContext {
            verifier: Arc::new(StubVerifier {
                signatures: Ok(vec![good_signature()]),
                ..Default::default()
            }),
            keychain: Keychain::default(),
            use_referrers: false,
            fail_on_empty_authorities: true,
            admission_object: Some(serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "workload", "labels": {"env": "prod"}},
                "spec": {"containers": [{"name": "main"}]}
            })),
        });
        let mut cip = key_policy(Mode::Enforce);
        cip.policy = Some(CompiledPolicy {
            r#type: PolicyType::Cue,
            data: concat!(
                "typemeta: { kind: \"Pod\", apiVersion: \"v1\" }\n",
                "metadata: { labels: { env: \"prod\" } }\n",
                "spec: { containers: [...{ name: string }] }\n",
            )
            .to_string(),
            fetch_config_file: false,
            include_spec: true,
            include_object_meta: true,
            include_type_meta: true,
        });
        let policies = BTreeMap::from([("cip".to_string(), cip)]);
        let (results, failures) = verify_image(
            &image(),
            policies,
            Arc::new(Snapshot::default()),
            ctx,
            CancellationToken::new(),
        )
        .await;
        assert!(failures.is_empty(), "{failures:?}");
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn policy_result_serializes_to_the_documented_shape() {
        let mut result = PolicyResult::default();
        result.authority_matches.insert(
            "authority-0".to_string(),
            AuthorityMatch::Signatures {
                signatures: vec![SignatureAttributes {
                    subject: Some("user@example.com".to_string()),
                    issuer: Some("https://accounts.example.com".to_string()),
                    github_extensions: GithubExtensions::default(),
                }],
            },
        );
        result.authority_matches.insert(
            "static-authority".to_string(),
            AuthorityMatch::Static { r#static: true },
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            json["authorityMatches"]["authority-0"]["signatures"][0]["subject"],
            "user@example.com"
        );
        assert_eq!(json["authorityMatches"]["static-authority"]["static"], true);

        let round: PolicyResult = serde_json::from_value(json).unwrap();
        assert_eq!(round, result);
    }
}
