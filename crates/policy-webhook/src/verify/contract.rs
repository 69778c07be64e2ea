use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use image_policy::api::HashAlgorithm;
use image_policy::reference::ImageReference;

#[derive(Error, Debug, Clone)]
pub enum VerifyError {
    #[error("no matching signatures")]
    NoMatchingSignatures,
    #[error("no matching attestations")]
    NoMatchingAttestations,
    #[error("{0}")]
    Verification(String),
    #[error("registry error: {0}")]
    Registry(String),
}

/// The trust material and constraints one authority verification runs
/// under. Built by the pipeline from the compiled authority plus the
/// snapshot's trust roots.
#[derive(Debug, Clone, Default)]
pub struct CheckOpts {
    /// Inline PEM public keys (possibly several blocks per entry), each
    /// bound to a hash algorithm. Any one verifying key satisfies the
    /// check.
    pub keys: Vec<KeyWithHash>,
    /// Fulcio roots and intermediates, PEM bundles.
    pub fulcio_cert_pems: Vec<String>,
    /// Rekor public keys, PEM.
    pub rekor_key_pems: Vec<String>,
    /// CT log public keys used to check signed entry timestamps, PEM.
    pub ctlog_key_pems: Vec<String>,
    /// Timestamp authority chains for RFC 3161 timestamp verification,
    /// PEM bundles.
    pub tsa_cert_pems: Vec<String>,
    pub rekor_url: Option<String>,
    /// Require a signed certificate timestamp on keyless certificates.
    pub require_sct: bool,
    /// Fall back to the embedded Sigstore defaults when no TrustRoot is
    /// referenced.
    pub use_default_trust: bool,
    /// Enumerate OCI 1.1 referrers of the image digest in addition to the
    /// tag-based discovery locations.
    pub use_referrers: bool,
}

#[derive(Debug, Clone)]
pub struct KeyWithHash {
    pub pem: String,
    pub hash_algorithm: HashAlgorithm,
}

/// Alternative repository to discover signatures in, with the pull secrets
/// needed there. Secrets are resolved in the admitted workload's namespace.
#[derive(Debug, Clone, Default)]
pub struct SignatureSource {
    pub oci: Option<String>,
    pub pull_secrets: Vec<String>,
}

/// Registry credentials in scope for an admission request: the service
/// account's pull secrets plus the workload's own, resolved in the workload
/// namespace. Cloud-provider helpers hang off the implementation, not this
/// data.
#[derive(Debug, Clone, Default)]
pub struct Keychain {
    pub namespace: String,
    pub service_account_name: Option<String>,
    pub image_pull_secrets: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GithubExtensions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_trigger: Option<String>,
    #[serde(default, rename = "workflowSHA", skip_serializing_if = "Option::is_none")]
    pub workflow_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_ref: Option<String>,
}

impl GithubExtensions {
    pub fn is_empty(&self) -> bool {
        self.workflow_trigger.is_none()
            && self.workflow_sha.is_none()
            && self.workflow_name.is_none()
            && self.workflow_repo.is_none()
            && self.workflow_ref.is_none()
    }
}

/// One cryptographically verified signature, reduced to the attributes the
/// pipeline needs: identity for the keyless gate, the signed payload digest
/// for the claim check.
#[derive(Debug, Clone, Default)]
pub struct VerifiedSignature {
    pub subject: Option<String>,
    pub issuer: Option<String>,
    /// Digest named by the signed payload (`sha256:...`).
    pub payload_digest: Option<String>,
    pub github_extensions: GithubExtensions,
}

/// A verified in-toto DSSE envelope.
#[derive(Debug, Clone)]
pub struct VerifiedAttestation {
    pub signature: VerifiedSignature,
    pub predicate_type: String,
    /// The decoded in-toto statement, JSON.
    pub payload: Vec<u8>,
}

/// Signature discovery plus cryptographic verification against a bundle of
/// check options. Implementations own all registry and crypto I/O; the
/// pipeline stays deterministic and testable against stubs.
#[async_trait]
pub trait SignatureVerifier: Send + Sync {
    async fn verify_signatures(
        &self,
        image: &ImageReference,
        opts: &CheckOpts,
        sources: &[SignatureSource],
        keychain: &Keychain,
    ) -> Result<Vec<VerifiedSignature>, VerifyError>;

    async fn verify_attestations(
        &self,
        image: &ImageReference,
        opts: &CheckOpts,
        sources: &[SignatureSource],
        keychain: &Keychain,
    ) -> Result<Vec<VerifiedAttestation>, VerifyError>;

    /// The OCI config file of the image, for policies that request it.
    async fn fetch_config_file(
        &self,
        _image: &ImageReference,
        _keychain: &Keychain,
    ) -> Result<serde_json::Value, VerifyError> {
        Err(VerifyError::Registry(
            "config file fetching is not supported by this verifier".to_string(),
        ))
    }
}

/// Tag to digest resolution, used by the mutating resolver.
#[async_trait]
pub trait DigestResolver: Send + Sync {
    async fn resolve_digest(
        &self,
        image: &str,
        keychain: &Keychain,
    ) -> Result<String, VerifyError>;
}
