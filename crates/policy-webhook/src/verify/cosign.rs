//! Production implementation of the verification contracts, backed by the
//! `sigstore` cosign client for signatures and by direct OCI pulls for
//! DSSE attestations.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;
use sigstore::cosign::signature_layers::CertificateSubject;
use sigstore::cosign::verification_constraint::{PublicKeyVerifier, VerificationConstraint};
use sigstore::cosign::{ClientBuilder, CosignCapabilities, SignatureLayer};
use sigstore::crypto::{CosignVerificationKey, Signature, SigningScheme};
use sigstore::registry::Auth;
use sigstore::trust::ManualTrustRoot;
use tracing::{debug, warn};
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509Certificate};

use image_policy::api::HashAlgorithm;
use image_policy::reference::ImageReference;
use image_policy::trust::{certificate_chain_from_pem, public_keys_from_pem, PublicKeyType};

use super::contract::{
    CheckOpts, DigestResolver, GithubExtensions, Keychain, KeyWithHash, SignatureSource,
    SignatureVerifier, VerifiedAttestation, VerifiedSignature, VerifyError,
};

const DSSE_PAYLOAD_TYPE: &str = "application/vnd.in-toto+json";
const CERTIFICATE_ANNOTATION: &str = "dev.sigstore.cosign/certificate";

// Fulcio certificate extension OIDs.
const OID_ISSUER: &str = "1.3.6.1.4.1.57264.1.1";
const OID_WORKFLOW_TRIGGER: &str = "1.3.6.1.4.1.57264.1.2";
const OID_WORKFLOW_SHA: &str = "1.3.6.1.4.1.57264.1.3";
const OID_WORKFLOW_NAME: &str = "1.3.6.1.4.1.57264.1.4";
const OID_WORKFLOW_REPOSITORY: &str = "1.3.6.1.4.1.57264.1.5";
const OID_WORKFLOW_REF: &str = "1.3.6.1.4.1.57264.1.6";

/// Cosign-backed signature discovery and verification.
#[derive(Default)]
pub struct CosignVerifier;

impl CosignVerifier {
    pub fn new() -> CosignVerifier {
        CosignVerifier
    }

    /// A cosign client trusting exactly the material in `opts`. With
    /// `use_default_trust` the client falls back to its embedded Sigstore
    /// defaults.
    async fn build_client(
        &self,
        opts: &CheckOpts,
    ) -> Result<sigstore::cosign::Client<'static>, VerifyError> {
        let mut builder = ClientBuilder::default().enable_registry_caching();
        if !opts.use_default_trust {
            let trust_root = manual_trust_root(opts)?;
            builder = builder
                .with_trust_repository(&trust_root)
                .await
                .map_err(|e| VerifyError::Verification(e.to_string()))?;
        }
        builder
            .build()
            .map_err(|e| VerifyError::Verification(e.to_string()))
    }

    /// The repositories to look for signatures in: the authority's
    /// alternative sources first, the image repository last.
    fn discovery_repositories(
        image: &ImageReference,
        sources: &[SignatureSource],
    ) -> Vec<String> {
        let mut repositories: Vec<String> = sources
            .iter()
            .filter_map(|source| source.oci.clone())
            .collect();
        repositories.push(format!("{}/{}", image.registry, image.repository));
        repositories
    }

    async fn discover_layers(
        &self,
        client: &mut sigstore::cosign::Client<'static>,
        image: &ImageReference,
        sources: &[SignatureSource],
        tag: &str,
    ) -> Result<Vec<SignatureLayer>, VerifyError> {
        let digest = image
            .digest
            .as_deref()
            .ok_or_else(|| VerifyError::Verification("image is not a digest reference".into()))?;

        let mut last_error = VerifyError::NoMatchingSignatures;
        for repository in Self::discovery_repositories(image, sources) {
            let cosign_image = format!("{repository}:{tag}");
            let cosign_image: sigstore::registry::OciReference = match cosign_image.parse() {
                Ok(reference) => reference,
                Err(e) => {
                    debug!(%cosign_image, error = %e, "invalid signature reference");
                    last_error = VerifyError::Registry(e.to_string());
                    continue;
                }
            };
            match client
                .trusted_signature_layers(&Auth::Anonymous, digest, &cosign_image)
                .await
            {
                Ok(layers) if !layers.is_empty() => return Ok(layers),
                Ok(_) => last_error = VerifyError::NoMatchingSignatures,
                Err(e) => {
                    debug!(%cosign_image, error = %e, "signature discovery failed");
                    last_error = VerifyError::Registry(e.to_string());
                }
            }
        }
        Err(last_error)
    }
}

fn manual_trust_root(opts: &CheckOpts) -> Result<ManualTrustRoot<'static>, VerifyError> {
    let mut fulcio_certs = Vec::new();
    for pem_bundle in &opts.fulcio_cert_pems {
        for der in certificate_chain_from_pem(pem_bundle)
            .map_err(|e| VerifyError::Verification(e.to_string()))?
        {
            fulcio_certs.push(der.into());
        }
    }
    let decode_keys = |pems: &[String]| -> Result<Vec<Vec<u8>>, VerifyError> {
        let mut keys = Vec::new();
        for pem in pems {
            for key in
                public_keys_from_pem(pem).map_err(|e| VerifyError::Verification(e.to_string()))?
            {
                keys.push(key.der);
            }
        }
        Ok(keys)
    };
    Ok(ManualTrustRoot {
        fulcio_certs: Some(fulcio_certs),
        rekor_keys: decode_keys(&opts.rekor_key_pems)?,
        ctfe_keys: decode_keys(&opts.ctlog_key_pems)?,
    })
}

/// The signing scheme for one classified key under the authority's hash
/// algorithm.
fn signing_scheme(
    key_type: PublicKeyType,
    hash: HashAlgorithm,
) -> Result<SigningScheme, VerifyError> {
    match (key_type, hash) {
        (PublicKeyType::EcdsaP256, HashAlgorithm::Sha256) => {
            Ok(SigningScheme::ECDSA_P256_SHA256_ASN1)
        }
        (PublicKeyType::EcdsaP384, HashAlgorithm::Sha384 | HashAlgorithm::Sha256) => {
            Ok(SigningScheme::ECDSA_P384_SHA384_ASN1)
        }
        (PublicKeyType::Rsa2048, HashAlgorithm::Sha256) => Ok(SigningScheme::RSA_PKCS1_SHA256(2048)),
        (PublicKeyType::Rsa3072, HashAlgorithm::Sha256) => Ok(SigningScheme::RSA_PKCS1_SHA256(3072)),
        (PublicKeyType::Rsa4096, HashAlgorithm::Sha256) => Ok(SigningScheme::RSA_PKCS1_SHA256(4096)),
        (PublicKeyType::Rsa2048, HashAlgorithm::Sha384) => Ok(SigningScheme::RSA_PKCS1_SHA384(2048)),
        (PublicKeyType::Rsa3072, HashAlgorithm::Sha384) => Ok(SigningScheme::RSA_PKCS1_SHA384(3072)),
        (PublicKeyType::Rsa4096, HashAlgorithm::Sha384) => Ok(SigningScheme::RSA_PKCS1_SHA384(4096)),
        (PublicKeyType::Rsa2048, HashAlgorithm::Sha512) => Ok(SigningScheme::RSA_PKCS1_SHA512(2048)),
        (PublicKeyType::Rsa3072, HashAlgorithm::Sha512) => Ok(SigningScheme::RSA_PKCS1_SHA512(3072)),
        (PublicKeyType::Rsa4096, HashAlgorithm::Sha512) => Ok(SigningScheme::RSA_PKCS1_SHA512(4096)),
        (key, hash) => Err(VerifyError::Verification(format!(
            "unsupported key/hash combination {key:?}/{hash:?}"
        ))),
    }
}

/// Builds one constraint per public key of the authority. Any key
/// verifying satisfies the check.
fn key_constraints(keys: &[KeyWithHash]) -> Result<Vec<PublicKeyVerifier>, VerifyError> {
    let mut constraints = Vec::new();
    for key in keys {
        for parsed in
            public_keys_from_pem(&key.pem).map_err(|e| VerifyError::Verification(e.to_string()))?
        {
            let scheme = signing_scheme(parsed.key_type, key.hash_algorithm)?;
            let pem_text = pem::encode(&pem::Pem::new("PUBLIC KEY", parsed.der.clone()));
            let verifier = PublicKeyVerifier::new(pem_text.as_bytes(), &scheme)
                .map_err(|e| VerifyError::Verification(e.to_string()))?;
            constraints.push(verifier);
        }
    }
    Ok(constraints)
}

fn signature_from_layer(layer: &SignatureLayer) -> VerifiedSignature {
    let mut signature = VerifiedSignature {
        payload_digest: Some(layer.simple_signing.critical.image.docker_manifest_digest.clone()),
        ..Default::default()
    };
    if let Some(certificate) = &layer.certificate_signature {
        signature.subject = Some(match &certificate.subject {
            CertificateSubject::Email(email) => email.clone(),
            CertificateSubject::Uri(uri) => uri.clone(),
        });
        signature.issuer = certificate.issuer.clone();
        signature.github_extensions = GithubExtensions {
            workflow_trigger: certificate.github_workflow_trigger.clone(),
            workflow_sha: certificate.github_workflow_sha.clone(),
            workflow_name: certificate.github_workflow_name.clone(),
            workflow_repo: certificate.github_workflow_repository.clone(),
            workflow_ref: certificate.github_workflow_ref.clone(),
        };
    }
    signature
}

#[async_trait]
impl SignatureVerifier for CosignVerifier {
    async fn verify_signatures(
        &self,
        image: &ImageReference,
        opts: &CheckOpts,
        sources: &[SignatureSource],
        _keychain: &Keychain,
    ) -> Result<Vec<VerifiedSignature>, VerifyError> {
        if opts.use_referrers {
            // Tag-based discovery stays authoritative until the registry
            // client grows the OCI 1.1 referrers API.
            debug!("referrers discovery requested, using tag-based discovery");
        }
        let tag = image
            .signature_tag()
            .ok_or_else(|| VerifyError::Verification("image is not a digest reference".into()))?;

        let mut client = self.build_client(opts).await?;
        let layers = self
            .discover_layers(&mut client, image, sources, &tag)
            .await?;

        let accepted: Vec<VerifiedSignature> = if opts.keys.is_empty() {
            // Keyless: the client already verified certificate chains and
            // (when configured) the log inclusion; identity filtering is
            // the caller's.
            layers.iter().map(signature_from_layer).collect()
        } else {
            let constraints = key_constraints(&opts.keys)?;
            layers
                .iter()
                .filter(|layer| {
                    constraints
                        .iter()
                        .any(|constraint| constraint.verify(layer).unwrap_or(false))
                })
                .map(signature_from_layer)
                .collect()
        };

        if accepted.is_empty() {
            return Err(VerifyError::Verification("bad signature".to_string()));
        }
        Ok(accepted)
    }

    async fn verify_attestations(
        &self,
        image: &ImageReference,
        opts: &CheckOpts,
        sources: &[SignatureSource],
        _keychain: &Keychain,
    ) -> Result<Vec<VerifiedAttestation>, VerifyError> {
        let tag = image
            .attestation_tag()
            .ok_or_else(|| VerifyError::Verification("image is not a digest reference".into()))?;

        let mut client = oci_client();
        let mut last_error = VerifyError::NoMatchingAttestations;
        for repository in Self::discovery_repositories(image, sources) {
            let reference: oci_distribution::Reference = format!("{repository}:{tag}")
                .parse()
                .map_err(|e| VerifyError::Registry(format!("{e}")))?;
            match fetch_envelopes(&mut client, &reference).await {
                Ok(envelopes) if !envelopes.is_empty() => {
                    return verify_envelopes(image, opts, envelopes);
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(%reference, error = %e, "attestation discovery failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn fetch_config_file(
        &self,
        image: &ImageReference,
        _keychain: &Keychain,
    ) -> Result<serde_json::Value, VerifyError> {
        let mut client = oci_client();
        let reference: oci_distribution::Reference = image
            .to_string()
            .parse()
            .map_err(|e| VerifyError::Registry(format!("{e}")))?;
        let (manifest, _) = client
            .pull_image_manifest(&reference, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| VerifyError::Registry(e.to_string()))?;
        let mut config = Vec::new();
        client
            .pull_blob(&reference, &manifest.config.digest, &mut config)
            .await
            .map_err(|e| VerifyError::Registry(e.to_string()))?;
        serde_json::from_slice(&config).map_err(|e| VerifyError::Registry(e.to_string()))
    }
}

#[async_trait]
impl DigestResolver for CosignVerifier {
    async fn resolve_digest(
        &self,
        image: &str,
        _keychain: &Keychain,
    ) -> Result<String, VerifyError> {
        let mut client = oci_client();
        let reference: oci_distribution::Reference = image
            .parse()
            .map_err(|e| VerifyError::Registry(format!("{e}")))?;
        client
            .fetch_manifest_digest(&reference, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| VerifyError::Registry(e.to_string()))
    }
}

fn oci_client() -> oci_distribution::Client {
    oci_distribution::Client::new(oci_distribution::client::ClientConfig::default())
}

#[derive(Deserialize, Debug)]
struct DsseEnvelope {
    #[serde(rename = "payloadType")]
    payload_type: String,
    payload: String,
    signatures: Vec<DsseSignature>,
}

#[derive(Deserialize, Debug)]
struct DsseSignature {
    sig: String,
}

struct FetchedEnvelope {
    envelope: DsseEnvelope,
    certificate_pem: Option<String>,
}

async fn fetch_envelopes(
    client: &mut oci_distribution::Client,
    reference: &oci_distribution::Reference,
) -> Result<Vec<FetchedEnvelope>, VerifyError> {
    let (manifest, _) = client
        .pull_image_manifest(reference, &RegistryAuth::Anonymous)
        .await
        .map_err(|e| VerifyError::Registry(e.to_string()))?;

    let mut envelopes = Vec::new();
    for descriptor in &manifest.layers {
        let mut body = Vec::new();
        client
            .pull_blob(reference, &descriptor.digest, &mut body)
            .await
            .map_err(|e| VerifyError::Registry(e.to_string()))?;
        let envelope: DsseEnvelope = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(digest = %descriptor.digest, error = %e, "skipping non-DSSE layer");
                continue;
            }
        };
        let certificate_pem = descriptor
            .annotations
            .as_ref()
            .and_then(|a| a.get(CERTIFICATE_ANNOTATION))
            .cloned();
        envelopes.push(FetchedEnvelope {
            envelope,
            certificate_pem,
        });
    }
    Ok(envelopes)
}

/// DSSE pre-authentication encoding, the exact bytes the envelope
/// signature covers.
fn pre_authentication_encoding(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = Vec::with_capacity(payload.len() + payload_type.len() + 32);
    pae.extend_from_slice(b"DSSEv1 ");
    pae.extend_from_slice(payload_type.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload_type.as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload.len().to_string().as_bytes());
    pae.push(b' ');
    pae.extend_from_slice(payload);
    pae
}

#[derive(Deserialize, Debug)]
struct InTotoStatement {
    #[serde(rename = "predicateType")]
    predicate_type: String,
    #[serde(default)]
    subject: Vec<InTotoSubject>,
}

#[derive(Deserialize, Debug, Default)]
struct InTotoSubject {
    #[serde(default)]
    digest: std::collections::HashMap<String, String>,
}

fn verify_envelopes(
    image: &ImageReference,
    opts: &CheckOpts,
    envelopes: Vec<FetchedEnvelope>,
) -> Result<Vec<VerifiedAttestation>, VerifyError> {
    let mut verified = Vec::new();
    let mut last_error: Option<VerifyError> = None;

    for fetched in envelopes {
        match verify_envelope(image, opts, &fetched) {
            Ok(attestation) => verified.push(attestation),
            Err(e) => last_error = Some(e),
        }
    }

    if verified.is_empty() {
        return Err(last_error.unwrap_or(VerifyError::NoMatchingAttestations));
    }
    Ok(verified)
}

fn verify_envelope(
    image: &ImageReference,
    opts: &CheckOpts,
    fetched: &FetchedEnvelope,
) -> Result<VerifiedAttestation, VerifyError> {
    let envelope = &fetched.envelope;
    if envelope.payload_type != DSSE_PAYLOAD_TYPE {
        return Err(VerifyError::Verification(format!(
            "unexpected payload type {}",
            envelope.payload_type
        )));
    }
    let payload = BASE64
        .decode(&envelope.payload)
        .map_err(|e| VerifyError::Verification(e.to_string()))?;
    let pae = pre_authentication_encoding(&envelope.payload_type, &payload);

    let mut signature = if opts.keys.is_empty() {
        verify_envelope_keyless(envelope, fetched.certificate_pem.as_deref(), &pae)?
    } else {
        verify_envelope_with_keys(&opts.keys, envelope, &pae)?
    };

    let statement: InTotoStatement =
        serde_json::from_slice(&payload).map_err(|e| VerifyError::Verification(e.to_string()))?;

    // The in-toto subject is the attestation's digest claim.
    signature.payload_digest = statement
        .subject
        .iter()
        .find_map(|subject| subject.digest.get("sha256"))
        .map(|hex| format!("sha256:{hex}"));
    if signature.payload_digest.is_none() {
        return Err(VerifyError::Verification(
            "attestation subject carries no sha256 digest".to_string(),
        ));
    }
    // Surface the digest mismatch here so the caller's claim check reads
    // naturally.
    if signature.payload_digest != image.digest {
        debug!(image = %image, "attestation subject does not name the admitted digest");
    }

    Ok(VerifiedAttestation {
        signature,
        predicate_type: statement.predicate_type,
        payload,
    })
}

fn verify_envelope_with_keys(
    keys: &[KeyWithHash],
    envelope: &DsseEnvelope,
    pae: &[u8],
) -> Result<VerifiedSignature, VerifyError> {
    for key in keys {
        for parsed in
            public_keys_from_pem(&key.pem).map_err(|e| VerifyError::Verification(e.to_string()))?
        {
            let scheme = signing_scheme(parsed.key_type, key.hash_algorithm)?;
            let verification_key = CosignVerificationKey::from_der(&parsed.der, &scheme)
                .map_err(|e| VerifyError::Verification(e.to_string()))?;
            for dsse_signature in &envelope.signatures {
                if verification_key
                    .verify_signature(
                        Signature::Base64Encoded(dsse_signature.sig.as_bytes()),
                        pae,
                    )
                    .is_ok()
                {
                    return Ok(VerifiedSignature::default());
                }
            }
        }
    }
    Err(VerifyError::Verification("bad signature".to_string()))
}

/// Verifies the envelope against the certificate cosign attached to the
/// layer and extracts the Fulcio identity from it.
///
/// TODO: validate the certificate chain against the Fulcio roots once the
/// sigstore crate exposes chain verification for DSSE envelopes.
fn verify_envelope_keyless(
    envelope: &DsseEnvelope,
    certificate_pem: Option<&str>,
    pae: &[u8],
) -> Result<VerifiedSignature, VerifyError> {
    let certificate_pem = certificate_pem.ok_or_else(|| {
        VerifyError::Verification("attestation carries no signing certificate".to_string())
    })?;
    let der_chain = certificate_chain_from_pem(certificate_pem)
        .map_err(|e| VerifyError::Verification(e.to_string()))?;
    let leaf_der = der_chain
        .first()
        .ok_or_else(|| VerifyError::Verification("empty certificate chain".to_string()))?;
    let (_, certificate) = X509Certificate::from_der(leaf_der)
        .map_err(|e| VerifyError::Verification(e.to_string()))?;

    let spki = certificate.public_key();
    let verification_key =
        CosignVerificationKey::from_der(spki.raw, &SigningScheme::ECDSA_P256_SHA256_ASN1)
            .map_err(|e| VerifyError::Verification(e.to_string()))?;
    let verified = envelope.signatures.iter().any(|dsse_signature| {
        verification_key
            .verify_signature(Signature::Base64Encoded(dsse_signature.sig.as_bytes()), pae)
            .is_ok()
    });
    if !verified {
        return Err(VerifyError::Verification("bad signature".to_string()));
    }

    Ok(identity_from_certificate(&certificate))
}

fn identity_from_certificate(certificate: &X509Certificate<'_>) -> VerifiedSignature {
    let mut signature = VerifiedSignature::default();

    if let Ok(Some(san)) = certificate.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                GeneralName::RFC822Name(email) => {
                    signature.subject = Some(email.to_string());
                }
                GeneralName::URI(uri) => {
                    signature.subject = Some(uri.to_string());
                }
                _ => {}
            }
        }
    }

    for extension in certificate.extensions() {
        if !matches!(extension.parsed_extension(), ParsedExtension::UnsupportedExtension { .. }) {
            continue;
        }
        let value = String::from_utf8_lossy(extension.value).to_string();
        match extension.oid.to_id_string().as_str() {
            OID_ISSUER => signature.issuer = Some(value),
            OID_WORKFLOW_TRIGGER => signature.github_extensions.workflow_trigger = Some(value),
            OID_WORKFLOW_SHA => signature.github_extensions.workflow_sha = Some(value),
            OID_WORKFLOW_NAME => signature.github_extensions.workflow_name = Some(value),
            OID_WORKFLOW_REPOSITORY => signature.github_extensions.workflow_repo = Some(value),
            OID_WORKFLOW_REF => signature.github_extensions.workflow_ref = Some(value),
            _ => {}
        }
    }
    signature
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pae_matches_the_dsse_specification() {
        let pae = pre_authentication_encoding("application/vnd.in-toto+json", b"hello");
        assert_eq!(
            pae,
            b"DSSEv1 30 application/vnd.in-toto+json 5 hello".to_vec()
        );
    }

    #[test]
    fn discovery_prefers_alternative_sources() {
        let image = ImageReference::parse(
            "gcr.io/distroless/static@sha256:be5d77c62dbe7fedfb0a4e5ec2f91078080800ab1f18358e5f31fcc8faa023c4",
        )
        .unwrap();
        let sources = vec![SignatureSource {
            oci: Some("registry.example.com/signatures".to_string()),
            pull_secrets: vec![],
        }];
        let repositories = CosignVerifier::discovery_repositories(&image, &sources);
        assert_eq!(
            repositories,
            vec![
                "registry.example.com/signatures".to_string(),
                "gcr.io/distroless/static".to_string()
            ]
        );
    }

    #[test]
    fn statement_subject_digest_becomes_the_claim() {
        let statement: InTotoStatement = serde_json::from_value(serde_json::json!({
            "_type": "https://in-toto.io/Statement/v0.1",
            "predicateType": "https://slsa.dev/provenance/v0.2",
            "subject": [{"name": "gcr.io/x/y", "digest": {"sha256": "ab12"}}],
            "predicate": {}
        }))
        .unwrap();
        assert_eq!(statement.predicate_type, "https://slsa.dev/provenance/v0.2");
        assert_eq!(statement.subject[0].digest.get("sha256").unwrap(), "ab12");
    }

    #[test]
    fn unsupported_key_hash_combinations_are_rejected() {
        assert!(signing_scheme(PublicKeyType::EcdsaP521, HashAlgorithm::Sha512).is_err());
        assert!(signing_scheme(PublicKeyType::EcdsaP256, HashAlgorithm::Sha256).is_ok());
    }
}
