use std::collections::BTreeMap;

use regex::Regex;

use image_policy::api::{Attestation, Identity, StaticAction};
use image_policy::compiled::{AuthorityKind, CompiledAuthority};
use image_policy::reference::ImageReference;

use crate::policy;
use crate::store::Snapshot;
use crate::verify::contract::{
    CheckOpts, KeyWithHash, SignatureSource, VerifiedAttestation, VerifiedSignature,
};
use crate::verify::errors::AuthorityError;
use crate::verify::{AttestationAttributes, AuthorityMatch, SignatureAttributes, VerificationContext};

/// Predicate type shorthands and the statement URIs they stand for.
const PREDICATE_URIS: &[(&str, &str)] = &[
    ("custom", "https://cosign.sigstore.dev/attestation/v1"),
    ("slsaprovenance", "https://slsa.dev/provenance/v0.2"),
    ("spdx", "https://spdx.dev/Document"),
    ("spdxjson", "https://spdx.dev/Document"),
    ("cyclonedx", "https://cyclonedx.org/bom"),
    ("link", "https://in-toto.io/Link/v1"),
    ("vuln", "https://cosign.sigstore.dev/attestation/vuln/v1"),
];

pub fn predicate_type_uri(declared: &str) -> &str {
    PREDICATE_URIS
        .iter()
        .find(|(shorthand, _)| *shorthand == declared)
        .map(|(_, uri)| *uri)
        .unwrap_or(declared)
}

/// Evaluates a single authority for one image. Success yields the match
/// evidence that feeds the CIP-level policy; failure yields the
/// per-authority error that surfaces only if every sibling fails too.
pub async fn verify_authority(
    image: &ImageReference,
    authority: &CompiledAuthority,
    snapshot: &Snapshot,
    ctx: &VerificationContext,
) -> Result<AuthorityMatch, AuthorityError> {
    if let AuthorityKind::Static(static_ref) = &authority.verifier {
        return match static_ref.action {
            StaticAction::Pass => Ok(AuthorityMatch::Static { r#static: true }),
            StaticAction::Fail => Err(AuthorityError::StaticPolicy),
        };
    }

    let opts = check_opts_for(authority, snapshot, ctx)?;
    let sources = signature_sources(authority);

    if authority.attestations.is_empty() {
        verify_signatures(image, authority, &opts, &sources, ctx).await
    } else {
        verify_attestations(image, authority, &opts, &sources, ctx).await
    }
}

async fn verify_signatures(
    image: &ImageReference,
    authority: &CompiledAuthority,
    opts: &CheckOpts,
    sources: &[SignatureSource],
    ctx: &VerificationContext,
) -> Result<AuthorityMatch, AuthorityError> {
    let verified = ctx
        .verifier
        .verify_signatures(image, opts, sources, &ctx.keychain)
        .await
        .map_err(|e| signature_error(authority, image, e.to_string()))?;

    let accepted: Vec<&VerifiedSignature> = verified
        .iter()
        .filter(|signature| claim_matches(signature, image))
        .filter(|signature| identities_satisfied(authority, signature))
        .collect();

    if accepted.is_empty() {
        let cause = if verified.is_empty() {
            "no matching signatures".to_string()
        } else if verified.iter().any(|s| claim_matches(s, image)) {
            "none of the expected identities matched what was in the certificate".to_string()
        } else {
            "payload digest does not match the image digest".to_string()
        };
        return Err(signature_error(authority, image, cause));
    }

    Ok(AuthorityMatch::Signatures {
        signatures: accepted.into_iter().map(SignatureAttributes::from).collect(),
    })
}

async fn verify_attestations(
    image: &ImageReference,
    authority: &CompiledAuthority,
    opts: &CheckOpts,
    sources: &[SignatureSource],
    ctx: &VerificationContext,
) -> Result<AuthorityMatch, AuthorityError> {
    let verified = ctx
        .verifier
        .verify_attestations(image, opts, sources, &ctx.keychain)
        .await
        .map_err(|e| AuthorityError::Attestation {
            authority: authority.name.clone(),
            image: image.to_string(),
            cause: e.to_string(),
        })?;

    let accepted: Vec<&VerifiedAttestation> = verified
        .iter()
        .filter(|attestation| claim_matches(&attestation.signature, image))
        .filter(|attestation| identities_satisfied(authority, &attestation.signature))
        .collect();

    let mut matches: BTreeMap<String, Vec<AttestationAttributes>> = BTreeMap::new();
    for declared in &authority.attestations {
        let of_type: Vec<&VerifiedAttestation> = accepted
            .iter()
            .filter(|a| a.predicate_type == predicate_type_uri(&declared.predicate_type))
            .copied()
            .collect();
        if of_type.is_empty() {
            return Err(AuthorityError::NoMatchingAttestations);
        }
        let passing = filter_by_attestation_policy(declared, &of_type)
            .map_err(|cause| AuthorityError::Attestation {
                authority: authority.name.clone(),
                image: image.to_string(),
                cause,
            })?;
        matches.insert(declared.name.clone(), passing);
    }

    Ok(AuthorityMatch::Attestations {
        attestations: matches,
    })
}

/// Applies the declared attestation's own policy to every candidate
/// payload; at least one attestation must satisfy it.
fn filter_by_attestation_policy(
    declared: &Attestation,
    candidates: &[&VerifiedAttestation],
) -> Result<Vec<AttestationAttributes>, String> {
    let Some(att_policy) = &declared.policy else {
        return Ok(candidates
            .iter()
            .map(|a| AttestationAttributes::from(*a))
            .collect());
    };
    let data = att_policy.data.as_deref().unwrap_or_default();

    let mut passing = Vec::new();
    let mut last_error = None;
    for candidate in candidates {
        let payload: serde_json::Value = match serde_json::from_slice(&candidate.payload) {
            Ok(payload) => payload,
            Err(e) => {
                last_error = Some(format!("cannot decode attestation payload: {e}"));
                continue;
            }
        };
        match policy::evaluate(att_policy.r#type, data, &payload) {
            Ok(()) => passing.push(AttestationAttributes::from(*candidate)),
            Err(e) => last_error = Some(e.to_string()),
        }
    }
    if passing.is_empty() {
        return Err(last_error
            .unwrap_or_else(|| "no attestations satisfied the policy".to_string()));
    }
    Ok(passing)
}

/// Simple claim check: the signed payload must name the digest being
/// admitted.
fn claim_matches(signature: &VerifiedSignature, image: &ImageReference) -> bool {
    match (&signature.payload_digest, &image.digest) {
        (Some(signed), Some(admitted)) => signed == admitted,
        _ => false,
    }
}

fn identities_satisfied(authority: &CompiledAuthority, signature: &VerifiedSignature) -> bool {
    let AuthorityKind::Keyless(keyless) = &authority.verifier else {
        return true;
    };
    keyless
        .identities
        .iter()
        .any(|identity| identity_matches(identity, signature))
}

/// A certificate satisfies an identity iff both the issuer and the subject
/// requirement hold, each being either a literal or a pre-validated regex.
fn identity_matches(identity: &Identity, signature: &VerifiedSignature) -> bool {
    let issuer = signature.issuer.as_deref().unwrap_or_default();
    let subject = signature.subject.as_deref().unwrap_or_default();

    let issuer_ok = match (&identity.issuer, &identity.issuer_reg_exp) {
        (Some(expected), _) => expected == issuer,
        (None, Some(pattern)) => Regex::new(pattern)
            .map(|re| re.is_match(issuer))
            .unwrap_or(false),
        (None, None) => true,
    };
    let subject_ok = match (&identity.subject, &identity.subject_reg_exp) {
        (Some(expected), _) => expected == subject,
        (None, Some(pattern)) => Regex::new(pattern)
            .map(|re| re.is_match(subject))
            .unwrap_or(false),
        (None, None) => true,
    };
    issuer_ok && subject_ok
}

fn signature_sources(authority: &CompiledAuthority) -> Vec<SignatureSource> {
    authority
        .sources
        .iter()
        .map(|source| SignatureSource {
            oci: source.oci.clone(),
            pull_secrets: source
                .signature_pull_secrets
                .iter()
                .map(|secret| secret.name.clone())
                .collect(),
        })
        .collect()
}

fn signature_error(
    authority: &CompiledAuthority,
    image: &ImageReference,
    cause: String,
) -> AuthorityError {
    match &authority.verifier {
        AuthorityKind::Keyless(_) => AuthorityError::Keyless {
            authority: authority.name.clone(),
            image: image.to_string(),
            cause,
        },
        _ => AuthorityError::Key {
            authority: authority.name.clone(),
            image: image.to_string(),
            cause,
        },
    }
}

/// The check options implied by the authority's material plus the trust
/// roots in the current snapshot.
fn check_opts_for(
    authority: &CompiledAuthority,
    snapshot: &Snapshot,
    ctx: &VerificationContext,
) -> Result<CheckOpts, AuthorityError> {
    let mut opts = CheckOpts {
        use_referrers: ctx.use_referrers,
        ..Default::default()
    };

    match &authority.verifier {
        AuthorityKind::Key(key) => {
            opts.keys.push(KeyWithHash {
                pem: key.data.clone(),
                hash_algorithm: key.hash_algorithm,
            });
        }
        AuthorityKind::Keyless(keyless) => {
            opts.require_sct = !keyless.insecure_ignore_sct.unwrap_or(false);
            if let Some(trust_root_ref) = &keyless.trust_root_ref {
                let keys = trust_root(snapshot, trust_root_ref)?;
                opts.fulcio_cert_pems = keys.fulcio_cert_pems();
                opts.rekor_key_pems = keys.rekor_key_pems();
                opts.ctlog_key_pems = keys.ctlog_key_pems();
            } else if let Some(ca_cert) = &keyless.ca_cert {
                if let Some(data) = &ca_cert.data {
                    opts.fulcio_cert_pems = vec![data.clone()];
                }
            } else {
                opts.use_default_trust = true;
            }
        }
        AuthorityKind::Static(_) => {}
    }

    if let Some(ctlog) = &authority.ctlog {
        opts.rekor_url = ctlog.url.clone();
        if let Some(trust_root_ref) = &ctlog.trust_root_ref {
            let keys = trust_root(snapshot, trust_root_ref)?;
            opts.rekor_key_pems = keys.rekor_key_pems();
            opts.ctlog_key_pems = keys.ctlog_key_pems();
        }
    }

    if let Some(rfc3161timestamp) = &authority.rfc3161timestamp {
        let keys = trust_root(snapshot, &rfc3161timestamp.trust_root_ref)?;
        opts.tsa_cert_pems = keys.tsa_cert_pems();
    }

    Ok(opts)
}

fn trust_root<'a>(
    snapshot: &'a Snapshot,
    name: &str,
) -> Result<&'a image_policy::trust::SigstoreKeys, AuthorityError> {
    snapshot.trust_roots.get(name).ok_or_else(|| {
        AuthorityError::Config(format!("trustRootRef {name} not found in the snapshot"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image_policy::api::{HashAlgorithm, KeylessRef};
    use image_policy::compiled::CompiledKey;

    fn keyless_authority(identities: Vec<Identity>) -> CompiledAuthority {
        CompiledAuthority {
            name: "authority-0".to_string(),
            verifier: AuthorityKind::Keyless(KeylessRef {
                url: Some("https://fulcio.sigstore.dev".to_string()),
                identities,
                ..Default::default()
            }),
            sources: vec![],
            ctlog: None,
            attestations: vec![],
            rfc3161timestamp: None,
        }
    }

    fn signature(subject: &str, issuer: &str) -> VerifiedSignature {
        VerifiedSignature {
            subject: Some(subject.to_string()),
            issuer: Some(issuer.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn identity_requires_both_issuer_and_subject() {
        let identity = Identity {
            issuer: Some("https://accounts.google.com".to_string()),
            subject: Some("user@example.com".to_string()),
            ..Default::default()
        };
        assert!(identity_matches(
            &identity,
            &signature("user@example.com", "https://accounts.google.com")
        ));
        assert!(!identity_matches(
            &identity,
            &signature("other@example.com", "https://accounts.google.com")
        ));
        assert!(!identity_matches(
            &identity,
            &signature("user@example.com", "https://other.issuer")
        ));
    }

    #[test]
    fn identity_regexes() {
        let identity = Identity {
            issuer_reg_exp: Some("^https://token\\.actions\\..*$".to_string()),
            subject_reg_exp: Some("^https://github\\.com/example/.*$".to_string()),
            ..Default::default()
        };
        assert!(identity_matches(
            &identity,
            &signature(
                "https://github.com/example/app/.github/workflows/release.yml@refs/heads/main",
                "https://token.actions.githubusercontent.com"
            )
        ));
        assert!(!identity_matches(
            &identity,
            &signature(
                "https://github.com/forked/app/.github/workflows/release.yml@refs/heads/main",
                "https://token.actions.githubusercontent.com"
            )
        ));
    }

    #[test]
    fn any_identity_passes_the_gate() {
        let authority = keyless_authority(vec![
            Identity {
                issuer: Some("https://first.example.com".to_string()),
                subject: Some("a@example.com".to_string()),
                ..Default::default()
            },
            Identity {
                issuer: Some("https://second.example.com".to_string()),
                subject: Some("b@example.com".to_string()),
                ..Default::default()
            },
        ]);
        assert!(identities_satisfied(
            &authority,
            &signature("b@example.com", "https://second.example.com")
        ));
        assert!(!identities_satisfied(
            &authority,
            &signature("c@example.com", "https://second.example.com")
        ));
    }

    #[test]
    fn predicate_shorthands_map_to_statement_uris() {
        assert_eq!(
            predicate_type_uri("slsaprovenance"),
            "https://slsa.dev/provenance/v0.2"
        );
        assert_eq!(
            predicate_type_uri("https://example.com/custom/v7"),
            "https://example.com/custom/v7"
        );
    }

    #[test]
    fn claim_check_compares_the_signed_digest() {
        let image = ImageReference::parse(
            "gcr.io/distroless/static@sha256:be5d77c62dbe7fedfb0a4e5ec2f91078080800ab1f18358e5f31fcc8faa023c4",
        )
        .unwrap();
        let mut sig = VerifiedSignature {
            payload_digest: Some(
                "sha256:be5d77c62dbe7fedfb0a4e5ec2f91078080800ab1f18358e5f31fcc8faa023c4"
                    .to_string(),
            ),
            ..Default::default()
        };
        assert!(claim_matches(&sig, &image));
        sig.payload_digest = Some("sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string());
        assert!(!claim_matches(&sig, &image));
    }

    #[test]
    fn missing_trust_root_is_a_config_error() {
        let authority = CompiledAuthority {
            name: "authority-0".to_string(),
            verifier: AuthorityKind::Keyless(KeylessRef {
                url: Some("https://fulcio.sigstore.dev".to_string()),
                identities: vec![Identity {
                    issuer: Some("i".to_string()),
                    subject: Some("s".to_string()),
                    ..Default::default()
                }],
                trust_root_ref: Some("missing-root".to_string()),
                ..Default::default()
            }),
            sources: vec![],
            ctlog: None,
            attestations: vec![],
            rfc3161timestamp: None,
        };
        let ctx = VerificationContext {
            verifier: std::sync::Arc::new(NullVerifier),
            keychain: Default::default(),
            use_referrers: false,
            fail_on_empty_authorities: false,
            admission_object: None,
        };
        let err = check_opts_for(&authority, &Snapshot::default(), &ctx).unwrap_err();
        assert!(err.to_string().contains("missing-root"));
    }

    #[test]
    fn key_authorities_bind_their_hash_algorithm() {
        let authority = CompiledAuthority {
            name: "authority-0".to_string(),
            verifier: AuthorityKind::Key(CompiledKey {
                data: "pem".to_string(),
                hash_algorithm: HashAlgorithm::Sha512,
            }),
            sources: vec![],
            ctlog: None,
            attestations: vec![],
            rfc3161timestamp: None,
        };
        let ctx = VerificationContext {
            verifier: std::sync::Arc::new(NullVerifier),
            keychain: Default::default(),
            use_referrers: false,
            fail_on_empty_authorities: false,
            admission_object: None,
        };
        let opts = check_opts_for(&authority, &Snapshot::default(), &ctx).unwrap();
        assert_eq!(opts.keys.len(), 1);
        assert_eq!(opts.keys[0].hash_algorithm, HashAlgorithm::Sha512);
    }

    struct NullVerifier;

    #[async_trait::async_trait]
    impl crate::verify::contract::SignatureVerifier for NullVerifier {
        async fn verify_signatures(
            &self,
            _image: &ImageReference,
            _opts: &CheckOpts,
            _sources: &[SignatureSource],
            _keychain: &crate::verify::contract::Keychain,
        ) -> Result<Vec<VerifiedSignature>, crate::verify::contract::VerifyError> {
            Ok(vec![])
        }

        async fn verify_attestations(
            &self,
            _image: &ImageReference,
            _opts: &CheckOpts,
            _sources: &[SignatureSource],
            _keychain: &crate::verify::contract::Keychain,
        ) -> Result<Vec<VerifiedAttestation>, crate::verify::contract::VerifyError> {
            Ok(vec![])
        }
    }
}
