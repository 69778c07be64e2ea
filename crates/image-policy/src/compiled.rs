use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::{
    Attestation, AttestationPolicy, Authority, ClusterImagePolicySpec, HashAlgorithm,
    ImagePattern, KeylessRef, MatchResource, Mode, PolicyRef, PolicyType, Source, StaticRef,
    TLogRef,
};

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("authority {authority} still references a secret")]
    ResidualSecretRef { authority: String },
    #[error("authority {authority} still references a KMS key")]
    ResidualKms { authority: String },
    #[error("policy still references a ConfigMap")]
    ResidualConfigMapRef,
    #[error("policy still references a remote document")]
    ResidualRemote,
    #[error("authority {authority} has no verification material")]
    EmptyAuthority { authority: String },
    #[error("cannot serialize policy: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The self-contained form of a ClusterImagePolicy consumed at admission
/// time: every external reference has been resolved and inlined by the
/// reconciler, every authority carries a canonical name, and defaults are
/// materialized.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledClusterImagePolicy {
    pub uid: String,
    pub resource_version: String,
    pub images: Vec<ImagePattern>,
    pub authorities: Vec<CompiledAuthority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<CompiledPolicy>,
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_resources: Option<Vec<MatchResource>>,
    #[serde(default)]
    pub mode: Mode,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledAuthority {
    pub name: String,
    #[serde(flatten)]
    pub verifier: AuthorityKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctlog: Option<TLogRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attestations: Vec<Attestation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfc3161timestamp: Option<crate::api::Rfc3161TimestampRef>,
}

/// The resolved verification material. The variants carry the same field
/// names as the authored YAML, so the canonical JSON keeps the familiar
/// `key:` / `keyless:` / `static:` shape.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum AuthorityKind {
    Key(CompiledKey),
    Keyless(KeylessRef),
    Static(StaticRef),
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledKey {
    /// Inline PEM data; one or more concatenated PUBLIC KEY blocks.
    pub data: String,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompiledPolicy {
    pub r#type: PolicyType,
    pub data: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fetch_config_file: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_spec: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_object_meta: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_type_meta: bool,
}

impl CompiledClusterImagePolicy {
    /// Builds the webhook form from an authored spec whose external
    /// references were already inlined by the reconciler. Residual
    /// references are an error, never silently dropped.
    pub fn from_spec(
        spec: &ClusterImagePolicySpec,
        uid: &str,
        resource_version: &str,
    ) -> Result<CompiledClusterImagePolicy, CompileError> {
        let authorities = spec
            .authorities
            .iter()
            .enumerate()
            .map(|(i, authority)| compile_authority(authority, i))
            .collect::<Result<Vec<_>, _>>()?;

        let policy = spec.policy.as_ref().map(compile_policy).transpose()?;

        Ok(CompiledClusterImagePolicy {
            uid: uid.to_string(),
            resource_version: resource_version.to_string(),
            images: spec.images.clone(),
            authorities,
            policy,
            match_resources: spec.match_resources.clone(),
            mode: spec.mode.unwrap_or_default(),
        })
    }

    /// The canonical JSON document stored as the ConfigMap entry.
    pub fn canonical_json(&self) -> Result<String, CompileError> {
        Ok(serde_json::to_string(self)?)
    }
}

fn authority_name(authority: &Authority, index: usize) -> String {
    match &authority.name {
        Some(name) if !name.is_empty() => name.clone(),
        _ => format!("authority-{index}"),
    }
}

fn compile_authority(
    authority: &Authority,
    index: usize,
) -> Result<CompiledAuthority, CompileError> {
    let name = authority_name(authority, index);

    let verifier = if let Some(key) = &authority.key {
        if key.kms.is_some() {
            return Err(CompileError::ResidualKms { authority: name });
        }
        if key.secret_ref.is_some() {
            return Err(CompileError::ResidualSecretRef { authority: name });
        }
        let data = key
            .data
            .clone()
            .ok_or(CompileError::EmptyAuthority {
                authority: name.clone(),
            })?;
        AuthorityKind::Key(CompiledKey {
            data,
            hash_algorithm: key.hash_algorithm.unwrap_or_default(),
        })
    } else if let Some(keyless) = &authority.keyless {
        if let Some(ca_cert) = &keyless.ca_cert {
            if ca_cert.secret_ref.is_some() {
                return Err(CompileError::ResidualSecretRef { authority: name });
            }
        }
        AuthorityKind::Keyless(keyless.clone())
    } else if let Some(static_ref) = &authority.r#static {
        AuthorityKind::Static(static_ref.clone())
    } else {
        return Err(CompileError::EmptyAuthority { authority: name });
    };

    let attestations = authority
        .attestations
        .iter()
        .map(compile_attestation)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CompiledAuthority {
        name,
        verifier,
        sources: authority.sources.clone(),
        ctlog: authority.ctlog.clone(),
        attestations,
        rfc3161timestamp: authority.rfc3161timestamp.clone(),
    })
}

fn compile_attestation(attestation: &Attestation) -> Result<Attestation, CompileError> {
    if let Some(policy) = &attestation.policy {
        if policy.config_map_ref.is_some() {
            return Err(CompileError::ResidualConfigMapRef);
        }
        if policy.data.is_none() {
            return Err(CompileError::ResidualConfigMapRef);
        }
    }
    Ok(Attestation {
        name: attestation.name.clone(),
        predicate_type: attestation.predicate_type.clone(),
        policy: attestation.policy.as_ref().map(|p| AttestationPolicy {
            r#type: p.r#type,
            data: p.data.clone(),
            config_map_ref: None,
        }),
    })
}

fn compile_policy(policy: &PolicyRef) -> Result<CompiledPolicy, CompileError> {
    if policy.config_map_ref.is_some() {
        return Err(CompileError::ResidualConfigMapRef);
    }
    if policy.remote.is_some() {
        return Err(CompileError::ResidualRemote);
    }
    let data = policy.data.clone().ok_or(CompileError::ResidualRemote)?;
    Ok(CompiledPolicy {
        r#type: policy.r#type,
        data,
        fetch_config_file: policy.fetch_config_file,
        include_spec: policy.include_spec,
        include_object_meta: policy.include_object_meta,
        include_type_meta: policy.include_type_meta,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{KeyRef, SecretRef};

    const P256_PEM: &str = "-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEW2U0K8c1RdwJXqiqGRpRIcUSdu8t
xx8g5+xPaD0oxJ4KrATSjsgyxkCYq62a1KwrZ1FledUlvg7aN5VoKryM9g==
-----END PUBLIC KEY-----
";

    fn resolved_spec() -> ClusterImagePolicySpec {
        ClusterImagePolicySpec {
            images: vec![ImagePattern {
                glob: "gcr.io/*/*".to_string(),
            }],
            authorities: vec![Authority {
                key: Some(KeyRef {
                    data: Some(P256_PEM.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            policy: None,
            match_resources: None,
            mode: None,
        }
    }

    #[test]
    fn authorities_get_default_names_and_modes() {
        let compiled =
            CompiledClusterImagePolicy::from_spec(&resolved_spec(), "uid-1", "42").unwrap();
        assert_eq!(compiled.authorities[0].name, "authority-0");
        assert_eq!(compiled.mode, Mode::Enforce);
        assert_eq!(compiled.uid, "uid-1");
        assert_eq!(compiled.resource_version, "42");
    }

    #[test]
    fn canonical_json_round_trips() {
        let compiled =
            CompiledClusterImagePolicy::from_spec(&resolved_spec(), "uid-1", "42").unwrap();
        let json = compiled.canonical_json().unwrap();
        let reparsed: CompiledClusterImagePolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(compiled, reparsed);
        assert!(!json.contains("secretRef"));
        assert!(!json.contains("kms"));
        assert!(!json.contains("configMapRef"));
        assert!(!json.contains("remote"));
    }

    #[test]
    fn canonical_json_keeps_the_authored_field_shape() {
        let compiled =
            CompiledClusterImagePolicy::from_spec(&resolved_spec(), "uid-1", "42").unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&compiled.canonical_json().unwrap()).unwrap();
        assert!(value["authorities"][0]["key"]["data"].is_string());
        assert_eq!(value["authorities"][0]["key"]["hashAlgorithm"], "sha256");
        assert_eq!(value["mode"], "enforce");
    }

    #[test]
    fn residual_secret_ref_is_an_error() {
        let mut spec = resolved_spec();
        spec.authorities[0].key = Some(KeyRef {
            secret_ref: Some(SecretRef {
                name: "signing-key".to_string(),
            }),
            ..Default::default()
        });
        let err = CompiledClusterImagePolicy::from_spec(&spec, "uid", "1").unwrap_err();
        assert!(matches!(err, CompileError::ResidualSecretRef { .. }));
    }

    #[test]
    fn residual_remote_policy_is_an_error() {
        let mut spec = resolved_spec();
        spec.policy = Some(PolicyRef {
            r#type: PolicyType::Cue,
            data: None,
            config_map_ref: None,
            remote: Some(crate::api::RemotePolicy {
                url: "https://example.com/policy.cue".to_string(),
                sha256sum: "00".to_string(),
            }),
            fetch_config_file: false,
            include_spec: false,
            include_object_meta: false,
            include_type_meta: false,
        });
        let err = CompiledClusterImagePolicy::from_spec(&spec, "uid", "1").unwrap_err();
        assert!(matches!(err, CompileError::ResidualRemote));
    }

    #[test]
    fn static_authorities_compile() {
        let mut spec = resolved_spec();
        spec.authorities = vec![Authority {
            name: Some("no-signatures-needed".to_string()),
            r#static: Some(StaticRef {
                action: crate::api::StaticAction::Pass,
            }),
            ..Default::default()
        }];
        let compiled = CompiledClusterImagePolicy::from_spec(&spec, "uid", "1").unwrap();
        assert_eq!(compiled.authorities[0].name, "no-signatures-needed");
        let json = compiled.canonical_json().unwrap();
        assert!(json.contains("\"static\":{\"action\":\"pass\"}"));
    }
}
