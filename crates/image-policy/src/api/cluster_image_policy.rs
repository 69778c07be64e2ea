use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;
use crate::glob::Glob;
use crate::kms;
use crate::trust::public_key_from_pem;
use crate::ValidationError;

/// Cluster-scoped policy binding a set of image name globs to the
/// cryptographic authorities that must vouch for matching images.
#[derive(CustomResource, Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[kube(
    kind = "ClusterImagePolicy",
    group = "policy.sigstore.dev",
    version = "v1beta1",
    status = "ClusterImagePolicyStatus",
    shortname = "cip"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterImagePolicySpec {
    pub images: Vec<ImagePattern>,
    #[serde(default)]
    pub authorities: Vec<Authority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyRef>,
    #[serde(default, rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_resources: Option<Vec<MatchResource>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterImagePolicyStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct ImagePattern {
    pub glob: String,
}

/// One verification path inside a policy. Exactly one of `key`, `keyless`
/// and `static` must be set; validation enforces it because the authored
/// YAML keeps the three as sibling fields.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Authority {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyless: Option<KeylessRef>,
    #[serde(default, rename = "static", skip_serializing_if = "Option::is_none")]
    pub r#static: Option<StaticRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctlog: Option<TLogRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attestations: Vec<Attestation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rfc3161timestamp: Option<Rfc3161TimestampRef>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyRef {
    /// Inline PEM-encoded public key data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// KMS reference, e.g. `awskms:///<key-arn>` or `gcpkms://...`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms: Option<String>,
    /// Reference to a Secret in the controller namespace holding the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_algorithm: Option<HashAlgorithm>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeylessRef {
    /// Fulcio URL issuing the short-lived signing certificates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Alternative CA certificate chain, inline or via Secret.
    #[serde(default, rename = "ca-cert", skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<KeyRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<Identity>,
    #[serde(
        default,
        rename = "insecureIgnoreSCT",
        skip_serializing_if = "Option::is_none"
    )]
    pub insecure_ignore_sct: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_root_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_reg_exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_reg_exp: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct StaticRef {
    pub action: StaticAction,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum StaticAction {
    Pass,
    Fail,
}

/// Alternative location to look up signatures and attestations, together
/// with the pull secrets needed to reach it.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signature_pull_secrets: Vec<SecretRef>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TLogRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_root_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Rfc3161TimestampRef {
    pub trust_root_ref: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub name: String,
    pub predicate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<AttestationPolicy>,
}

/// Predicate types understood without a full URL.
pub const PREDICATE_TYPES: &[&str] = &[
    "custom",
    "slsaprovenance",
    "spdx",
    "spdxjson",
    "cyclonedx",
    "link",
    "vuln",
];

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PolicyType {
    Cue,
    Rego,
}

/// Declarative policy evaluated over the aggregated verification results of
/// a whole ClusterImagePolicy.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRef {
    pub r#type: PolicyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<ConfigMapKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemotePolicy>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fetch_config_file: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_spec: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_object_meta: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_type_meta: bool,
}

/// Declarative policy evaluated over a single matching attestation payload.
/// Unlike the CIP-level policy it may not splice fragments of the admission
/// object into the evaluator input.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttestationPolicy {
    pub r#type: PolicyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<ConfigMapKeyRef>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct ConfigMapKeyRef {
    pub name: String,
    pub key: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
pub struct RemotePolicy {
    pub url: String,
    pub sha256sum: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchResource {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Enforce,
    Warn,
}

impl ClusterImagePolicySpec {
    /// Validates every invariant of the authored form. Called from the CRD
    /// admission webhook and re-run defensively by the reconciler.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.images.is_empty() {
            return Err(ValidationError::missing("spec.images"));
        }
        for (i, image) in self.images.iter().enumerate() {
            Glob::compile(&image.glob).map_err(|_| {
                ValidationError::invalid_value(&image.glob, format!("spec.images[{i}].glob"))
            })?;
        }
        for (i, authority) in self.authorities.iter().enumerate() {
            authority.validate(&format!("spec.authorities[{i}]"))?;
        }
        if let Some(policy) = &self.policy {
            policy.validate("spec.policy")?;
        }
        if let Some(matches) = &self.match_resources {
            for (i, m) in matches.iter().enumerate() {
                if m.resource.is_empty() {
                    return Err(ValidationError::missing(format!(
                        "spec.match[{i}].resource"
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Authority {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        let set: Vec<&str> = [
            self.key.as_ref().map(|_| "key"),
            self.keyless.as_ref().map(|_| "keyless"),
            self.r#static.as_ref().map(|_| "static"),
        ]
        .into_iter()
        .flatten()
        .collect();
        match set.len() {
            0 => {
                return Err(ValidationError::one_of_neither(&[
                    &format!("{field}.key"),
                    &format!("{field}.keyless"),
                    &format!("{field}.static"),
                ]))
            }
            1 => {}
            _ => {
                let fields: Vec<String> = set.iter().map(|s| format!("{field}.{s}")).collect();
                let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
                return Err(ValidationError::one_of_both(&refs));
            }
        }

        if self.r#static.is_some() {
            if !self.sources.is_empty() {
                return Err(ValidationError::invalid(
                    format!("{field}.sources"),
                    "static authorities cannot fetch from alternative sources",
                ));
            }
            if !self.attestations.is_empty() {
                return Err(ValidationError::invalid(
                    format!("{field}.attestations"),
                    "static authorities cannot have attestations",
                ));
            }
            if self.ctlog.is_some() {
                return Err(ValidationError::invalid(
                    format!("{field}.ctlog"),
                    "static authorities cannot use a transparency log",
                ));
            }
            if self.rfc3161timestamp.is_some() {
                return Err(ValidationError::invalid(
                    format!("{field}.rfc3161timestamp"),
                    "static authorities cannot use a timestamp authority",
                ));
            }
        }

        if let Some(key) = &self.key {
            key.validate(&format!("{field}.key"))?;
        }
        if let Some(keyless) = &self.keyless {
            keyless.validate(&format!("{field}.keyless"))?;
        }
        for (i, attestation) in self.attestations.iter().enumerate() {
            attestation.validate(&format!("{field}.attestations[{i}]"))?;
        }
        Ok(())
    }
}

impl KeyRef {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        let set = [
            self.data.as_ref().map(|_| "data"),
            self.kms.as_ref().map(|_| "kms"),
            self.secret_ref.as_ref().map(|_| "secretRef"),
        ]
        .into_iter()
        .flatten()
        .count();
        match set {
            0 => {
                return Err(ValidationError::one_of_neither(&[
                    &format!("{field}.data"),
                    &format!("{field}.kms"),
                    &format!("{field}.secretRef"),
                ]))
            }
            1 => {}
            _ => {
                return Err(ValidationError::one_of_both(&[
                    &format!("{field}.data"),
                    &format!("{field}.kms"),
                    &format!("{field}.secretRef"),
                ]))
            }
        }

        if let Some(data) = &self.data {
            public_key_from_pem(data).map_err(|e| {
                ValidationError::invalid(format!("{field}.data"), e.to_string())
            })?;
        }
        if let Some(kms_ref) = &self.kms {
            kms::validate_kms_reference(kms_ref, &format!("{field}.kms"))?;
        }
        Ok(())
    }
}

impl KeylessRef {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        match (self.url.as_ref(), self.ca_cert.as_ref()) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::one_of_both(&[
                    &format!("{field}.url"),
                    &format!("{field}.ca-cert"),
                ]))
            }
            (None, None) => {
                return Err(ValidationError::one_of_neither(&[
                    &format!("{field}.url"),
                    &format!("{field}.ca-cert"),
                ]))
            }
            _ => {}
        }
        if self.identities.is_empty() {
            return Err(ValidationError::missing(format!("{field}.identities")));
        }
        for (i, identity) in self.identities.iter().enumerate() {
            identity.validate(&format!("{field}.identities[{i}]"))?;
        }
        if let Some(ca_cert) = &self.ca_cert {
            // The CA cert is carried with the same one-of shape as a key,
            // minus the KMS option.
            if ca_cert.kms.is_some() {
                return Err(ValidationError::invalid(
                    format!("{field}.ca-cert.kms"),
                    "CA certificates cannot be fetched from KMS",
                ));
            }
            match (ca_cert.data.as_ref(), ca_cert.secret_ref.as_ref()) {
                (Some(_), Some(_)) => {
                    return Err(ValidationError::one_of_both(&[
                        &format!("{field}.ca-cert.data"),
                        &format!("{field}.ca-cert.secretRef"),
                    ]))
                }
                (None, None) => {
                    return Err(ValidationError::one_of_neither(&[
                        &format!("{field}.ca-cert.data"),
                        &format!("{field}.ca-cert.secretRef"),
                    ]))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Identity {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        match (self.issuer.as_ref(), self.issuer_reg_exp.as_ref()) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::one_of_both(&[
                    &format!("{field}.issuer"),
                    &format!("{field}.issuerRegExp"),
                ]))
            }
            (None, None) => {
                return Err(ValidationError::one_of_neither(&[
                    &format!("{field}.issuer"),
                    &format!("{field}.issuerRegExp"),
                ]))
            }
            _ => {}
        }
        match (self.subject.as_ref(), self.subject_reg_exp.as_ref()) {
            (Some(_), Some(_)) => {
                return Err(ValidationError::one_of_both(&[
                    &format!("{field}.subject"),
                    &format!("{field}.subjectRegExp"),
                ]))
            }
            (None, None) => {
                return Err(ValidationError::one_of_neither(&[
                    &format!("{field}.subject"),
                    &format!("{field}.subjectRegExp"),
                ]))
            }
            _ => {}
        }
        if let Some(re) = &self.issuer_reg_exp {
            Regex::new(re).map_err(|e| {
                ValidationError::invalid(format!("{field}.issuerRegExp"), e.to_string())
            })?;
        }
        if let Some(re) = &self.subject_reg_exp {
            Regex::new(re).map_err(|e| {
                ValidationError::invalid(format!("{field}.subjectRegExp"), e.to_string())
            })?;
        }
        Ok(())
    }
}

impl Attestation {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::missing(format!("{field}.name")));
        }
        let known = PREDICATE_TYPES.contains(&self.predicate_type.as_str())
            || self.predicate_type.starts_with("http://")
            || self.predicate_type.starts_with("https://");
        if !known {
            return Err(ValidationError::invalid_value(
                &self.predicate_type,
                format!("{field}.predicateType"),
            ));
        }
        if let Some(policy) = &self.policy {
            match (policy.data.as_ref(), policy.config_map_ref.as_ref()) {
                (Some(_), Some(_)) => {
                    return Err(ValidationError::one_of_both(&[
                        &format!("{field}.policy.data"),
                        &format!("{field}.policy.configMapRef"),
                    ]))
                }
                (None, None) => {
                    return Err(ValidationError::one_of_neither(&[
                        &format!("{field}.policy.data"),
                        &format!("{field}.policy.configMapRef"),
                    ]))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl PolicyRef {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        let set = [
            self.data.as_ref().map(|_| ()),
            self.config_map_ref.as_ref().map(|_| ()),
            self.remote.as_ref().map(|_| ()),
        ]
        .into_iter()
        .flatten()
        .count();
        match set {
            0 => Err(ValidationError::one_of_neither(&[
                &format!("{field}.data"),
                &format!("{field}.configMapRef"),
                &format!("{field}.remote"),
            ])),
            1 => Ok(()),
            _ => Err(ValidationError::one_of_both(&[
                &format!("{field}.data"),
                &format!("{field}.configMapRef"),
                &format!("{field}.remote"),
            ])),
        }
    }
}
