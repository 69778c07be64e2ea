use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;
use crate::ValidationError;

/// Named bundle of trust material: Fulcio CA chains, transparency log keys
/// and timestamp authorities, authored inline or shipped through TUF.
#[derive(CustomResource, Deserialize, Serialize, Debug, Clone, PartialEq, JsonSchema)]
#[kube(
    kind = "TrustRoot",
    group = "policy.sigstore.dev",
    version = "v1alpha1",
    status = "TrustRootStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct TrustRootSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sigstore_keys: Option<SigstoreKeysSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositorySpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteSpec>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TrustRootStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SigstoreKeysSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certificate_authorities: Vec<CertificateAuthoritySpec>,
    #[serde(default, rename = "tLogs", skip_serializing_if = "Vec::is_empty")]
    pub t_logs: Vec<TransparencyLogSpec>,
    #[serde(default, rename = "ctLogs", skip_serializing_if = "Vec::is_empty")]
    pub ct_logs: Vec<TransparencyLogSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timestamp_authorities: Vec<CertificateAuthoritySpec>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthoritySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<DistinguishedName>,
    #[serde(default)]
    pub uri: String,
    /// PEM bundle holding the certificate chain, root last.
    pub cert_chain: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DistinguishedName {
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub common_name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TransparencyLogSpec {
    pub base_url: String,
    #[serde(default = "default_hash_algorithm")]
    pub hash_algorithm: String,
    /// PEM-encoded public key of the log.
    pub public_key: String,
}

fn default_hash_algorithm() -> String {
    "sha-256".to_string()
}

/// A serialized TUF repository carried inside the cluster: the gzipped
/// tarball of the repo plus the trusted root.json, both base64-encoded.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    pub root: String,
    #[serde(rename = "mirrorFS")]
    pub mirror_fs: String,
    #[serde(default)]
    pub targets: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSpec {
    pub mirror: String,
    pub root: String,
    #[serde(default)]
    pub targets: String,
}

impl TrustRootSpec {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let set = [
            self.sigstore_keys.as_ref().map(|_| ()),
            self.repository.as_ref().map(|_| ()),
            self.remote.as_ref().map(|_| ()),
        ]
        .into_iter()
        .flatten()
        .count();
        match set {
            0 => {
                return Err(ValidationError::one_of_neither(&[
                    "spec.sigstoreKeys",
                    "spec.repository",
                    "spec.remote",
                ]))
            }
            1 => {}
            _ => {
                return Err(ValidationError::one_of_both(&[
                    "spec.sigstoreKeys",
                    "spec.repository",
                    "spec.remote",
                ]))
            }
        }

        if let Some(keys) = &self.sigstore_keys {
            if keys.certificate_authorities.is_empty() {
                return Err(ValidationError::missing(
                    "spec.sigstoreKeys.certificateAuthorities",
                ));
            }
            for (i, log) in keys.t_logs.iter().enumerate() {
                if log.public_key.is_empty() {
                    return Err(ValidationError::missing(format!(
                        "spec.sigstoreKeys.tLogs[{i}].publicKey"
                    )));
                }
            }
            for (i, log) in keys.ct_logs.iter().enumerate() {
                if log.public_key.is_empty() {
                    return Err(ValidationError::missing(format!(
                        "spec.sigstoreKeys.ctLogs[{i}].publicKey"
                    )));
                }
            }
        }
        if let Some(repository) = &self.repository {
            if repository.root.is_empty() {
                return Err(ValidationError::missing("spec.repository.root"));
            }
            if repository.mirror_fs.is_empty() {
                return Err(ValidationError::missing("spec.repository.mirrorFS"));
            }
        }
        if let Some(remote) = &self.remote {
            if remote.mirror.is_empty() {
                return Err(ValidationError::missing("spec.remote.mirror"));
            }
            if remote.root.is_empty() {
                return Err(ValidationError::missing("spec.remote.root"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exactly_one_source_is_required() {
        let spec = TrustRootSpec {
            sigstore_keys: None,
            repository: None,
            remote: None,
        };
        assert_eq!(
            spec.validate().unwrap_err().to_string(),
            "expected exactly one, got neither: spec.sigstoreKeys, spec.repository, spec.remote"
        );

        let spec = TrustRootSpec {
            sigstore_keys: Some(SigstoreKeysSpec::default()),
            repository: Some(RepositorySpec::default()),
            remote: None,
        };
        assert!(spec.validate().is_err());
    }

    #[test]
    fn inline_keys_need_a_certificate_authority() {
        let spec = TrustRootSpec {
            sigstore_keys: Some(SigstoreKeysSpec::default()),
            repository: None,
            remote: None,
        };
        assert_eq!(
            spec.validate().unwrap_err().to_string(),
            "missing field(s): spec.sigstoreKeys.certificateAuthorities"
        );
    }

    #[test]
    fn repository_requires_root_and_mirror() {
        let spec = TrustRootSpec {
            sigstore_keys: None,
            repository: Some(RepositorySpec {
                root: "b64".to_string(),
                mirror_fs: String::new(),
                targets: String::new(),
            }),
            remote: None,
        };
        assert_eq!(
            spec.validate().unwrap_err().to_string(),
            "missing field(s): spec.repository.mirrorFS"
        );
    }
}
