use std::io::Cursor;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tough::IntoVec;
use tracing::debug;
use url::Url;

use image_policy::api::DistinguishedName;
use image_policy::trust::{
    certificate_chain_from_pem, log_id_from_pem, sigstore_keys_from_trusted_root,
    CertificateAuthority, SigstoreKeys, TransparencyLogInstance,
};

use crate::errors::CompileError;

/// Target literally named like this is the pre-compiled trust root.
const TRUSTED_ROOT_TARGET: &str = "trusted_root.json";

#[derive(Error, Debug)]
pub enum TufError {
    #[error("cannot decode the serialized repository: {0}")]
    Mirror(String),
    #[error("repository refresh failed: {0}")]
    Refresh(String),
    #[error("cannot read target {name}: {reason}")]
    Target { name: String, reason: String },
}

/// Where the TUF repository lives: serialized in-cluster bytes or an HTTP
/// remote. `root` is the trusted root.json in both cases.
pub enum TufSource {
    InMemory { mirror_gz: Vec<u8>, root: Vec<u8> },
    Remote { mirror: String, root: Vec<u8> },
}

/// How a fallback target contributes to the trust root, declared by the
/// target's `custom.sigstore.usage` metadata.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigstoreUsage {
    Fulcio,
    #[serde(rename = "CTFE")]
    Ctfe,
    Rekor,
}

#[derive(Deserialize, Debug, Default)]
struct SigstoreCustomMetadata {
    #[serde(default)]
    usage: Option<SigstoreUsage>,
    #[serde(default)]
    uri: Option<String>,
}

#[derive(Debug)]
pub struct TufTarget {
    pub name: String,
    pub body: Vec<u8>,
    pub usage: Option<SigstoreUsage>,
    pub uri: Option<String>,
}

/// Fetches and verifies targets from a TUF repository. The TUF client
/// machinery is a collaborator; the compiler only consumes verified target
/// bodies plus their sigstore custom metadata.
#[async_trait]
pub trait TufFetcher: Send + Sync {
    async fn fetch_targets(
        &self,
        source: &TufSource,
        targets_prefix: &str,
    ) -> Result<Vec<TufTarget>, TufError>;
}

/// Compiles fetched targets into the canonical trust material: a
/// `trusted_root.json` target wins outright; otherwise targets are folded
/// in by their declared usage. At least one certificate authority must
/// come out of it.
pub fn compile_targets(targets: &[TufTarget]) -> Result<SigstoreKeys, CompileError> {
    if let Some(trusted_root) = targets
        .iter()
        .find(|t| t.name == TRUSTED_ROOT_TARGET || t.name.ends_with("/trusted_root.json"))
    {
        return Ok(sigstore_keys_from_trusted_root(&trusted_root.body)?);
    }

    let mut compiled = SigstoreKeys::default();
    for target in targets {
        let Some(usage) = target.usage else {
            debug!(target = %target.name, "target has no sigstore usage, skipping");
            continue;
        };
        let pem = String::from_utf8(target.body.clone()).map_err(|e| {
            CompileError::Tuf(format!("target {} is not valid UTF-8: {e}", target.name))
        })?;
        let uri = target.uri.clone().unwrap_or_default();
        match usage {
            SigstoreUsage::Fulcio => {
                certificate_chain_from_pem(&pem)?;
                compiled.certificate_authorities.push(CertificateAuthority {
                    subject: Some(DistinguishedName::default()),
                    uri,
                    cert_chain: pem,
                });
            }
            SigstoreUsage::Ctfe => {
                compiled.ct_logs.push(log_instance(&pem, uri)?);
            }
            SigstoreUsage::Rekor => {
                compiled.t_logs.push(log_instance(&pem, uri)?);
            }
        }
    }

    if compiled.certificate_authorities.is_empty() {
        return Err(CompileError::NoCertificateAuthorities);
    }
    Ok(compiled)
}

fn log_instance(pem: &str, base_url: String) -> Result<TransparencyLogInstance, CompileError> {
    Ok(TransparencyLogInstance {
        base_url,
        hash_algorithm: "sha-256".to_string(),
        public_key: pem.to_string(),
        log_id: log_id_from_pem(pem)?,
    })
}

/// `tough`-backed fetcher. The in-memory form unpacks the gzipped repo
/// tarball into a temporary directory and loads it over file URLs, the
/// remote form loads straight over HTTP.
pub struct ToughFetcher;

#[async_trait]
impl TufFetcher for ToughFetcher {
    async fn fetch_targets(
        &self,
        source: &TufSource,
        targets_prefix: &str,
    ) -> Result<Vec<TufTarget>, TufError> {
        match source {
            TufSource::InMemory { mirror_gz, root } => {
                let dir = unpack_mirror(mirror_gz)?;
                let base = Url::from_directory_path(dir.path())
                    .map_err(|_| TufError::Mirror("cannot build file URL".to_string()))?;
                let targets_base = base
                    .join("targets/")
                    .map_err(|e| TufError::Mirror(e.to_string()))?;
                load_targets(root, base, targets_base, targets_prefix).await
            }
            TufSource::Remote { mirror, root } => {
                let base = Url::parse(&format!("{}/", mirror.trim_end_matches('/')))
                    .map_err(|e| TufError::Mirror(e.to_string()))?;
                let targets_base = base
                    .join("targets/")
                    .map_err(|e| TufError::Mirror(e.to_string()))?;
                load_targets(root, base, targets_base, targets_prefix).await
            }
        }
    }
}

fn unpack_mirror(mirror_gz: &[u8]) -> Result<tempfile::TempDir, TufError> {
    let dir = tempfile::tempdir().map_err(|e| TufError::Mirror(e.to_string()))?;
    let decoder = flate2::read::GzDecoder::new(Cursor::new(mirror_gz));
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dir.path())
        .map_err(|e| TufError::Mirror(e.to_string()))?;
    Ok(dir)
}

async fn load_targets(
    root: &[u8],
    metadata_base: Url,
    targets_base: Url,
    targets_prefix: &str,
) -> Result<Vec<TufTarget>, TufError> {
    let repository = tough::RepositoryLoader::new(&root, metadata_base, targets_base)
        .load()
        .await
        .map_err(|e| TufError::Refresh(e.to_string()))?;

    let target_names: Vec<tough::TargetName> = repository
        .targets()
        .signed
        .targets
        .keys()
        .filter(|name| targets_prefix.is_empty() || name.raw().starts_with(targets_prefix))
        .cloned()
        .collect();

    let mut targets = Vec::new();
    for name in target_names {
        let custom: SigstoreCustomMetadata = repository
            .targets()
            .signed
            .targets
            .get(&name)
            .and_then(|t| t.custom.get("sigstore"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let reader = repository
            .read_target(&name)
            .await
            .map_err(|e| TufError::Target {
                name: name.raw().to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| TufError::Target {
                name: name.raw().to_string(),
                reason: "target not found".to_string(),
            })?;

        let body = reader.into_vec().await.map_err(|e| TufError::Target {
            name: name.raw().to_string(),
            reason: e.to_string(),
        })?;

        targets.push(TufTarget {
            name: name.raw().to_string(),
            body,
            usage: custom.usage,
            uri: custom.uri,
        });
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;

    const P256_PEM: &str = "-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAEW2U0K8c1RdwJXqiqGRpRIcUSdu8t
xx8g5+xPaD0oxJ4KrATSjsgyxkCYq62a1KwrZ1FledUlvg7aN5VoKryM9g==
-----END PUBLIC KEY-----
";

    const CERT_PEM: &str = "-----BEGIN CERTIFICATE-----
AAAA
-----END CERTIFICATE-----
";

    fn target(name: &str, body: &str, usage: Option<SigstoreUsage>) -> TufTarget {
        TufTarget {
            name: name.to_string(),
            body: body.as_bytes().to_vec(),
            usage,
            uri: Some("https://example.com".to_string()),
        }
    }

    #[test]
    fn usage_fallback_folds_targets_by_kind() {
        let targets = vec![
            target("fulcio_v1.crt.pem", CERT_PEM, Some(SigstoreUsage::Fulcio)),
            target("rekor.pub", P256_PEM, Some(SigstoreUsage::Rekor)),
            target("ctfe.pub", P256_PEM, Some(SigstoreUsage::Ctfe)),
            target("unrelated.txt", "hello", None),
        ];
        let compiled = compile_targets(&targets).unwrap();
        assert_eq!(compiled.certificate_authorities.len(), 1);
        assert_eq!(compiled.t_logs.len(), 1);
        assert_eq!(compiled.ct_logs.len(), 1);
        assert_eq!(
            compiled.t_logs[0].log_id,
            "895f24f31f61c5084d9387186202097995dc5763be60d3953850158b15335b7b"
        );
    }

    #[test]
    fn missing_certificate_authorities_fail_compilation() {
        let targets = vec![target("rekor.pub", P256_PEM, Some(SigstoreUsage::Rekor))];
        assert!(matches!(
            compile_targets(&targets).unwrap_err(),
            CompileError::NoCertificateAuthorities
        ));
    }

    #[test]
    fn trusted_root_target_wins() {
        use base64::Engine as _;
        let key = image_policy::trust::public_key_from_pem(P256_PEM).unwrap();
        let raw_bytes = base64::engine::general_purpose::STANDARD.encode(&key.der);
        let trusted_root = serde_json::json!({
            "certificateAuthorities": [{
                "uri": "https://fulcio.example.com",
                "certChain": {"certificates": []}
            }],
            "tlogs": [{
                "baseUrl": "https://rekor.example.com",
                "hashAlgorithm": "SHA2_256",
                "publicKey": {"rawBytes": raw_bytes}
            }]
        });
        let targets = vec![TufTarget {
            name: TRUSTED_ROOT_TARGET.to_string(),
            body: serde_json::to_vec(&trusted_root).unwrap(),
            usage: None,
            uri: None,
        }];
        let compiled = compile_targets(&targets).unwrap();
        assert_eq!(compiled.certificate_authorities.len(), 1);
        assert_eq!(compiled.t_logs.len(), 1);
    }

    #[test]
    fn usage_metadata_deserializes() {
        let custom: SigstoreCustomMetadata = serde_json::from_value(serde_json::json!({
            "usage": "Fulcio",
            "uri": "https://fulcio.sigstore.dev"
        }))
        .unwrap();
        assert_eq!(custom.usage, Some(SigstoreUsage::Fulcio));
    }
}
