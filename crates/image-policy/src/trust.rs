use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_parser::prelude::FromDer;
use x509_parser::x509::SubjectPublicKeyInfo;

use crate::api::{DistinguishedName, SigstoreKeysSpec};

const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P384: &str = "1.3.132.0.34";
const OID_CURVE_P521: &str = "1.3.132.0.35";

#[derive(Error, Debug)]
pub enum TrustError {
    #[error("cannot decode PEM block: {0}")]
    Pem(#[from] pem::PemError),
    #[error("expected a PUBLIC KEY PEM block, found {0}")]
    NotAPublicKey(String),
    #[error("expected a CERTIFICATE PEM block, found {0}")]
    NotACertificate(String),
    #[error("cannot parse SubjectPublicKeyInfo: {0}")]
    Spki(String),
    #[error("unsupported public key algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("unsupported elliptic curve {0}")]
    UnsupportedCurve(String),
    #[error("unsupported RSA key size {0}")]
    UnsupportedRsaSize(usize),
    #[error("cannot decode base64 data: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("trusted root has no certificate authorities")]
    NoCertificateAuthorities,
}

/// The public key flavors the verifier accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublicKeyType {
    EcdsaP256,
    EcdsaP384,
    EcdsaP521,
    Rsa2048,
    Rsa3072,
    Rsa4096,
}

/// A parsed public key: the DER-encoded SubjectPublicKeyInfo plus its
/// classified type.
#[derive(Debug, Clone)]
pub struct ParsedPublicKey {
    pub der: Vec<u8>,
    pub key_type: PublicKeyType,
}

/// Parses a PEM `PUBLIC KEY` block and classifies it. Multiple
/// concatenated blocks are accepted; every block must hold a supported key.
pub fn public_keys_from_pem(data: &str) -> Result<Vec<ParsedPublicKey>, TrustError> {
    let blocks = pem::parse_many(data.as_bytes())?;
    if blocks.is_empty() {
        return Err(TrustError::NotAPublicKey("no PEM data".to_string()));
    }
    blocks
        .into_iter()
        .map(|block| {
            if block.tag() != "PUBLIC KEY" {
                return Err(TrustError::NotAPublicKey(block.tag().to_string()));
            }
            let der = block.contents().to_vec();
            let key_type = classify_public_key(&der)?;
            Ok(ParsedPublicKey { der, key_type })
        })
        .collect()
}

/// Single-key variant used by validation, where exactly one key is allowed.
pub fn public_key_from_pem(data: &str) -> Result<ParsedPublicKey, TrustError> {
    let mut keys = public_keys_from_pem(data)?;
    // parse_many returned at least one entry
    Ok(keys.swap_remove(0))
}

/// Parses a PEM bundle of certificates, returning the DER bytes of each.
pub fn certificate_chain_from_pem(data: &str) -> Result<Vec<Vec<u8>>, TrustError> {
    let blocks = pem::parse_many(data.as_bytes())?;
    if blocks.is_empty() {
        return Err(TrustError::NotACertificate("no PEM data".to_string()));
    }
    blocks
        .into_iter()
        .map(|block| {
            if block.tag() != "CERTIFICATE" {
                return Err(TrustError::NotACertificate(block.tag().to_string()));
            }
            Ok(block.contents().to_vec())
        })
        .collect()
}

fn classify_public_key(der: &[u8]) -> Result<PublicKeyType, TrustError> {
    let (_, spki) =
        SubjectPublicKeyInfo::from_der(der).map_err(|e| TrustError::Spki(e.to_string()))?;
    let algorithm = spki.algorithm.algorithm.to_id_string();
    match algorithm.as_str() {
        OID_EC_PUBLIC_KEY => {
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.as_oid().ok())
                .map(|oid| oid.to_id_string())
                .ok_or_else(|| TrustError::UnsupportedCurve("unknown".to_string()))?;
            match curve.as_str() {
                OID_CURVE_P256 => Ok(PublicKeyType::EcdsaP256),
                OID_CURVE_P384 => Ok(PublicKeyType::EcdsaP384),
                OID_CURVE_P521 => Ok(PublicKeyType::EcdsaP521),
                other => Err(TrustError::UnsupportedCurve(other.to_string())),
            }
        }
        OID_RSA_ENCRYPTION => {
            let parsed = spki
                .parsed()
                .map_err(|e| TrustError::Spki(e.to_string()))?;
            match parsed {
                x509_parser::public_key::PublicKey::RSA(rsa) => {
                    match rsa.key_size() {
                        2048 => Ok(PublicKeyType::Rsa2048),
                        3072 => Ok(PublicKeyType::Rsa3072),
                        4096 => Ok(PublicKeyType::Rsa4096),
                        other => Err(TrustError::UnsupportedRsaSize(other)),
                    }
                }
                _ => Err(TrustError::Spki("not an RSA key".to_string())),
            }
        }
        other => Err(TrustError::UnsupportedAlgorithm(other.to_string())),
    }
}

/// The log ID of a transparency log instance: the SHA-256 of the
/// DER-encoded SubjectPublicKeyInfo of its public key, hex-encoded.
pub fn log_id(spki_der: &[u8]) -> String {
    hex::encode(Sha256::digest(spki_der))
}

/// Log ID computed straight from a PEM public key.
pub fn log_id_from_pem(data: &str) -> Result<String, TrustError> {
    let key = public_key_from_pem(data)?;
    Ok(log_id(&key.der))
}

/// Compiled trust material for one TrustRoot, as published into the
/// sigstore-keys ConfigMap. Keys and chains are carried as PEM so the entry
/// is self-contained and diffable.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SigstoreKeys {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub certificate_authorities: Vec<CertificateAuthority>,
    #[serde(default, rename = "tLogs", skip_serializing_if = "Vec::is_empty")]
    pub t_logs: Vec<TransparencyLogInstance>,
    #[serde(default, rename = "ctLogs", skip_serializing_if = "Vec::is_empty")]
    pub ct_logs: Vec<TransparencyLogInstance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub timestamp_authorities: Vec<CertificateAuthority>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAuthority {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<DistinguishedName>,
    #[serde(default)]
    pub uri: String,
    /// PEM bundle of the chain.
    pub cert_chain: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransparencyLogInstance {
    pub base_url: String,
    pub hash_algorithm: String,
    /// PEM-encoded public key.
    pub public_key: String,
    /// Hex SHA-256 of the DER SubjectPublicKeyInfo of `public_key`.
    pub log_id: String,
}

impl SigstoreKeys {
    /// Compiles the inline `sigstoreKeys` authored form: PEM material is
    /// checked, log IDs are derived.
    pub fn from_spec(spec: &SigstoreKeysSpec) -> Result<SigstoreKeys, TrustError> {
        let mut compiled = SigstoreKeys::default();
        for ca in &spec.certificate_authorities {
            certificate_chain_from_pem(&ca.cert_chain)?;
            compiled.certificate_authorities.push(CertificateAuthority {
                subject: ca.subject.clone(),
                uri: ca.uri.clone(),
                cert_chain: ca.cert_chain.clone(),
            });
        }
        for log in &spec.t_logs {
            compiled.t_logs.push(Self::compile_log(log)?);
        }
        for log in &spec.ct_logs {
            compiled.ct_logs.push(Self::compile_log(log)?);
        }
        for ta in &spec.timestamp_authorities {
            certificate_chain_from_pem(&ta.cert_chain)?;
            compiled.timestamp_authorities.push(CertificateAuthority {
                subject: ta.subject.clone(),
                uri: ta.uri.clone(),
                cert_chain: ta.cert_chain.clone(),
            });
        }
        Ok(compiled)
    }

    fn compile_log(
        log: &crate::api::TransparencyLogSpec,
    ) -> Result<TransparencyLogInstance, TrustError> {
        let key = public_key_from_pem(&log.public_key)?;
        Ok(TransparencyLogInstance {
            base_url: log.base_url.clone(),
            hash_algorithm: log.hash_algorithm.clone(),
            public_key: log.public_key.clone(),
            log_id: log_id(&key.der),
        })
    }

    /// Every Fulcio root and intermediate of every CA, as PEM text.
    pub fn fulcio_cert_pems(&self) -> Vec<String> {
        self.certificate_authorities
            .iter()
            .map(|ca| ca.cert_chain.clone())
            .collect()
    }

    pub fn rekor_key_pems(&self) -> Vec<String> {
        self.t_logs.iter().map(|l| l.public_key.clone()).collect()
    }

    pub fn ctlog_key_pems(&self) -> Vec<String> {
        self.ct_logs.iter().map(|l| l.public_key.clone()).collect()
    }

    pub fn tsa_cert_pems(&self) -> Vec<String> {
        self.timestamp_authorities
            .iter()
            .map(|ta| ta.cert_chain.clone())
            .collect()
    }
}

/// `trusted_root.json` as shipped by TUF repositories: the protobuf-JSON
/// rendering of the Sigstore TrustedRoot message. Only the fields the
/// compiler consumes are modeled.
pub mod trusted_root {
    use super::*;

    #[derive(Deserialize, Debug, Clone, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct TrustedRoot {
        #[serde(default)]
        pub certificate_authorities: Vec<CertificateAuthorityMsg>,
        #[serde(default)]
        pub tlogs: Vec<TransparencyLogMsg>,
        #[serde(default)]
        pub ctlogs: Vec<TransparencyLogMsg>,
        #[serde(default)]
        pub timestamp_authorities: Vec<CertificateAuthorityMsg>,
    }

    #[derive(Deserialize, Debug, Clone, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct CertificateAuthorityMsg {
        #[serde(default)]
        pub subject: Option<SubjectMsg>,
        #[serde(default)]
        pub uri: String,
        #[serde(default)]
        pub cert_chain: Option<CertChainMsg>,
    }

    #[derive(Deserialize, Debug, Clone, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct SubjectMsg {
        #[serde(default)]
        pub organization: String,
        #[serde(default)]
        pub common_name: String,
    }

    #[derive(Deserialize, Debug, Clone, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct CertChainMsg {
        #[serde(default)]
        pub certificates: Vec<CertificateMsg>,
    }

    #[derive(Deserialize, Debug, Clone, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct CertificateMsg {
        /// base64 DER
        pub raw_bytes: String,
    }

    #[derive(Deserialize, Debug, Clone, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct TransparencyLogMsg {
        #[serde(default)]
        pub base_url: String,
        #[serde(default)]
        pub hash_algorithm: String,
        #[serde(default)]
        pub public_key: Option<PublicKeyMsg>,
    }

    #[derive(Deserialize, Debug, Clone, Default)]
    #[serde(rename_all = "camelCase")]
    pub struct PublicKeyMsg {
        /// base64 DER SubjectPublicKeyInfo
        pub raw_bytes: String,
    }
}

/// Decodes a `trusted_root.json` body into the compiled form. Log IDs are
/// always re-derived from the key material rather than trusted from the
/// file.
pub fn sigstore_keys_from_trusted_root(body: &[u8]) -> Result<SigstoreKeys, TrustError> {
    let root: trusted_root::TrustedRoot =
        serde_json::from_slice(body).map_err(|e| TrustError::Spki(e.to_string()))?;
    if root.certificate_authorities.is_empty() {
        return Err(TrustError::NoCertificateAuthorities);
    }

    let convert_ca = |ca: &trusted_root::CertificateAuthorityMsg| -> Result<CertificateAuthority, TrustError> {
        let mut chain = String::new();
        if let Some(cert_chain) = &ca.cert_chain {
            for cert in &cert_chain.certificates {
                let der = BASE64.decode(&cert.raw_bytes)?;
                chain.push_str(&pem::encode(&pem::Pem::new("CERTIFICATE", der)));
            }
        }
        Ok(CertificateAuthority {
            subject: ca.subject.as_ref().map(|s| DistinguishedName {
                organization: s.organization.clone(),
                common_name: s.common_name.clone(),
            }),
            uri: ca.uri.clone(),
            cert_chain: chain,
        })
    };

    let convert_log = |log: &trusted_root::TransparencyLogMsg| -> Result<TransparencyLogInstance, TrustError> {
        let der = match &log.public_key {
            Some(key) => BASE64.decode(&key.raw_bytes)?,
            None => Vec::new(),
        };
        Ok(TransparencyLogInstance {
            base_url: log.base_url.clone(),
            hash_algorithm: log.hash_algorithm.clone(),
            public_key: pem::encode(&pem::Pem::new("PUBLIC KEY", der.clone())),
            log_id: log_id(&der),
        })
    };

    let mut compiled = SigstoreKeys::default();
    for ca in &root.certificate_authorities {
        compiled.certificate_authorities.push(convert_ca(ca)?);
    }
    for log in &root.tlogs {
        compiled.t_logs.push(convert_log(log)?);
    }
    for log in &root.ctlogs {
        compiled.ct_logs.push(convert_log(log)?);
    }
    for ta in &root.timestamp_authorities {
        compiled.timestamp_authorities.push(convert_ca(ta)?);
    }
    Ok(compiled)
}
