use thiserror::Error;

/// Everything that can go wrong while compiling a CR into its ConfigMap
/// entry. Compile errors surface on the CR's status conditions and requeue
/// the resource; they are never shown to admitting clients.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Validation(#[from] image_policy::ValidationError),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("secret {name} has no data")]
    EmptySecret { name: String },

    #[error("secret {name} has multiple data entries, expected exactly one")]
    AmbiguousSecret { name: String },

    #[error("secret {name} does not hold a valid public key: {reason}")]
    InvalidSecretKey { name: String, reason: String },

    #[error("configmap {name} has no value for key {key}")]
    MissingConfigMapKey { name: String, key: String },

    #[error("failed to fetch policy from {url}: {reason}")]
    RemoteFetch { url: String, reason: String },

    #[error("failed to check sha256sum from policy remote {url}: expected {expected}, computed {computed}")]
    ShaMismatch {
        url: String,
        expected: String,
        computed: String,
    },

    #[error("kms {reference}: {reason}")]
    Kms { reference: String, reason: String },

    #[error("tuf: {0}")]
    Tuf(String),

    #[error("trusted material has no certificate authorities")]
    NoCertificateAuthorities,

    #[error(transparent)]
    Compile(#[from] image_policy::compiled::CompileError),

    #[error(transparent)]
    Trust(#[from] image_policy::trust::TrustError),

    #[error("cannot serialize entry: {0}")]
    Serialize(#[from] serde_json::Error),
}
