use async_trait::async_trait;
use thiserror::Error;

use image_policy::api::HashAlgorithm;

#[derive(Error, Debug)]
#[error("{0}")]
pub struct KmsError(pub String);

/// Fetches the PEM public key behind a `kms` authority reference. Key
/// custody stays with the provider; the compiler only ever sees public
/// material.
#[async_trait]
pub trait KmsKeyProvider: Send + Sync {
    async fn public_key(
        &self,
        reference: &str,
        hash_algorithm: HashAlgorithm,
    ) -> Result<String, KmsError>;
}

/// Deployment without KMS access. Policies referencing KMS keys fail to
/// compile with an actionable message instead of silently admitting.
pub struct DisabledKmsProvider;

#[async_trait]
impl KmsKeyProvider for DisabledKmsProvider {
    async fn public_key(
        &self,
        reference: &str,
        _hash_algorithm: HashAlgorithm,
    ) -> Result<String, KmsError> {
        Err(KmsError(format!(
            "no KMS provider is configured for {reference}"
        )))
    }
}
