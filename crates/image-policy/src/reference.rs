use std::fmt;
use thiserror::Error;

const DEFAULT_REGISTRY: &str = "index.docker.io";
const DEFAULT_NAMESPACE: &str = "library";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("could not parse reference: {0}")]
    Malformed(String),
    #[error("invalid digest {digest} in reference {reference}")]
    BadDigest { reference: String, digest: String },
}

/// A parsed OCI image reference. Admission only ever operates on the
/// canonical registry+repository+digest form; tag references have to be
/// resolved by the mutating resolver before validation sees them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(name: &str) -> Result<ImageReference, ReferenceError> {
        if name.is_empty() {
            return Err(ReferenceError::Malformed(name.to_string()));
        }

        let (remainder, digest) = match name.split_once('@') {
            Some((rest, digest)) => {
                if !is_valid_digest(digest) {
                    return Err(ReferenceError::BadDigest {
                        reference: name.to_string(),
                        digest: digest.to_string(),
                    });
                }
                (rest, Some(digest.to_string()))
            }
            None => (name, None),
        };

        // A colon after the last slash separates the tag; earlier colons
        // belong to the registry host:port.
        let (remainder, tag) = match remainder.rsplit_once(':') {
            Some((rest, tag)) if !tag.contains('/') => (rest, Some(tag.to_string())),
            _ => (remainder, None),
        };

        let (registry, repository) = match remainder.split_once('/') {
            Some((host, rest))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (host.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), remainder.to_string()),
            None => (
                DEFAULT_REGISTRY.to_string(),
                format!("{DEFAULT_NAMESPACE}/{remainder}"),
            ),
        };

        if repository.is_empty() {
            return Err(ReferenceError::Malformed(name.to_string()));
        }

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// The digest hex, without the algorithm prefix.
    pub fn digest_hex(&self) -> Option<&str> {
        self.digest.as_deref().and_then(|d| d.split_once(':')).map(|(_, hex)| hex)
    }

    pub fn digest_algorithm(&self) -> Option<&str> {
        self.digest.as_deref().and_then(|d| d.split_once(':')).map(|(algo, _)| algo)
    }

    /// The default cosign tag holding signatures for this digest, e.g.
    /// `sha256-<hex>.sig`.
    pub fn signature_tag(&self) -> Option<String> {
        self.digest
            .as_deref()
            .map(|d| format!("{}.sig", d.replace(':', "-")))
    }

    /// The default cosign tag holding attestations for this digest.
    pub fn attestation_tag(&self) -> Option<String> {
        self.digest
            .as_deref()
            .map(|d| format!("{}.att", d.replace(':', "-")))
    }

    /// The same digest pinned onto a different repository, used when an
    /// authority declares an alternative signature source.
    pub fn with_repository(&self, oci: &str) -> Result<ImageReference, ReferenceError> {
        let mut re = ImageReference::parse(oci)?;
        re.tag = None;
        re.digest = self.digest.clone();
        Ok(re)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn is_valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algo, hex)) => {
            !algo.is_empty()
                && !hex.is_empty()
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}
