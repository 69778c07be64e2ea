use thiserror::Error;

use image_policy::api::Mode;

/// Outcome of one authority that did not produce a match. Authority errors
/// are masked when a sibling authority of the same policy succeeds; they
/// only surface once a policy fails in its entirety.
#[derive(Error, Debug, Clone)]
pub enum AuthorityError {
    #[error("disallowed by static policy")]
    StaticPolicy,

    #[error("signature key validation failed for authority {authority} for {image}: {cause}")]
    Key {
        authority: String,
        image: String,
        cause: String,
    },

    #[error("signature keyless validation failed for authority {authority} for {image}: {cause}")]
    Keyless {
        authority: String,
        image: String,
        cause: String,
    },

    #[error("attestation validation failed for authority {authority} for {image}: {cause}")]
    Attestation {
        authority: String,
        image: String,
        cause: String,
    },

    #[error("no matching attestations")]
    NoMatchingAttestations,

    #[error("failed to process ClusterImagePolicy: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// No authority of the policy produced a valid result.
    Verification,
    /// The CIP-level declarative policy rejected the aggregated result.
    Policy,
    /// The admission context was canceled or the pipeline misbehaved.
    Internal,
}

/// A policy that could not be satisfied for one image. The owning policy's
/// `mode` travels with the failure so the admission decider can classify it
/// as warning or error without a second lookup.
#[derive(Debug, Clone)]
pub struct PolicyFailure {
    pub policy: String,
    pub mode: Mode,
    pub kind: FailureKind,
    pub message: String,
}

impl PolicyFailure {
    pub fn verification(policy: &str, mode: Mode, message: String) -> PolicyFailure {
        PolicyFailure {
            policy: policy.to_string(),
            mode,
            kind: FailureKind::Verification,
            message,
        }
    }

    pub fn policy(policy: &str, mode: Mode, message: String) -> PolicyFailure {
        PolicyFailure {
            policy: policy.to_string(),
            mode,
            kind: FailureKind::Policy,
            message,
        }
    }

    pub fn internal(policy: &str, mode: Mode) -> PolicyFailure {
        PolicyFailure {
            policy: policy.to_string(),
            mode,
            kind: FailureKind::Internal,
            message: "context was canceled before validation completed".to_string(),
        }
    }
}
