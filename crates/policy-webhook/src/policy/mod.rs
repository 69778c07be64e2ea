mod cue;
mod rego;

use thiserror::Error;

use image_policy::api::PolicyType;

#[derive(Error, Debug, Clone)]
pub enum PolicyEvalError {
    #[error("failed to compile the cue policy with error: {0}")]
    CueCompile(String),
    #[error("failed to evaluate the cue policy with error: {0}")]
    CueEval(String),
    #[error("failed to compile the rego policy with error: {0}")]
    RegoCompile(String),
    #[error("failed to evaluate the rego policy with error: {0}")]
    RegoEval(String),
}

/// Evaluates a CIP-level or attestation-level declarative policy over a
/// JSON document. `Ok(())` means the document satisfies the policy.
pub fn evaluate(
    policy_type: PolicyType,
    data: &str,
    input: &serde_json::Value,
) -> Result<(), PolicyEvalError> {
    match policy_type {
        PolicyType::Cue => cue::evaluate(data, input),
        PolicyType::Rego => rego::evaluate(data, input),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dispatches_to_cue() {
        let input = json!({"authorityMatches": {"authority-0": {"static": true}}});
        evaluate(
            PolicyType::Cue,
            "{ authorityMatches: { \"authority-0\": { static: true } } }",
            &input,
        )
        .unwrap();
    }

    #[test]
    fn malformed_cue_reports_the_compile_error() {
        let err = evaluate(PolicyType::Cue, "{\"wontgo", &json!({})).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to compile the cue policy with error: string literal not terminated"
        );
    }
}
