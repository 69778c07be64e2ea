//! Rego policy evaluation through `regorus`. Policies follow the OPA
//! convention used by image policies: the document is compliant when
//! `data.<package>.isCompliant` evaluates to true.

use lazy_static::lazy_static;
use regex::Regex;

use super::PolicyEvalError;

lazy_static! {
    static ref PACKAGE_RE: Regex =
        Regex::new(r"(?m)^\s*package\s+([a-zA-Z_][a-zA-Z0-9_.]*)").expect("static regex");
}

pub fn evaluate(source: &str, input: &serde_json::Value) -> Result<(), PolicyEvalError> {
    let package = PACKAGE_RE
        .captures(source)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            PolicyEvalError::RegoCompile("missing package declaration".to_string())
        })?;

    let mut engine = regorus::Engine::new();
    engine
        .add_policy("policy.rego".to_string(), source.to_string())
        .map_err(|e| PolicyEvalError::RegoCompile(e.to_string()))?;

    let parsed = regorus::Value::from_json_str(&input.to_string())
        .map_err(|e| PolicyEvalError::RegoEval(e.to_string()))?;
    engine.set_input(parsed);

    let query = format!("data.{package}.isCompliant");
    let compliant = engine
        .eval_bool_query(query.clone(), false)
        .map_err(|e| PolicyEvalError::RegoEval(e.to_string()))?;
    if compliant {
        Ok(())
    } else {
        Err(PolicyEvalError::RegoEval(format!(
            "policy is not compliant for query '{query}'"
        )))
    }
}
