mod cluster_image_policy;
mod trust_root;

pub use cluster_image_policy::*;
pub use trust_root::*;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const API_GROUP: &str = "policy.sigstore.dev";

/// Status condition attached to the policy CRDs by the reconcilers.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn ok(r#type: &str) -> Condition {
        Condition {
            r#type: r#type.to_string(),
            status: "True".to_string(),
            reason: None,
            message: None,
            last_transition_time: None,
        }
    }

    pub fn failed(r#type: &str, reason: &str, message: &str) -> Condition {
        Condition {
            r#type: r#type.to_string(),
            status: "False".to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            last_transition_time: None,
        }
    }
}
