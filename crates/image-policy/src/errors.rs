use thiserror::Error;

/// Rejection raised while validating an authored ClusterImagePolicy or
/// TrustRoot. The messages mirror the ones emitted by the CRD admission
/// webhook, so they always carry the offending field path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing field(s): {field}")]
    MissingField { field: String },

    #[error("expected exactly one, got neither: {fields}")]
    MissingOneOf { fields: String },

    #[error("expected exactly one, got both: {fields}")]
    MultipleOneOf { fields: String },

    #[error("invalid value: {value}: {field}")]
    InvalidValue { field: String, value: String },

    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ValidationError {
    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::MissingField {
            field: field.into(),
        }
    }

    pub fn one_of_neither(fields: &[&str]) -> Self {
        ValidationError::MissingOneOf {
            fields: fields.join(", "),
        }
    }

    pub fn one_of_both(fields: &[&str]) -> Self {
        ValidationError::MultipleOneOf {
            fields: fields.join(", "),
        }
    }

    pub fn invalid_value(value: impl Into<String>, field: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
