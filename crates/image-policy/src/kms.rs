use lazy_static::lazy_static;
use regex::Regex;

use crate::ValidationError;

pub const AWS_PREFIX: &str = "awskms://";
pub const GCP_PREFIX: &str = "gcpkms://";
pub const AZURE_PREFIX: &str = "azurekms://";
pub const VAULT_PREFIX: &str = "hashivault://";

const PREFIXES: &[&str] = &[AWS_PREFIX, GCP_PREFIX, AZURE_PREFIX, VAULT_PREFIX];

const UUID: &str = "[a-fA-F0-9]{8}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{4}-[a-fA-F0-9]{12}";
const HOST_PORT: &str = r"([^/]*)";

lazy_static! {
    // The accepted AWS reference shapes: bare key id, key ARN, alias and
    // alias ARN, optionally preceded by a host:port endpoint override.
    static ref AWS_KEY_ID: Regex =
        Regex::new(&format!("^awskms://{HOST_PORT}/({UUID})$")).unwrap();
    static ref AWS_KEY_ARN: Regex = Regex::new(&format!(
        r"^awskms://{HOST_PORT}/(arn:(?:aws|aws-us-gov|aws-cn):kms:[a-z0-9-]+:\d{{12}}:key/{UUID})$"
    ))
    .unwrap();
    static ref AWS_ALIAS: Regex =
        Regex::new(&format!("^awskms://{HOST_PORT}/(alias/.*)$")).unwrap();
    static ref AWS_ALIAS_ARN: Regex = Regex::new(&format!(
        r"^awskms://{HOST_PORT}/(arn:(?:aws|aws-us-gov|aws-cn):kms:[a-z0-9-]+:\d{{12}}:alias/.*)$"
    ))
    .unwrap();
}

/// Returns true when the reference carries one of the supported KMS scheme
/// prefixes.
pub fn is_kms_reference(reference: &str) -> bool {
    PREFIXES.iter().any(|p| reference.starts_with(p))
}

/// Validates a `kms` authority reference. Every supported provider is
/// checked for its prefix; AWS references are additionally validated against
/// the full reference grammar.
pub fn validate_kms_reference(reference: &str, field: &str) -> Result<(), ValidationError> {
    if !is_kms_reference(reference) {
        return Err(ValidationError::invalid_value(reference, field));
    }
    if reference.starts_with(AWS_PREFIX) && !is_valid_aws_reference(reference) {
        return Err(ValidationError::invalid(
            field,
            format!("failed to parse aws kms reference {reference}"),
        ));
    }
    Ok(())
}

fn is_valid_aws_reference(reference: &str) -> bool {
    AWS_KEY_ID.is_match(reference)
        || AWS_KEY_ARN.is_match(reference)
        || AWS_ALIAS.is_match(reference)
        || AWS_ALIAS_ARN.is_match(reference)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("awskms:///1234abcd-12ab-34cd-56ef-1234567890ab", true)]
    #[case(
        "awskms://localhost:4566/1234abcd-12ab-34cd-56ef-1234567890ab",
        true
    )]
    #[case(
        "awskms:///arn:aws:kms:us-east-2:111122223333:key/1234abcd-12ab-34cd-56ef-1234567890ab",
        true
    )]
    #[case(
        "awskms://localhost:4566/arn:aws:kms:us-east-2:111122223333:key/1234abcd-12ab-34cd-56ef-1234567890ab",
        true
    )]
    #[case("awskms:///alias/ExampleAlias", true)]
    #[case(
        "awskms:///arn:aws:kms:us-east-2:111122223333:alias/ExampleAlias",
        true
    )]
    #[case("awskms:///not-a-uuid", false)]
    #[case("awskms:///arn:aws:kms:us-east-2:11112222:key/1234abcd-12ab-34cd-56ef-1234567890ab", false)]
    fn aws_reference_grammar(#[case] reference: &str, #[case] valid: bool) {
        assert_eq!(
            validate_kms_reference(reference, "spec.authorities[0].key.kms").is_ok(),
            valid,
            "{reference}"
        );
    }

    #[rstest]
    #[case("gcpkms://projects/p/locations/l/keyRings/r/cryptoKeys/k/cryptoKeyVersions/1")]
    #[case("azurekms://vault.vault.azure.net/key")]
    #[case("hashivault://transit-key")]
    fn non_aws_prefixes_only_require_the_scheme(#[case] reference: &str) {
        validate_kms_reference(reference, "spec.authorities[0].key.kms").unwrap();
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err =
            validate_kms_reference("kms://foo", "spec.authorities[0].key.kms").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid value: kms://foo: spec.authorities[0].key.kms"
        );
    }
}
