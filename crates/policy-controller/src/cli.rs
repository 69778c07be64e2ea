use clap::builder::PossibleValue;
use clap::{crate_authors, crate_description, crate_name, crate_version, Arg, ArgAction, Command};

pub(crate) fn build_cli() -> Command {
    Command::new(crate_name!())
        .author(crate_authors!(",\n"))
        .version(crate_version!())
        .about(crate_description!())
        .args(vec![
            Arg::new("log-level")
                .long("log-level")
                .value_name("LOG_LEVEL")
                .env("POLICY_CONTROLLER_LOG_LEVEL")
                .default_value("info")
                .value_parser([
                    PossibleValue::new("trace"),
                    PossibleValue::new("debug"),
                    PossibleValue::new("info"),
                    PossibleValue::new("warn"),
                    PossibleValue::new("error"),
                ])
                .help("Log level"),
            Arg::new("log-fmt")
                .long("log-fmt")
                .value_name("LOG_FMT")
                .env("POLICY_CONTROLLER_LOG_FMT")
                .default_value("text")
                .value_parser([PossibleValue::new("text"), PossibleValue::new("json")])
                .help("Log output format"),
            Arg::new("namespace")
                .long("namespace")
                .value_name("NAMESPACE")
                .env("POLICY_CONTROLLER_NAMESPACE")
                .default_value("cosign-system")
                .help("Namespace holding the published ConfigMaps and referenced Secrets"),
            Arg::new("image-policies-configmap")
                .long("image-policies-configmap")
                .value_name("CONFIGMAP")
                .env("POLICY_CONTROLLER_IMAGE_POLICIES_CONFIGMAP")
                .default_value(policy_compiler::IMAGE_POLICIES_CONFIGMAP)
                .help("ConfigMap receiving the compiled image policies"),
            Arg::new("sigstore-keys-configmap")
                .long("sigstore-keys-configmap")
                .value_name("CONFIGMAP")
                .env("POLICY_CONTROLLER_SIGSTORE_KEYS_CONFIGMAP")
                .default_value(policy_compiler::SIGSTORE_KEYS_CONFIGMAP)
                .help("ConfigMap receiving the compiled trust roots"),
            Arg::new("resync-period-seconds")
                .long("resync-period-seconds")
                .value_name("SECONDS")
                .env("POLICY_CONTROLLER_RESYNC_PERIOD")
                .default_value("600")
                .help("Periodic requeue interval for reconciled resources"),
            Arg::new("no-match-policy")
                .long("no-match-policy")
                .value_name("POLICY")
                .env("POLICY_CONTROLLER_NO_MATCH_POLICY")
                .default_value("deny")
                .value_parser([
                    PossibleValue::new("allow"),
                    PossibleValue::new("warn"),
                    PossibleValue::new("deny"),
                ])
                .help("What to do with images no policy matches"),
            Arg::new("fail-on-empty-authorities")
                .long("fail-on-empty-authorities")
                .env("POLICY_CONTROLLER_FAIL_ON_EMPTY_AUTHORITIES")
                .action(ArgAction::SetTrue)
                .help("Treat policies with an empty authority list as failing"),
            Arg::new("enable-referrers")
                .long("enable-referrers")
                .env("POLICY_CONTROLLER_ENABLE_REFERRERS")
                .action(ArgAction::SetTrue)
                .help("Also discover signatures through the OCI 1.1 referrers API"),
        ])
}
