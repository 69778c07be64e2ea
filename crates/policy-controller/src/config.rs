use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::ArgMatches;

use policy_webhook::admission::NoMatchPolicy;

pub(crate) struct Config {
    pub namespace: String,
    pub image_policies_configmap: String,
    pub sigstore_keys_configmap: String,
    pub resync: Duration,
    pub no_match_policy: NoMatchPolicy,
    pub fail_on_empty_authorities: bool,
    pub enable_referrers: bool,
    pub log_level: String,
    pub log_fmt: String,
}

impl Config {
    pub fn from_args(matches: &ArgMatches) -> Result<Config> {
        let resync_seconds = matches
            .get_one::<String>("resync-period-seconds")
            .expect("clap provides a default")
            .parse::<u64>()
            .map_err(|e| anyhow!("cannot parse resync-period-seconds: {e}"))?;

        let no_match_policy = match matches
            .get_one::<String>("no-match-policy")
            .expect("clap provides a default")
            .as_str()
        {
            "allow" => NoMatchPolicy::Allow,
            "warn" => NoMatchPolicy::Warn,
            _ => NoMatchPolicy::Deny,
        };

        Ok(Config {
            namespace: matches
                .get_one::<String>("namespace")
                .expect("clap provides a default")
                .clone(),
            image_policies_configmap: matches
                .get_one::<String>("image-policies-configmap")
                .expect("clap provides a default")
                .clone(),
            sigstore_keys_configmap: matches
                .get_one::<String>("sigstore-keys-configmap")
                .expect("clap provides a default")
                .clone(),
            resync: Duration::from_secs(resync_seconds),
            no_match_policy,
            fail_on_empty_authorities: matches.get_flag("fail-on-empty-authorities"),
            enable_referrers: matches.get_flag("enable-referrers"),
            log_level: matches
                .get_one::<String>("log-level")
                .expect("clap provides a default")
                .clone(),
            log_fmt: matches
                .get_one::<String>("log-fmt")
                .expect("clap provides a default")
                .clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::build_cli;

    #[test]
    fn parses_the_full_flag_set() {
        let matches = build_cli().get_matches_from(vec![
            "policy-controller",
            "--namespace",
            "sigstore-system",
            "--resync-period-seconds",
            "120",
            "--no-match-policy",
            "warn",
            "--fail-on-empty-authorities",
        ]);
        let config = Config::from_args(&matches).unwrap();
        assert_eq!(config.namespace, "sigstore-system");
        assert_eq!(config.resync, Duration::from_secs(120));
        assert_eq!(config.no_match_policy, NoMatchPolicy::Warn);
        assert!(config.fail_on_empty_authorities);
        assert!(!config.enable_referrers);
    }

    #[test]
    fn bad_resync_period_is_an_error() {
        let matches = build_cli().get_matches_from(vec![
            "policy-controller",
            "--resync-period-seconds",
            "soon",
        ]);
        assert!(Config::from_args(&matches).is_err());
    }
}
