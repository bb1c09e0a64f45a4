//! Command line and environment configuration

use std::time::Duration;

use clap::Parser;

use caph_controller::hcloud::DEFAULT_ENDPOINT;

/// Hetzner Cluster API infrastructure provider
#[derive(Parser, Debug)]
#[command(name = "caph-controller", version, about, long_about = None)]
pub struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Install or update the CRDs on startup
    #[arg(long, env = "INSTALL_CRDS")]
    pub install_crds: bool,

    /// Only watch objects in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub namespace: Option<String>,

    /// Seconds to stay away from the cloud API after a rate-limit response
    #[arg(long, env = "RATE_LIMIT_WAIT_SECS", default_value_t = 300)]
    pub rate_limit_wait_secs: u64,

    /// Base URL of the hcloud API
    #[arg(long, env = "HCLOUD_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub hcloud_endpoint: String,

    /// Log JSON lines instead of text
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

/// Settings the controllers run with
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Watched namespace, all namespaces when None
    pub namespace: Option<String>,
    /// Backoff after rate-limited cloud calls
    pub rate_limit_wait: Duration,
    /// Base URL of the hcloud API
    pub hcloud_endpoint: String,
}

impl From<&Cli> for OperatorConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            namespace: cli.namespace.clone().filter(|ns| !ns.is_empty()),
            rate_limit_wait: Duration::from_secs(cli.rate_limit_wait_secs),
            hcloud_endpoint: cli.hcloud_endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_watch_everything_with_five_minute_backoff() {
        let cli = Cli::parse_from(["caph-controller"]);
        let config = OperatorConfig::from(&cli);
        assert_eq!(config.namespace, None);
        assert_eq!(config.rate_limit_wait, Duration::from_secs(300));
        assert_eq!(config.hcloud_endpoint, DEFAULT_ENDPOINT.trim_end_matches('/'));
        assert!(!cli.crd);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "caph-controller",
            "--namespace",
            "capi-system",
            "--rate-limit-wait-secs",
            "60",
            "--hcloud-endpoint",
            "http://localhost:8080/v1/",
            "--log-json",
        ]);
        let config = OperatorConfig::from(&cli);
        assert_eq!(config.namespace.as_deref(), Some("capi-system"));
        assert_eq!(config.rate_limit_wait, Duration::from_secs(60));
        assert_eq!(config.hcloud_endpoint, "http://localhost:8080/v1");
        assert!(cli.log_json);
    }

    #[test]
    fn empty_namespace_means_all_namespaces() {
        let cli = Cli::parse_from(["caph-controller", "--namespace", ""]);
        assert_eq!(OperatorConfig::from(&cli).namespace, None);
    }
}
