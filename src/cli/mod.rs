//! CLI module for nats-operator
//!
//! Subcommands:
//! - `nats-operator run` - Manage clusters from NatsCluster manifests
//! - `nats-operator render` - Print the topology a manifest would produce
//! - `nats-operator status` - Query a running operator's status API

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use crate::controller::{ActualStateSource, ControllerConfig};
use crate::logging::LogOptions;
use crate::orchestration::kube::DEFAULT_API_URL;
use crate::topology::ConfigFailurePolicy;

mod display;

pub use display::*;

/// Default port of the status API
pub const DEFAULT_STATUS_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(name = "nats-operator")]
#[command(about = "Drive NATS server clusters toward a declarative NatsCluster spec")]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the clusters described by one or more manifests
    Run(RunArgs),

    /// Print worker manifests and the shared config without contacting any API
    Render(RenderArgs),

    /// Show the clusters managed by a running operator
    Status(StatusArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// NatsCluster manifest files (YAML or JSON)
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Kubernetes API server URL (e.g. a `kubectl proxy` endpoint)
    #[arg(long, env = "NATS_OPERATOR_API_URL", default_value = DEFAULT_API_URL)]
    pub api_url: String,

    /// Use the in-process orchestration backend instead of Kubernetes
    #[arg(long)]
    pub local: bool,

    /// Seconds between reconciliation passes
    #[arg(long, env = "NATS_OPERATOR_INTERVAL", default_value = "5")]
    pub interval_secs: u64,

    /// Timeout for each orchestration API call in seconds
    #[arg(long, default_value = "30")]
    pub api_timeout_secs: u64,

    /// Seconds a new worker may be missing from listings before it is replaced
    #[arg(long, default_value = "30")]
    pub visibility_grace_secs: u64,

    /// Trust the in-memory registry instead of listing workers every pass
    #[arg(long)]
    pub registry_state: bool,

    /// Bind address for the status API
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port for the status API
    #[arg(short, long, value_name = "PORT", default_value_t = DEFAULT_STATUS_PORT)]
    pub port: u16,

    /// Emit controller debug records
    #[arg(long)]
    pub debug: bool,

    /// Emit controller trace records (every API request)
    #[arg(long)]
    pub trace: bool,

    /// Abort bootstrap when the shared config cannot be created
    #[arg(long)]
    pub fail_fast_config: bool,
}

impl RunArgs {
    /// Controller settings derived from the flags
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig::default()
            .with_reconcile_interval(Duration::from_secs(self.interval_secs))
            .with_api_timeout(Duration::from_secs(self.api_timeout_secs))
            .with_visibility_grace(Duration::from_secs(self.visibility_grace_secs))
            .with_actual_state(if self.registry_state {
                ActualStateSource::Registry
            } else {
                ActualStateSource::Live
            })
            .with_config_failure_policy(if self.fail_fast_config {
                ConfigFailurePolicy::FailFast
            } else {
                ConfigFailurePolicy::Degrade
            })
            .with_log_options(LogOptions {
                debug: self.debug,
                trace: self.trace,
            })
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn status_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Arguments for the render command
#[derive(Parser, Debug)]
pub struct RenderArgs {
    /// NatsCluster manifest file
    pub file: PathBuf,
}

/// Arguments for the status command
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Base URL of the operator's status API
    #[arg(long, env = "NATS_OPERATOR_URL", default_value = "http://127.0.0.1:8080")]
    pub url: String,

    /// Print raw JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_defaults() {
        let cli = Cli::parse_from(["nats-operator", "run", "cluster.yaml"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };

        assert_eq!(args.files, vec![PathBuf::from("cluster.yaml")]);
        assert!(!args.local);
        assert_eq!(args.status_addr(), "0.0.0.0:8080");

        let config = args.controller_config();
        assert_eq!(config.reconcile_interval, Duration::from_secs(5));
        assert_eq!(config.actual_state, ActualStateSource::Live);
        assert_eq!(config.config_failure_policy, ConfigFailurePolicy::Degrade);
        assert!(!config.log.debug);
    }

    #[test]
    fn test_run_args_flags() {
        let cli = Cli::parse_from([
            "nats-operator",
            "-vv",
            "run",
            "a.yaml",
            "b.yaml",
            "--local",
            "--interval-secs",
            "1",
            "--registry-state",
            "--fail-fast-config",
            "--debug",
            "--trace",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };

        assert_eq!(args.files.len(), 2);
        assert!(args.local);
        let config = args.controller_config();
        assert_eq!(config.reconcile_interval, Duration::from_secs(1));
        assert_eq!(config.actual_state, ActualStateSource::Registry);
        assert_eq!(config.config_failure_policy, ConfigFailurePolicy::FailFast);
        assert!(config.log.debug && config.log.trace);
    }

    #[test]
    fn test_render_args() {
        let cli = Cli::parse_from(["nats-operator", "render", "cluster.yaml"]);
        assert!(matches!(cli.command, Commands::Render(ref a) if a.file == PathBuf::from("cluster.yaml")));
    }
}
