//! CLI argument parsing for Navarch

use std::path::PathBuf;

use clap::Parser;

/// Navarch node agent - GPU compute-node health lifecycle engine
#[derive(Debug, Parser)]
#[command(name = "navarch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/navarch/config.yaml")]
    pub config: PathBuf,

    /// Node id (overrides config and NODE_ID env)
    #[arg(long, env = "NODE_ID")]
    pub node_id: Option<String>,

    /// Control-plane address (overrides config)
    #[arg(long)]
    pub control_plane_address: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "NAVARCH_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "NAVARCH_LOG_JSON")]
    pub log_json: bool,

    /// Dry run mode - build and validate, but don't start the agent loops
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Run a single registration + heartbeat + health-report + command-poll
    /// pass and exit
    #[arg(long)]
    pub once: bool,

    /// Enable debug endpoints
    #[arg(long, default_value = "false")]
    pub debug: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["navarch"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/etc/navarch/config.yaml");
        assert_eq!(cli.log_level, "info");
        assert!(!cli.log_json);
        assert!(!cli.dry_run);
        assert!(!cli.once);
    }

    #[test]
    fn test_cli_custom_config() {
        let cli = Cli::try_parse_from(["navarch", "-c", "/custom/config.yaml"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/custom/config.yaml");
    }

    #[test]
    fn test_cli_once() {
        let cli = Cli::try_parse_from(["navarch", "--once"]).unwrap();
        assert!(cli.once);
    }

    #[test]
    fn test_cli_control_plane_override() {
        let cli = Cli::try_parse_from(["navarch", "--control-plane-address", "http://cp:8080"]).unwrap();
        assert_eq!(cli.control_plane_address.as_deref(), Some("http://cp:8080"));
    }
}
