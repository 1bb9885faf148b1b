//! Configuration module for Navarch
//!
//! Handles loading and validating configuration from YAML files and environment variables.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Prometheus metrics export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics HTTP endpoint is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// Path for the metrics endpoint.
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

/// Node identity and addressing reported at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default)]
    pub provider: String,

    #[serde(default)]
    pub region: String,

    #[serde(default)]
    pub zone: String,

    #[serde(default)]
    pub instance_type: String,

    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub internal_ip: String,

    #[serde(default)]
    pub external_ip: String,

    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            provider: String::new(),
            region: String::new(),
            zone: String::new(),
            instance_type: String::new(),
            hostname: None,
            internal_ip: String::new(),
            external_ip: String::new(),
            labels: HashMap::new(),
        }
    }
}

/// Interval defaults for the three agent loops; the control plane may
/// override these at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    pub heartbeat: Duration,

    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    pub health_check: Duration,

    #[serde(with = "humantime_serde", default = "default_command_poll_interval")]
    pub command_poll: Duration,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            heartbeat: default_heartbeat_interval(),
            health_check: default_health_check_interval(),
            command_poll: default_command_poll_interval(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address of the control plane the node registers and reports to.
    #[serde(default)]
    pub control_plane_address: String,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub intervals: IntervalConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Dry run mode: build and validate, but don't start the agent loops.
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_plane_address: String::new(),
            node: NodeConfig::default(),
            intervals: IntervalConfig::default(),
            metrics: MetricsConfig::default(),
            dry_run: false,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.as_deref().unwrap_or("").is_empty() {
            anyhow::bail!("node.node_id must be specified via config, --node-id, or NODE_ID env");
        }
        if self.control_plane_address.is_empty() {
            anyhow::bail!("control_plane_address must be set");
        }
        if self.intervals.heartbeat.is_zero() {
            anyhow::bail!("intervals.heartbeat must be > 0");
        }
        if self.intervals.health_check.is_zero() {
            anyhow::bail!("intervals.health_check must be > 0");
        }
        if self.intervals.command_poll.is_zero() {
            anyhow::bail!("intervals.command_poll must be > 0");
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        Ok(())
    }

    /// Override node_id from the environment if not already set.
    pub fn with_node_id_from_env(mut self) -> Self {
        if self.node.node_id.is_none() {
            self.node.node_id = std::env::var("NODE_ID").ok();
        }
        self
    }

    /// Fall back to the OS hostname if none was configured.
    pub fn with_hostname_fallback(mut self) -> Self {
        if self.node.hostname.is_none() {
            self.node.hostname = std::env::var("HOSTNAME").ok();
        }
        self
    }
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_true() -> bool {
    true
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_command_poll_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_fails_validation_without_node_id() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
control_plane_address: "http://control-plane:8080"

node:
  node_id: node-0
  provider: aws
  region: us-east-1
  zone: us-east-1a
  instance_type: p4d.24xlarge

intervals:
  heartbeat: 30s
  health_check: 1m

metrics:
  enabled: true
  port: 9100
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.node.node_id.as_deref(), Some("node-0"));
        assert_eq!(config.intervals.heartbeat, Duration::from_secs(30));
        assert_eq!(config.intervals.health_check, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_id_from_env() {
        std::env::set_var("NODE_ID", "node-from-env");
        let config = Config::default().with_node_id_from_env();
        assert_eq!(config.node.node_id.as_deref(), Some("node-from-env"));
        std::env::remove_var("NODE_ID");
    }
}
