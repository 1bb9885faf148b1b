//! Navarch node agent
//!
//! GPU compute-node health lifecycle engine: collects device health,
//! reports it to a control plane, and carries out the lifecycle commands
//! the control plane issues in response (cordon / drain / terminate /
//! diagnostic).

mod cli;
mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use config::Config;
use navarch_core::clock::SystemClock;
use navarch_core::device::{create_gpu_backend, BackendConfig};
use navarch_core::dispatcher::{DrainCallback, ShutdownCallback};
use navarch_core::metrics_collector::ProcSystemMetricsReader;
use navarch_core::rpc::HttpRpcClient;
use navarch_core::{NodeAgent, NodeAgentConfig};

/// Initialize the tracing/logging subsystem.
fn init_logging(log_level: &str, json_format: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    if json_format {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
    }
}

/// Drain callback that logs and succeeds. The eviction/cordon side-effects
/// a real fleet controller would perform are out of scope here; the hook
/// exists so a deployment can swap in its own `DrainCallback`.
struct LoggingDrainCallback;

#[async_trait]
impl DrainCallback for LoggingDrainCallback {
    async fn drain(&self, timeout: std::time::Duration, force: bool) -> Result<(), String> {
        info!(?timeout, force, "drain requested");
        Ok(())
    }
}

struct LoggingShutdownCallback;

#[async_trait]
impl ShutdownCallback for LoggingShutdownCallback {
    async fn shutdown(&self, force: bool) -> Result<(), String> {
        info!(force, "shutdown requested");
        Ok(())
    }
}

fn build_agent_config(config: &Config) -> Result<NodeAgentConfig> {
    let node_id = config.node.node_id.clone().context("node_id must be set")?;
    Ok(NodeAgentConfig {
        node_id,
        control_plane_address: config.control_plane_address.clone(),
        provider: config.node.provider.clone(),
        region: config.node.region.clone(),
        zone: config.node.zone.clone(),
        instance_type: config.node.instance_type.clone(),
        hostname: config.node.hostname.clone().unwrap_or_default(),
        internal_ip: config.node.internal_ip.clone(),
        external_ip: config.node.external_ip.clone(),
        labels: config.node.labels.clone(),
        heartbeat_interval: config.intervals.heartbeat,
        health_check_interval: config.intervals.health_check,
        command_poll_interval: config.intervals.command_poll,
    })
}

async fn build_agent(config: &Config) -> Result<NodeAgent> {
    let backend_config = BackendConfig::from_env();
    let clock = Arc::new(SystemClock);
    let backend = create_gpu_backend(&backend_config, clock.clone()).context("Failed to construct GPU backend")?;
    let rpc = Arc::new(HttpRpcClient::new(config.control_plane_address.clone()));
    let system = Arc::new(ProcSystemMetricsReader);

    let agent_config = build_agent_config(config)?;
    let agent = NodeAgent::new(agent_config, backend, rpc, clock, system).context("Failed to construct node agent")?;

    agent.dispatcher().set_drain_callback(Arc::new(LoggingDrainCallback)).await;
    agent.dispatcher().set_shutdown_callback(Arc::new(LoggingShutdownCallback)).await;

    Ok(agent)
}

/// Start the Prometheus metrics HTTP server.
async fn start_metrics_server(port: u16) -> Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = port, "Metrics server listening");

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            let _ = socket.read(&mut buf).await;

            let metrics_output = prometheus::TextEncoder::new().encode_to_string(&prometheus::gather()).unwrap_or_default();

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                metrics_output.len(),
                metrics_output
            );

            let _ = socket.write_all(response.as_bytes()).await;
        });
    }
}

/// Run the full agent: register, then loop until the shutdown signal fires.
async fn run(config: Config) -> Result<()> {
    let agent = build_agent(&config).await?;

    if config.metrics.enabled {
        let port = config.metrics.port;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(port).await {
                error!(error = %e, "Metrics server failed");
            }
        });
    }

    let shutdown_signal = agent.dispatcher().shutdown_signal();
    tokio::spawn(async move {
        let ctrl_c = async {
            signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("Failed to install SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating shutdown"),
            _ = terminate => info!("Received SIGTERM, initiating shutdown"),
        }

        shutdown_signal.cancel();
    });

    agent.run().await.context("Node agent runtime failed")?;
    info!("Navarch shutdown complete");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(&cli.log_level, cli.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Navarch starting");

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config).with_context(|| format!("Failed to load config from {:?}", cli.config))?
    } else {
        warn!(path = ?cli.config, "Config file not found, using defaults");
        Config::default()
    };

    if cli.dry_run {
        config.dry_run = true;
    }
    if cli.node_id.is_some() {
        config.node.node_id = cli.node_id;
    }
    if cli.control_plane_address.is_some() {
        config.control_plane_address = cli.control_plane_address.unwrap();
    }

    config = config.with_node_id_from_env().with_hostname_fallback();

    config.validate().context("Invalid configuration")?;

    info!(dry_run = config.dry_run, "Configuration loaded");

    if config.dry_run {
        info!("Dry run mode: configuration validated, exiting without starting agent loops");
        return Ok(());
    }

    if cli.once {
        info!("Running single agent pass (--once mode)");
        let agent = build_agent(&config).await?;
        agent.run_once().await.context("Single agent pass failed")?;
        return Ok(());
    }

    run(config).await
}
