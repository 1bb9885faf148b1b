//! Node Agent runtime: registration plus the three concurrent
//! heartbeat/health-report/command-poll loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::device::{DeviceError, GpuBackend};
use crate::dispatcher::CommandDispatcher;
use crate::health_event::HealthEventWire;
use crate::metrics::MetricsRegistry;
use crate::metrics_collector::{MetricsCollector, SystemMetricsReader};
use crate::retry::{retry_with, RetryConfig, RetryError};
use crate::rpc::{
    AckStatus, AcknowledgeCommandRequest, CheckResult, CheckStatus, GetNodeCommandsRequest, NodeMetadata, RegisterNodeRequest,
    ReportHealthRequest, RpcClient, RpcError, SendHeartbeatRequest,
};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_COMMAND_POLL_INTERVAL: Duration = Duration::from_secs(10);
const HIGH_TEMPERATURE_THRESHOLD_CELSIUS: u32 = 85;

/// Static identity and addressing the agent registers with.
#[derive(Debug, Clone)]
pub struct NodeAgentConfig {
    pub node_id: String,
    pub control_plane_address: String,
    pub provider: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub hostname: String,
    pub internal_ip: String,
    pub external_ip: String,
    pub labels: HashMap<String, String>,
    pub heartbeat_interval: Duration,
    pub health_check_interval: Duration,
    pub command_poll_interval: Duration,
}

impl Default for NodeAgentConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            control_plane_address: String::new(),
            provider: String::new(),
            region: String::new(),
            zone: String::new(),
            instance_type: String::new(),
            hostname: String::new(),
            internal_ip: String::new(),
            external_ip: String::new(),
            labels: HashMap::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            command_poll_interval: DEFAULT_COMMAND_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("node_id must be set")]
    MissingNodeId,
    #[error("control_plane_address must be set")]
    MissingControlPlaneAddress,
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("registration failed: {0}")]
    Registration(String),
}

struct Intervals {
    heartbeat: Duration,
    health_check: Duration,
    command_poll: Duration,
}

/// Boots the GPU backend, registers with the control plane, and runs the
/// three long-lived loops until the shared shutdown signal fires.
pub struct NodeAgent {
    config: NodeAgentConfig,
    backend: Arc<dyn GpuBackend>,
    rpc: Arc<dyn RpcClient>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<CommandDispatcher>,
    metrics_collector: MetricsCollector,
    metrics_registry: Arc<MetricsRegistry>,
    intervals: RwLock<Intervals>,
}

impl NodeAgent {
    pub fn new(
        config: NodeAgentConfig,
        backend: Arc<dyn GpuBackend>,
        rpc: Arc<dyn RpcClient>,
        clock: Arc<dyn Clock>,
        system: Arc<dyn SystemMetricsReader>,
    ) -> Result<Self, AgentError> {
        if config.node_id.is_empty() {
            return Err(AgentError::MissingNodeId);
        }
        if config.control_plane_address.is_empty() {
            return Err(AgentError::MissingControlPlaneAddress);
        }

        let dispatcher = Arc::new(CommandDispatcher::new(backend.clone(), clock.clone()));
        let metrics_collector = MetricsCollector::new(system, backend.clone());
        let intervals = RwLock::new(Intervals {
            heartbeat: config.heartbeat_interval,
            health_check: config.health_check_interval,
            command_poll: config.command_poll_interval,
        });

        Ok(Self {
            config,
            backend,
            rpc,
            clock,
            dispatcher,
            metrics_collector,
            metrics_registry: Arc::new(MetricsRegistry::new()),
            intervals,
        })
    }

    /// Exposed so `main` can register drain/shutdown callbacks before
    /// calling `run`.
    pub fn dispatcher(&self) -> Arc<CommandDispatcher> {
        self.dispatcher.clone()
    }

    async fn register(&self) -> Result<(), AgentError> {
        let cancel = self.dispatcher.shutdown_signal();
        let devices = self.backend.device_count().await?;
        let mut gpus = Vec::with_capacity(devices as usize);
        for index in 0..devices {
            gpus.push(self.backend.device_info(index).await?);
        }

        let request = RegisterNodeRequest {
            node_id: self.config.node_id.clone(),
            provider: self.config.provider.clone(),
            region: self.config.region.clone(),
            zone: self.config.zone.clone(),
            instance_type: self.config.instance_type.clone(),
            gpus,
            metadata: NodeMetadata {
                hostname: self.config.hostname.clone(),
                internal_ip: self.config.internal_ip.clone(),
                external_ip: self.config.external_ip.clone(),
                labels: self.config.labels.clone(),
            },
        };

        let rpc = self.rpc.clone();
        let always_retryable = |_: &RpcError| true;
        let response = retry_with(&*self.clock, &cancel, &RetryConfig::network_profile(), always_retryable, || {
            let rpc = rpc.clone();
            let request = request.clone();
            async move { rpc.register_node(request).await }
        })
        .await
        .map_err(|e: RetryError<RpcError>| AgentError::Registration(format!("{e}")))?;

        if let Some(secs) = response.config.heartbeat_interval_seconds.filter(|s| *s > 0) {
            self.intervals.write().await.heartbeat = Duration::from_secs(secs);
        }
        if let Some(secs) = response.config.health_check_interval_seconds.filter(|s| *s > 0) {
            self.intervals.write().await.health_check = Duration::from_secs(secs);
        }

        info!(node_id = %self.config.node_id, message = %response.message, "registered with control plane");
        Ok(())
    }

    async fn send_heartbeat(&self) {
        let cancel = self.dispatcher.shutdown_signal();
        let metrics = self.metrics_collector.collect().await;
        let request = SendHeartbeatRequest {
            node_id: self.config.node_id.clone(),
            metrics,
        };
        let rpc = self.rpc.clone();
        let always_retryable = |_: &RpcError| true;
        let result = retry_with(&*self.clock, &cancel, &RetryConfig::heartbeat_profile(), always_retryable, || {
            let rpc = rpc.clone();
            let request = request.clone();
            async move { rpc.send_heartbeat(request).await }
        })
        .await;

        match result {
            Ok(_) => debug!("heartbeat sent"),
            Err(e) => {
                self.metrics_registry.inc_retry_exhausted("heartbeat");
                warn!(error = %e, "heartbeat failed after retries, continuing");
            }
        }
    }

    async fn local_checks(&self) -> Vec<CheckResult> {
        let mut results = Vec::with_capacity(3);

        match self.backend.device_count().await {
            Ok(count) if count > 0 => results.push(CheckResult {
                check_name: "boot".to_string(),
                status: CheckStatus::Healthy,
                message: format!("{count} device(s) present"),
            }),
            Ok(_) => results.push(CheckResult {
                check_name: "boot".to_string(),
                status: CheckStatus::Unhealthy,
                message: "no GPU devices present".to_string(),
            }),
            Err(e) => results.push(CheckResult {
                check_name: "boot".to_string(),
                status: CheckStatus::Unhealthy,
                message: format!("device count query failed: {e}"),
            }),
        }

        results.push(self.gpu_metrics_check().await);
        results
    }

    async fn gpu_metrics_check(&self) -> CheckResult {
        let count = match self.backend.device_count().await {
            Ok(count) => count,
            Err(e) => {
                return CheckResult {
                    check_name: "gpu_metrics".to_string(),
                    status: CheckStatus::Unhealthy,
                    message: format!("device count query failed: {e}"),
                }
            }
        };

        let mut hot_device = None;
        for index in 0..count {
            match self.backend.device_health(index).await {
                Ok(sample) if sample.temperature_celsius > HIGH_TEMPERATURE_THRESHOLD_CELSIUS => {
                    hot_device.get_or_insert(index);
                }
                Ok(_) => {}
                Err(e) => {
                    return CheckResult {
                        check_name: "gpu_metrics".to_string(),
                        status: CheckStatus::Unhealthy,
                        message: format!("device {index} health read failed: {e}"),
                    }
                }
            }
        }

        match hot_device {
            Some(index) => CheckResult {
                check_name: "gpu_metrics".to_string(),
                status: CheckStatus::Degraded,
                message: format!("device {index} above {HIGH_TEMPERATURE_THRESHOLD_CELSIUS}C"),
            },
            None => CheckResult {
                check_name: "gpu_metrics".to_string(),
                status: CheckStatus::Healthy,
                message: "all devices within thermal range".to_string(),
            },
        }
    }

    async fn send_health_report(&self) {
        let mut results = self.local_checks().await;

        let events: Vec<HealthEventWire> = match self.backend.collect_health_events().await {
            Ok(events) => events.iter().map(HealthEventWire::from).collect(),
            Err(e) => {
                results.push(CheckResult {
                    check_name: "health_events".to_string(),
                    status: CheckStatus::Unhealthy,
                    message: format!("failed to drain health events: {e}"),
                });
                Vec::new()
            }
        };

        let cancel = self.dispatcher.shutdown_signal();
        let request = ReportHealthRequest {
            node_id: self.config.node_id.clone(),
            results,
            events,
        };
        let rpc = self.rpc.clone();
        let always_retryable = |_: &RpcError| true;
        let result = retry_with(&*self.clock, &cancel, &RetryConfig::default_profile(), always_retryable, || {
            let rpc = rpc.clone();
            let request = request.clone();
            async move { rpc.report_health(request).await }
        })
        .await;

        match result {
            Ok(response) => debug!(node_status = %response.node_status, "health report sent"),
            Err(e) => {
                self.metrics_registry.inc_retry_exhausted("report_health");
                warn!(error = %e, "health report failed after retries, continuing");
            }
        }
    }

    async fn poll_commands(&self) {
        let cancel = self.dispatcher.shutdown_signal();
        let rpc = self.rpc.clone();
        let request = GetNodeCommandsRequest {
            node_id: self.config.node_id.clone(),
        };
        let always_retryable = |_: &RpcError| true;
        let result = retry_with(&*self.clock, &cancel, &RetryConfig::default_profile(), always_retryable, || {
            let rpc = rpc.clone();
            let request = request.clone();
            async move { rpc.get_node_commands(request).await }
        })
        .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.metrics_registry.inc_retry_exhausted("get_node_commands");
                warn!(error = %e, "command poll failed after retries, continuing");
                return;
            }
        };

        for command in response.commands {
            let command_id = command.command_id.clone();
            let outcome = self.dispatcher.dispatch(&command).await;
            let ack = AcknowledgeCommandRequest {
                node_id: self.config.node_id.clone(),
                command_id: command_id.clone(),
                status: if outcome.is_ok() { AckStatus::Completed } else { AckStatus::Failed },
                error_message: outcome.as_ref().err().map(|e| e.to_string()),
            };
            if let Err(e) = self.rpc.acknowledge_command(ack).await {
                warn!(error = %e, command_id = %command_id, "failed to acknowledge command");
            }
        }
    }

    /// Initializes the backend, registers, and runs the three loops until
    /// the shutdown signal fires. Shuts the backend down on exit either way.
    pub async fn run(&self) -> Result<(), AgentError> {
        self.backend.initialize().await?;

        if let Err(e) = self.register().await {
            let _ = self.backend.shutdown().await;
            return Err(e);
        }

        let cancel = self.dispatcher.shutdown_signal();
        let (heartbeat, health_check, command_poll) = {
            let intervals = self.intervals.read().await;
            (intervals.heartbeat, intervals.health_check, intervals.command_poll)
        };

        tokio::join!(
            self.run_periodic(heartbeat, &cancel, || self.send_heartbeat()),
            self.run_periodic(health_check, &cancel, || self.send_health_report()),
            self.run_periodic(command_poll, &cancel, || self.poll_commands()),
        );

        info!(node_id = %self.config.node_id, "shutdown signal received, stopping agent loops");
        let _ = self.backend.shutdown().await;
        Ok(())
    }

    /// Runs `body` every `interval`, timed through `self.clock` rather than
    /// `tokio::time`, so the cadence is driven deterministically by
    /// `FakeClock` in tests like every other time-dependent path here.
    /// Exits as soon as `cancel` fires, whether that happens during the
    /// wait or while `body` is running.
    async fn run_periodic<'a, F, Fut>(&'a self, interval: Duration, cancel: &CancellationToken, mut body: F)
    where
        F: FnMut() -> Fut + 'a,
        Fut: std::future::Future<Output = ()> + 'a,
    {
        loop {
            tokio::select! {
                _ = self.clock.sleep(interval) => {}
                _ = cancel.cancelled() => return,
            }
            tokio::select! {
                _ = body() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    /// Initializes, registers, and runs exactly one pass of each loop body
    /// before shutting the backend down. Used by the CLI's `--once` mode.
    pub async fn run_once(&self) -> Result<(), AgentError> {
        self.backend.initialize().await?;

        if let Err(e) = self.register().await {
            let _ = self.backend.shutdown().await;
            return Err(e);
        }

        self.send_heartbeat().await;
        self.send_health_report().await;
        self.poll_commands().await;

        let _ = self.backend.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::device::InjectableBackend;
    use crate::metrics_collector::ProcSystemMetricsReader;
    use crate::rpc::{InMemoryRpcClient, NodeCommand};
    use crate::rpc::CommandType;

    fn config() -> NodeAgentConfig {
        NodeAgentConfig {
            node_id: "node-0".to_string(),
            control_plane_address: "http://control-plane:8080".to_string(),
            ..NodeAgentConfig::default()
        }
    }

    #[tokio::test]
    async fn construction_requires_node_id() {
        let backend = Arc::new(InjectableBackend::new(1, "Test GPU"));
        let rpc = InMemoryRpcClient::new();
        let clock = FakeClock::new();
        let system = Arc::new(ProcSystemMetricsReader);
        let mut cfg = config();
        cfg.node_id.clear();
        let result = NodeAgent::new(cfg, backend, rpc, clock, system);
        assert!(matches!(result, Err(AgentError::MissingNodeId)));
    }

    #[tokio::test]
    async fn registration_applies_interval_overrides() {
        let backend = Arc::new(InjectableBackend::new(1, "Test GPU"));
        let rpc = InMemoryRpcClient::new();
        rpc.set_register_response(crate::rpc::RegisterNodeResponse {
            success: true,
            message: "ok".to_string(),
            config: crate::rpc::RegisterConfig {
                heartbeat_interval_seconds: Some(5),
                health_check_interval_seconds: Some(15),
            },
        })
        .await;
        let clock = FakeClock::new();
        let system = Arc::new(ProcSystemMetricsReader);
        let agent = NodeAgent::new(config(), backend.clone(), rpc.clone(), clock, system).unwrap();

        backend.initialize().await.unwrap();
        agent.register().await.unwrap();

        let intervals = agent.intervals.read().await;
        assert_eq!(intervals.heartbeat, Duration::from_secs(5));
        assert_eq!(intervals.health_check, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn dispatched_command_is_acknowledged() {
        let backend = Arc::new(InjectableBackend::new(1, "Test GPU"));
        backend.initialize().await.unwrap();
        let rpc = InMemoryRpcClient::new();
        rpc.enqueue_command(NodeCommand {
            command_id: "c1".to_string(),
            command_type: CommandType::Cordon,
            parameters: HashMap::new(),
        })
        .await;
        let clock = FakeClock::new();
        let system = Arc::new(ProcSystemMetricsReader);
        let agent = NodeAgent::new(config(), backend, rpc.clone(), clock, system).unwrap();

        agent.poll_commands().await;

        let acked = rpc.acknowledged().await;
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].status, AckStatus::Completed);
        assert_eq!(agent.dispatcher().state().await, crate::lifecycle::LifecycleState::Cordoned);
    }

    /// `run()`'s loop cadence must be driven by the injected `Clock`, not
    /// `tokio::time`, so a `FakeClock` can advance it deterministically.
    #[tokio::test]
    async fn run_loop_cadence_is_driven_by_injected_clock() {
        let backend = Arc::new(InjectableBackend::new(1, "Test GPU"));
        let rpc = InMemoryRpcClient::new();
        let clock = FakeClock::new();
        let system = Arc::new(ProcSystemMetricsReader);
        let mut cfg = config();
        cfg.heartbeat_interval = Duration::from_secs(10);
        cfg.health_check_interval = Duration::from_secs(10);
        cfg.command_poll_interval = Duration::from_secs(10);
        let agent = Arc::new(NodeAgent::new(cfg, backend, rpc.clone(), clock.clone(), system).unwrap());

        let agent_for_run = agent.clone();
        let run_handle = tokio::spawn(async move { agent_for_run.run().await });

        // Drain registration and let all three loops reach their first sleep.
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }
        assert_eq!(clock.waiter_count().await, 3);
        assert!(rpc.heartbeats_received().await.is_empty());

        clock.advance(Duration::from_secs(10)).await;
        for _ in 0..200 {
            tokio::task::yield_now().await;
        }

        assert_eq!(rpc.heartbeats_received().await.len(), 1);
        assert_eq!(rpc.health_reports_received().await.len(), 1);

        agent.dispatcher().shutdown_signal().cancel();
        run_handle.await.unwrap().unwrap();
    }
}
