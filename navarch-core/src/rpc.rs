//! RPC contracts between the node agent and the control plane, plus an
//! in-memory test double and a thin HTTP+JSON transport shim.
//!
//! The control-plane server itself is out of scope; only the shapes the
//! node speaks are specified here.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::device::DeviceDescriptor;
use crate::health_event::HealthEventWire;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub hostname: String,
    pub internal_ip: String,
    pub external_ip: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_id: String,
    pub provider: String,
    pub region: String,
    pub zone: String,
    pub instance_type: String,
    pub gpus: Vec<DeviceDescriptor>,
    pub metadata: NodeMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    pub heartbeat_interval_seconds: Option<u64>,
    pub health_check_interval_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub success: bool,
    pub message: String,
    pub config: RegisterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuMetricSample {
    pub index: u32,
    pub utilization_percent: u32,
    pub memory_used_bytes: u64,
    pub temperature_celsius: u32,
    pub power_watts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub cpu_usage_percent: f64,
    pub memory_usage_percent: f64,
    pub gpu_metrics: Vec<GpuMetricSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendHeartbeatRequest {
    pub node_id: String,
    pub metrics: HeartbeatMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendHeartbeatResponse {
    pub acknowledged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_name: String,
    pub status: CheckStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportHealthRequest {
    pub node_id: String,
    pub results: Vec<CheckResult>,
    pub events: Vec<HealthEventWire>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportHealthResponse {
    pub acknowledged: bool,
    pub node_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNodeCommandsRequest {
    pub node_id: String,
}

impl GetNodeCommandsRequest {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Cordon,
    Drain,
    Terminate,
    RunDiagnostic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCommand {
    pub command_id: String,
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetNodeCommandsResponse {
    pub commands: Vec<NodeCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcknowledgeCommandRequest {
    pub node_id: String,
    pub command_id: String,
    pub status: AckStatus,
    pub error_message: Option<String>,
}

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("control plane rejected request: {0}")]
    Rejected(String),
    #[error("failed to encode/decode message: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Client-side contract the node agent speaks to the control plane. The
/// wire protocol itself is unspecified; only these four calls plus the
/// out-of-band command acknowledgement are required.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn register_node(&self, request: RegisterNodeRequest) -> Result<RegisterNodeResponse, RpcError>;

    async fn send_heartbeat(&self, request: SendHeartbeatRequest) -> Result<SendHeartbeatResponse, RpcError>;

    async fn report_health(&self, request: ReportHealthRequest) -> Result<ReportHealthResponse, RpcError>;

    async fn get_node_commands(&self, request: GetNodeCommandsRequest) -> Result<GetNodeCommandsResponse, RpcError>;

    async fn acknowledge_command(&self, request: AcknowledgeCommandRequest) -> Result<(), RpcError>;
}

/// In-memory test double. Canned responses and injected failures are set
/// up before use; every call records its request for assertions.
#[derive(Default)]
struct InMemoryState {
    register_response: Option<RegisterNodeResponse>,
    heartbeats_received: Vec<SendHeartbeatRequest>,
    health_reports_received: Vec<ReportHealthRequest>,
    pending_commands: Vec<NodeCommand>,
    acknowledged: Vec<AcknowledgeCommandRequest>,
    fail_next_register: bool,
    fail_next_heartbeat: bool,
}

pub struct InMemoryRpcClient {
    state: Mutex<InMemoryState>,
}

impl InMemoryRpcClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(InMemoryState::default()),
        })
    }

    pub async fn set_register_response(&self, response: RegisterNodeResponse) {
        self.state.lock().await.register_response = Some(response);
    }

    pub async fn enqueue_command(&self, command: NodeCommand) {
        self.state.lock().await.pending_commands.push(command);
    }

    pub async fn fail_next_register(&self) {
        self.state.lock().await.fail_next_register = true;
    }

    pub async fn fail_next_heartbeat(&self) {
        self.state.lock().await.fail_next_heartbeat = true;
    }

    pub async fn heartbeats_received(&self) -> Vec<SendHeartbeatRequest> {
        self.state.lock().await.heartbeats_received.clone()
    }

    pub async fn health_reports_received(&self) -> Vec<ReportHealthRequest> {
        self.state.lock().await.health_reports_received.clone()
    }

    pub async fn acknowledged(&self) -> Vec<AcknowledgeCommandRequest> {
        self.state.lock().await.acknowledged.clone()
    }
}

#[async_trait]
impl RpcClient for InMemoryRpcClient {
    async fn register_node(&self, _request: RegisterNodeRequest) -> Result<RegisterNodeResponse, RpcError> {
        let mut state = self.state.lock().await;
        if state.fail_next_register {
            state.fail_next_register = false;
            return Err(RpcError::Transport("injected register failure".to_string()));
        }
        Ok(state.register_response.clone().unwrap_or(RegisterNodeResponse {
            success: true,
            message: "registered".to_string(),
            config: RegisterConfig {
                heartbeat_interval_seconds: None,
                health_check_interval_seconds: None,
            },
        }))
    }

    async fn send_heartbeat(&self, request: SendHeartbeatRequest) -> Result<SendHeartbeatResponse, RpcError> {
        let mut state = self.state.lock().await;
        if state.fail_next_heartbeat {
            state.fail_next_heartbeat = false;
            return Err(RpcError::Transport("injected heartbeat failure".to_string()));
        }
        state.heartbeats_received.push(request);
        Ok(SendHeartbeatResponse { acknowledged: true })
    }

    async fn report_health(&self, request: ReportHealthRequest) -> Result<ReportHealthResponse, RpcError> {
        let mut state = self.state.lock().await;
        state.health_reports_received.push(request);
        Ok(ReportHealthResponse {
            acknowledged: true,
            node_status: "ok".to_string(),
        })
    }

    async fn get_node_commands(&self, _request: GetNodeCommandsRequest) -> Result<GetNodeCommandsResponse, RpcError> {
        let mut state = self.state.lock().await;
        let commands = std::mem::take(&mut state.pending_commands);
        Ok(GetNodeCommandsResponse { commands })
    }

    async fn acknowledge_command(&self, request: AcknowledgeCommandRequest) -> Result<(), RpcError> {
        self.state.lock().await.acknowledged.push(request);
        Ok(())
    }
}

/// Minimal HTTP+JSON client, hand-rolled the same way this codebase's
/// metrics endpoint hand-rolls its server side: no HTTP library, just
/// enough framing over a raw socket to round-trip a JSON body.
pub struct HttpRpcClient {
    base_url: String,
}

impl HttpRpcClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }

    async fn post_json<Req: Serialize, Resp: for<'de> Deserialize<'de>>(&self, path: &str, request: &Req) -> Result<Resp, RpcError> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpStream;

        let body = serde_json::to_vec(request)?;
        let authority = self
            .base_url
            .strip_prefix("http://")
            .unwrap_or(&self.base_url);
        let mut stream = TcpStream::connect(authority)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let request_line = format!(
            "POST {path} HTTP/1.1\r\nHost: {authority}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream
            .write_all(request_line.as_bytes())
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        stream.write_all(&body).await.map_err(|e| RpcError::Transport(e.to_string()))?;

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.map_err(|e| RpcError::Transport(e.to_string()))?;
        let response = String::from_utf8_lossy(&raw);
        let split = response.find("\r\n\r\n").ok_or_else(|| RpcError::Transport("malformed HTTP response".to_string()))?;
        let json_body = &response[split + 4..];
        serde_json::from_str(json_body).map_err(RpcError::Codec)
    }
}

#[async_trait]
impl RpcClient for HttpRpcClient {
    async fn register_node(&self, request: RegisterNodeRequest) -> Result<RegisterNodeResponse, RpcError> {
        self.post_json("/v1/register", &request).await
    }

    async fn send_heartbeat(&self, request: SendHeartbeatRequest) -> Result<SendHeartbeatResponse, RpcError> {
        self.post_json("/v1/heartbeat", &request).await
    }

    async fn report_health(&self, request: ReportHealthRequest) -> Result<ReportHealthResponse, RpcError> {
        self.post_json("/v1/health", &request).await
    }

    async fn get_node_commands(&self, request: GetNodeCommandsRequest) -> Result<GetNodeCommandsResponse, RpcError> {
        self.post_json("/v1/commands", &request).await
    }

    async fn acknowledge_command(&self, request: AcknowledgeCommandRequest) -> Result<(), RpcError> {
        let _: serde_json::Value = self.post_json("/v1/commands/ack", &request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_returns_default_register_response_until_one_is_set() {
        let client = InMemoryRpcClient::new();
        let response = client
            .register_node(RegisterNodeRequest {
                node_id: "node-0".to_string(),
                provider: "aws".to_string(),
                region: "us-east-1".to_string(),
                zone: "us-east-1a".to_string(),
                instance_type: "p4d.24xlarge".to_string(),
                gpus: vec![],
                metadata: NodeMetadata {
                    hostname: "host".to_string(),
                    internal_ip: "10.0.0.1".to_string(),
                    external_ip: "".to_string(),
                    labels: HashMap::new(),
                },
            })
            .await
            .unwrap();
        assert!(response.success);
    }

    #[tokio::test]
    async fn injected_register_failure_fires_exactly_once() {
        let client = InMemoryRpcClient::new();
        client.fail_next_register().await;
        let req = GetNodeCommandsRequest { node_id: "n".to_string() };
        let _ = client.get_node_commands(req).await;

        let register_request = || RegisterNodeRequest {
            node_id: "n".to_string(),
            provider: "aws".to_string(),
            region: "r".to_string(),
            zone: "z".to_string(),
            instance_type: "t".to_string(),
            gpus: vec![],
            metadata: NodeMetadata {
                hostname: "h".to_string(),
                internal_ip: "i".to_string(),
                external_ip: "e".to_string(),
                labels: HashMap::new(),
            },
        };
        assert!(client.register_node(register_request()).await.is_err());
        assert!(client.register_node(register_request()).await.is_ok());
    }

    #[tokio::test]
    async fn enqueued_commands_are_drained_in_order() {
        let client = InMemoryRpcClient::new();
        client
            .enqueue_command(NodeCommand {
                command_id: "c1".to_string(),
                command_type: CommandType::Cordon,
                parameters: HashMap::new(),
            })
            .await;
        client
            .enqueue_command(NodeCommand {
                command_id: "c2".to_string(),
                command_type: CommandType::Drain,
                parameters: HashMap::new(),
            })
            .await;

        let req = GetNodeCommandsRequest { node_id: "n".to_string() };
        let response = client.get_node_commands(req.clone()).await.unwrap();
        assert_eq!(response.commands.len(), 2);
        assert_eq!(response.commands[0].command_id, "c1");

        let second = client.get_node_commands(req).await.unwrap();
        assert!(second.commands.is_empty());
    }
}
