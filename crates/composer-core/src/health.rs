//! Periodic health probes and resource sampling for one running server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::RpcClient;
use crate::config::{HealthSettings, ProbeStrategy, ResourceLimits, ResourceUsage};
use crate::error::{ComposerError, Result};
use crate::observer::{ComposerEvent, EventSink};
use crate::supervisor::SupervisorSignal;

/// Send one probe and wait at most `timeout` for its answer.
///
/// A tool probe whose result carries `isError: true` counts as a failure.
pub async fn probe(client: &RpcClient, strategy: &ProbeStrategy, timeout: Duration) -> Result<()> {
    let attempt = async {
        match strategy {
            ProbeStrategy::Ping => client.ping().await,
            ProbeStrategy::Tool { name, arguments } => {
                let result = client.call_tool(name, arguments.clone()).await?;
                if result.get("isError").and_then(Value::as_bool) == Some(true) {
                    return Err(ComposerError::HealthCheckFailure {
                        name: client.name().to_string(),
                        reason: format!("probe tool '{}' reported an error", name),
                    });
                }
                Ok(())
            }
            ProbeStrategy::Custom { method, params } => {
                client.request(method, params.clone()).await.map(|_| ())
            }
        }
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| ComposerError::timeout("health probe", timeout))?
}

/// Samples memory and CPU of one process.
pub struct ResourceSampler {
    system: System,
    pid: Pid,
}

impl ResourceSampler {
    pub fn new(pid: u32) -> Self {
        Self {
            system: System::new(),
            pid: Pid::from_u32(pid),
        }
    }

    /// Current usage, or `None` once the process is gone.
    ///
    /// CPU usage is measured against the previous sample, so the first
    /// reading is always zero.
    pub fn sample(&mut self) -> Option<ResourceUsage> {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        let process = self.system.process(self.pid)?;
        Some(ResourceUsage {
            memory_mb: process.memory() / (1024 * 1024),
            cpu_percent: process.cpu_usage(),
        })
    }
}

/// Watches one incarnation of a server until cancelled or until it decides
/// the server must be treated as crashed.
pub(crate) struct HealthMonitor {
    pub(crate) server: String,
    pub(crate) generation: u64,
    pub(crate) health: HealthSettings,
    pub(crate) limits: ResourceLimits,
    pub(crate) client: Arc<RpcClient>,
    pub(crate) pid: Option<u32>,
    pub(crate) signals: mpsc::UnboundedSender<SupervisorSignal>,
    pub(crate) events: EventSink,
}

impl HealthMonitor {
    fn has_work(&self) -> bool {
        self.health.enabled || (!self.limits.is_empty() && self.pid.is_some())
    }

    /// Spawn the monitor, or return `None` when there is nothing to watch.
    pub(crate) fn spawn(self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.has_work() {
            return None;
        }
        if self.health.enabled && !self.health.probe.is_idempotent() {
            warn!(server = %self.server, probe = ?self.health.probe, "Health probe invokes a tool; it may have side effects");
        }
        Some(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = self.run() => {}
            }
        }))
    }

    async fn run(self) {
        let mut ticker = tokio::time::interval(self.health.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the server was just checked by launch.
        ticker.tick().await;

        let mut sampler = match (self.limits.is_empty(), self.pid) {
            (false, Some(pid)) => Some(ResourceSampler::new(pid)),
            _ => None,
        };
        let mut probe_failures = 0u32;
        let mut violations = 0u32;

        loop {
            ticker.tick().await;

            if self.health.enabled {
                match probe(&self.client, &self.health.probe, self.health.timeout()).await {
                    Ok(()) => {
                        if probe_failures > 0 {
                            debug!(server = %self.server, "Health probe recovered");
                        }
                        probe_failures = 0;
                    }
                    Err(e) => {
                        probe_failures += 1;
                        warn!(
                            server = %self.server,
                            consecutive = probe_failures,
                            threshold = self.health.failure_threshold,
                            error = %e,
                            "Health probe failed"
                        );
                        self.events.emit(ComposerEvent::HealthCheckFailed {
                            server: self.server.clone(),
                            consecutive: probe_failures,
                            reason: e.to_string(),
                        });
                        if probe_failures >= self.health.failure_threshold.max(1) {
                            let _ = self.signals.send(SupervisorSignal::Unhealthy {
                                server: self.server.clone(),
                                generation: self.generation,
                                reason: e.to_string(),
                            });
                            return;
                        }
                    }
                }
            }

            let Some(sampler) = sampler.as_mut() else {
                continue;
            };
            let Some(usage) = sampler.sample() else {
                continue;
            };
            match self.limits.check(&usage) {
                Some(detail) => {
                    violations += 1;
                    warn!(
                        server = %self.server,
                        consecutive = violations,
                        detail = %detail,
                        "Resource limit exceeded"
                    );
                    self.events.emit(ComposerEvent::ResourceLimitExceeded {
                        server: self.server.clone(),
                        detail: detail.clone(),
                        consecutive: violations,
                    });
                    if violations >= self.limits.sustained_samples.max(1) {
                        let _ = self.signals.send(SupervisorSignal::ResourceLimit {
                            server: self.server.clone(),
                            generation: self.generation,
                            detail,
                        });
                        return;
                    }
                }
                None => violations = 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse};
    use crate::transport::StdioTransport;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    async fn client_answering(answer: fn(&JsonRpcRequest) -> Option<Value>) -> Arc<RpcClient> {
        let (ours, theirs) = duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        let transport = Arc::new(StdioTransport::from_pipes("probe", reader, writer, EventSink::detached()));

        tokio::spawn(async move {
            let (peer_reader, mut peer_writer) = tokio::io::split(theirs);
            let mut lines = BufReader::new(peer_reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(JsonRpcMessage::Request(request)) = JsonRpcMessage::parse(&line) {
                    if let Some(result) = answer(&request) {
                        let response = JsonRpcResponse::success(request.id, result);
                        let mut out = serde_json::to_string(&response).unwrap();
                        out.push('\n');
                        peer_writer.write_all(out.as_bytes()).await.unwrap();
                    }
                }
            }
        });

        RpcClient::connect("probe", transport, Duration::from_secs(5))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_probe_succeeds() {
        let client = client_answering(|_| Some(json!({}))).await;
        probe(&client, &ProbeStrategy::Ping, Duration::from_millis(500))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_probe_times_out_on_silent_server() {
        let client = client_answering(|_| None).await;
        let err = probe(&client, &ProbeStrategy::Ping, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ComposerError::Timeout { .. }));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_tool_probe_error_result_fails() {
        let client = client_answering(|_| Some(json!({"content": [], "isError": true}))).await;
        let strategy = ProbeStrategy::Tool {
            name: "status".into(),
            arguments: None,
        };
        let err = probe(&client, &strategy, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, ComposerError::HealthCheckFailure { .. }));
    }

    #[tokio::test]
    async fn test_monitor_signals_after_threshold() {
        let client = client_answering(|_| None).await;
        let (signals, mut rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor {
            server: "silent".into(),
            generation: 7,
            health: HealthSettings {
                enabled: true,
                interval_ms: 20,
                timeout_ms: 20,
                failure_threshold: 2,
                probe: ProbeStrategy::Ping,
            },
            limits: ResourceLimits::default(),
            client,
            pid: None,
            signals,
            events: EventSink::detached(),
        };
        let cancel = CancellationToken::new();
        let _task = monitor.spawn(cancel.clone()).unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            signal,
            SupervisorSignal::Unhealthy { ref server, generation: 7, .. } if server == "silent"
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_disabled_monitor_does_not_spawn() {
        let client = client_answering(|_| None).await;
        let (signals, _rx) = mpsc::unbounded_channel();
        let monitor = HealthMonitor {
            server: "quiet".into(),
            generation: 1,
            health: HealthSettings::disabled(),
            limits: ResourceLimits::default(),
            client,
            pid: None,
            signals,
            events: EventSink::detached(),
        };
        assert!(monitor.spawn(CancellationToken::new()).is_none());
    }

    #[test]
    fn test_sampler_reads_own_process() {
        let mut sampler = ResourceSampler::new(std::process::id());
        let usage = sampler.sample().unwrap();
        assert!(usage.memory_mb > 0 || usage.cpu_percent >= 0.0);
    }
}
