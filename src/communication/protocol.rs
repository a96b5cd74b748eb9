// src/communication/protocol.rs - Request/acknowledgement layer over the control channel
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

use crate::communication::commands::{extract_correlation_id, Command, Reply};
use crate::communication::transport::ControlChannel;
use crate::error::DeviceError;

/// A command waiting for its reply.
#[derive(Debug)]
pub struct PendingRequest {
    pub correlation_id: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    pub timeout: Duration,
    result_slot: oneshot::Sender<Result<Reply, DeviceError>>,
}

/// Statistics for command execution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtocolStats {
    pub sent: u64,
    pub resolved: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub total_response_time: f64,
    pub average_response_time: f64,
}

/// Assigns correlation ids, tracks pending requests and resolves or expires them.
///
/// Removal from the pending map is the single arbitration point: whichever of
/// reply, timeout, sweep or disconnect removes the entry decides the outcome, so a
/// request is settled exactly once.
pub struct CommandProtocol {
    channel: Arc<dyn ControlChannel>,
    pending: Arc<Mutex<HashMap<String, PendingRequest>>>,
    stats: Arc<Mutex<ProtocolStats>>,
    default_timeout: Duration,
}

impl CommandProtocol {
    pub fn new(channel: Arc<dyn ControlChannel>, default_timeout: Duration) -> Self {
        Self {
            channel,
            pending: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Mutex::new(ProtocolStats::default())),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Send `command` and wait for the reply carrying the same correlation id.
    ///
    /// Fails with `NotConnected` without registering anything when the channel is
    /// down, and with `Timeout` once `timeout` (or the default) has elapsed.
    pub async fn send(&self, command: Command, timeout: Option<Duration>) -> Result<Reply, DeviceError> {
        if !self.channel.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (result_tx, mut result_rx) = oneshot::channel();

        let correlation_id = {
            let mut pending = self.pending.lock().await;
            let correlation_id = loop {
                let candidate = uuid::Uuid::new_v4().simple().to_string();
                if !pending.contains_key(&candidate) {
                    break candidate;
                }
            };
            let issued_at = Instant::now();
            pending.insert(
                correlation_id.clone(),
                PendingRequest {
                    correlation_id: correlation_id.clone(),
                    issued_at,
                    deadline: issued_at + timeout,
                    timeout,
                    result_slot: result_tx,
                },
            );
            correlation_id
        };

        let payload = command.to_payload(&correlation_id);
        tracing::debug!(
            "Sending {} {} (correlation id {})",
            command.domain,
            command.action,
            correlation_id
        );
        if let Err(e) = self.channel.publish(payload.to_string().into_bytes()).await {
            self.pending.lock().await.remove(&correlation_id);
            self.stats.lock().await.failed += 1;
            tracing::warn!("Publish of {} failed: {}", correlation_id, e);
            return Err(e);
        }
        self.stats.lock().await.sent += 1;

        match tokio::time::timeout(timeout, &mut result_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DeviceError::NotConnected),
            Err(_) => {
                let expired = self.pending.lock().await.remove(&correlation_id);
                match expired {
                    Some(_) => {
                        self.stats.lock().await.timed_out += 1;
                        tracing::warn!("Command {} timed out after {:?}", correlation_id, timeout);
                        Err(DeviceError::Timeout {
                            correlation_id,
                            after: timeout,
                        })
                    }
                    // Settled by someone else at the same instant; their outcome stands.
                    None => result_rx.await.unwrap_or(Err(DeviceError::NotConnected)),
                }
            }
        }
    }

    /// Publish a command that the device never acknowledges. Nothing is registered.
    pub async fn publish(&self, command: Command) -> Result<(), DeviceError> {
        if !self.channel.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let payload = command.to_payload("0");
        self.channel.publish(payload.to_string().into_bytes()).await?;
        self.stats.lock().await.sent += 1;
        Ok(())
    }

    /// Match a report payload against the pending map. Returns true when it
    /// settled a request.
    pub async fn dispatch_reply(&self, payload: &Value) -> bool {
        let Some((domain, correlation_id)) = extract_correlation_id(payload) else {
            return false;
        };
        let entry = self.pending.lock().await.remove(&correlation_id);
        let Some(request) = entry else {
            return false;
        };
        let body = payload.get(&domain).cloned().unwrap_or(Value::Null);
        let elapsed = request.issued_at.elapsed().as_secs_f64();
        {
            let mut stats = self.stats.lock().await;
            stats.resolved += 1;
            stats.total_response_time += elapsed;
            stats.average_response_time = stats.total_response_time / stats.resolved as f64;
        }
        tracing::debug!(
            "Command {} resolved in {:.3}ms",
            correlation_id,
            elapsed * 1000.0
        );
        let _ = request.result_slot.send(Ok(Reply {
            correlation_id,
            domain,
            body,
        }));
        true
    }

    /// Fail every request whose deadline has passed. Returns how many expired.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .values()
                .filter(|request| request.deadline <= now)
                .map(|request| request.correlation_id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = expired.len();
        if count > 0 {
            self.stats.lock().await.timed_out += count as u64;
        }
        for request in expired {
            tracing::warn!("Sweeping expired command {}", request.correlation_id);
            let _ = request.result_slot.send(Err(DeviceError::Timeout {
                correlation_id: request.correlation_id,
                after: request.timeout,
            }));
        }
        count
    }

    /// Fail all pending requests with `NotConnected`. Used on disconnect.
    pub async fn fail_all(&self) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, request)| request).collect()
        };
        let count = drained.len();
        if count > 0 {
            self.stats.lock().await.failed += count as u64;
            tracing::info!("Failing {} pending command(s): session closed", count);
        }
        for request in drained {
            let _ = request.result_slot.send(Err(DeviceError::NotConnected));
        }
        count
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn get_stats(&self) -> ProtocolStats {
        self.stats.lock().await.clone()
    }
}
