// src/communication/transport.rs - Encrypted, authenticated control channel to one device
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};

use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions,
    Packet, QoS, TlsConfiguration, Transport,
};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::communication::commands::{report_topic, request_topic};
use crate::communication::tls::device_client_config;
use crate::config::Config;
use crate::device::ConnectionPhase;
use crate::error::DeviceError;

/// Who the session talks to. Fixed for the lifetime of a session.
#[derive(Clone)]
pub struct DeviceIdentity {
    pub address: String,
    pub access_secret: String,
    pub serial_id: String,
}

impl DeviceIdentity {
    pub fn new(address: &str, access_secret: &str, serial_id: &str) -> Self {
        Self {
            address: address.to_string(),
            access_secret: access_secret.to_string(),
            serial_id: serial_id.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.printer.host,
            &config.printer.access_code,
            &config.printer.serial,
        )
    }
}

// The secret never reaches logs.
impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("address", &self.address)
            .field("serial_id", &self.serial_id)
            .finish()
    }
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub principal: String,
    pub control_port: u16,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            principal: config.printer.principal.clone(),
            control_port: config.printer.control_port,
            connect_timeout: config.session.connect_timeout(),
            keep_alive: config.session.keep_alive(),
            backoff_initial: config.session.backoff_initial(),
            backoff_max: config.session.backoff_max(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Reconnection delay: starts at `initial`, doubles per consecutive failure,
/// capped at `max`, back to `initial` after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            attempts: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Outgoing side of a control channel.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Publish a command payload on the device's request topic.
    async fn publish(&self, payload: Vec<u8>) -> Result<(), DeviceError>;
}

/// Receives everything the session hears, in receipt order.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn on_telemetry(&self, topic: &str, payload: &[u8]);
    async fn on_phase_change(&self, phase: ConnectionPhase);
}

/// A control channel whose lifetime the device facade manages.
#[async_trait]
pub trait DeviceSession: ControlChannel {
    /// Connect and start delivering telemetry to `sink`.
    async fn open(&self, sink: Arc<dyn TelemetrySink>) -> Result<(), DeviceError>;
    /// Disconnect and stop any reconnection. Idempotent.
    async fn close(&self);

    fn link_stats(&self) -> LinkStats {
        LinkStats::default()
    }
}

/// Connection counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Acknowledged connections, first one included.
    pub connects: u64,
    /// Unexpected link losses after a connection was up.
    pub disconnections: u64,
    /// Acknowledged connections that followed a loss.
    pub reconnections: u64,
}

#[derive(Debug, Default)]
struct LinkCounters {
    connects: AtomicU64,
    disconnections: AtomicU64,
    reconnections: AtomicU64,
}

impl LinkCounters {
    fn snapshot(&self) -> LinkStats {
        LinkStats {
            connects: self.connects.load(Ordering::Relaxed),
            disconnections: self.disconnections.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
        }
    }
}

/// Where the listener gets its events from. The MQTT event loop in production.
#[async_trait]
pub trait LinkEvents: Send {
    /// Next event. After an error the following call starts a new connection attempt.
    async fn poll(&mut self) -> Result<Event, ConnectionError>;
    fn subscribe(&self, topic: &str) -> Result<(), ClientError>;
}

struct MqttLink {
    client: AsyncClient,
    event_loop: EventLoop,
}

#[async_trait]
impl LinkEvents for MqttLink {
    async fn poll(&mut self) -> Result<Event, ConnectionError> {
        self.event_loop.poll().await
    }

    fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.client.try_subscribe(topic, QoS::AtMostOnce)
    }
}

/// Persistent MQTT-over-TLS session to one device.
pub struct TransportSession {
    identity: DeviceIdentity,
    settings: SessionSettings,
    phase_tx: watch::Sender<ConnectionPhase>,
    client: Mutex<Option<AsyncClient>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    counters: Arc<LinkCounters>,
}

impl TransportSession {
    pub fn new(identity: DeviceIdentity, settings: SessionSettings) -> Self {
        let (phase_tx, _) = watch::channel(ConnectionPhase::Disconnected);
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            identity,
            settings,
            phase_tx,
            client: Mutex::new(None),
            listener: Mutex::new(None),
            shutdown_tx,
            counters: Arc::new(LinkCounters::default()),
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn phase(&self) -> ConnectionPhase {
        *self.phase_tx.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ConnectionPhase> {
        self.phase_tx.subscribe()
    }

    pub fn report_topic(&self) -> String {
        report_topic(&self.identity.serial_id)
    }

    pub fn request_topic(&self) -> String {
        request_topic(&self.identity.serial_id)
    }

    fn mqtt_options(&self) -> MqttOptions {
        let client_id = format!("printlink_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let mut options = MqttOptions::new(
            client_id,
            self.identity.address.clone(),
            self.settings.control_port,
        );
        options.set_credentials(self.settings.principal.clone(), self.identity.access_secret.clone());
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(1024 * 1024, 1024 * 1024);
        options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(
            device_client_config(),
        )));
        options
    }

    /// Open the channel, authenticate and subscribe to the report topic.
    ///
    /// Returns once the device acknowledged the connection. From then on the
    /// listener task owns the link: unexpected loss is retried with backoff until
    /// `disconnect` is called.
    pub async fn connect(&self, sink: Arc<dyn TelemetrySink>) -> Result<(), DeviceError> {
        if self.phase() == ConnectionPhase::Connected {
            return Ok(());
        }
        // A previous listener may still be retrying.
        self.stop_listener().await;

        tracing::info!(
            "Connecting to {}:{} (serial {})",
            self.identity.address,
            self.settings.control_port,
            self.identity.serial_id
        );
        set_phase(&self.phase_tx, sink.as_ref(), ConnectionPhase::Connecting).await;

        let (client, event_loop) = AsyncClient::new(self.mqtt_options(), 64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let listener = Listener {
            link: MqttLink {
                client: client.clone(),
                event_loop,
            },
            report_topic: self.report_topic(),
            sink: sink.clone(),
            phase_tx: self.phase_tx.clone(),
            backoff: Backoff::new(self.settings.backoff_initial, self.settings.backoff_max),
            shutdown_rx: self.shutdown_tx.subscribe(),
            counters: self.counters.clone(),
        };
        let handle = tokio::spawn(listener.run(ready_tx));

        let outcome = match tokio::time::timeout(self.settings.connect_timeout, ready_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(DeviceError::Network("listener exited during connect".to_string())),
            Err(_) => Err(DeviceError::Network(format!(
                "no acknowledgement from {} within {:?}",
                self.identity.address, self.settings.connect_timeout
            ))),
        };

        match outcome {
            Ok(()) => {
                *self.client.lock().await = Some(client);
                *self.listener.lock().await = Some(handle);
                tracing::info!("Connected to device {}", self.identity.serial_id);
                Ok(())
            }
            Err(e) => {
                handle.abort();
                set_phase(&self.phase_tx, sink.as_ref(), ConnectionPhase::Disconnected).await;
                tracing::error!("Connection to {} failed: {}", self.identity.address, e);
                Err(e)
            }
        }
    }

    /// Close the channel and cancel any scheduled reconnection.
    pub async fn disconnect(&self) {
        if let Some(client) = self.client.lock().await.take() {
            let _ = client.try_disconnect();
        }
        self.stop_listener().await;
        self.phase_tx.send_replace(ConnectionPhase::Disconnected);
        tracing::info!("Disconnected from device {}", self.identity.serial_id);
    }

    async fn stop_listener(&self) {
        let handle = self.listener.lock().await.take();
        if let Some(handle) = handle {
            let _ = self.shutdown_tx.send(());
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                tracing::warn!("Listener did not stop in time");
            }
        }
    }
}

#[async_trait]
impl ControlChannel for TransportSession {
    fn is_connected(&self) -> bool {
        self.phase() == ConnectionPhase::Connected
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<(), DeviceError> {
        let client = self.client.lock().await.clone();
        let Some(client) = client else {
            return Err(DeviceError::NotConnected);
        };
        client
            .publish(self.request_topic(), QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| DeviceError::Network(e.to_string()))
    }
}

#[async_trait]
impl DeviceSession for TransportSession {
    async fn open(&self, sink: Arc<dyn TelemetrySink>) -> Result<(), DeviceError> {
        self.connect(sink).await
    }

    async fn close(&self) {
        self.disconnect().await
    }

    fn link_stats(&self) -> LinkStats {
        self.stats()
    }
}

async fn set_phase(
    phase_tx: &watch::Sender<ConnectionPhase>,
    sink: &dyn TelemetrySink,
    phase: ConnectionPhase,
) {
    let previous = phase_tx.send_replace(phase);
    if previous != phase {
        tracing::debug!("Connection phase {:?} -> {:?}", previous, phase);
        sink.on_phase_change(phase).await;
    }
}

/// Map a connection error onto the device error taxonomy.
pub fn classify_connection_error(error: &ConnectionError) -> DeviceError {
    match error {
        ConnectionError::ConnectionRefused(
            code @ (ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized),
        ) => DeviceError::Auth(format!("{:?}", code)),
        other => DeviceError::Network(other.to_string()),
    }
}

/// Background task that owns the event source for one session.
struct Listener<L> {
    link: L,
    report_topic: String,
    sink: Arc<dyn TelemetrySink>,
    phase_tx: watch::Sender<ConnectionPhase>,
    backoff: Backoff,
    shutdown_rx: broadcast::Receiver<()>,
    counters: Arc<LinkCounters>,
}

impl<L: LinkEvents> Listener<L> {
    async fn run(mut self, ready_tx: oneshot::Sender<Result<(), DeviceError>>) {
        let mut ready = Some(ready_tx);
        let mut lost = false;
        loop {
            let event = tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    tracing::info!("Transport listener shutting down");
                    break;
                }
                event = self.link.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.backoff.reset();
                    self.counters.connects.fetch_add(1, Ordering::Relaxed);
                    if lost {
                        self.counters.reconnections.fetch_add(1, Ordering::Relaxed);
                        lost = false;
                    }
                    if let Err(e) = self.link.subscribe(&self.report_topic) {
                        tracing::error!("Subscribe to {} failed: {}", self.report_topic, e);
                    }
                    set_phase(&self.phase_tx, self.sink.as_ref(), ConnectionPhase::Connected).await;
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    tracing::trace!("Telemetry on {} ({} bytes)", publish.topic, publish.payload.len());
                    self.sink.on_telemetry(&publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(e) => {
                    let error = classify_connection_error(&e);
                    if let Some(tx) = ready.take() {
                        // First attempt: the caller decides what to do.
                        let _ = tx.send(Err(error));
                        break;
                    }
                    if !lost {
                        self.counters.disconnections.fetch_add(1, Ordering::Relaxed);
                        lost = true;
                    }
                    set_phase(&self.phase_tx, self.sink.as_ref(), ConnectionPhase::Disconnected).await;
                    if let DeviceError::Auth(_) = error {
                        tracing::error!("Device rejected credentials, not reconnecting: {}", error);
                        break;
                    }
                    let delay = self.backoff.next_delay();
                    tracing::warn!(
                        "Link lost ({}), reconnect attempt {} in {:?}",
                        error,
                        self.backoff.attempts(),
                        delay
                    );
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => {
                            tracing::info!("Reconnection cancelled");
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    set_phase(&self.phase_tx, self.sink.as_ref(), ConnectionPhase::Connecting).await;
                }
            }
        }
        set_phase(&self.phase_tx, self.sink.as_ref(), ConnectionPhase::Disconnected).await;
    }
}
