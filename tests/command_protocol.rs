use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use printlink_rs::communication::commands::{
    extract_correlation_id, CalibrationOptions, Fan, PrinterCommand,
};
use printlink_rs::communication::protocol::CommandProtocol;
use printlink_rs::communication::transport::{
    ControlChannel, DeviceIdentity, DeviceSession, LinkStats, TelemetrySink,
};
use printlink_rs::config::Config;
use printlink_rs::device::network::NetworkDevice;
use printlink_rs::device::{remote_file_name, ConnectionPhase, DeviceFacade, PrintPhase, PrinterState};
use printlink_rs::error::DeviceError;
use printlink_rs::file_transfer::FileTransfer;
use printlink_rs::print_job::{FailureKind, JobRequest, ModelFormat, Outcome, ShapeParams, WorkflowState};
use printlink_rs::workflow::{BasicMeshValidator, FileModelSource, WorkflowOrchestrator, WorkflowSettings};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Connected channel that hands every published payload to the test.
struct ForwardingChannel {
    connected: AtomicBool,
    tx: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl ControlChannel for ForwardingChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
    async fn publish(&self, payload: Vec<u8>) -> Result<(), DeviceError> {
        let value: Value = serde_json::from_slice(&payload).unwrap();
        let _ = self.tx.send(value);
        Ok(())
    }
}

fn forwarding() -> (Arc<ForwardingChannel>, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(ForwardingChannel {
            connected: AtomicBool::new(true),
            tx,
        }),
        rx,
    )
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_device_times_out_after_one_second() {
    let (channel, _published) = forwarding();
    let protocol = CommandProtocol::new(channel, Duration::from_secs(30));

    let started = Instant::now();
    let err = protocol
        .send(PrinterCommand::Pause.into(), Some(Duration::from_secs(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, DeviceError::Timeout { after, .. } if after == Duration::from_secs(1)));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1) && elapsed < Duration::from_millis(1100));
    assert_eq!(protocol.pending_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_every_request_settles_exactly_once() {
    let (channel, mut published) = forwarding();
    let protocol = Arc::new(CommandProtocol::new(channel, Duration::from_secs(5)));

    // Answer every other command, twice; the duplicate must be ignored.
    let responder = {
        let protocol = protocol.clone();
        tokio::spawn(async move {
            let mut seen = 0usize;
            while let Some(payload) = published.recv().await {
                seen += 1;
                if seen % 2 == 0 {
                    let (domain, id) = extract_correlation_id(&payload).unwrap();
                    let reply = json!({ domain: {"sequence_id": id, "result": "success"} });
                    assert!(protocol.dispatch_reply(&reply).await);
                    assert!(!protocol.dispatch_reply(&reply).await);
                }
            }
        })
    };

    let mut handles = Vec::new();
    for i in 0..20u64 {
        let protocol = protocol.clone();
        handles.push(tokio::spawn(async move {
            protocol
                .send(PrinterCommand::SetSpeed((i % 4) as u8 + 1).into(), Some(Duration::from_secs(1 + i % 3)))
                .await
        }));
    }

    let mut resolved = 0;
    let mut timed_out = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(reply) => {
                assert!(reply.is_success());
                resolved += 1;
            }
            Err(DeviceError::Timeout { .. }) => timed_out += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(resolved, 10);
    assert_eq!(timed_out, 10);
    assert_eq!(protocol.pending_count().await, 0);
    let stats = protocol.get_stats().await;
    assert_eq!(stats.sent, 20);
    assert_eq!(stats.resolved + stats.timed_out, 20);

    responder.abort();
}

#[tokio::test(start_paused = true)]
async fn test_sweep_expires_requests_without_waiting_for_caller() {
    let (channel, _published) = forwarding();
    let protocol = Arc::new(CommandProtocol::new(channel, Duration::from_secs(2)));
    let sender = protocol.clone();
    let handle = tokio::spawn(async move { sender.send(PrinterCommand::Stop.into(), None).await });
    while protocol.pending_count().await == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(protocol.sweep_expired().await, 0);
    tokio::time::advance(Duration::from_secs(2)).await;
    let swept = protocol.sweep_expired().await;
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(DeviceError::Timeout { .. })));
    // Either the sweep or the caller's own timer expired it, never both.
    assert_eq!(protocol.get_stats().await.timed_out, 1);
    assert!(swept <= 1);
}

/// In-memory session that answers commands the way a printer would.
struct LoopbackSession {
    connected: AtomicBool,
    sink: Mutex<Option<Arc<dyn TelemetrySink>>>,
    rules: Mutex<HashMap<String, Value>>,
    published: Mutex<Vec<Value>>,
}

impl LoopbackSession {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            sink: Mutex::new(None),
            rules: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    /// Extra fields merged into the reply to `action`. Without a rule the
    /// session answers `result: success`; `null` means never answer.
    fn on(&self, action: &str, reply: Value) {
        self.rules.lock().unwrap().insert(action.to_string(), reply);
    }

    /// Body of the last published command with this action.
    fn last(&self, action: &str) -> Option<Value> {
        self.published.lock().unwrap().iter().rev().find_map(|p| {
            let body = p.as_object()?.values().next()?;
            (body.get("command")?.as_str()? == action).then(|| body.clone())
        })
    }

    fn actions(&self) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter_map(|p| p.as_object()?.values().next()?.get("command")?.as_str().map(str::to_string))
            .collect()
    }

    async fn push(&self, payload: Value) {
        let sink = self.sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink.on_telemetry("device/SN/report", payload.to_string().as_bytes()).await;
        }
    }
}

#[async_trait]
impl ControlChannel for LoopbackSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&self, payload: Vec<u8>) -> Result<(), DeviceError> {
        let value: Value = serde_json::from_slice(&payload).unwrap();
        self.published.lock().unwrap().push(value.clone());
        let (domain, id) = extract_correlation_id(&value).unwrap();
        let action = value[&domain]["command"].as_str().unwrap_or_default().to_string();
        let rule = self.rules.lock().unwrap().get(&action).cloned();
        let mut body = json!({"command": action, "sequence_id": id, "result": "success"});
        match rule {
            Some(Value::Null) => return Ok(()),
            Some(Value::Object(extra)) => {
                for (k, v) in extra {
                    body[k] = v;
                }
            }
            _ => {}
        }
        self.push(json!({ domain: body })).await;
        Ok(())
    }
}

#[async_trait]
impl DeviceSession for LoopbackSession {
    async fn open(&self, sink: Arc<dyn TelemetrySink>) -> Result<(), DeviceError> {
        self.connected.store(true, Ordering::SeqCst);
        *self.sink.lock().unwrap() = Some(sink.clone());
        sink.on_phase_change(ConnectionPhase::Connected).await;
        Ok(())
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let sink = self.sink.lock().unwrap().take();
        if let Some(sink) = sink {
            sink.on_phase_change(ConnectionPhase::Disconnected).await;
        }
    }
}

fn network_device(session: Arc<LoopbackSession>) -> NetworkDevice {
    let mut config = Config::default();
    config.session.command_timeout_secs = 2;
    let identity = DeviceIdentity::new("127.0.0.1", "code", "SN");
    let transfer = FileTransfer::new(&identity, &config);
    NetworkDevice::with_session(session, transfer, &config)
}

#[tokio::test]
async fn test_connect_requests_full_status() {
    let session = LoopbackSession::new();
    let device = network_device(session.clone());
    device.connect().await.unwrap();
    assert_eq!(session.actions(), vec!["pushall"]);
    assert_eq!(device.get_status().await.connection_phase, ConnectionPhase::Connected);
    // pushall is never registered as pending
    assert_eq!(device.protocol_stats().await.resolved, 0);
    device.disconnect().await;
    assert_eq!(device.get_status().await.connection_phase, ConnectionPhase::Disconnected);
}

#[tokio::test]
async fn test_second_start_is_busy_and_keeps_progress() {
    let session = LoopbackSession::new();
    let device = network_device(session.clone());
    device.connect().await.unwrap();

    device.start_print("cube.3mf").await.unwrap();
    session
        .push(json!({"print": {"gcode_state": "RUNNING", "mc_percent": 37}}))
        .await;
    let before = device.get_status().await;
    assert_eq!(before.print_phase, PrintPhase::Printing);

    let err = device.start_print("other.3mf").await.unwrap_err();
    assert!(matches!(err, DeviceError::Busy(_)));
    assert_eq!(device.get_status().await, before);
    assert_eq!(session.actions(), vec!["pushall", "project_file"]);
    device.disconnect().await;
}

#[tokio::test]
async fn test_refusal_maps_to_rejected() {
    let session = LoopbackSession::new();
    session.on("pause", json!({"result": "fail", "reason": "not printing"}));
    let device = network_device(session);
    device.connect().await.unwrap();
    match device.pause().await {
        Err(DeviceError::Rejected(reason)) => assert_eq!(reason, "not printing"),
        other => panic!("expected rejection, got {other:?}"),
    }
    device.disconnect().await;
}

#[tokio::test]
async fn test_stop_stays_cancelled_when_device_reports_failure() {
    let session = LoopbackSession::new();
    let device = network_device(session.clone());
    device.connect().await.unwrap();
    device.start_print("cube.3mf").await.unwrap();
    device.stop().await.unwrap();
    session.push(json!({"print": {"gcode_state": "FAILED"}})).await;
    assert_eq!(device.get_status().await.print_phase, PrintPhase::Cancelled);
    device.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_fails_pending_commands() {
    let session = LoopbackSession::new();
    session.on("resume", Value::Null);
    let device = Arc::new(network_device(session));
    device.connect().await.unwrap();

    let pending = {
        let device = device.clone();
        tokio::spawn(async move { device.resume().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    device.disconnect().await;

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(DeviceError::NotConnected)));
    assert_eq!(device.protocol_stats().await.failed, 1);
}

#[tokio::test]
async fn test_commands_need_a_connection() {
    let device = network_device(LoopbackSession::new());
    assert!(matches!(device.pause().await, Err(DeviceError::NotConnected)));
}

#[tokio::test]
async fn test_session_stays_open_until_last_caller_disconnects() {
    let session = LoopbackSession::new();
    let device = network_device(session.clone());
    device.connect().await.unwrap();
    device.connect().await.unwrap();
    // The second caller joins the open session.
    assert_eq!(session.actions(), vec!["pushall"]);

    device.disconnect().await;
    assert_eq!(device.get_status().await.connection_phase, ConnectionPhase::Connected);
    device.pause().await.unwrap();

    device.disconnect().await;
    assert_eq!(device.get_status().await.connection_phase, ConnectionPhase::Disconnected);
    assert!(matches!(device.pause().await, Err(DeviceError::NotConnected)));

    // Sessions without a broker link report no link counters.
    assert_eq!(device.link_stats(), LinkStats::default());
}

#[tokio::test]
async fn test_fan_filament_and_calibration_commands() {
    let session = LoopbackSession::new();
    let device = network_device(session.clone());
    device.connect().await.unwrap();

    device.set_fan_speed(Fan::Chamber, 100).await.unwrap();
    assert_eq!(session.last("gcode_line").unwrap()["param"], "M106 P3 S255");
    let err = device.set_fan_speed(Fan::Part, 101).await.unwrap_err();
    assert!(matches!(err, DeviceError::InvalidState(_)));

    session.push(json!({"print": {"nozzle_temper": 212.6}})).await;
    device.change_filament(5).await.unwrap();
    let change = session.last("ams_change_filament").unwrap();
    assert_eq!(change["target"], 5);
    assert_eq!(change["curr_temp"], 212);
    assert_eq!(change["tar_temp"], 220);
    assert!(matches!(device.change_filament(16).await, Err(DeviceError::InvalidState(_))));

    let nothing = CalibrationOptions {
        bed_leveling: false,
        vibration: false,
        motor_noise: false,
    };
    assert!(matches!(device.calibrate(nothing).await, Err(DeviceError::InvalidState(_))));
    device.calibrate(CalibrationOptions::default()).await.unwrap();
    assert_eq!(session.last("calibration").unwrap()["option"], "bed_leveling");

    // Refused locally, never published.
    assert_eq!(
        session.actions(),
        vec!["pushall", "gcode_line", "ams_change_filament", "calibration"]
    );
    device.disconnect().await;
}

const ASCII_STL: &str = "solid m\nfacet normal 0 0 1\nouter loop\nvertex 0 0 0\nvertex 1 0 0\nvertex 0 1 0\nendloop\nendfacet\nendsolid m\n";

/// A network printer whose files are already in storage: uploads only name them.
struct StoredFilePrinter {
    device: NetworkDevice,
}

#[async_trait]
impl DeviceFacade for StoredFilePrinter {
    async fn connect(&self) -> Result<(), DeviceError> {
        self.device.connect().await
    }
    async fn disconnect(&self) {
        self.device.disconnect().await
    }
    async fn upload_file(&self, path: &std::path::Path, _size_hint: Option<u64>) -> Result<String, DeviceError> {
        remote_file_name(path)
    }
    async fn start_print(&self, filename: &str) -> Result<(), DeviceError> {
        self.device.start_print(filename).await
    }
    async fn pause(&self) -> Result<(), DeviceError> {
        self.device.pause().await
    }
    async fn resume(&self) -> Result<(), DeviceError> {
        self.device.resume().await
    }
    async fn stop(&self) -> Result<(), DeviceError> {
        self.device.stop().await
    }
    async fn get_status(&self) -> PrinterState {
        self.device.get_status().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_does_not_wait_for_unconfirmed_stop() {
    let session = LoopbackSession::new();
    session.on("stop", Value::Null);
    let printer = Arc::new(StoredFilePrinter {
        device: network_device(session.clone()),
    });
    let dir = tempfile::tempdir().unwrap();
    let model = dir.path().join("cube.stl");
    std::fs::write(&model, ASCII_STL).unwrap();

    let orchestrator = WorkflowOrchestrator::new(
        printer.clone(),
        Arc::new(FileModelSource::new()),
        Arc::new(BasicMeshValidator),
        WorkflowSettings {
            poll_interval: Duration::from_secs(1),
            monitor_timeout: None,
            stop_timeout: Duration::from_millis(300),
        },
    );
    let cancel = orchestrator.cancel_handle();
    let request = JobRequest::new(ShapeParams::from_file(model.clone()), ModelFormat::Stl).with_start(true);

    let started = Instant::now();
    let (result, _) = tokio::join!(orchestrator.run(request), async {
        tokio::time::sleep(Duration::from_secs(2)).await;
        cancel.cancel();
    });
    let elapsed = started.elapsed();

    assert_eq!(result.outcome, Outcome::Failed);
    let error = result.error.unwrap();
    assert_eq!(error.kind, FailureKind::Cancelled);
    assert_eq!(error.phase, WorkflowState::Monitoring);
    assert_eq!(session.actions(), vec!["pushall", "project_file", "stop"]);
    // Bounded by the stop timeout, not the 2 s command timeout.
    assert!(elapsed >= Duration::from_millis(2_300) && elapsed < Duration::from_millis(2_500), "{elapsed:?}");
    assert_eq!(printer.get_status().await.connection_phase, ConnectionPhase::Disconnected);
}
