//! Printer commands and their wire payloads.
//!
//! Every command is a `{domain: {command, sequence_id, ...params}}` JSON object
//! published on `device/{serial}/request`. Replies arrive on the report topic and
//! echo the same `sequence_id` inside the same domain object.

use serde_json::{Map, Value};

/// Structured command: `{domain, action, params}`. The correlation id is attached
/// when the command is sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub domain: String,
    pub action: String,
    pub params: Map<String, Value>,
}

impl Command {
    pub fn new(domain: &str, action: &str) -> Self {
        Self {
            domain: domain.to_string(),
            action: action.to_string(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Wire payload with `correlation_id` embedded as `sequence_id`.
    pub fn to_payload(&self, correlation_id: &str) -> Value {
        let mut body = self.params.clone();
        body.insert("command".to_string(), Value::String(self.action.clone()));
        body.insert(
            "sequence_id".to_string(),
            Value::String(correlation_id.to_string()),
        );
        let mut root = Map::new();
        root.insert(self.domain.clone(), Value::Object(body));
        Value::Object(root)
    }
}

/// Reply to a command, matched by correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub correlation_id: String,
    pub domain: String,
    pub body: Value,
}

impl Reply {
    /// Devices report `result: "fail"` on refusal. A missing result counts as success.
    pub fn is_success(&self) -> bool {
        match self.body.get("result").and_then(Value::as_str) {
            Some(result) => !matches!(result.to_ascii_lowercase().as_str(), "fail" | "failed" | "error"),
            None => true,
        }
    }

    pub fn failure_reason(&self) -> String {
        self.body
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} {} failed", self.domain, self.action()))
    }

    pub fn action(&self) -> &str {
        self.body.get("command").and_then(Value::as_str).unwrap_or("unknown")
    }
}

/// Find the `(domain, correlation id)` carried by a report payload, if any.
pub fn extract_correlation_id(payload: &Value) -> Option<(String, String)> {
    let object = payload.as_object()?;
    object.iter().find_map(|(domain, body)| {
        let id = match body.get("sequence_id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some((domain.clone(), id))
    })
}

/// Fans addressable through `M106 P<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fan {
    Part,
    Aux,
    Chamber,
}

impl Fan {
    fn index(self) -> u8 {
        match self {
            Fan::Part => 1,
            Fan::Aux => 2,
            Fan::Chamber => 3,
        }
    }
}

/// Calibration routines to run. At least one must be selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationOptions {
    pub bed_leveling: bool,
    pub vibration: bool,
    pub motor_noise: bool,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            bed_leveling: true,
            vibration: false,
            motor_noise: false,
        }
    }
}

impl CalibrationOptions {
    pub fn selected(&self) -> Vec<&'static str> {
        let mut options = Vec::new();
        if self.bed_leveling {
            options.push("bed_leveling");
        }
        if self.vibration {
            options.push("vibration");
        }
        if self.motor_noise {
            options.push("motor_noise");
        }
        options
    }

    pub fn is_empty(&self) -> bool {
        !(self.bed_leveling || self.vibration || self.motor_noise)
    }
}

/// Command to send to the printer.
#[derive(Debug, Clone)]
pub enum PrinterCommand {
    /// Request a full status push. The device answers with telemetry, not a reply.
    PushAll,
    /// Start printing a file already in device storage.
    ProjectFile {
        /// Path in device storage, e.g. `/cache/cube.3mf`.
        remote_path: String,
        plate_index: u32,
        use_ams: bool,
        bed_leveling: bool,
    },
    Pause,
    Resume,
    Stop,
    /// Speed level 1-4, clamped.
    SetSpeed(u8),
    SetNozzleTemp(u32),
    SetBedTemp(u32),
    GcodeLine(String),
    ChamberLight(bool),
    /// Fan speed in percent, clamped to 100.
    SetFan { fan: Fan, percent: u8 },
    /// Feed filament from a global AMS slot (`unit * 4 + tray`).
    AmsChangeFilament {
        target_slot: u32,
        current_temp: u32,
        target_temp: u32,
    },
    Calibrate(CalibrationOptions),
}

impl PrinterCommand {
    pub fn into_command(self) -> Command {
        match self {
            PrinterCommand::PushAll => Command::new("pushing", "pushall"),
            PrinterCommand::ProjectFile {
                remote_path,
                plate_index,
                use_ams,
                bed_leveling,
            } => {
                let name = remote_path
                    .rsplit('/')
                    .next()
                    .unwrap_or(remote_path.as_str())
                    .to_string();
                Command::new("print", "project_file")
                    .with_param("param", format!("Metadata/plate_{}.gcode", plate_index.max(1)))
                    .with_param("subtask_name", name)
                    .with_param("url", format!("file://{}", remote_path))
                    .with_param("bed_type", "auto")
                    .with_param("timelapse", false)
                    .with_param("bed_leveling", bed_leveling)
                    .with_param("flow_cali", false)
                    .with_param("vibration_cali", false)
                    .with_param("layer_inspect", false)
                    .with_param("use_ams", use_ams)
                    .with_param("profile_id", "0")
                    .with_param("project_id", "0")
                    .with_param("subtask_id", "0")
                    .with_param("task_id", "0")
            }
            PrinterCommand::Pause => Command::new("print", "pause"),
            PrinterCommand::Resume => Command::new("print", "resume"),
            PrinterCommand::Stop => Command::new("print", "stop"),
            PrinterCommand::SetSpeed(level) => {
                Command::new("print", "print_speed").with_param("param", level.clamp(1, 4).to_string())
            }
            PrinterCommand::SetNozzleTemp(temp) => {
                Command::new("print", "gcode_line").with_param("param", format!("M104 S{}", temp))
            }
            PrinterCommand::SetBedTemp(temp) => {
                Command::new("print", "gcode_line").with_param("param", format!("M140 S{}", temp))
            }
            PrinterCommand::GcodeLine(gcode) => {
                Command::new("print", "gcode_line").with_param("param", gcode)
            }
            PrinterCommand::ChamberLight(on) => Command::new("system", "ledctrl")
                .with_param("led_node", "chamber_light")
                .with_param("led_mode", if on { "on" } else { "off" })
                .with_param("led_on_time", 500)
                .with_param("led_off_time", 500)
                .with_param("loop_times", 0)
                .with_param("interval_time", 0),
            PrinterCommand::SetFan { fan, percent } => {
                let speed = percent.min(100) as u32 * 255 / 100;
                Command::new("print", "gcode_line")
                    .with_param("param", format!("M106 P{} S{}", fan.index(), speed))
            }
            PrinterCommand::AmsChangeFilament {
                target_slot,
                current_temp,
                target_temp,
            } => Command::new("print", "ams_change_filament")
                .with_param("target", target_slot)
                .with_param("curr_temp", current_temp)
                .with_param("tar_temp", target_temp),
            PrinterCommand::Calibrate(options) => {
                // A single routine goes as a string, several as a list.
                let selected = options.selected();
                let option = match selected.as_slice() {
                    [single] => Value::from(*single),
                    _ => Value::from(selected),
                };
                Command::new("print", "calibration").with_param("option", option)
            }
        }
    }

    /// Whether the device answers this command with a correlated reply.
    pub fn expects_reply(&self) -> bool {
        !matches!(self, PrinterCommand::PushAll)
    }
}

impl From<PrinterCommand> for Command {
    fn from(command: PrinterCommand) -> Self {
        command.into_command()
    }
}

/// Report-topic name for a device.
pub fn report_topic(serial: &str) -> String {
    format!("device/{}/report", serial)
}

/// Request-topic name for a device.
pub fn request_topic(serial: &str) -> String {
    format!("device/{}/request", serial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_push_all_command() {
        let payload = PrinterCommand::PushAll.into_command().to_payload("7");
        assert_eq!(payload["pushing"]["command"].as_str(), Some("pushall"));
        assert_eq!(payload["pushing"]["sequence_id"].as_str(), Some("7"));
        assert!(!PrinterCommand::PushAll.expects_reply());
    }

    #[test]
    fn test_pause_command() {
        let payload = PrinterCommand::Pause.into_command().to_payload("abc");
        assert_eq!(payload["print"]["command"].as_str(), Some("pause"));
        assert_eq!(extract_correlation_id(&payload), Some(("print".into(), "abc".into())));
    }

    #[test]
    fn test_project_file_points_at_remote_path() {
        let cmd = PrinterCommand::ProjectFile {
            remote_path: "/cache/cube.3mf".into(),
            plate_index: 1,
            use_ams: false,
            bed_leveling: true,
        }
        .into_command();
        assert_eq!(cmd.domain, "print");
        assert_eq!(cmd.params["url"], "file:///cache/cube.3mf");
        assert_eq!(cmd.params["subtask_name"], "cube.3mf");
        assert_eq!(cmd.params["bed_leveling"], true);
    }

    #[test]
    fn test_speed_is_clamped() {
        let cmd = PrinterCommand::SetSpeed(9).into_command();
        assert_eq!(cmd.params["param"], "4");
    }

    #[test]
    fn test_fan_speed_scales_to_pwm() {
        let cmd = PrinterCommand::SetFan { fan: Fan::Aux, percent: 50 }.into_command();
        assert_eq!(cmd.action, "gcode_line");
        assert_eq!(cmd.params["param"], "M106 P2 S127");
        let cmd = PrinterCommand::SetFan { fan: Fan::Part, percent: 250 }.into_command();
        assert_eq!(cmd.params["param"], "M106 P1 S255");
    }

    #[test]
    fn test_ams_change_filament_payload() {
        let payload = PrinterCommand::AmsChangeFilament {
            target_slot: 5,
            current_temp: 215,
            target_temp: 220,
        }
        .into_command()
        .to_payload("9");
        assert_eq!(payload["print"]["command"], "ams_change_filament");
        assert_eq!(payload["print"]["target"], 5);
        assert_eq!(payload["print"]["curr_temp"], 215);
        assert_eq!(payload["print"]["tar_temp"], 220);
    }

    #[test]
    fn test_calibration_option_shape() {
        let single = PrinterCommand::Calibrate(CalibrationOptions::default()).into_command();
        assert_eq!(single.params["option"], json!("bed_leveling"));

        let several = PrinterCommand::Calibrate(CalibrationOptions {
            bed_leveling: false,
            vibration: true,
            motor_noise: true,
        })
        .into_command();
        assert_eq!(several.params["option"], json!(["vibration", "motor_noise"]));

        let none = CalibrationOptions {
            bed_leveling: false,
            vibration: false,
            motor_noise: false,
        };
        assert!(none.is_empty());
    }

    #[test]
    fn test_reply_failure_reason() {
        let reply = Reply {
            correlation_id: "1".into(),
            domain: "print".into(),
            body: json!({"command": "pause", "result": "fail", "reason": "not printing"}),
        };
        assert!(!reply.is_success());
        assert_eq!(reply.failure_reason(), "not printing");

        let ok = Reply {
            correlation_id: "2".into(),
            domain: "print".into(),
            body: json!({"command": "resume", "result": "success"}),
        };
        assert!(ok.is_success());
    }

    #[test]
    fn test_numeric_sequence_id_is_extracted() {
        let payload = json!({"print": {"sequence_id": 42, "command": "push_status"}});
        assert_eq!(extract_correlation_id(&payload), Some(("print".into(), "42".into())));
        assert_eq!(extract_correlation_id(&json!({"print": {"mc_percent": 3}})), None);
    }

    #[test]
    fn test_topics() {
        assert_eq!(report_topic("SN1"), "device/SN1/report");
        assert_eq!(request_topic("SN1"), "device/SN1/request");
    }
}
