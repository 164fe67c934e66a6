use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// Most probes any hardware variant carries on the one-wire bus.
pub const MAX_PROBES: usize = 3;

/// Sentinel stored in place of a missing or failed reading. Never forwarded
/// to actuators and never compared as a temperature.
pub const PROBE_FAULT_C: f32 = -999.0;

pub fn is_fault(reading: f32) -> bool {
    reading == PROBE_FAULT_C
}

/// Maps a normalized servo position (0-100) onto the 0-180 degree output
/// domain of the PWM driver.
pub fn servo_angle(position: u8) -> u8 {
    let position = position.min(100) as u16;
    (position * 180 / 100) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting { attempt: u8, max: u8 },
    Up(Ipv4Addr),
    Down,
}

impl LinkState {
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up(_))
    }

    pub fn status_line(self) -> String {
        match self {
            Self::Connecting { attempt, max } => format!("attempt {attempt}/{max}"),
            Self::Up(ip) => ip.to_string(),
            Self::Down => "offline".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportOutcome {
    #[default]
    Pending,
    Sent(u16),
    Failed,
}

impl ReportOutcome {
    pub fn status_line(self) -> String {
        match self {
            Self::Pending => "--".to_string(),
            Self::Sent(code) => format!("OK ({code})"),
            Self::Failed => "ERR".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollOutcome {
    #[default]
    Pending,
    Received,
    Failed,
}

impl PollOutcome {
    pub fn status_line(self) -> String {
        match self {
            Self::Pending => "--".to_string(),
            Self::Received => "OK".to_string(),
            Self::Failed => "ERR".to_string(),
        }
    }
}

/// Body of `POST /api/esp32/data`. Probe fields beyond the profile's slot
/// count are omitted entirely, matching the per-variant payloads the backend
/// accepts.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TelemetryPayload {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature1: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature2: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature3: Option<f32>,
    #[serde(rename = "sensorCount")]
    pub sensor_count: usize,
    pub status: &'static str,
}

/// One element of the poll response's `commands` array, kept raw so an
/// unrecognized `type` fails per command instead of per batch.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Command {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    PowerOn,
    PowerOff,
    /// Normalized position in 0-100, already truncated toward zero.
    SetServo(u8),
}

impl Command {
    pub fn decode(&self) -> Result<CommandAction, DeviceError> {
        match self.kind.as_str() {
            "power_on" => Ok(CommandAction::PowerOn),
            "power_off" => Ok(CommandAction::PowerOff),
            "servo" => {
                let value = self.value.ok_or_else(|| DeviceError::Malformed {
                    reason: format!("servo command {} without value", self.id),
                })?;
                Ok(CommandAction::SetServo(normalize_servo_value(value)))
            }
            _ => Err(DeviceError::UnknownCommand {
                id: self.id,
                kind: self.kind.clone(),
            }),
        }
    }

    pub fn describe(&self) -> String {
        match self.value {
            Some(value) => format!("{} {}", self.kind, value.trunc() as i64),
            None => self.kind.clone(),
        }
    }
}

fn normalize_servo_value(value: f64) -> u8 {
    let value = value.trunc();
    if value <= 0.0 {
        0
    } else if value >= 100.0 {
        100
    } else {
        value as u8
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CommandBatch {
    pub commands: Vec<Command>,
}

impl CommandBatch {
    /// A missing or malformed `commands` field is a reported, non-fatal
    /// error rather than an empty batch.
    pub fn parse(body: &str) -> Result<Vec<Command>, DeviceError> {
        serde_json::from_str::<Self>(body)
            .map(|batch| batch.commands)
            .map_err(|err| DeviceError::Malformed {
                reason: err.to_string(),
            })
    }
}

/// Body of `POST /api/esp32/commands/ack`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CommandAck {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "commandId")]
    pub command_id: i64,
    pub status: &'static str,
}

impl CommandAck {
    pub fn new(device_id: &str, command_id: i64) -> Self {
        Self {
            device_id: device_id.to_string(),
            command_id,
            status: "OK",
        }
    }
}

/// Everything the display needs, decoupled from the agent's internals.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub readings: [f32; MAX_PROBES],
    pub probe_slots: usize,
    pub probe_count: usize,
    pub power: Option<bool>,
    pub servo_position: Option<u8>,
    pub link: LinkState,
    pub telemetry: ReportOutcome,
    pub poll: PollOutcome,
    pub last_command: Option<String>,
    pub last_error: Option<String>,
}
