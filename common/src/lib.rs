pub mod agent;
pub mod config;
pub mod display;
pub mod error;
pub mod types;

pub use agent::{ActuatorAction, CommandSink, DeviceAgent};
pub use config::{AgentConfig, DeviceProfile, NetworkConfig, RuntimeConfig};
pub use error::DeviceError;
pub use types::{
    is_fault, servo_angle, Command, CommandAck, CommandAction, CommandBatch, LinkState,
    PollOutcome, ReportOutcome, StatusSnapshot, TelemetryPayload, MAX_PROBES, PROBE_FAULT_C,
};
