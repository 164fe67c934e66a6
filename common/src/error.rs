use thiserror::Error;

/// Recoverable faults. Each one overwrites the state's last-error slot and
/// the cycle continues; nothing here aborts the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("link down")]
    LinkDown,
    #[error("send failed: {reason}")]
    Transport { reason: String },
    #[error("server rejected (HTTP {status})")]
    Rejected { status: u16 },
    #[error("bad payload: {reason}")]
    Malformed { reason: String },
    #[error("unknown command `{kind}` (id {id})")]
    UnknownCommand { id: i64, kind: String },
    #[error("actuator fault: {reason}")]
    Actuator { reason: String },
}
