use crate::model::{CommandStatus, DeviceId};
use thiserror::Error;

/// Failures at the bus adapter boundary.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("broker disconnected")]
    Disconnected,
    #[error("offline buffer overflow, dropped oldest message")]
    BufferOverflow,
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("payload rejected by {topic} schema: {reason}")]
    SchemaViolation { topic: String, reason: String },
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures inside the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("command {0} not found")]
    CommandNotFound(i64),
    #[error("slot {0} not found")]
    SlotNotFound(String),
    #[error("carrier {0} not found")]
    CarrierNotFound(i64),
    #[error("claim conflict on command {0}")]
    ClaimConflict(i64),
    #[error("command {id} is terminal ({status:?}), refusing update")]
    TerminalRow { id: i64, status: CommandStatus },
    #[error("invalid status transition {from:?} -> {to:?} on command {id}")]
    InvalidTransition {
        id: i64,
        from: CommandStatus,
        to: CommandStatus,
    },
    #[error("carrier {carrier} already locked by command {owner}")]
    CarrierLocked { carrier: i64, owner: i64 },
    #[error("invariant violation: {0}")]
    Invariant(String),
}

/// Failures that terminate a single command's execution. These never
/// propagate past the command's driver task.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("operation `{op}` timed out after {timeout_ms} ms")]
    OpTimeout { op: String, timeout_ms: u64 },
    #[error("command deadline exceeded")]
    DeadlineExceeded,
    #[error("device {0} reported ERROR status")]
    DeviceError(DeviceId),
    #[error("EMERGENCY_STOP")]
    EmergencyStop,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("bus: {0}")]
    Bus(#[from] BusError),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

/// Configuration failures, raised once at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
    #[error("{var} must be positive")]
    NonPositive { var: &'static str },
}
