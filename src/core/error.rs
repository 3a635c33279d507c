//! Core Errors
//!
//! Named failure conditions of the heart rate session. Platform failures that do not map
//! onto one of these travel as `anyhow::Error` and end up in [`HrpError::SetupException`].
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HrpError {
    /// The characteristic is absent or the configured index is out of range.
    #[error("characteristic {uuid} not found at index {index}")]
    CharacteristicNotFound { uuid: Uuid, index: usize },

    /// The notification configuration write could not reach the device.
    #[error("device unreachable")]
    DeviceUnreachable,

    /// The payload is shorter than its flags imply.
    #[error("decode failure: {0}")]
    DecodeFailure(String),

    /// No accepted sample within the active watchdog threshold.
    #[error("watchdog timeout: {0}")]
    WatchdogTimeout(String),

    /// Configuration mutated while not stopped, or incompatible monitor.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Any other platform failure during the subscription handshake.
    #[error("setup failed: {0}")]
    SetupException(String),

    #[error("link encryption not supported")]
    EncryptionNotSupported,

    #[error("no device assigned")]
    NoDevice,
}

impl HrpError {
    pub(crate) fn invalid_while_active(what: &str) -> Self {
        HrpError::InvalidOperation(format!("{} cannot be changed while the monitor is active", what))
    }
}
