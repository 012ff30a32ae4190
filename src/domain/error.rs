//! Error taxonomy for the link and the wire protocol.

use crate::domain::models::MessageSeverity;
use thiserror::Error;

/// Refusals reported synchronously by a transport when asked to start work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("no usable Bluetooth adapter: {0}")]
    AdapterUnavailable(String),
    #[error("transport refused the operation: {0}")]
    Refused(String),
    #[error("unknown connection handle {0}")]
    UnknownConnection(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Bluetooth permission denied")]
    PermissionDenied,
    #[error("Bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("Scan timed out.")]
    ScanTimeout,
    #[error("Discovery incomplete: robot characteristics not found")]
    DiscoveryIncomplete,
    #[error("config write rejected: {0}")]
    WriteRejected(String),
    #[error("link dropped unexpectedly (code {0})")]
    DisconnectedUnexpectedly(i32),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl LinkError {
    /// Severity used when the error is surfaced as a status message.
    pub fn severity(&self) -> MessageSeverity {
        match self {
            Self::PermissionDenied | Self::TransportUnavailable(_) => MessageSeverity::Error,
            _ => MessageSeverity::Warning,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid frame length: expected {expected}, got {actual}")]
    FrameLength { expected: usize, actual: usize },
    #[error("telemetry payload too short: {0} bytes")]
    TelemetryTooShort(usize),
    #[error("invalid translate direction byte {0}")]
    InvalidDirection(u8),
}
