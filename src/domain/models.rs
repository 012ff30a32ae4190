use std::fmt;

/// A discovered peripheral: opaque transport address plus advertised name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralIdentity {
    pub address: u64,
    pub name: String,
}

/// Why the link left a connected or connecting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Status code reported by the transport with the disconnect event
    Status(i32),
    /// The transport refused to start the connect attempt
    ConnectRejected,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "Code {}", code),
            Self::ConnectRejected => write!(f, "connect rejected"),
        }
    }
}

/// Public view of the link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Ready,
    Disconnected(DisconnectReason),
}

impl LinkState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::Ready => write!(f, "Connected"),
            Self::Disconnected(reason) => write!(f, "Disconnected ({})", reason),
        }
    }
}

/// Decoded robot stats notification.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TelemetrySample {
    pub rpm: f32,
    pub battery_voltage: f32,
}

/// Raw phone accelerometer reading in m/s^2.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AccelSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Commanded drive state, encoded as the frame's direction byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TranslateDirection {
    #[default]
    Idle = 0,
    Forward = 1,
    Reverse = 2,
}

impl TranslateDirection {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Idle),
            1 => Some(Self::Forward),
            2 => Some(Self::Reverse),
            _ => None,
        }
    }
}

impl fmt::Display for TranslateDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Forward => write!(f, "FORWARD"),
            Self::Reverse => write!(f, "REVERSE"),
        }
    }
}

/// Events delivered from the link driver to whatever owns the display.
#[derive(Debug, Clone)]
pub enum AppEvent {
    LinkState(LinkState),
    Telemetry(TelemetrySample),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn new(message: impl Into<String>, severity: MessageSeverity) -> Self {
        Self {
            message: message.into(),
            severity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
