//! GATT Transport Boundary
//!
//! Everything below scan / connect / discover / read / write / notify is
//! owned by a platform backend. Operations only *start* work; completions
//! come back as [`TransportEvent`]s on the link channel, so every effect
//! is applied on the link driver's single execution context.

use crate::domain::error::TransportError;
use crate::domain::models::PeripheralIdentity;
use std::fmt;
use uuid::Uuid;

/// GATT status code for a successful operation
pub const GATT_SUCCESS: i32 = 0;

/// Transport-level handle for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u32);

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A characteristic located during service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattConnectionState {
    Connected,
    Disconnected,
}

/// Asynchronous completions and callbacks raised by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    DeviceDiscovered(PeripheralIdentity),
    ConnectionStateChanged {
        connection: ConnectionHandle,
        status: i32,
        state: GattConnectionState,
    },
    ServicesDiscovered {
        connection: ConnectionHandle,
        status: i32,
        services: Vec<GattService>,
    },
    CharacteristicWritten {
        connection: ConnectionHandle,
        characteristic: Uuid,
        status: i32,
    },
    Notification {
        connection: ConnectionHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    /// Connection this event belongs to, if it is connection scoped.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        match self {
            Self::DeviceDiscovered(_) => None,
            Self::ConnectionStateChanged { connection, .. }
            | Self::ServicesDiscovered { connection, .. }
            | Self::CharacteristicWritten { connection, .. }
            | Self::Notification { connection, .. } => Some(*connection),
        }
    }
}

/// Platform GATT central operations.
///
/// Implementations must not be invoked concurrently; the link driver owns
/// the transport and calls it from one task only.
pub trait GattTransport: Send {
    /// Whether the platform radio permission is currently granted.
    fn has_permission(&self) -> bool;

    /// Begin discovery. Matches are reported as `DeviceDiscovered`.
    fn start_scan(&mut self, name_filter: Option<&str>) -> Result<(), TransportError>;

    fn stop_scan(&mut self);

    /// Request a connection. The result arrives as `ConnectionStateChanged`.
    fn connect(&mut self, peripheral: &PeripheralIdentity)
        -> Result<ConnectionHandle, TransportError>;

    /// Request service discovery. The result arrives as `ServicesDiscovered`.
    fn discover_services(&mut self, connection: ConnectionHandle) -> Result<(), TransportError>;

    /// Enable notifications and write the CCC descriptor. Returns whether the
    /// request was accepted.
    fn enable_notification(
        &mut self,
        connection: ConnectionHandle,
        characteristic: &GattCharacteristic,
    ) -> bool;

    /// Start a characteristic write. Completion arrives as `CharacteristicWritten`.
    fn write_characteristic(
        &mut self,
        connection: ConnectionHandle,
        characteristic: &GattCharacteristic,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Request a disconnect. The result arrives as `ConnectionStateChanged`.
    fn disconnect(&mut self, connection: ConnectionHandle);

    /// Release the connection object after it has disconnected.
    fn close(&mut self, connection: ConnectionHandle);
}
