//! BLE Connection Module
//!
//! Connection parameters and the characteristic lookup performed once
//! services have been discovered.

use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{GattCharacteristic, GattService};
use std::time::Duration;
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Advertised name the scan must match exactly
    pub device_name: String,
    /// Telemetry (notify) characteristic UUID
    pub telemetry_char_uuid: Uuid,
    /// Config (write) characteristic UUID
    pub config_char_uuid: Uuid,
    /// How long a scan runs before giving up
    pub scan_timeout: Duration,
    /// Settle delay between a scan match and the connect request
    pub connect_delay: Duration,
    /// Give up on service discovery after this long. `None` waits forever.
    pub discovery_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_name: protocol::DEVICE_NAME.to_string(),
            telemetry_char_uuid: protocol::TELEMETRY_CHAR_UUID,
            config_char_uuid: protocol::CONFIG_CHAR_UUID,
            scan_timeout: Duration::from_millis(10_000),
            connect_delay: Duration::from_millis(500),
            discovery_timeout: Some(Duration::from_millis(5_000)),
        }
    }
}

impl From<&Settings> for ConnectionConfig {
    fn from(s: &Settings) -> Self {
        Self {
            device_name: s.device_name.clone(),
            telemetry_char_uuid: s.telemetry_char_uuid,
            config_char_uuid: s.config_char_uuid,
            scan_timeout: Duration::from_millis(s.scan_timeout_ms),
            connect_delay: Duration::from_millis(s.connect_delay_ms),
            discovery_timeout: s.discovery_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// The two data channels bound to a ready connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSet {
    pub telemetry: GattCharacteristic,
    pub config: GattCharacteristic,
}

/// Channels found so far while discovery is still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartialChannels {
    pub telemetry: Option<GattCharacteristic>,
    pub config: Option<GattCharacteristic>,
}

impl PartialChannels {
    /// Look up both characteristics across every discovered service
    pub fn locate(services: &[GattService], config: &ConnectionConfig) -> Self {
        let mut found = Self::default();
        for characteristic in services.iter().flat_map(|s| s.characteristics.iter()) {
            if characteristic.uuid == config.telemetry_char_uuid {
                found.telemetry = Some(*characteristic);
            } else if characteristic.uuid == config.config_char_uuid {
                found.config = Some(*characteristic);
            }
        }
        found
    }

    pub fn complete(&self) -> Option<ChannelSet> {
        Some(ChannelSet {
            telemetry: self.telemetry?,
            config: self.config?,
        })
    }

    /// Human readable list of what is still missing
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.telemetry.is_none() {
            missing.push("telemetry");
        }
        if self.config.is_none() {
            missing.push("config");
        }
        missing
    }
}
