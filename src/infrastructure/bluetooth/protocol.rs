//! MeltyBLE Protocol
//!
//! Wire formats exchanged with the robot over the MeltyBLE GATT service:
//! the config frame written by the controller and the stats notification
//! pushed back by the robot.

use crate::domain::error::ProtocolError;
use crate::domain::models::{TelemetrySample, TranslateDirection};
use uuid::Uuid;

/// Advertised name of the robot
pub const DEVICE_NAME: &str = "Melty_Bot";

/// MeltyBLE primary service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x00001523_1212_efde_1523_785feabcd123);

/// Stats characteristic - robot pushes telemetry here (read, notify)
pub const TELEMETRY_CHAR_UUID: Uuid = Uuid::from_u128(0x00001524_1212_efde_1523_785feabcd123);

/// Config characteristic - controller writes config frames here (write)
pub const CONFIG_CHAR_UUID: Uuid = Uuid::from_u128(0x00001525_1212_efde_1523_785feabcd123);

/// Client characteristic configuration descriptor used to enable notifications
pub const CCC_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Size of an encoded config frame
pub const CONFIG_FRAME_LEN: usize = 6;

/// Minimum size of a stats notification
pub const TELEMETRY_MIN_LEN: usize = 3;

/// Radius is sent as fixed point with this scale
pub const RADIUS_SCALE: f32 = 1000.0;

/// Heading offsets live on a ring of this size (0-99)
pub const HEADING_RANGE: u8 = 100;

/// Largest meaningful throttle value
pub const THROTTLE_MAX: u8 = 100;

/// Heartbeat marker cycles through FIRST..=LAST
pub const HEARTBEAT_FIRST: u8 = 10;
pub const HEARTBEAT_LAST: u8 = 13;

/// Convert a radius in cm to the u16 fixed-point wire value.
///
/// Out of range values saturate, NaN encodes as 0.
pub fn radius_to_fixed(radius_cm: f32) -> u16 {
    (radius_cm * RADIUS_SCALE)
        .round()
        .clamp(0.0, u16::MAX as f32) as u16
}

pub fn fixed_to_radius(fixed: u16) -> f32 {
    fixed as f32 / RADIUS_SCALE
}

/// One control tick's intent, ready to be written to the config characteristic.
///
/// # Frame Structure (6 bytes)
///
/// ```text
/// [0-1] : Radius in cm x1000 (u16 little-endian)
/// [2]   : Heading LED offset (0-99)
/// [3]   : Throttle (0-100)
/// [4]   : Translate direction (0 idle, 1 forward, 2 reverse)
/// [5]   : Heartbeat marker (10-13)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigFrame {
    radius_fixed: u16,
    heading_offset: u8,
    throttle: u8,
    direction: TranslateDirection,
    heartbeat: u8,
}

impl ConfigFrame {
    /// Build a frame, wrapping the heading onto its ring and capping the throttle.
    pub fn new(
        radius_cm: f32,
        heading_offset: u8,
        throttle: u8,
        direction: TranslateDirection,
        heartbeat: u8,
    ) -> Self {
        Self {
            radius_fixed: radius_to_fixed(radius_cm),
            heading_offset: heading_offset % HEADING_RANGE,
            throttle: throttle.min(THROTTLE_MAX),
            direction,
            heartbeat,
        }
    }

    pub fn radius_fixed(&self) -> u16 {
        self.radius_fixed
    }

    pub fn radius_cm(&self) -> f32 {
        fixed_to_radius(self.radius_fixed)
    }

    pub fn heading_offset(&self) -> u8 {
        self.heading_offset
    }

    pub fn throttle(&self) -> u8 {
        self.throttle
    }

    pub fn direction(&self) -> TranslateDirection {
        self.direction
    }

    pub fn heartbeat(&self) -> u8 {
        self.heartbeat
    }

    pub fn encode(&self) -> [u8; CONFIG_FRAME_LEN] {
        let [radius_lo, radius_hi] = self.radius_fixed.to_le_bytes();
        [
            radius_lo,
            radius_hi,
            self.heading_offset,
            self.throttle,
            self.direction.as_byte(),
            self.heartbeat,
        ]
    }

    /// Parse a frame the way the robot does on a config write.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let [radius_lo, radius_hi, heading_offset, throttle, direction, heartbeat]: [u8;
            CONFIG_FRAME_LEN] = bytes.try_into().map_err(|_| ProtocolError::FrameLength {
            expected: CONFIG_FRAME_LEN,
            actual: bytes.len(),
        })?;

        let direction = TranslateDirection::from_byte(direction)
            .ok_or(ProtocolError::InvalidDirection(direction))?;

        Ok(Self {
            radius_fixed: u16::from_le_bytes([radius_lo, radius_hi]),
            heading_offset,
            throttle,
            direction,
            heartbeat,
        })
    }
}

/// Parse a stats notification from the robot
///
/// # Stats Structure (3 bytes observed)
///
/// ```text
/// [0] : Rotation interval in ms (0 = not spinning)
/// [1] : Reserved
/// [2] : Battery voltage in decivolts
/// ```
pub fn parse_telemetry(bytes: &[u8]) -> Result<TelemetrySample, ProtocolError> {
    let (period, battery) = match bytes {
        [period, _, battery, ..] => (*period, *battery),
        _ => return Err(ProtocolError::TelemetryTooShort(bytes.len())),
    };

    let rpm = if period == 0 {
        0.0
    } else {
        (1.0 / period as f32) * 1000.0 * 60.0
    };

    Ok(TelemetrySample {
        rpm,
        battery_voltage: battery as f32 / 10.0,
    })
}

/// Build a stats notification payload, as the robot firmware does.
pub fn encode_telemetry(rotation_interval_ms: u8, battery_decivolts: u8) -> [u8; TELEMETRY_MIN_LEN] {
    [rotation_interval_ms, 0, battery_decivolts]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radius_fixed_point_little_endian() {
        let frame = ConfigFrame::new(12.345, 0, 0, TranslateDirection::Idle, HEARTBEAT_FIRST);
        assert_eq!(frame.radius_fixed(), 12345);
        assert_eq!(&frame.encode()[0..2], &[0x39, 0x30]);
    }

    #[test]
    fn test_frame_layout() {
        let frame = ConfigFrame::new(1.0, 42, 77, TranslateDirection::Reverse, 12);
        assert_eq!(frame.encode(), [0xE8, 0x03, 42, 77, 2, 12]);
    }

    #[test]
    fn test_decode_reverses_encode() {
        let frame = ConfigFrame::new(65.535, 99, 100, TranslateDirection::Forward, 13);
        let decoded = ConfigFrame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.radius_fixed(), u16::MAX);

        let frame = ConfigFrame::new(0.0, 0, 0, TranslateDirection::Idle, 10);
        assert_eq!(ConfigFrame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_out_of_range_values_never_encode() {
        let frame = ConfigFrame::new(1000.0, 250, 255, TranslateDirection::Idle, 10);
        assert_eq!(frame.radius_fixed(), u16::MAX);
        assert_eq!(frame.heading_offset(), 50);
        assert_eq!(frame.throttle(), THROTTLE_MAX);

        let frame = ConfigFrame::new(-3.0, 0, 0, TranslateDirection::Idle, 10);
        assert_eq!(frame.radius_fixed(), 0);

        let frame = ConfigFrame::new(f32::NAN, 0, 0, TranslateDirection::Idle, 10);
        assert_eq!(frame.radius_fixed(), 0);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        assert_eq!(
            ConfigFrame::decode(&[0, 0, 0]),
            Err(ProtocolError::FrameLength {
                expected: CONFIG_FRAME_LEN,
                actual: 3
            })
        );
        assert_eq!(
            ConfigFrame::decode(&[0, 0, 0, 0, 7, 10]),
            Err(ProtocolError::InvalidDirection(7))
        );
    }

    #[test]
    fn test_parse_telemetry() {
        let sample = parse_telemetry(&[4, 0xAA, 25]).unwrap();
        assert_eq!(sample.rpm, 15000.0);
        assert_eq!(sample.battery_voltage, 2.5);

        let sample = parse_telemetry(&[0, 0xAA, 0]).unwrap();
        assert_eq!(sample.rpm, 0.0);
        assert_eq!(sample.battery_voltage, 0.0);

        // Period is unsigned: 200 ms per rotation, 300 RPM
        let sample = parse_telemetry(&[200, 0, 168, 0xFF]).unwrap();
        assert!((sample.rpm - 300.0).abs() < 1e-2);
        assert!((sample.battery_voltage - 16.8).abs() < 1e-5);
    }

    #[test]
    fn test_short_telemetry_is_rejected() {
        assert_eq!(parse_telemetry(&[]), Err(ProtocolError::TelemetryTooShort(0)));
        assert_eq!(parse_telemetry(&[4, 0]), Err(ProtocolError::TelemetryTooShort(2)));
    }

    #[test]
    fn test_telemetry_payload_matches_decoder() {
        let sample = parse_telemetry(&encode_telemetry(60, 74)).unwrap();
        assert!((sample.rpm - 1000.0).abs() < 1e-2);
        assert!((sample.battery_voltage - 7.4).abs() < 1e-5);
    }
}
