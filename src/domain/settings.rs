use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const APP_DIR: &str = "MeltyController";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "melty_controller".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Behaviour of the in-process robot used when no radio backend is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSettings {
    #[serde(default = "default_true")]
    pub adapter_present: bool,
    #[serde(default = "default_true")]
    pub permission_granted: bool,
    #[serde(default = "default_advertise_delay_ms")]
    pub advertise_delay_ms: u64,
    #[serde(default = "default_link_latency_ms")]
    pub connect_latency_ms: u64,
    #[serde(default = "default_link_latency_ms")]
    pub write_latency_ms: u64,
    #[serde(default = "default_telemetry_interval_ms")]
    pub telemetry_interval_ms: u64,
    #[serde(default = "default_battery_volts")]
    pub battery_volts: f32,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            adapter_present: true,
            permission_granted: true,
            advertise_delay_ms: default_advertise_delay_ms(),
            connect_latency_ms: default_link_latency_ms(),
            write_latency_ms: default_link_latency_ms(),
            telemetry_interval_ms: default_telemetry_interval_ms(),
            battery_volts: default_battery_volts(),
        }
    }
}

fn default_advertise_delay_ms() -> u64 {
    800
}
fn default_link_latency_ms() -> u64 {
    30
}
fn default_telemetry_interval_ms() -> u64 {
    200
}
fn default_battery_volts() -> f32 {
    16.4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // BLE Settings
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_service_uuid")]
    pub ble_service_uuid: Uuid,
    #[serde(default = "default_telemetry_uuid")]
    pub telemetry_char_uuid: Uuid,
    #[serde(default = "default_config_uuid")]
    pub config_char_uuid: Uuid,

    // Link timing
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: Option<u64>,

    // Control loop
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_radius_cm")]
    pub max_radius_cm: f32,
    #[serde(default = "default_min_radius_cm")]
    pub min_radius_cm: f32,

    #[serde(default)]
    pub simulator: SimulatorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            device_name: default_device_name(),
            ble_service_uuid: default_service_uuid(),
            telemetry_char_uuid: default_telemetry_uuid(),
            config_char_uuid: default_config_uuid(),
            scan_timeout_ms: default_scan_timeout_ms(),
            connect_delay_ms: default_connect_delay_ms(),
            discovery_timeout_ms: default_discovery_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_radius_cm: default_max_radius_cm(),
            min_radius_cm: default_min_radius_cm(),
            simulator: SimulatorSettings::default(),
        }
    }
}

fn default_device_name() -> String {
    protocol::DEVICE_NAME.to_string()
}
fn default_service_uuid() -> Uuid {
    protocol::SERVICE_UUID
}
fn default_telemetry_uuid() -> Uuid {
    protocol::TELEMETRY_CHAR_UUID
}
fn default_config_uuid() -> Uuid {
    protocol::CONFIG_CHAR_UUID
}
fn default_scan_timeout_ms() -> u64 {
    10_000
}
fn default_connect_delay_ms() -> u64 {
    500
}
fn default_discovery_timeout_ms() -> Option<u64> {
    Some(5_000)
}
fn default_tick_interval_ms() -> u64 {
    50
}
fn default_heartbeat_interval_ms() -> u64 {
    400
}
fn default_max_radius_cm() -> f32 {
    20.0
}
fn default_min_radius_cm() -> f32 {
    0.1
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = app_dir()?.join("settings.json");
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

fn app_dir() -> anyhow::Result<PathBuf> {
    let mut path = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
    path.push(APP_DIR);
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Keys of the persisted control preferences
pub mod keys {
    pub const HEADING_OFFSET: &str = "heading_offset";
    pub const RADIUS: &str = "radius";
}

/// App-scoped key-value store for values that survive restarts.
pub trait PreferenceStore: Send {
    fn get_int(&self, key: &str) -> Option<i64>;
    fn set_int(&mut self, key: &str, value: i64);
    fn get_float(&self, key: &str) -> Option<f32>;
    fn set_float(&mut self, key: &str, value: f32);
    /// Write pending changes to the backing medium
    fn flush(&mut self) -> anyhow::Result<()>;
}

fn set_value(values: &mut Map<String, Value>, key: &str, value: Value) -> bool {
    if values.get(key) == Some(&value) {
        return false;
    }
    values.insert(key.to_string(), value);
    true
}

/// Preferences held in memory only
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    values: Map<String, Value>,
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    fn set_int(&mut self, key: &str, value: i64) {
        set_value(&mut self.values, key, Value::from(value));
    }

    fn get_float(&self, key: &str) -> Option<f32> {
        self.values.get(key).and_then(Value::as_f64).map(|v| v as f32)
    }

    fn set_float(&mut self, key: &str, value: f32) {
        if let Some(number) = Number::from_f64(value as f64) {
            set_value(&mut self.values, key, Value::Number(number));
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Preferences persisted as a flat JSON object. Only touches disk when a
/// value actually changed since the last flush.
pub struct JsonPreferenceStore {
    path: PathBuf,
    values: Map<String, Value>,
    dirty: bool,
}

impl JsonPreferenceStore {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::open(app_dir()?.join("preferences.json")))
    }

    /// Open the store at `path`; a missing or unreadable file starts empty
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = fs::read_to_string(&path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default();

        Self {
            path,
            values,
            dirty: false,
        }
    }
}

impl PreferenceStore for JsonPreferenceStore {
    fn get_int(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    fn set_int(&mut self, key: &str, value: i64) {
        self.dirty |= set_value(&mut self.values, key, Value::from(value));
    }

    fn get_float(&self, key: &str) -> Option<f32> {
        self.values.get(key).and_then(Value::as_f64).map(|v| v as f32)
    }

    fn set_float(&mut self, key: &str, value: f32) {
        if let Some(number) = Number::from_f64(value as f64) {
            self.dirty |= set_value(&mut self.values, key, Value::Number(number));
        }
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let json = serde_json::to_string_pretty(&self.values)?;
        fs::write(&self.path, json)?;
        self.dirty = false;
        Ok(())
    }
}
