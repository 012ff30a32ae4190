//! Simulated GATT Backend
//!
//! An in-process robot that advertises, accepts a connection, exposes the
//! robot service and streams telemetry, so the controller can be driven
//! end to end without a radio. Completions are delivered from spawned
//! tasks after configurable latencies, like a real stack would.

use crate::domain::error::TransportError;
use crate::domain::models::PeripheralIdentity;
use crate::domain::settings::{Settings, SimulatorSettings};
use crate::infrastructure::bluetooth::protocol::{self, ConfigFrame};
use crate::infrastructure::bluetooth::service::TransportEventSender;
use crate::infrastructure::bluetooth::transport::{
    ConnectionHandle, GattCharacteristic, GattConnectionState, GattService, GattTransport,
    TransportEvent, GATT_SUCCESS,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Status reported when a write carries a malformed frame
pub const GATT_INVALID_ATTRIBUTE_LENGTH: i32 = 0x0D;

/// Status reported when the robot drops off the air
pub const GATT_CONN_TIMEOUT: i32 = 0x08;

const ROBOT_ADDRESS: u64 = 0xC0_FF_EE_00_15_23;
const DECOY_ADDRESS: u64 = 0x5A_5A_5A_00_00_01;
const DECOY_NAME: &str = "Pocket_Speaker";

const TELEMETRY_HANDLE: u16 = 0x000E;
const CONFIG_HANDLE: u16 = 0x0011;

/// What the simulated robot has seen so far.
#[derive(Debug, Default)]
struct RobotState {
    last_frame: Option<ConfigFrame>,
    frames_received: usize,
    connection: Option<ConnectionHandle>,
}

/// Observer / fault injector for the simulated robot.
#[derive(Debug, Clone)]
pub struct RobotHandle {
    state: Arc<Mutex<RobotState>>,
    events: TransportEventSender,
}

impl RobotHandle {
    pub fn last_frame(&self) -> Option<ConfigFrame> {
        self.lock().last_frame
    }

    pub fn frames_received(&self) -> usize {
        self.lock().frames_received
    }

    /// Drop the link from the robot's side, as if it went out of range.
    pub fn power_off(&self) {
        let connection = self.lock().connection.take();
        if let Some(connection) = connection {
            warn!("Simulated robot dropping connection {}", connection);
            self.events.send(TransportEvent::ConnectionStateChanged {
                connection,
                status: GATT_CONN_TIMEOUT,
                state: GattConnectionState::Disconnected,
            });
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RobotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Robot GATT identifiers served by the simulator
#[derive(Debug, Clone, Copy)]
struct RobotGatt {
    service: Uuid,
    telemetry: Uuid,
    config: Uuid,
}

pub struct SimulatedTransport {
    settings: SimulatorSettings,
    device_name: String,
    gatt: RobotGatt,
    events: TransportEventSender,
    robot: Arc<Mutex<RobotState>>,
    advertiser: Option<JoinHandle<()>>,
    tasks: HashMap<ConnectionHandle, Vec<JoinHandle<()>>>,
    next_connection: u32,
}

impl SimulatedTransport {
    pub fn new(settings: &Settings, events: TransportEventSender) -> Result<Self, TransportError> {
        if !settings.simulator.adapter_present {
            return Err(TransportError::AdapterUnavailable(
                "no Bluetooth adapter".to_string(),
            ));
        }

        info!("Using simulated robot '{}'", settings.device_name);
        Ok(Self {
            settings: settings.simulator.clone(),
            device_name: settings.device_name.clone(),
            gatt: RobotGatt {
                service: settings.ble_service_uuid,
                telemetry: settings.telemetry_char_uuid,
                config: settings.config_char_uuid,
            },
            events,
            robot: Arc::new(Mutex::new(RobotState::default())),
            advertiser: None,
            tasks: HashMap::new(),
            next_connection: 1,
        })
    }

    pub fn robot(&self) -> RobotHandle {
        RobotHandle {
            state: self.robot.clone(),
            events: self.events.clone(),
        }
    }

    fn latency(&self, ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn deliver_later(&self, after: Duration, event: TransportEvent) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            events.send(event);
        })
    }

    fn track(&mut self, connection: ConnectionHandle, task: JoinHandle<()>) {
        self.tasks.entry(connection).or_default().push(task);
    }

    fn ensure_known(&self, connection: ConnectionHandle) -> Result<(), TransportError> {
        if self.tasks.contains_key(&connection) {
            Ok(())
        } else {
            Err(TransportError::UnknownConnection(connection.0))
        }
    }

    fn abort_tasks(&mut self, connection: ConnectionHandle) {
        if let Some(tasks) = self.tasks.get_mut(&connection) {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn services(&self) -> Vec<GattService> {
        vec![GattService {
            uuid: self.gatt.service,
            characteristics: vec![
                GattCharacteristic {
                    uuid: self.gatt.telemetry,
                    handle: TELEMETRY_HANDLE,
                },
                GattCharacteristic {
                    uuid: self.gatt.config,
                    handle: CONFIG_HANDLE,
                },
            ],
        }]
    }
}

/// Rotation period the robot reports for a throttle setting.
fn rotation_interval_ms(throttle: u8) -> u8 {
    if throttle == 0 {
        0
    } else {
        // Full throttle spins at ~3000 RPM, a 20 ms period
        (2000 / throttle as u16).min(u8::MAX as u16) as u8
    }
}

fn battery_decivolts(volts: f32) -> u8 {
    (volts * 10.0).round().clamp(0.0, u8::MAX as f32) as u8
}

impl GattTransport for SimulatedTransport {
    fn has_permission(&self) -> bool {
        self.settings.permission_granted
    }

    fn start_scan(&mut self, name_filter: Option<&str>) -> Result<(), TransportError> {
        if let Some(task) = self.advertiser.take() {
            task.abort();
        }

        let advertised = [
            PeripheralIdentity {
                address: DECOY_ADDRESS,
                name: DECOY_NAME.to_string(),
            },
            PeripheralIdentity {
                address: ROBOT_ADDRESS,
                name: self.device_name.clone(),
            },
        ];
        let visible: Vec<_> = advertised
            .into_iter()
            .filter(|p| name_filter.map_or(true, |name| p.name == name))
            .collect();

        debug!("Simulated scan started ({} visible)", visible.len());
        let events = self.events.clone();
        let step = self.latency(self.settings.advertise_delay_ms / 2);
        self.advertiser = Some(tokio::spawn(async move {
            for peripheral in visible {
                tokio::time::sleep(step).await;
                events.send(TransportEvent::DeviceDiscovered(peripheral));
            }
        }));
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some(task) = self.advertiser.take() {
            task.abort();
            debug!("Simulated scan stopped");
        }
    }

    fn connect(
        &mut self,
        peripheral: &PeripheralIdentity,
    ) -> Result<ConnectionHandle, TransportError> {
        if peripheral.address != ROBOT_ADDRESS {
            return Err(TransportError::Refused(format!(
                "{} is not connectable",
                peripheral.name
            )));
        }

        let connection = ConnectionHandle(self.next_connection);
        self.next_connection += 1;
        self.tasks.insert(connection, Vec::new());
        self.robot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .connection = Some(connection);

        let task = self.deliver_later(
            self.latency(self.settings.connect_latency_ms),
            TransportEvent::ConnectionStateChanged {
                connection,
                status: GATT_SUCCESS,
                state: GattConnectionState::Connected,
            },
        );
        self.track(connection, task);
        Ok(connection)
    }

    fn discover_services(&mut self, connection: ConnectionHandle) -> Result<(), TransportError> {
        self.ensure_known(connection)?;
        let task = self.deliver_later(
            self.latency(self.settings.connect_latency_ms),
            TransportEvent::ServicesDiscovered {
                connection,
                status: GATT_SUCCESS,
                services: self.services(),
            },
        );
        self.track(connection, task);
        Ok(())
    }

    fn enable_notification(
        &mut self,
        connection: ConnectionHandle,
        characteristic: &GattCharacteristic,
    ) -> bool {
        if self.ensure_known(connection).is_err() || characteristic.uuid != self.gatt.telemetry {
            return false;
        }
        debug!(
            "Notifications enabled on {} (CCC {})",
            characteristic.uuid,
            protocol::CCC_DESCRIPTOR_UUID
        );

        let events = self.events.clone();
        let robot = self.robot.clone();
        let uuid = characteristic.uuid;
        let period = self.latency(self.settings.telemetry_interval_ms.max(1));
        let battery = battery_decivolts(self.settings.battery_volts);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let throttle = robot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .last_frame
                    .map_or(0, |frame| frame.throttle());
                events.send(TransportEvent::Notification {
                    connection,
                    characteristic: uuid,
                    value: protocol::encode_telemetry(rotation_interval_ms(throttle), battery)
                        .to_vec(),
                });
            }
        });
        self.track(connection, task);
        true
    }

    fn write_characteristic(
        &mut self,
        connection: ConnectionHandle,
        characteristic: &GattCharacteristic,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.ensure_known(connection)?;
        if characteristic.uuid != self.gatt.config {
            return Err(TransportError::Refused(format!(
                "{} is not writable",
                characteristic.uuid
            )));
        }

        let status = match ConfigFrame::decode(value) {
            Ok(frame) => {
                trace!("Robot received {:?}", frame);
                let mut robot = self.robot.lock().unwrap_or_else(PoisonError::into_inner);
                robot.last_frame = Some(frame);
                robot.frames_received += 1;
                GATT_SUCCESS
            }
            Err(e) => {
                warn!("Robot rejected config write: {}", e);
                GATT_INVALID_ATTRIBUTE_LENGTH
            }
        };

        let task = self.deliver_later(
            self.latency(self.settings.write_latency_ms),
            TransportEvent::CharacteristicWritten {
                connection,
                characteristic: characteristic.uuid,
                status,
            },
        );
        self.track(connection, task);
        Ok(())
    }

    fn disconnect(&mut self, connection: ConnectionHandle) {
        if self.ensure_known(connection).is_err() {
            return;
        }
        self.abort_tasks(connection);
        {
            let mut robot = self.robot.lock().unwrap_or_else(PoisonError::into_inner);
            if robot.connection == Some(connection) {
                robot.connection = None;
            }
        }

        let task = self.deliver_later(
            self.latency(self.settings.connect_latency_ms),
            TransportEvent::ConnectionStateChanged {
                connection,
                status: GATT_SUCCESS,
                state: GattConnectionState::Disconnected,
            },
        );
        self.track(connection, task);
    }

    fn close(&mut self, connection: ConnectionHandle) {
        // Pending disconnect notification has already been delivered
        if let Some(tasks) = self.tasks.remove(&connection) {
            for task in tasks {
                task.abort();
            }
        }
        debug!("Closed connection {}", connection);
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.stop_scan();
        for (_, tasks) in self.tasks.drain() {
            for task in tasks {
                task.abort();
            }
        }
    }
}
