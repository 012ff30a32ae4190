//! Link State Machine
//!
//! Owns the connection lifecycle to the robot: scan, delayed connect,
//! service discovery, notification setup, single-outstanding-write
//! tracking and disconnect cleanup. All mutation happens through
//! [`LinkStateMachine::handle`], which the link driver calls from one task.

use crate::domain::error::LinkError;
use crate::domain::models::{
    AppEvent, DisconnectReason, LinkState, MessageSeverity, PeripheralIdentity, StatusMessage,
};
use crate::infrastructure::bluetooth::connection::{ChannelSet, ConnectionConfig, PartialChannels};
use crate::infrastructure::bluetooth::protocol::{self, ConfigFrame};
use crate::infrastructure::bluetooth::scanner::BleScanner;
use crate::infrastructure::bluetooth::transport::{
    ConnectionHandle, GattConnectionState, GattService, GattTransport, TransportEvent,
    GATT_SUCCESS,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Everything the link driver feeds into the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Scan,
    Disconnect,
    Send(ConfigFrame),
    Timer(TimerEvent),
    Transport(TransportEvent),
}

/// One-shot timer expiries. Each carries the generation it was armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    ScanTimedOut { scan_id: u64 },
    ConnectSettled { attempt: u64 },
    DiscoveryTimedOut { attempt: u64 },
}

/// A timer the driver must arm on behalf of the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    pub after: Duration,
    pub event: TimerEvent,
}

enum Phase {
    Idle,
    Scanning,
    Connecting {
        attempt: u64,
        peripheral: PeripheralIdentity,
        connection: Option<ConnectionHandle>,
    },
    DiscoveringServices {
        attempt: u64,
        peripheral: PeripheralIdentity,
        connection: ConnectionHandle,
        partial: PartialChannels,
    },
    Ready {
        peripheral: PeripheralIdentity,
        connection: ConnectionHandle,
        channels: ChannelSet,
        write_pending: bool,
        // Latched after a refused write so a refusing transport is
        // reported once, not once per tick
        write_rejected: bool,
    },
    Disconnected(DisconnectReason),
}

impl Phase {
    fn state(&self) -> LinkState {
        match self {
            Self::Idle => LinkState::Idle,
            Self::Scanning => LinkState::Scanning,
            Self::Connecting { .. } => LinkState::Connecting,
            Self::DiscoveringServices { .. } => LinkState::DiscoveringServices,
            Self::Ready { .. } => LinkState::Ready,
            Self::Disconnected(reason) => LinkState::Disconnected(*reason),
        }
    }

    fn connection(&self) -> Option<ConnectionHandle> {
        match self {
            Self::Connecting { connection, .. } => *connection,
            Self::DiscoveringServices { connection, .. } | Self::Ready { connection, .. } => {
                Some(*connection)
            }
            _ => None,
        }
    }
}

pub struct LinkStateMachine<T: GattTransport> {
    transport: T,
    config: ConnectionConfig,
    scanner: BleScanner,
    phase: Phase,
    next_attempt: u64,
    disconnect_requested: bool,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<T: GattTransport> LinkStateMachine<T> {
    pub fn new(
        transport: T,
        config: ConnectionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            scanner: BleScanner::new(config.device_name.clone()),
            transport,
            config,
            phase: Phase::Idle,
            next_attempt: 1,
            disconnect_requested: false,
            event_sender,
        }
    }

    pub fn state(&self) -> LinkState {
        self.phase.state()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Ready { .. })
    }

    pub fn is_write_pending(&self) -> bool {
        matches!(
            self.phase,
            Phase::Ready {
                write_pending: true,
                ..
            }
        )
    }

    /// Channels bound to the current connection, present only while ready
    pub fn channels(&self) -> Option<ChannelSet> {
        match &self.phase {
            Phase::Ready { channels, .. } => Some(*channels),
            _ => None,
        }
    }

    /// Characteristics found so far during discovery
    pub fn partial_channels(&self) -> Option<PartialChannels> {
        match &self.phase {
            Phase::DiscoveringServices { partial, .. } => Some(*partial),
            _ => None,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Apply one event. Returns a timer to arm, if the transition needs one.
    pub fn handle(&mut self, event: LinkEvent) -> Result<Option<Timer>, LinkError> {
        match event {
            LinkEvent::Scan => self.scan(),
            LinkEvent::Disconnect => {
                self.disconnect();
                Ok(None)
            }
            LinkEvent::Send(frame) => self.send(&frame).map(|_| None),
            LinkEvent::Timer(timer) => self.on_timer(timer),
            LinkEvent::Transport(event) => self.on_transport_event(event),
        }
    }

    /// Start looking for the robot. No-op while a scan or a link is active.
    pub fn scan(&mut self) -> Result<Option<Timer>, LinkError> {
        if !self.transport.has_permission() {
            error!("Scan aborted: Bluetooth permission not granted");
            return Err(LinkError::PermissionDenied);
        }

        if self.scanner.is_scanning() {
            debug!("Scan already in progress");
            return Ok(None);
        }

        if !matches!(self.phase, Phase::Idle | Phase::Disconnected(_)) {
            debug!("Ignoring scan request while {}", self.state());
            return Ok(None);
        }

        let scan_id = self.scanner.start(&mut self.transport)?;
        self.set_phase(Phase::Scanning);
        self.send_log("Scanning...", MessageSeverity::Info);

        Ok(Some(Timer {
            after: self.config.scan_timeout,
            event: TimerEvent::ScanTimedOut { scan_id },
        }))
    }

    /// Request a disconnect. The state only changes when the transport
    /// reports the disconnect, except for a scan which is simply stopped.
    pub fn disconnect(&mut self) {
        match &self.phase {
            Phase::Idle | Phase::Disconnected(_) => {
                debug!("Disconnect requested with no active link");
            }
            Phase::Scanning => {
                self.scanner.stop(&mut self.transport);
                self.set_phase(Phase::Idle);
                self.send_log("Scan stopped.", MessageSeverity::Info);
            }
            Phase::Connecting {
                connection: None, ..
            } => {
                debug!("Disconnect requested before connect was issued, nothing to tear down");
            }
            phase => {
                if let Some(connection) = phase.connection() {
                    info!("Disconnecting connection {}", connection);
                    self.disconnect_requested = true;
                    self.transport.disconnect(connection);
                    self.send_log("Disconnecting...", MessageSeverity::Info);
                }
            }
        }
    }

    /// Submit a config frame. Dropped unless ready with no write in flight.
    pub fn send(&mut self, frame: &ConfigFrame) -> Result<bool, LinkError> {
        let Phase::Ready {
            connection,
            channels,
            write_pending,
            write_rejected,
            ..
        } = &mut self.phase
        else {
            trace!("Dropping config frame: link not ready");
            return Ok(false);
        };

        if *write_pending {
            trace!("Dropping config frame: write already pending");
            return Ok(false);
        }

        match self
            .transport
            .write_characteristic(*connection, &channels.config, &frame.encode())
        {
            Ok(()) => {
                *write_pending = true;
                *write_rejected = false;
                trace!("Config frame submitted: {:?}", frame);
                Ok(true)
            }
            Err(e) if *write_rejected => {
                debug!("Config write still refused: {}", e);
                Ok(false)
            }
            Err(e) => {
                *write_rejected = true;
                Err(LinkError::WriteRejected(e.to_string()))
            }
        }
    }

    fn on_timer(&mut self, timer: TimerEvent) -> Result<Option<Timer>, LinkError> {
        match timer {
            TimerEvent::ScanTimedOut { scan_id } => self.on_scan_timeout(scan_id),
            TimerEvent::ConnectSettled { attempt } => self.on_connect_settled(attempt),
            TimerEvent::DiscoveryTimedOut { attempt } => self.on_discovery_timeout(attempt),
        }
    }

    fn on_scan_timeout(&mut self, scan_id: u64) -> Result<Option<Timer>, LinkError> {
        if !self.scanner.expire(scan_id, &mut self.transport) {
            return Ok(None);
        }
        info!("Scan {} timed out", scan_id);
        self.set_phase(Phase::Idle);
        Err(LinkError::ScanTimeout)
    }

    fn on_connect_settled(&mut self, attempt: u64) -> Result<Option<Timer>, LinkError> {
        let peripheral = match &self.phase {
            Phase::Connecting {
                attempt: current,
                peripheral,
                connection: None,
            } if *current == attempt => peripheral.clone(),
            _ => {
                debug!("Ignoring stale connect timer for attempt {}", attempt);
                return Ok(None);
            }
        };

        if !self.transport.has_permission() {
            error!("Connect aborted: Bluetooth permission not granted");
            self.set_phase(Phase::Idle);
            return Err(LinkError::PermissionDenied);
        }

        info!("Connecting to device: {}", peripheral.name);
        match self.transport.connect(&peripheral) {
            Ok(connection) => {
                self.phase = Phase::Connecting {
                    attempt,
                    peripheral,
                    connection: Some(connection),
                };
                self.send_log("Connecting...", MessageSeverity::Info);
                Ok(None)
            }
            Err(e) => {
                warn!("Connect request rejected: {}", e);
                self.set_phase(Phase::Disconnected(DisconnectReason::ConnectRejected));
                Err(e.into())
            }
        }
    }

    fn on_discovery_timeout(&mut self, attempt: u64) -> Result<Option<Timer>, LinkError> {
        let connection = match &self.phase {
            Phase::DiscoveringServices {
                attempt: current,
                connection,
                partial,
                ..
            } if *current == attempt => {
                warn!(
                    "Service discovery incomplete, missing: {:?}",
                    partial.missing()
                );
                *connection
            }
            _ => return Ok(None),
        };

        self.disconnect_requested = true;
        self.transport.disconnect(connection);
        Err(LinkError::DiscoveryIncomplete)
    }

    fn on_transport_event(&mut self, event: TransportEvent) -> Result<Option<Timer>, LinkError> {
        if let Some(connection) = event.connection() {
            if self.phase.connection() != Some(connection) {
                debug!("Ignoring event for stale connection {}", connection);
                return Ok(None);
            }
        }

        match event {
            TransportEvent::DeviceDiscovered(peripheral) => Ok(self.on_device_discovered(peripheral)),
            TransportEvent::ConnectionStateChanged {
                connection,
                status,
                state,
            } => Ok(self.on_connection_state_changed(connection, status, state)),
            TransportEvent::ServicesDiscovered {
                status, services, ..
            } => {
                self.on_services_discovered(status, &services);
                Ok(None)
            }
            TransportEvent::CharacteristicWritten {
                characteristic,
                status,
                ..
            } => {
                self.on_characteristic_written(characteristic, status);
                Ok(None)
            }
            TransportEvent::Notification {
                characteristic,
                value,
                ..
            } => {
                self.on_notification(characteristic, &value);
                Ok(None)
            }
        }
    }

    fn on_device_discovered(&mut self, peripheral: PeripheralIdentity) -> Option<Timer> {
        trace!("Device: {}", peripheral.name);
        if !matches!(self.phase, Phase::Scanning) || !self.scanner.matches(&peripheral) {
            return None;
        }

        info!("Found {} at {:#X}", peripheral.name, peripheral.address);
        self.scanner.stop(&mut self.transport);
        self.send_log("Found device.", MessageSeverity::Info);

        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.set_phase(Phase::Connecting {
            attempt,
            peripheral,
            connection: None,
        });

        Some(Timer {
            after: self.config.connect_delay,
            event: TimerEvent::ConnectSettled { attempt },
        })
    }

    fn on_connection_state_changed(
        &mut self,
        connection: ConnectionHandle,
        status: i32,
        state: GattConnectionState,
    ) -> Option<Timer> {
        match state {
            GattConnectionState::Connected => {
                let Phase::Connecting {
                    attempt,
                    peripheral,
                    ..
                } = &self.phase
                else {
                    debug!("Connected event while {}, ignoring", self.state());
                    return None;
                };
                let (attempt, peripheral) = (*attempt, peripheral.clone());

                info!("Connected to GATT server, discovering services");
                self.set_phase(Phase::DiscoveringServices {
                    attempt,
                    peripheral,
                    connection,
                    partial: PartialChannels::default(),
                });
                self.send_log("Discovering Services...", MessageSeverity::Info);

                if let Err(e) = self.transport.discover_services(connection) {
                    warn!("Service discovery failed to start: {}", e);
                    self.send_log(
                        format!("Service discovery failed: {}", e),
                        MessageSeverity::Warning,
                    );
                }

                self.config.discovery_timeout.map(|after| Timer {
                    after,
                    event: TimerEvent::DiscoveryTimedOut { attempt },
                })
            }
            GattConnectionState::Disconnected => {
                let was_ready = self.is_connected();
                if was_ready && !self.disconnect_requested {
                    warn!("{}", LinkError::DisconnectedUnexpectedly(status));
                } else {
                    info!("Disconnected from device (status {})", status);
                }

                self.transport.close(connection);
                self.disconnect_requested = false;
                self.set_phase(Phase::Disconnected(DisconnectReason::Status(status)));
                self.send_log(
                    format!("Disconnected (Code {})", status),
                    MessageSeverity::Info,
                );
                None
            }
        }
    }

    fn on_services_discovered(&mut self, status: i32, services: &[GattService]) {
        let Phase::DiscoveringServices {
            peripheral,
            connection,
            partial,
            ..
        } = &mut self.phase
        else {
            debug!("Services discovered outside of discovery, ignoring");
            return;
        };

        if status != GATT_SUCCESS {
            warn!("onServicesDiscovered received: {}", status);
            return;
        }

        let found = PartialChannels::locate(services, &self.config);
        *partial = found;

        if let Some(telemetry) = &found.telemetry {
            if !self.transport.enable_notification(*connection, telemetry) {
                warn!("Failed to enable telemetry notifications");
                return;
            }
            debug!("Telemetry notifications enabled");
        }

        let Some(channels) = found.complete() else {
            warn!(
                "Robot is missing required characteristics: {:?}",
                found.missing()
            );
            return;
        };

        let (peripheral, connection) = (peripheral.clone(), *connection);
        info!("Link ready with {}", peripheral.name);
        self.set_phase(Phase::Ready {
            peripheral,
            connection,
            channels,
            write_pending: false,
            write_rejected: false,
        });
        self.send_log("Connected", MessageSeverity::Success);
    }

    fn on_characteristic_written(&mut self, characteristic: Uuid, status: i32) {
        if let Phase::Ready { write_pending, .. } = &mut self.phase {
            *write_pending = false;
        }
        if status != GATT_SUCCESS {
            debug!("Write to {} completed with status {}", characteristic, status);
        }
    }

    fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) {
        let Phase::Ready { channels, .. } = &self.phase else {
            return;
        };
        if characteristic != channels.telemetry.uuid {
            return;
        }

        match protocol::parse_telemetry(value) {
            Ok(sample) => {
                debug!(
                    "Melty stats (RPM / V): {} / {}",
                    sample.rpm, sample.battery_voltage
                );
                let _ = self.event_sender.send(AppEvent::Telemetry(sample));
            }
            Err(e) => debug!("Dropping telemetry sample: {}", e),
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        let previous = self.phase.state();
        self.phase = phase;
        let current = self.phase.state();
        if previous != current {
            debug!("Link state {} -> {}", previous, current);
            let _ = self.event_sender.send(AppEvent::LinkState(current));
        }
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self
            .event_sender
            .send(AppEvent::LogMessage(StatusMessage::new(message, severity)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::TransportError;
    use crate::domain::models::{TelemetrySample, TranslateDirection};
    use crate::infrastructure::bluetooth::transport::GattCharacteristic;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        StartScan(Option<String>),
        StopScan,
        Connect(u64),
        DiscoverServices(ConnectionHandle),
        EnableNotification(u16),
        Write(u16, Vec<u8>),
        Disconnect(ConnectionHandle),
        Close(ConnectionHandle),
    }

    struct MockTransport {
        calls: Vec<Call>,
        permission: bool,
        notifications_ok: bool,
        reject_writes: bool,
        next_connection: u32,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                permission: true,
                notifications_ok: true,
                reject_writes: false,
                next_connection: 1,
            }
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }
    }

    impl GattTransport for MockTransport {
        fn has_permission(&self) -> bool {
            self.permission
        }

        fn start_scan(&mut self, name_filter: Option<&str>) -> Result<(), TransportError> {
            self.calls.push(Call::StartScan(name_filter.map(str::to_string)));
            Ok(())
        }

        fn stop_scan(&mut self) {
            self.calls.push(Call::StopScan);
        }

        fn connect(
            &mut self,
            peripheral: &PeripheralIdentity,
        ) -> Result<ConnectionHandle, TransportError> {
            self.calls.push(Call::Connect(peripheral.address));
            let handle = ConnectionHandle(self.next_connection);
            self.next_connection += 1;
            Ok(handle)
        }

        fn discover_services(&mut self, connection: ConnectionHandle) -> Result<(), TransportError> {
            self.calls.push(Call::DiscoverServices(connection));
            Ok(())
        }

        fn enable_notification(
            &mut self,
            _connection: ConnectionHandle,
            characteristic: &GattCharacteristic,
        ) -> bool {
            self.calls.push(Call::EnableNotification(characteristic.handle));
            self.notifications_ok
        }

        fn write_characteristic(
            &mut self,
            _connection: ConnectionHandle,
            characteristic: &GattCharacteristic,
            value: &[u8],
        ) -> Result<(), TransportError> {
            if self.reject_writes {
                return Err(TransportError::Refused("busy".to_string()));
            }
            self.calls.push(Call::Write(characteristic.handle, value.to_vec()));
            Ok(())
        }

        fn disconnect(&mut self, connection: ConnectionHandle) {
            self.calls.push(Call::Disconnect(connection));
        }

        fn close(&mut self, connection: ConnectionHandle) {
            self.calls.push(Call::Close(connection));
        }
    }

    type Machine = LinkStateMachine<MockTransport>;

    fn machine() -> (Machine, mpsc::UnboundedReceiver<AppEvent>) {
        machine_with(MockTransport::new(), ConnectionConfig::default())
    }

    fn machine_with(
        transport: MockTransport,
        config: ConnectionConfig,
    ) -> (Machine, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LinkStateMachine::new(transport, config, tx), rx)
    }

    fn robot() -> PeripheralIdentity {
        PeripheralIdentity {
            address: 0xC0FFEE,
            name: protocol::DEVICE_NAME.to_string(),
        }
    }

    fn full_services() -> Vec<GattService> {
        vec![GattService {
            uuid: protocol::SERVICE_UUID,
            characteristics: vec![
                GattCharacteristic {
                    uuid: protocol::TELEMETRY_CHAR_UUID,
                    handle: 10,
                },
                GattCharacteristic {
                    uuid: protocol::CONFIG_CHAR_UUID,
                    handle: 13,
                },
            ],
        }]
    }

    fn transport_event(m: &mut Machine, event: TransportEvent) -> Option<Timer> {
        m.handle(LinkEvent::Transport(event)).unwrap()
    }

    /// Drive the machine from idle to the discovering state, returning the
    /// connection handle and discovery timer.
    fn drive_to_discovery(m: &mut Machine) -> (ConnectionHandle, Option<Timer>) {
        m.handle(LinkEvent::Scan).unwrap();
        let settle = transport_event(m, TransportEvent::DeviceDiscovered(robot())).unwrap();
        m.handle(LinkEvent::Timer(settle.event)).unwrap();
        let connection = ConnectionHandle(m.transport().next_connection - 1);
        let timer = transport_event(
            m,
            TransportEvent::ConnectionStateChanged {
                connection,
                status: GATT_SUCCESS,
                state: GattConnectionState::Connected,
            },
        );
        (connection, timer)
    }

    fn drive_to_ready(m: &mut Machine) -> ConnectionHandle {
        let (connection, _) = drive_to_discovery(m);
        transport_event(
            m,
            TransportEvent::ServicesDiscovered {
                connection,
                status: GATT_SUCCESS,
                services: full_services(),
            },
        );
        assert_eq!(m.state(), LinkState::Ready);
        connection
    }

    fn frame() -> ConfigFrame {
        ConfigFrame::new(10.0, 5, 50, TranslateDirection::Idle, 10)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_scan_arms_timeout_and_filters_by_name() {
        let (mut m, _rx) = machine();
        let timer = m.handle(LinkEvent::Scan).unwrap().unwrap();
        assert_eq!(m.state(), LinkState::Scanning);
        assert_eq!(timer.after, Duration::from_secs(10));
        assert_eq!(
            m.transport().calls,
            vec![Call::StartScan(Some(protocol::DEVICE_NAME.to_string()))]
        );

        // A second scan while scanning is a silent no-op
        assert_eq!(m.handle(LinkEvent::Scan).unwrap(), None);
        assert_eq!(m.transport().count(|c| matches!(c, Call::StartScan(_))), 1);
    }

    #[test]
    fn test_scan_without_permission_is_denied() {
        let mut transport = MockTransport::new();
        transport.permission = false;
        let (mut m, _rx) = machine_with(transport, ConnectionConfig::default());

        assert_eq!(m.handle(LinkEvent::Scan), Err(LinkError::PermissionDenied));
        assert_eq!(m.state(), LinkState::Idle);
        assert!(m.transport().calls.is_empty());
    }

    #[test]
    fn test_only_exact_name_match_connects() {
        let (mut m, _rx) = machine();
        m.handle(LinkEvent::Scan).unwrap();

        let other = PeripheralIdentity {
            address: 1,
            name: "Melty_Bot_2".to_string(),
        };
        assert_eq!(transport_event(&mut m, TransportEvent::DeviceDiscovered(other)), None);
        assert_eq!(m.state(), LinkState::Scanning);

        let settle = transport_event(&mut m, TransportEvent::DeviceDiscovered(robot())).unwrap();
        assert_eq!(settle.after, Duration::from_millis(500));
        assert_eq!(m.state(), LinkState::Connecting);
        assert!(m.transport().calls.contains(&Call::StopScan));

        // A second advertisement is not acted on
        assert_eq!(transport_event(&mut m, TransportEvent::DeviceDiscovered(robot())), None);

        // Connect only happens once the settle delay expires
        assert_eq!(m.transport().count(|c| matches!(c, Call::Connect(_))), 0);
        m.handle(LinkEvent::Timer(settle.event)).unwrap();
        assert_eq!(
            m.transport().count(|c| *c == Call::Connect(robot().address)),
            1
        );
    }

    #[test]
    fn test_scan_timeout_reports_once() {
        let (mut m, mut rx) = machine();
        let timer = m.handle(LinkEvent::Scan).unwrap().unwrap();

        assert_eq!(
            m.handle(LinkEvent::Timer(timer.event)),
            Err(LinkError::ScanTimeout)
        );
        assert_eq!(m.state(), LinkState::Idle);

        // Redelivered expiry is ignored
        assert_eq!(m.handle(LinkEvent::Timer(timer.event)), Ok(None));
        assert_eq!(m.transport().count(|c| *c == Call::StopScan), 1);

        let states: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::LinkState(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![LinkState::Scanning, LinkState::Idle]);
    }

    #[test]
    fn test_stale_scan_timeout_does_not_cancel_new_scan() {
        let (mut m, _rx) = machine();
        let first = m.handle(LinkEvent::Scan).unwrap().unwrap();
        m.handle(LinkEvent::Disconnect).unwrap();
        assert_eq!(m.state(), LinkState::Idle);

        let _second = m.handle(LinkEvent::Scan).unwrap().unwrap();
        assert_eq!(m.handle(LinkEvent::Timer(first.event)), Ok(None));
        assert_eq!(m.state(), LinkState::Scanning);
    }

    #[test]
    fn test_ready_requires_both_channels_and_notifications() {
        let (mut m, mut rx) = machine();
        let (connection, timer) = drive_to_discovery(&mut m);
        assert_eq!(m.state(), LinkState::DiscoveringServices);
        assert_eq!(timer.unwrap().after, Duration::from_secs(5));
        assert!(m
            .transport()
            .calls
            .contains(&Call::DiscoverServices(connection)));
        assert_eq!(m.channels(), None);

        transport_event(
            &mut m,
            TransportEvent::ServicesDiscovered {
                connection,
                status: GATT_SUCCESS,
                services: full_services(),
            },
        );
        assert!(m.is_connected());
        assert!(m.transport().calls.contains(&Call::EnableNotification(10)));
        let channels = m.channels().unwrap();
        assert_eq!(channels.config.handle, 13);

        let connected = drain(&mut rx).into_iter().any(|e| {
            matches!(e, AppEvent::LogMessage(StatusMessage { ref message, .. }) if message == "Connected")
        });
        assert!(connected);
    }

    #[test]
    fn test_notification_failure_stalls_discovery() {
        let mut transport = MockTransport::new();
        transport.notifications_ok = false;
        let (mut m, _rx) = machine_with(transport, ConnectionConfig::default());
        let (connection, _) = drive_to_discovery(&mut m);

        transport_event(
            &mut m,
            TransportEvent::ServicesDiscovered {
                connection,
                status: GATT_SUCCESS,
                services: full_services(),
            },
        );
        assert_eq!(m.state(), LinkState::DiscoveringServices);
        assert!(!m.is_connected());
    }

    #[test]
    fn test_disconnect_during_discovery_clears_partial_channels() {
        let (mut m, _rx) = machine();
        let (connection, _) = drive_to_discovery(&mut m);

        let mut services = full_services();
        services[0].characteristics.truncate(1);
        transport_event(
            &mut m,
            TransportEvent::ServicesDiscovered {
                connection,
                status: GATT_SUCCESS,
                services,
            },
        );
        assert_eq!(m.state(), LinkState::DiscoveringServices);
        assert!(m.partial_channels().unwrap().telemetry.is_some());

        transport_event(
            &mut m,
            TransportEvent::ConnectionStateChanged {
                connection,
                status: 8,
                state: GattConnectionState::Disconnected,
            },
        );
        assert_eq!(
            m.state(),
            LinkState::Disconnected(DisconnectReason::Status(8))
        );
        assert_eq!(m.partial_channels(), None);
        assert_eq!(m.channels(), None);
        assert!(m.transport().calls.contains(&Call::Close(connection)));
    }

    #[test]
    fn test_discovery_timeout_requests_disconnect() {
        let (mut m, _rx) = machine();
        let (connection, timer) = drive_to_discovery(&mut m);

        assert_eq!(
            m.handle(LinkEvent::Timer(timer.unwrap().event)),
            Err(LinkError::DiscoveryIncomplete)
        );
        // The state change waits for the transport's disconnect event
        assert_eq!(m.state(), LinkState::DiscoveringServices);
        assert!(m.transport().calls.contains(&Call::Disconnect(connection)));
    }

    #[test]
    fn test_discovery_without_timeout_stalls() {
        let config = ConnectionConfig {
            discovery_timeout: None,
            ..ConnectionConfig::default()
        };
        let (mut m, _rx) = machine_with(MockTransport::new(), config);
        let (_, timer) = drive_to_discovery(&mut m);
        assert_eq!(timer, None);
    }

    #[test]
    fn test_send_allows_single_outstanding_write() {
        let (mut m, _rx) = machine();
        let connection = drive_to_ready(&mut m);

        assert_eq!(m.send(&frame()), Ok(true));
        assert!(m.is_write_pending());
        assert_eq!(m.send(&frame()), Ok(false));
        assert_eq!(m.transport().count(|c| matches!(c, Call::Write(..))), 1);
        assert!(m
            .transport()
            .calls
            .contains(&Call::Write(13, frame().encode().to_vec())));

        // Completion clears the flag even on failure
        transport_event(
            &mut m,
            TransportEvent::CharacteristicWritten {
                connection,
                characteristic: protocol::CONFIG_CHAR_UUID,
                status: 133,
            },
        );
        assert!(!m.is_write_pending());
        assert_eq!(m.send(&frame()), Ok(true));
        assert_eq!(m.transport().count(|c| matches!(c, Call::Write(..))), 2);
    }

    #[test]
    fn test_send_before_ready_is_dropped() {
        let (mut m, _rx) = machine();
        assert_eq!(m.send(&frame()), Ok(false));
        drive_to_discovery(&mut m);
        assert_eq!(m.send(&frame()), Ok(false));
        assert_eq!(m.transport().count(|c| matches!(c, Call::Write(..))), 0);
    }

    #[test]
    fn test_rejected_write_leaves_flag_clear() {
        let (mut m, _rx) = machine();
        drive_to_ready(&mut m);
        m.transport.reject_writes = true;

        assert!(matches!(m.send(&frame()), Err(LinkError::WriteRejected(_))));
        assert!(!m.is_write_pending());
    }

    #[test]
    fn test_repeated_write_refusals_reported_once() {
        let (mut m, _rx) = machine();
        let connection = drive_to_ready(&mut m);
        m.transport.reject_writes = true;

        let errors = (0..20)
            .filter(|_| m.handle(LinkEvent::Send(frame())).is_err())
            .count();
        assert_eq!(errors, 1);
        assert!(!m.is_write_pending());

        // A successful write re-arms reporting
        m.transport.reject_writes = false;
        assert_eq!(m.send(&frame()), Ok(true));
        transport_event(
            &mut m,
            TransportEvent::CharacteristicWritten {
                connection,
                characteristic: protocol::CONFIG_CHAR_UUID,
                status: GATT_SUCCESS,
            },
        );
        m.transport.reject_writes = true;
        assert!(matches!(m.send(&frame()), Err(LinkError::WriteRejected(_))));
    }

    #[test]
    fn test_disconnect_from_ready_clears_channels_and_pending_write() {
        let (mut m, _rx) = machine();
        let connection = drive_to_ready(&mut m);
        m.send(&frame()).unwrap();

        m.handle(LinkEvent::Disconnect).unwrap();
        // Still ready until the transport confirms
        assert!(m.is_connected());
        assert!(m.transport().calls.contains(&Call::Disconnect(connection)));

        transport_event(
            &mut m,
            TransportEvent::ConnectionStateChanged {
                connection,
                status: 0,
                state: GattConnectionState::Disconnected,
            },
        );
        assert_eq!(
            m.state(),
            LinkState::Disconnected(DisconnectReason::Status(0))
        );
        assert!(!m.is_write_pending());
        assert_eq!(m.channels(), None);

        // Recoverable by scanning again
        assert!(m.handle(LinkEvent::Scan).unwrap().is_some());
        assert_eq!(m.state(), LinkState::Scanning);
    }

    #[test]
    fn test_events_for_stale_connection_are_ignored() {
        let (mut m, _rx) = machine();
        drive_to_ready(&mut m);

        transport_event(
            &mut m,
            TransportEvent::ConnectionStateChanged {
                connection: ConnectionHandle(99),
                status: 19,
                state: GattConnectionState::Disconnected,
            },
        );
        assert!(m.is_connected());
    }

    #[test]
    fn test_telemetry_notification_is_decoded() {
        let (mut m, mut rx) = machine();
        let connection = drive_to_ready(&mut m);
        drain(&mut rx);

        for value in [vec![4, 0, 25], vec![4]] {
            transport_event(
                &mut m,
                TransportEvent::Notification {
                    connection,
                    characteristic: protocol::TELEMETRY_CHAR_UUID,
                    value,
                },
            );
        }

        let samples: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                AppEvent::Telemetry(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(
            samples,
            vec![TelemetrySample {
                rpm: 15000.0,
                battery_voltage: 2.5
            }]
        );
    }

    #[test]
    fn test_disconnect_event_while_connecting() {
        let (mut m, _rx) = machine();
        m.handle(LinkEvent::Scan).unwrap();
        let settle = transport_event(&mut m, TransportEvent::DeviceDiscovered(robot())).unwrap();
        m.handle(LinkEvent::Timer(settle.event)).unwrap();
        let connection = ConnectionHandle(m.transport().next_connection - 1);
        assert_eq!(m.state(), LinkState::Connecting);

        transport_event(
            &mut m,
            TransportEvent::ConnectionStateChanged {
                connection,
                status: 133,
                state: GattConnectionState::Disconnected,
            },
        );
        assert_eq!(
            m.state(),
            LinkState::Disconnected(DisconnectReason::Status(133))
        );
        assert!(m.transport().calls.contains(&Call::Close(connection)));
        assert_eq!(m.channels(), None);
    }

    #[test]
    fn test_disconnect_before_connect_issued_is_noop() {
        let (mut m, _rx) = machine();
        m.handle(LinkEvent::Scan).unwrap();
        let settle = transport_event(&mut m, TransportEvent::DeviceDiscovered(robot())).unwrap();

        assert_eq!(m.handle(LinkEvent::Disconnect), Ok(None));
        assert_eq!(m.state(), LinkState::Connecting);
        assert_eq!(
            m.transport().count(|c| matches!(c, Call::Disconnect(_))),
            0
        );

        // The pending connect still fires
        m.handle(LinkEvent::Timer(settle.event)).unwrap();
        assert_eq!(m.state(), LinkState::Connecting);
        assert_eq!(m.transport().count(|c| matches!(c, Call::Connect(_))), 1);
    }

    #[test]
    fn test_connect_rejection_lands_in_disconnected() {
        struct Rejecting(MockTransport);
        impl GattTransport for Rejecting {
            fn has_permission(&self) -> bool {
                true
            }
            fn start_scan(&mut self, f: Option<&str>) -> Result<(), TransportError> {
                self.0.start_scan(f)
            }
            fn stop_scan(&mut self) {}
            fn connect(
                &mut self,
                _: &PeripheralIdentity,
            ) -> Result<ConnectionHandle, TransportError> {
                Err(TransportError::Refused("no slots".to_string()))
            }
            fn discover_services(&mut self, _: ConnectionHandle) -> Result<(), TransportError> {
                Ok(())
            }
            fn enable_notification(&mut self, _: ConnectionHandle, _: &GattCharacteristic) -> bool {
                true
            }
            fn write_characteristic(
                &mut self,
                _: ConnectionHandle,
                _: &GattCharacteristic,
                _: &[u8],
            ) -> Result<(), TransportError> {
                Ok(())
            }
            fn disconnect(&mut self, _: ConnectionHandle) {}
            fn close(&mut self, _: ConnectionHandle) {}
        }

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut m = LinkStateMachine::new(
            Rejecting(MockTransport::new()),
            ConnectionConfig::default(),
            tx,
        );
        m.handle(LinkEvent::Scan).unwrap();
        let settle = m
            .handle(LinkEvent::Transport(TransportEvent::DeviceDiscovered(robot())))
            .unwrap()
            .unwrap();
        assert!(matches!(
            m.handle(LinkEvent::Timer(settle.event)),
            Err(LinkError::Transport(TransportError::Refused(_)))
        ));
        assert_eq!(
            m.state(),
            LinkState::Disconnected(DisconnectReason::ConnectRejected)
        );
    }
}
