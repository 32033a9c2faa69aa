//! BLE Connection Module
//!
//! The connection session state machine: scan, connect, discover the Heart
//! Rate service and its characteristics, subscribe, and decode notifications.
//!
//! Every radio callback and every command runs to completion on the owning
//! task, so transitions never interleave. Callbacks that arrive for a stage
//! the session has already left are ignored; that is where cancellation
//! takes effect.

use crate::domain::error::{ConnectFailure, GattError, SessionError};
use crate::domain::models::{
    AdapterState, BluetoothCommand, CharacteristicHandle, DeviceId, DiscoveredDevice,
    HeartRateMeasurement, PeripheralHandle, SessionEvent, SessionState,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::protocol::{self, RESET_ENERGY_EXPENDED};
use crate::infrastructure::bluetooth::radio::{
    GattCharacteristic, GattService, Radio, RadioEvent,
};
use crate::infrastructure::bluetooth::scanner::BleScanner;
use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Connect to the first advertiser of `service_uuid` without a selection
    pub auto_connect: bool,
    /// Service UUID to scan for and require on connect
    pub service_uuid: Uuid,
    /// Measurement characteristic UUID (must support notify)
    pub measurement_char_uuid: Uuid,
    /// Optional body sensor location characteristic UUID
    pub sensor_location_char_uuid: Uuid,
    /// Optional control point characteristic UUID
    pub control_point_char_uuid: Uuid,
    /// End a scan after this long
    pub scan_timeout: Option<Duration>,
    /// Prune registry entries not seen for this long
    pub device_stale_after: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_connect: false,
            service_uuid: protocol::HEART_RATE_SERVICE_UUID,
            measurement_char_uuid: protocol::HEART_RATE_MEASUREMENT_UUID,
            sensor_location_char_uuid: protocol::BODY_SENSOR_LOCATION_UUID,
            control_point_char_uuid: protocol::HEART_RATE_CONTROL_POINT_UUID,
            scan_timeout: None,
            device_stale_after: None,
        }
    }
}

/// Upper bound for configured durations (one week)
const MAX_CONFIGURED_SECS: u64 = 7 * 24 * 60 * 60;

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let secs = |name: &str, value: u64| -> Result<Option<Duration>> {
            if value > MAX_CONFIGURED_SECS {
                anyhow::bail!(
                    "{} must be at most {} seconds, got {}",
                    name,
                    MAX_CONFIGURED_SECS,
                    value
                );
            }
            Ok((value > 0).then(|| Duration::from_secs(value)))
        };

        Ok(Self {
            auto_connect: settings.auto_connect,
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            measurement_char_uuid: protocol::parse_uuid(&settings.ble_measurement_char_uuid)?,
            sensor_location_char_uuid: protocol::parse_uuid(
                &settings.ble_sensor_location_char_uuid,
            )?,
            control_point_char_uuid: protocol::parse_uuid(&settings.ble_control_point_char_uuid)?,
            scan_timeout: secs("scan_timeout_secs", settings.scan_timeout_secs)?,
            device_stale_after: secs("device_stale_after_secs", settings.device_stale_after_secs)?,
        })
    }
}

/// The single active heart rate session.
pub struct ConnectionSession<R: Radio> {
    radio: R,
    config: SessionConfig,
    scanner: BleScanner,
    event_sender: mpsc::UnboundedSender<SessionEvent>,

    adapter_state: AdapterState,
    state: SessionState,
    target: Option<DiscoveredDevice>,
    peripheral: Option<PeripheralHandle>,
    measurement_char: Option<CharacteristicHandle>,
    sensor_location_char: Option<CharacteristicHandle>,
    control_point_char: Option<CharacteristicHandle>,
    last_measurement: Option<HeartRateMeasurement>,
}

impl<R: Radio> ConnectionSession<R> {
    /// Create an idle session
    pub fn new(
        radio: R,
        config: SessionConfig,
        event_sender: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let stale_after = config
            .device_stale_after
            .and_then(|d| chrono::Duration::from_std(d).ok());
        Self {
            radio,
            scanner: BleScanner::new(config.service_uuid, stale_after),
            config,
            event_sender,
            adapter_state: AdapterState::Unknown,
            state: SessionState::Idle,
            target: None,
            peripheral: None,
            measurement_char: None,
            sensor_location_char: None,
            control_point_char: None,
            last_measurement: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.adapter_state
    }

    pub fn target(&self) -> Option<&DiscoveredDevice> {
        self.target.as_ref()
    }

    pub fn last_measurement(&self) -> Option<&HeartRateMeasurement> {
        self.last_measurement.as_ref()
    }

    pub fn heart_rate_characteristic(&self) -> Option<CharacteristicHandle> {
        self.measurement_char
    }

    pub fn devices(&self) -> Vec<DiscoveredDevice> {
        self.scanner.registry().all()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn handle_command(&mut self, command: BluetoothCommand) -> Result<(), SessionError> {
        match command {
            BluetoothCommand::StartScan => self.start_scan(),
            BluetoothCommand::StopScan => self.stop_scan(),
            BluetoothCommand::SelectDevice(id) => self.select_device(&id),
            BluetoothCommand::Cancel => self.cancel(),
            BluetoothCommand::Disconnect => self.disconnect(),
            BluetoothCommand::ResetEnergyExpended => self.reset_energy_expended(),
        }
    }

    /// Begin a new scan cycle. Requires a powered-on adapter.
    pub fn start_scan(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return self.reject(self.invalid("start_scan"));
        }
        if !self.adapter_state.is_powered_on() {
            return self.reject(SessionError::AdapterUnavailable(self.adapter_state));
        }

        self.scanner.start(&mut self.radio);
        self.set_state(SessionState::Scanning);
        self.emit(SessionEvent::DevicesChanged(Vec::new()));
        Ok(())
    }

    pub fn stop_scan(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Scanning {
            return self.reject(self.invalid("stop_scan"));
        }
        self.scanner.stop(&mut self.radio);
        self.set_state(SessionState::Idle);
        Ok(())
    }

    /// Scan timer expiry. A timer that fires after the scan ended is a no-op.
    pub fn scan_timed_out(&mut self) {
        if self.state == SessionState::Scanning {
            info!("Scan timed out");
            self.scanner.stop(&mut self.radio);
            self.set_state(SessionState::Idle);
        }
    }

    /// Connect to a device from the registry. Accepted while scanning, or
    /// while idle with the previous scan's results still listed.
    pub fn select_device(&mut self, identifier: &DeviceId) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Scanning | SessionState::Idle) {
            return self.reject(self.invalid("select_device"));
        }
        if !self.adapter_state.is_powered_on() {
            return self.reject(SessionError::AdapterUnavailable(self.adapter_state));
        }
        let Some(device) = self.scanner.registry().get(identifier).cloned() else {
            return self.reject(SessionError::UnknownDevice(identifier.clone()));
        };

        self.connect_to(device);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Scanning => {
                self.scanner.stop(&mut self.radio);
                self.set_state(SessionState::Cancelled);
                self.set_state(SessionState::Idle);
            }
            SessionState::Connecting
            | SessionState::DiscoveringServices
            | SessionState::DiscoveringCharacteristics
            | SessionState::Subscribing => {
                info!("Cancelling connection attempt");
                self.set_state(SessionState::Cancelled);
                self.begin_disconnect();
            }
            SessionState::Streaming => self.begin_disconnect(),
            _ => return self.reject(self.invalid("cancel")),
        }
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<(), SessionError> {
        if !self.state.has_link() {
            return self.reject(self.invalid("disconnect"));
        }
        self.begin_disconnect();
        Ok(())
    }

    /// Write the reset command to the control point while streaming.
    pub fn reset_energy_expended(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Streaming {
            return self.reject(self.invalid("reset_energy_expended"));
        }
        let Some(control_point) = self.control_point_char else {
            return self.reject(SessionError::CharacteristicNotSupported);
        };

        info!("Resetting energy expended");
        self.radio.write(control_point, &[RESET_ENERGY_EXPENDED]);
        Ok(())
    }

    pub fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            RadioEvent::Advertisement(advertisement) => {
                if self.state != SessionState::Scanning {
                    trace!("Advertisement while {}", self.state);
                    return;
                }
                let Some(result) = self.scanner.on_advertisement(&advertisement, Utc::now())
                else {
                    return;
                };
                if result.pruned > 0 {
                    debug!("Pruned {} stale devices", result.pruned);
                }
                self.emit(SessionEvent::DevicesChanged(self.scanner.registry().all()));

                if self.config.auto_connect && result.advertises_service {
                    info!("Auto-connecting to {}", result.device.label());
                    self.connect_to(result.device);
                }
            }
            RadioEvent::Connected(peripheral) => self.on_connected(peripheral),
            RadioEvent::ConnectFailed(reason) => self.on_connect_failed(reason),
            RadioEvent::ServicesDiscovered(result) => self.on_services(result),
            RadioEvent::CharacteristicsDiscovered(result) => self.on_characteristics(result),
            RadioEvent::Subscribed(result) => self.on_subscribed(result),
            RadioEvent::Notification(handle, value) => self.on_notification(handle, &value),
            RadioEvent::CharacteristicRead(handle, result) => self.on_read(handle, result),
            RadioEvent::Disconnected(peripheral) => self.on_disconnected(peripheral),
        }
    }

    fn on_adapter_state(&mut self, adapter_state: AdapterState) {
        let previous = std::mem::replace(&mut self.adapter_state, adapter_state);
        if previous != adapter_state {
            info!("Adapter state: {} -> {}", previous, adapter_state);
        }
        if adapter_state.is_powered_on() || self.state == SessionState::Idle {
            return;
        }

        warn!(
            "Adapter {} while {}; tearing down session",
            adapter_state, self.state
        );
        self.scanner.abandon();
        self.reset_link();
        self.set_state(SessionState::Idle);
        self.emit(SessionEvent::RadioUnavailable(adapter_state));
    }

    fn connect_to(&mut self, device: DiscoveredDevice) {
        // The radio cannot reliably scan and connect at the same time
        self.scanner.stop(&mut self.radio);

        info!("Connecting to {} ({})", device.label(), device.identifier);
        let identifier = device.identifier.clone();
        self.target = Some(device);
        self.set_state(SessionState::Connecting);
        self.radio.connect(&identifier);
    }

    fn on_connected(&mut self, peripheral: PeripheralHandle) {
        if self.state != SessionState::Connecting {
            debug!("Ignoring connect callback while {}", self.state);
            return;
        }
        info!("Device connected, discovering services...");
        self.peripheral = Some(peripheral);
        self.set_state(SessionState::DiscoveringServices);
        self.radio.discover_services(peripheral);
    }

    fn on_connect_failed(&mut self, reason: ConnectFailure) {
        if self.state != SessionState::Connecting {
            debug!("Ignoring connect failure while {}", self.state);
            return;
        }
        self.fail_attempt(SessionError::ConnectFailed(reason));
    }

    fn on_services(&mut self, result: Result<Vec<GattService>, GattError>) {
        if self.state != SessionState::DiscoveringServices {
            debug!("Ignoring service discovery result while {}", self.state);
            return;
        }
        let services = match result {
            Ok(services) => services,
            Err(e) => return self.fail_attempt(e.into()),
        };

        match services.iter().find(|s| s.uuid == self.config.service_uuid) {
            Some(service) => {
                info!("Found heart rate service");
                let handle = service.handle;
                self.set_state(SessionState::DiscoveringCharacteristics);
                self.radio.discover_characteristics(handle);
            }
            None => self.fail_attempt(SessionError::ServiceNotSupported),
        }
    }

    fn on_characteristics(&mut self, result: Result<Vec<GattCharacteristic>, GattError>) {
        if self.state != SessionState::DiscoveringCharacteristics {
            debug!("Ignoring characteristic discovery result while {}", self.state);
            return;
        }
        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(e) => return self.fail_attempt(e.into()),
        };
        info!("Found {} characteristics", characteristics.len());

        let find = |uuid: Uuid, usable: fn(&GattCharacteristic) -> bool| {
            characteristics
                .iter()
                .find(|c| c.uuid == uuid && usable(c))
                .map(|c| c.handle)
        };

        let Some(measurement) = find(self.config.measurement_char_uuid, |c| c.properties.notify)
        else {
            return self.fail_attempt(SessionError::CharacteristicNotSupported);
        };
        self.measurement_char = Some(measurement);
        self.sensor_location_char =
            find(self.config.sensor_location_char_uuid, |c| c.properties.read);
        self.control_point_char = find(self.config.control_point_char_uuid, |c| c.properties.write);

        self.set_state(SessionState::Subscribing);
        self.radio.subscribe(measurement);
        if let Some(location) = self.sensor_location_char {
            self.radio.read(location);
        }
    }

    fn on_subscribed(&mut self, result: Result<CharacteristicHandle, GattError>) {
        if self.state != SessionState::Subscribing {
            debug!("Ignoring subscription result while {}", self.state);
            return;
        }
        match result {
            Ok(handle) if Some(handle) == self.measurement_char => {
                info!("Notifications enabled");
                self.set_state(SessionState::Streaming);
            }
            Ok(handle) => {
                // Only the measurement characteristic was subscribed
                warn!("Subscription confirmed for unexpected {:?}", handle);
                self.fail_attempt(SessionError::CharacteristicNotSupported);
            }
            Err(e) => self.fail_attempt(e.into()),
        }
    }

    fn on_notification(&mut self, handle: CharacteristicHandle, value: &[u8]) {
        if self.state != SessionState::Streaming || Some(handle) != self.measurement_char {
            trace!("Ignoring notification on {:?} while {}", handle, self.state);
            return;
        }

        match protocol::decode_measurement(value) {
            Ok(measurement) => {
                debug!("Heart rate: {} bpm", measurement.beats_per_minute);
                self.last_measurement = Some(measurement.clone());
                self.emit(SessionEvent::Measurement(measurement));
            }
            Err(e) => {
                warn!("Dropping malformed measurement {:02X?}: {}", value, e);
                self.emit(SessionEvent::Warning(e.into()));
            }
        }
    }

    fn on_read(&mut self, handle: CharacteristicHandle, result: Result<Vec<u8>, GattError>) {
        if !self.state.has_link() || Some(handle) != self.sensor_location_char {
            debug!("Ignoring read result for {:?} while {}", handle, self.state);
            return;
        }

        let location = result
            .map_err(SessionError::from)
            .and_then(|value| protocol::decode_sensor_location(&value).map_err(Into::into));
        match location {
            Ok(location) => {
                info!("Body sensor location: {:?}", location);
                self.emit(SessionEvent::SensorLocation(location));
            }
            Err(e) => {
                warn!("Could not read body sensor location: {}", e);
                self.emit(SessionEvent::Warning(e));
            }
        }
    }

    fn on_disconnected(&mut self, peripheral: PeripheralHandle) {
        if self.peripheral.is_some_and(|p| p != peripheral) {
            debug!("Ignoring disconnect for foreign peripheral {:?}", peripheral);
            return;
        }

        match self.state {
            SessionState::Disconnecting => {
                info!("Disconnected from device");
                self.reset_link();
                self.set_state(SessionState::Idle);
            }
            state if state.has_link() => {
                // Link is already gone; nothing to tear down on the radio
                self.peripheral = None;
                self.fail_attempt(SessionError::ConnectionLost);
            }
            state => debug!("Ignoring disconnect callback while {}", state),
        }
    }

    /// Report a structural failure once, then unwind the attempt.
    fn fail_attempt(&mut self, err: SessionError) {
        error!("Session failed while {}: {}", self.state, err);
        self.emit(SessionEvent::Failure(err));
        self.set_state(SessionState::Failed);

        if self.peripheral.is_some() {
            self.begin_disconnect();
        } else {
            self.reset_link();
            self.set_state(SessionState::Idle);
        }
    }

    fn begin_disconnect(&mut self) {
        self.set_state(SessionState::Disconnecting);
        match self.target.as_ref() {
            Some(target) => {
                let identifier = target.identifier.clone();
                self.radio.disconnect(&identifier);
            }
            None => {
                self.reset_link();
                self.set_state(SessionState::Idle);
            }
        }
    }

    fn reset_link(&mut self) {
        self.target = None;
        self.peripheral = None;
        self.measurement_char = None;
        self.sensor_location_char = None;
        self.control_point_char = None;
        self.last_measurement = None;
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        debug!("Session state: {} -> {}", self.state, state);
        self.state = state;
        self.emit(SessionEvent::StateChanged(state));
    }

    fn invalid(&self, command: &'static str) -> SessionError {
        SessionError::InvalidState {
            command,
            state: self.state,
        }
    }

    fn reject(&self, err: SessionError) -> Result<(), SessionError> {
        warn!("Command rejected: {}", err);
        self.emit(SessionEvent::Failure(err.clone()));
        Err(err)
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::DecodeError;
    use crate::domain::models::{BodySensorLocation, ServiceHandle};
    use crate::infrastructure::bluetooth::protocol::{
        BODY_SENSOR_LOCATION_UUID, HEART_RATE_CONTROL_POINT_UUID, HEART_RATE_MEASUREMENT_UUID,
        HEART_RATE_SERVICE_UUID,
    };
    use crate::infrastructure::bluetooth::radio::testing::{RadioCall, RecordingRadio};
    use crate::infrastructure::bluetooth::radio::{Advertisement, CharProps};

    const PERIPHERAL: PeripheralHandle = PeripheralHandle(1);
    const HR_SERVICE: ServiceHandle = ServiceHandle(10);
    const MEASUREMENT: CharacteristicHandle = CharacteristicHandle(11);
    const LOCATION: CharacteristicHandle = CharacteristicHandle(12);
    const CONTROL_POINT: CharacteristicHandle = CharacteristicHandle(13);

    type Session = ConnectionSession<RecordingRadio>;

    fn session_with(config: SessionConfig) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = ConnectionSession::new(RecordingRadio::default(), config, tx);
        session.handle_radio_event(RadioEvent::AdapterStateChanged(AdapterState::PoweredOn));
        (session, rx)
    }

    fn session() -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        session_with(SessionConfig::default())
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[SessionEvent]) -> Vec<SessionState> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::StateChanged(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    fn failures(events: &[SessionEvent]) -> Vec<SessionError> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Failure(err) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    fn advert(id: &str, services: Vec<Uuid>) -> RadioEvent {
        RadioEvent::Advertisement(Advertisement {
            identifier: DeviceId::from(id),
            local_name: Some("Chest Strap".to_string()),
            manufacturer_data: Some(vec![0x6B, 0x00]),
            service_uuids: services,
            rssi: -58,
        })
    }

    fn hr_services() -> RadioEvent {
        RadioEvent::ServicesDiscovered(Ok(vec![
            GattService {
                uuid: protocol::uuid_from_u16(0x180A),
                handle: ServiceHandle(5),
            },
            GattService {
                uuid: HEART_RATE_SERVICE_UUID,
                handle: HR_SERVICE,
            },
        ]))
    }

    fn hr_characteristics(with_optional: bool) -> RadioEvent {
        let mut characteristics = vec![GattCharacteristic {
            uuid: HEART_RATE_MEASUREMENT_UUID,
            handle: MEASUREMENT,
            properties: CharProps {
                notify: true,
                ..Default::default()
            },
        }];
        if with_optional {
            characteristics.push(GattCharacteristic {
                uuid: BODY_SENSOR_LOCATION_UUID,
                handle: LOCATION,
                properties: CharProps {
                    read: true,
                    ..Default::default()
                },
            });
            characteristics.push(GattCharacteristic {
                uuid: HEART_RATE_CONTROL_POINT_UUID,
                handle: CONTROL_POINT,
                properties: CharProps {
                    write: true,
                    ..Default::default()
                },
            });
        }
        RadioEvent::CharacteristicsDiscovered(Ok(characteristics))
    }

    /// Drive a fresh session all the way to Streaming.
    fn streaming(with_optional: bool) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("strap", vec![HEART_RATE_SERVICE_UUID]));
        session.select_device(&DeviceId::from("strap")).unwrap();
        session.handle_radio_event(RadioEvent::Connected(PERIPHERAL));
        session.handle_radio_event(hr_services());
        session.handle_radio_event(hr_characteristics(with_optional));
        session.handle_radio_event(RadioEvent::Subscribed(Ok(MEASUREMENT)));
        assert_eq!(session.state(), SessionState::Streaming);
        drain(&mut rx);
        session.radio_mut().take_calls();
        (session, rx)
    }

    #[test]
    fn test_scan_requires_powered_on_adapter() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session =
            ConnectionSession::new(RecordingRadio::default(), SessionConfig::default(), tx);

        let err = session.start_scan().unwrap_err();
        assert_eq!(err, SessionError::AdapterUnavailable(AdapterState::Unknown));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.radio().calls.is_empty());
        assert_eq!(failures(&drain(&mut rx)), vec![err]);
    }

    #[test]
    fn test_start_scan_clears_registry() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("a", vec![]));
        session.stop_scan().unwrap();
        assert_eq!(session.devices().len(), 1);

        session.start_scan().unwrap();
        assert!(session.devices().is_empty());
        assert_eq!(session.state(), SessionState::Scanning);
        assert_eq!(
            session.radio().calls.last(),
            Some(&RadioCall::StartScan(HEART_RATE_SERVICE_UUID))
        );
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&SessionEvent::DevicesChanged(Vec::new())));
    }

    #[test]
    fn test_select_unknown_device_stays_scanning() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        drain(&mut rx);

        let err = session.select_device(&DeviceId::from("missing")).unwrap_err();
        assert_eq!(err, SessionError::UnknownDevice(DeviceId::from("missing")));
        assert_eq!(session.state(), SessionState::Scanning);

        let events = drain(&mut rx);
        assert!(states(&events).is_empty());
        assert_eq!(failures(&events), vec![err]);
    }

    #[test]
    fn test_full_connection_flow() {
        let (mut session, mut rx) = session();
        drain(&mut rx);

        session.start_scan().unwrap();
        session.handle_radio_event(advert("strap", vec![HEART_RATE_SERVICE_UUID]));
        session.select_device(&DeviceId::from("strap")).unwrap();
        assert_eq!(session.target().unwrap().display_name, "Chest Strap");

        session.handle_radio_event(RadioEvent::Connected(PERIPHERAL));
        session.handle_radio_event(hr_services());
        session.handle_radio_event(hr_characteristics(true));
        session.handle_radio_event(RadioEvent::Subscribed(Ok(MEASUREMENT)));
        session.handle_radio_event(RadioEvent::Notification(MEASUREMENT, vec![0x00, 0x48]));

        assert_eq!(session.heart_rate_characteristic(), Some(MEASUREMENT));
        assert_eq!(session.last_measurement().unwrap().beats_per_minute, 72);
        assert_eq!(
            session.radio_mut().take_calls(),
            vec![
                RadioCall::StartScan(HEART_RATE_SERVICE_UUID),
                RadioCall::StopScan,
                RadioCall::Connect(DeviceId::from("strap")),
                RadioCall::DiscoverServices(PERIPHERAL),
                RadioCall::DiscoverCharacteristics(HR_SERVICE),
                RadioCall::Subscribe(MEASUREMENT),
                RadioCall::Read(LOCATION),
            ]
        );

        let events = drain(&mut rx);
        assert_eq!(
            states(&events),
            vec![
                SessionState::Scanning,
                SessionState::Connecting,
                SessionState::DiscoveringServices,
                SessionState::DiscoveringCharacteristics,
                SessionState::Subscribing,
                SessionState::Streaming,
            ]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            SessionEvent::Measurement(m) if m.beats_per_minute == 72
        )));
    }

    #[test]
    fn test_decode_error_keeps_streaming() {
        let (mut session, mut rx) = streaming(false);
        session.handle_radio_event(RadioEvent::Notification(MEASUREMENT, vec![0x00, 0x50]));
        session.handle_radio_event(RadioEvent::Notification(MEASUREMENT, vec![0x10, 0x48, 0x01]));

        assert_eq!(session.state(), SessionState::Streaming);
        assert_eq!(session.last_measurement().unwrap().beats_per_minute, 80);

        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&SessionEvent::Warning(SessionError::Decode(
                DecodeError::TrailingOddByte
            )))
        );
        assert!(failures(&events).is_empty());
    }

    #[test]
    fn test_radio_lost_while_streaming() {
        let (mut session, mut rx) = streaming(false);
        session.handle_radio_event(RadioEvent::Notification(MEASUREMENT, vec![0x00, 0x50]));
        session.handle_radio_event(RadioEvent::AdapterStateChanged(AdapterState::PoweredOff));

        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.target().is_none());
        assert!(session.last_measurement().is_none());
        assert!(session.heart_rate_characteristic().is_none());
        assert!(session.radio().calls.is_empty());

        let events = drain(&mut rx);
        assert_eq!(states(&events), vec![SessionState::Idle]);
        assert_eq!(
            events.last(),
            Some(&SessionEvent::RadioUnavailable(AdapterState::PoweredOff))
        );
        assert!(failures(&events).is_empty());

        // Scanning is possible again once the adapter comes back
        assert!(session.start_scan().is_err());
        session.handle_radio_event(RadioEvent::AdapterStateChanged(AdapterState::PoweredOn));
        assert!(session.start_scan().is_ok());
    }

    #[test]
    fn test_radio_lost_while_scanning() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        drain(&mut rx);

        session.handle_radio_event(RadioEvent::AdapterStateChanged(AdapterState::Resetting));
        assert_eq!(session.state(), SessionState::Idle);
        session.handle_radio_event(advert("late", vec![]));
        assert!(session.devices().is_empty());
        assert_eq!(
            drain(&mut rx).last(),
            Some(&SessionEvent::RadioUnavailable(AdapterState::Resetting))
        );
    }

    #[test]
    fn test_service_not_supported_disconnects() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("watch", vec![]));
        session.select_device(&DeviceId::from("watch")).unwrap();
        session.handle_radio_event(RadioEvent::Connected(PERIPHERAL));
        drain(&mut rx);
        session.radio_mut().take_calls();

        session.handle_radio_event(RadioEvent::ServicesDiscovered(Ok(Vec::new())));
        assert_eq!(session.state(), SessionState::Disconnecting);
        assert_eq!(
            session.radio_mut().take_calls(),
            vec![RadioCall::Disconnect(DeviceId::from("watch"))]
        );

        session.handle_radio_event(RadioEvent::Disconnected(PERIPHERAL));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.target().is_none());

        let events = drain(&mut rx);
        assert_eq!(failures(&events), vec![SessionError::ServiceNotSupported]);
        assert_eq!(
            states(&events),
            vec![
                SessionState::Failed,
                SessionState::Disconnecting,
                SessionState::Idle
            ]
        );
    }

    #[test]
    fn test_characteristic_without_notify_is_unsupported() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("strap", vec![]));
        session.select_device(&DeviceId::from("strap")).unwrap();
        session.handle_radio_event(RadioEvent::Connected(PERIPHERAL));
        session.handle_radio_event(hr_services());
        drain(&mut rx);

        session.handle_radio_event(RadioEvent::CharacteristicsDiscovered(Ok(vec![
            GattCharacteristic {
                uuid: HEART_RATE_MEASUREMENT_UUID,
                handle: MEASUREMENT,
                properties: CharProps {
                    read: true,
                    ..Default::default()
                },
            },
        ])));

        assert_eq!(session.state(), SessionState::Disconnecting);
        assert_eq!(
            failures(&drain(&mut rx)),
            vec![SessionError::CharacteristicNotSupported]
        );
    }

    #[test]
    fn test_connect_failure_returns_to_idle() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("strap", vec![]));
        session.select_device(&DeviceId::from("strap")).unwrap();
        drain(&mut rx);
        session.radio_mut().take_calls();

        session.handle_radio_event(RadioEvent::ConnectFailed(ConnectFailure::Timeout));

        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.target().is_none());
        assert!(session.radio().calls.is_empty());
        let events = drain(&mut rx);
        assert_eq!(
            failures(&events),
            vec![SessionError::ConnectFailed(ConnectFailure::Timeout)]
        );
        assert_eq!(states(&events), vec![SessionState::Failed, SessionState::Idle]);
    }

    #[test]
    fn test_gatt_error_during_subscribe() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("strap", vec![]));
        session.select_device(&DeviceId::from("strap")).unwrap();
        session.handle_radio_event(RadioEvent::Connected(PERIPHERAL));
        session.handle_radio_event(hr_services());
        session.handle_radio_event(hr_characteristics(false));
        drain(&mut rx);

        let err = GattError("insufficient authentication".to_string());
        session.handle_radio_event(RadioEvent::Subscribed(Err(err.clone())));

        assert_eq!(session.state(), SessionState::Disconnecting);
        assert_eq!(failures(&drain(&mut rx)), vec![SessionError::Gatt(err)]);
    }

    #[test]
    fn test_subscription_for_wrong_handle_fails_attempt() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("strap", vec![]));
        session.select_device(&DeviceId::from("strap")).unwrap();
        session.handle_radio_event(RadioEvent::Connected(PERIPHERAL));
        session.handle_radio_event(hr_services());
        session.handle_radio_event(hr_characteristics(true));
        drain(&mut rx);

        session.handle_radio_event(RadioEvent::Subscribed(Ok(LOCATION)));

        let events = drain(&mut rx);
        assert_eq!(session.state(), SessionState::Disconnecting);
        assert_eq!(failures(&events), vec![SessionError::CharacteristicNotSupported]);
        assert_eq!(
            states(&events),
            vec![SessionState::Failed, SessionState::Disconnecting]
        );
    }

    #[test]
    fn test_cancel_while_connecting_ignores_late_callbacks() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("strap", vec![]));
        session.select_device(&DeviceId::from("strap")).unwrap();
        drain(&mut rx);
        session.radio_mut().take_calls();

        session.cancel().unwrap();
        assert_eq!(session.state(), SessionState::Disconnecting);
        assert_eq!(
            session.radio_mut().take_calls(),
            vec![RadioCall::Disconnect(DeviceId::from("strap"))]
        );

        // The native connect completes anyway; the session does not resume
        session.handle_radio_event(RadioEvent::Connected(PERIPHERAL));
        assert_eq!(session.state(), SessionState::Disconnecting);
        assert!(session.radio().calls.is_empty());

        session.handle_radio_event(RadioEvent::Disconnected(PERIPHERAL));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(
            states(&drain(&mut rx)),
            vec![
                SessionState::Cancelled,
                SessionState::Disconnecting,
                SessionState::Idle
            ]
        );
    }

    #[test]
    fn test_cancel_while_scanning() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        drain(&mut rx);

        session.cancel().unwrap();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.radio().calls.last(), Some(&RadioCall::StopScan));
        assert_eq!(
            states(&drain(&mut rx)),
            vec![SessionState::Cancelled, SessionState::Idle]
        );
    }

    #[test]
    fn test_cancel_when_idle_is_rejected() {
        let (mut session, _rx) = session();
        assert!(matches!(
            session.cancel(),
            Err(SessionError::InvalidState {
                command: "cancel",
                state: SessionState::Idle
            })
        ));
    }

    #[test]
    fn test_disconnect_while_streaming() {
        let (mut session, mut rx) = streaming(false);
        session.handle_radio_event(RadioEvent::Notification(MEASUREMENT, vec![0x00, 0x50]));

        session.handle_command(BluetoothCommand::Disconnect).unwrap();
        assert_eq!(session.state(), SessionState::Disconnecting);
        assert_eq!(
            session.radio().calls,
            vec![RadioCall::Disconnect(DeviceId::from("strap"))]
        );

        // Notifications still in flight are dropped
        session.handle_radio_event(RadioEvent::Notification(MEASUREMENT, vec![0x00, 0x51]));
        assert_eq!(session.last_measurement().unwrap().beats_per_minute, 80);

        session.handle_radio_event(RadioEvent::Disconnected(PERIPHERAL));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.last_measurement().is_none());
        assert!(session.target().is_none());
        assert!(failures(&drain(&mut rx)).is_empty());
    }

    #[test]
    fn test_unexpected_disconnect_reports_connection_lost() {
        let (mut session, mut rx) = streaming(false);
        session.handle_radio_event(RadioEvent::Disconnected(PERIPHERAL));

        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.radio().calls.is_empty());
        let events = drain(&mut rx);
        assert_eq!(failures(&events), vec![SessionError::ConnectionLost]);
        assert_eq!(states(&events), vec![SessionState::Failed, SessionState::Idle]);
    }

    #[test]
    fn test_auto_connect_on_heart_rate_advertisement() {
        let (mut session, _rx) = session_with(SessionConfig {
            auto_connect: true,
            ..Default::default()
        });
        session.start_scan().unwrap();

        session.handle_radio_event(advert("speaker", vec![]));
        assert_eq!(session.state(), SessionState::Scanning);

        session.handle_radio_event(advert("strap", vec![HEART_RATE_SERVICE_UUID]));
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(
            session.radio().calls.last(),
            Some(&RadioCall::Connect(DeviceId::from("strap")))
        );
    }

    #[test]
    fn test_select_from_idle_after_scan_stopped() {
        let (mut session, _rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("strap", vec![]));
        session.scan_timed_out();
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(session.devices().len(), 1);

        session.select_device(&DeviceId::from("strap")).unwrap();
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[test]
    fn test_notifications_before_streaming_ignored() {
        let (mut session, mut rx) = session();
        session.start_scan().unwrap();
        session.handle_radio_event(advert("strap", vec![]));
        session.select_device(&DeviceId::from("strap")).unwrap();
        session.handle_radio_event(RadioEvent::Connected(PERIPHERAL));
        session.handle_radio_event(hr_services());
        session.handle_radio_event(hr_characteristics(false));
        drain(&mut rx);

        session.handle_radio_event(RadioEvent::Notification(MEASUREMENT, vec![0x00, 0x48]));
        assert!(session.last_measurement().is_none());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_sensor_location_read() {
        let (mut session, mut rx) = streaming(true);
        session.handle_radio_event(RadioEvent::CharacteristicRead(LOCATION, Ok(vec![0x01])));
        session.handle_radio_event(RadioEvent::CharacteristicRead(LOCATION, Ok(Vec::new())));

        let events = drain(&mut rx);
        assert_eq!(
            events[0],
            SessionEvent::SensorLocation(BodySensorLocation::Chest)
        );
        assert!(matches!(
            events[1],
            SessionEvent::Warning(SessionError::Decode(DecodeError::TooShort { .. }))
        ));
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_reset_energy_expended() {
        let (mut session, _rx) = streaming(true);
        session.reset_energy_expended().unwrap();
        assert_eq!(
            session.radio().calls,
            vec![RadioCall::Write(CONTROL_POINT, vec![RESET_ENERGY_EXPENDED])]
        );

        let (mut session, _rx) = streaming(false);
        assert_eq!(
            session.reset_energy_expended(),
            Err(SessionError::CharacteristicNotSupported)
        );
    }

    #[test]
    fn test_config_from_settings() {
        let settings = Settings {
            auto_connect: true,
            scan_timeout_secs: 0,
            device_stale_after_secs: 15,
            ..Default::default()
        };
        let config = SessionConfig::from_settings(&settings).unwrap();
        assert!(config.auto_connect);
        assert_eq!(config.service_uuid, HEART_RATE_SERVICE_UUID);
        assert_eq!(config.scan_timeout, None);
        assert_eq!(config.device_stale_after, Some(Duration::from_secs(15)));

        let bad = Settings {
            ble_service_uuid: "not-a-uuid".to_string(),
            ..Default::default()
        };
        assert!(SessionConfig::from_settings(&bad).is_err());
    }

    #[test]
    fn test_config_rejects_out_of_range_durations() {
        let stale = Settings {
            device_stale_after_secs: 10_000_000_000_000,
            ..Default::default()
        };
        let err = SessionConfig::from_settings(&stale).unwrap_err();
        assert!(err.to_string().contains("device_stale_after_secs"));

        let timeout = Settings {
            scan_timeout_secs: u64::MAX,
            ..Default::default()
        };
        let err = SessionConfig::from_settings(&timeout).unwrap_err();
        assert!(err.to_string().contains("scan_timeout_secs"));

        let week = Settings {
            scan_timeout_secs: MAX_CONFIGURED_SECS,
            ..Default::default()
        };
        assert!(SessionConfig::from_settings(&week).is_ok());
    }
}
