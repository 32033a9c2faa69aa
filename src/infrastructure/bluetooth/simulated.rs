//! Simulated Radio
//!
//! An in-process [`Radio`] that advertises a fixed set of peripherals and
//! streams synthetic heart rate notifications. Used by the console host and
//! the service tests.

use crate::domain::error::{ConnectFailure, GattError};
use crate::domain::models::{
    AdapterState, BodySensorLocation, CharacteristicHandle, DeviceId, HeartRateMeasurement,
    PeripheralHandle, ServiceHandle,
};
use crate::infrastructure::bluetooth::protocol::{
    BODY_SENSOR_LOCATION_UUID, HEART_RATE_CONTROL_POINT_UUID, HEART_RATE_MEASUREMENT_UUID,
    HEART_RATE_SERVICE_UUID, RESET_ENERGY_EXPENDED,
};
use crate::infrastructure::bluetooth::radio::{
    Advertisement, CharProps, GattCharacteristic, GattService, Radio, RadioEvent,
};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

pub const HEART_RATE_SERVICE_HANDLE: ServiceHandle = ServiceHandle(0x10);
pub const MEASUREMENT_HANDLE: CharacteristicHandle = CharacteristicHandle(0x11);
pub const SENSOR_LOCATION_HANDLE: CharacteristicHandle = CharacteristicHandle(0x12);
pub const CONTROL_POINT_HANDLE: CharacteristicHandle = CharacteristicHandle(0x13);
/// Services other than Heart Rate get handles from here upwards
const OTHER_SERVICE_BASE: u64 = 0x20;

/// One advertising peripheral.
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub identifier: DeviceId,
    pub name: Option<String>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub services: Vec<Uuid>,
    pub rssi: i16,
    pub resting_bpm: u16,
    pub sensor_location: Option<BodySensorLocation>,
    pub reports_energy: bool,
}

impl SimulatedPeripheral {
    /// A chest strap exposing the full Heart Rate service.
    pub fn heart_rate_strap(identifier: &str, name: &str) -> Self {
        Self {
            identifier: DeviceId::from(identifier),
            name: Some(name.to_string()),
            manufacturer_data: Some(vec![0x6B, 0x00]),
            services: vec![HEART_RATE_SERVICE_UUID],
            rssi: -62,
            resting_bpm: 64,
            sensor_location: Some(BodySensorLocation::Chest),
            reports_energy: true,
        }
    }
}

/// Event cadence of the simulation.
#[derive(Debug, Clone, Copy)]
pub struct SimulationTiming {
    pub advertise_interval: Duration,
    pub notify_interval: Duration,
}

impl Default for SimulationTiming {
    fn default() -> Self {
        Self {
            advertise_interval: Duration::from_millis(500),
            notify_interval: Duration::from_secs(1),
        }
    }
}

/// Flips the simulated adapter's power state from outside the session.
#[derive(Clone)]
pub struct AdapterSwitch {
    events: mpsc::UnboundedSender<RadioEvent>,
    powered: Arc<AtomicBool>,
}

impl AdapterSwitch {
    pub fn set(&self, state: AdapterState) {
        info!("Simulated adapter {}", state);
        self.powered.store(state.is_powered_on(), Ordering::SeqCst);
        let _ = self.events.send(RadioEvent::AdapterStateChanged(state));
    }
}

pub struct SimulatedRadio {
    events: mpsc::UnboundedSender<RadioEvent>,
    peripherals: Arc<Vec<SimulatedPeripheral>>,
    timing: SimulationTiming,
    powered: Arc<AtomicBool>,
    energy: Arc<AtomicU16>,
    connected: Option<usize>,
    scan_task: Option<JoinHandle<()>>,
    stream_task: Option<JoinHandle<()>>,
}

impl SimulatedRadio {
    /// Create a powered-on radio. Its callbacks arrive on the returned receiver.
    pub fn new(
        peripherals: Vec<SimulatedPeripheral>,
        timing: SimulationTiming,
    ) -> (Self, mpsc::UnboundedReceiver<RadioEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(RadioEvent::AdapterStateChanged(AdapterState::PoweredOn));

        let radio = Self {
            events,
            peripherals: Arc::new(peripherals),
            timing,
            powered: Arc::new(AtomicBool::new(true)),
            energy: Arc::new(AtomicU16::new(0)),
            connected: None,
            scan_task: None,
            stream_task: None,
        };
        (radio, rx)
    }

    pub fn adapter_switch(&self) -> AdapterSwitch {
        AdapterSwitch {
            events: self.events.clone(),
            powered: self.powered.clone(),
        }
    }

    fn send(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    fn index_of(&self, identifier: &DeviceId) -> Option<usize> {
        self.peripherals
            .iter()
            .position(|p| &p.identifier == identifier)
    }

    fn peripheral_for(&self, handle: PeripheralHandle) -> Option<&SimulatedPeripheral> {
        let index = usize::try_from(handle.0).ok()?.checked_sub(1)?;
        self.peripherals.get(index)
    }

    fn connected_peripheral(&self) -> Option<&SimulatedPeripheral> {
        self.connected.and_then(|i| self.peripherals.get(i))
    }

    fn stop_stream(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
    }
}

impl Radio for SimulatedRadio {
    fn start_scan(&mut self, service_filter: Uuid) {
        self.stop_scan();

        let events = self.events.clone();
        let powered = self.powered.clone();
        let peripherals = self.peripherals.clone();
        let interval = self.timing.advertise_interval;

        self.scan_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            while powered.load(Ordering::SeqCst) {
                ticker.tick().await;
                for peripheral in peripherals
                    .iter()
                    .filter(|p| p.services.contains(&service_filter))
                {
                    let advertisement = Advertisement {
                        identifier: peripheral.identifier.clone(),
                        local_name: peripheral.name.clone(),
                        manufacturer_data: peripheral.manufacturer_data.clone(),
                        service_uuids: peripheral.services.clone(),
                        rssi: peripheral.rssi,
                    };
                    if events.send(RadioEvent::Advertisement(advertisement)).is_err() {
                        return;
                    }
                }
            }
        }));
    }

    fn stop_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }

    fn connect(&mut self, device: &DeviceId) {
        match self.index_of(device) {
            Some(index) if self.powered.load(Ordering::SeqCst) => {
                debug!("Simulated connect to {}", device);
                self.connected = Some(index);
                self.send(RadioEvent::Connected(PeripheralHandle(index as u64 + 1)));
            }
            _ => self.send(RadioEvent::ConnectFailed(ConnectFailure::Unreachable)),
        }
    }

    fn disconnect(&mut self, device: &DeviceId) {
        self.stop_stream();
        self.connected = None;
        let handle = self
            .index_of(device)
            .map_or(PeripheralHandle(0), |i| PeripheralHandle(i as u64 + 1));
        self.send(RadioEvent::Disconnected(handle));
    }

    fn discover_services(&mut self, peripheral: PeripheralHandle) {
        let result = match self.peripheral_for(peripheral) {
            Some(p) => Ok(p
                .services
                .iter()
                .enumerate()
                .map(|(i, uuid)| GattService {
                    uuid: *uuid,
                    handle: if *uuid == HEART_RATE_SERVICE_UUID {
                        HEART_RATE_SERVICE_HANDLE
                    } else {
                        ServiceHandle(OTHER_SERVICE_BASE + i as u64)
                    },
                })
                .collect()),
            None => Err(GattError(format!("unknown peripheral {:?}", peripheral))),
        };
        self.send(RadioEvent::ServicesDiscovered(result));
    }

    fn discover_characteristics(&mut self, service: ServiceHandle) {
        let Some(peripheral) = self.connected_peripheral() else {
            self.send(RadioEvent::CharacteristicsDiscovered(Err(GattError(
                "not connected".to_string(),
            ))));
            return;
        };

        let mut characteristics = Vec::new();
        if service == HEART_RATE_SERVICE_HANDLE {
            characteristics.push(GattCharacteristic {
                uuid: HEART_RATE_MEASUREMENT_UUID,
                handle: MEASUREMENT_HANDLE,
                properties: CharProps {
                    notify: true,
                    ..Default::default()
                },
            });
            if peripheral.sensor_location.is_some() {
                characteristics.push(GattCharacteristic {
                    uuid: BODY_SENSOR_LOCATION_UUID,
                    handle: SENSOR_LOCATION_HANDLE,
                    properties: CharProps {
                        read: true,
                        ..Default::default()
                    },
                });
            }
            if peripheral.reports_energy {
                characteristics.push(GattCharacteristic {
                    uuid: HEART_RATE_CONTROL_POINT_UUID,
                    handle: CONTROL_POINT_HANDLE,
                    properties: CharProps {
                        write: true,
                        ..Default::default()
                    },
                });
            }
        }
        self.send(RadioEvent::CharacteristicsDiscovered(Ok(characteristics)));
    }

    fn subscribe(&mut self, characteristic: CharacteristicHandle) {
        let Some(peripheral) = self.connected_peripheral().cloned() else {
            self.send(RadioEvent::Subscribed(Err(GattError(
                "not connected".to_string(),
            ))));
            return;
        };
        if characteristic != MEASUREMENT_HANDLE {
            self.send(RadioEvent::Subscribed(Err(GattError(format!(
                "{:?} does not support notifications",
                characteristic
            )))));
            return;
        }

        self.send(RadioEvent::Subscribed(Ok(characteristic)));
        self.stop_stream();

        let events = self.events.clone();
        let powered = self.powered.clone();
        let energy = self.energy.clone();
        let interval = self.timing.notify_interval;

        self.stream_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut tick: u16 = 0;
            while powered.load(Ordering::SeqCst) {
                ticker.tick().await;
                let measurement = synthetic_measurement(&peripheral, tick, &energy);
                let value = measurement.to_bytes();
                if events
                    .send(RadioEvent::Notification(characteristic, value))
                    .is_err()
                {
                    return;
                }
                tick = tick.wrapping_add(1);
            }
        }));
    }

    fn read(&mut self, characteristic: CharacteristicHandle) {
        let location = self
            .connected_peripheral()
            .and_then(|p| p.sensor_location)
            .filter(|_| characteristic == SENSOR_LOCATION_HANDLE);
        let result = match location {
            Some(location) => Ok(vec![u8::from(location)]),
            None => Err(GattError(format!("{:?} is not readable", characteristic))),
        };
        self.send(RadioEvent::CharacteristicRead(characteristic, result));
    }

    fn write(&mut self, characteristic: CharacteristicHandle, value: &[u8]) {
        if characteristic == CONTROL_POINT_HANDLE && value == [RESET_ENERGY_EXPENDED] {
            info!("Simulated energy expended reset");
            self.energy.store(0, Ordering::SeqCst);
        } else {
            debug!("Ignoring write {:02X?} to {:?}", value, characteristic);
        }
    }
}

impl Drop for SimulatedRadio {
    fn drop(&mut self) {
        self.stop_scan();
        self.stop_stream();
    }
}

/// Rate drifts in a triangle wave of ±5 bpm around the resting rate.
fn synthetic_measurement(
    peripheral: &SimulatedPeripheral,
    tick: u16,
    energy: &AtomicU16,
) -> HeartRateMeasurement {
    let phase = (tick % 20) as i32;
    let offset = (phase - 10).abs() - 5;
    let bpm = (i32::from(peripheral.resting_bpm) + offset).max(30) as u16;
    let rr = (60 * 1024 / u32::from(bpm)) as u16;

    let energy_expended_kjoules = peripheral
        .reports_energy
        .then(|| energy.fetch_add(1, Ordering::SeqCst).saturating_add(1));

    HeartRateMeasurement {
        beats_per_minute: bpm,
        sensor_contact_supported: true,
        sensor_contact_detected: true,
        energy_expended_kjoules,
        rr_intervals: vec![rr],
    }
}
