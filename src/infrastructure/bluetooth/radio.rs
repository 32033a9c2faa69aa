//! Host Radio Interface
//!
//! The platform radio is driven through [`Radio`] calls that never block;
//! every result comes back later as a [`RadioEvent`] on the event channel.

use crate::domain::error::{ConnectFailure, GattError};
use crate::domain::models::{
    AdapterState, CharacteristicHandle, DeviceId, PeripheralHandle, ServiceHandle,
};
use uuid::Uuid;

/// One received advertisement packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub identifier: DeviceId,
    pub local_name: Option<String>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
    pub rssi: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub handle: ServiceHandle,
}

/// Subset of GATT characteristic properties the session cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub handle: CharacteristicHandle,
    pub properties: CharProps,
}

/// Callbacks from the host radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    AdapterStateChanged(AdapterState),
    Advertisement(Advertisement),
    Connected(PeripheralHandle),
    ConnectFailed(ConnectFailure),
    ServicesDiscovered(Result<Vec<GattService>, GattError>),
    CharacteristicsDiscovered(Result<Vec<GattCharacteristic>, GattError>),
    Subscribed(Result<CharacteristicHandle, GattError>),
    Notification(CharacteristicHandle, Vec<u8>),
    CharacteristicRead(CharacteristicHandle, Result<Vec<u8>, GattError>),
    Disconnected(PeripheralHandle),
}

/// Commands the session issues to the host radio.
pub trait Radio {
    /// Begin delivering `RadioEvent::Advertisement` for peripherals
    /// advertising `service_filter`.
    fn start_scan(&mut self, service_filter: Uuid);
    fn stop_scan(&mut self);

    /// Answered by `Connected` or `ConnectFailed`.
    fn connect(&mut self, device: &DeviceId);
    /// Tears down a link or a pending connect; answered by `Disconnected`.
    fn disconnect(&mut self, device: &DeviceId);

    fn discover_services(&mut self, peripheral: PeripheralHandle);
    fn discover_characteristics(&mut self, service: ServiceHandle);
    /// Enable notifications; answered by `Subscribed`.
    fn subscribe(&mut self, characteristic: CharacteristicHandle);
    fn read(&mut self, characteristic: CharacteristicHandle);
    fn write(&mut self, characteristic: CharacteristicHandle, value: &[u8]);
}
