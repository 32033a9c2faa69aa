//! Heart rate sensor discovery and data acquisition over Bluetooth LE.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{ConnectFailure, DecodeError, GattError, SessionError};
pub use domain::models::{
    AdapterState, BluetoothCommand, BodySensorLocation, DeviceId, DiscoveredDevice,
    HeartRateMeasurement, SessionEvent, SessionState,
};
pub use infrastructure::bluetooth::connection::{ConnectionSession, SessionConfig};
pub use infrastructure::bluetooth::protocol::decode_measurement;
pub use infrastructure::bluetooth::radio::{Radio, RadioEvent};
pub use infrastructure::bluetooth::{BluetoothService, MonitorHandle};
