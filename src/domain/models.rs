use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::domain::error::SessionError;

/// Power/authorization status of the host Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AdapterState {
    #[default]
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unknown => "unknown",
            Self::Resetting => "resetting",
            Self::Unsupported => "unsupported",
            Self::Unauthorized => "unauthorized",
            Self::PoweredOff => "powered off",
            Self::PoweredOn => "powered on",
        };
        f.write_str(text)
    }
}

/// Stable identifier the radio assigns to an advertising peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace-only identifiers are treated as malformed.
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque token for a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralHandle(pub u64);

/// Opaque token for a discovered GATT service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(pub u64);

/// Opaque token for a discovered GATT characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle(pub u64);

/// A peripheral seen while scanning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub identifier: DeviceId,
    /// Empty until an advertisement carries a local name.
    pub display_name: String,
    pub manufacturer_data: Option<Vec<u8>>,
    pub last_seen_at: DateTime<Utc>,
    pub rssi: i16,
}

impl DiscoveredDevice {
    /// Name for listings; "Unknown" when no advertisement carried one.
    pub fn label(&self) -> &str {
        if self.display_name.is_empty() {
            "Unknown"
        } else {
            &self.display_name
        }
    }

    /// Bluetooth SIG company identifier: the first two bytes (little-endian)
    /// of the manufacturer specific data.
    pub fn company_id(&self) -> Option<u16> {
        match self.manufacturer_data.as_deref() {
            Some([lo, hi, ..]) => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}

/// One decoded Heart Rate Measurement notification.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartRateMeasurement {
    pub beats_per_minute: u16,
    pub sensor_contact_supported: bool,
    pub sensor_contact_detected: bool,
    /// Cumulative energy in kilojoules.
    pub energy_expended_kjoules: Option<u16>,
    /// RR intervals in 1/1024 second units, oldest first.
    pub rr_intervals: Vec<u16>,
}

impl HeartRateMeasurement {
    /// RR intervals converted to milliseconds.
    pub fn rr_intervals_ms(&self) -> Vec<f64> {
        self.rr_intervals
            .iter()
            .map(|rr| f64::from(*rr) * 1000.0 / 1024.0)
            .collect()
    }

    pub fn rr_durations(&self) -> impl Iterator<Item = Duration> + '_ {
        self.rr_intervals
            .iter()
            .map(|rr| Duration::from_secs_f64(f64::from(*rr) / 1024.0))
    }
}

/// Value of the Body Sensor Location characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodySensorLocation {
    Other,
    Chest,
    Wrist,
    Finger,
    Hand,
    EarLobe,
    Foot,
    Reserved(u8),
}

impl From<u8> for BodySensorLocation {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Other,
            1 => Self::Chest,
            2 => Self::Wrist,
            3 => Self::Finger,
            4 => Self::Hand,
            5 => Self::EarLobe,
            6 => Self::Foot,
            other => Self::Reserved(other),
        }
    }
}

impl From<BodySensorLocation> for u8 {
    fn from(location: BodySensorLocation) -> Self {
        match location {
            BodySensorLocation::Other => 0,
            BodySensorLocation::Chest => 1,
            BodySensorLocation::Wrist => 2,
            BodySensorLocation::Finger => 3,
            BodySensorLocation::Hand => 4,
            BodySensorLocation::EarLobe => 5,
            BodySensorLocation::Foot => 6,
            BodySensorLocation::Reserved(value) => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    DiscoveringCharacteristics,
    Subscribing,
    Streaming,
    Disconnecting,
    Failed,
    Cancelled,
}

impl SessionState {
    /// States in which a peripheral connection exists or is being established.
    pub fn has_link(self) -> bool {
        matches!(
            self,
            Self::Connecting
                | Self::DiscoveringServices
                | Self::DiscoveringCharacteristics
                | Self::Subscribing
                | Self::Streaming
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Everything the session reports to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    DevicesChanged(Vec<DiscoveredDevice>),
    Measurement(HeartRateMeasurement),
    SensorLocation(BodySensorLocation),
    /// Non-fatal problem; the session keeps its state.
    Warning(SessionError),
    /// Terminal for the current attempt, or a rejected command.
    Failure(SessionError),
    /// The adapter left `PoweredOn` and the session was torn down.
    RadioUnavailable(AdapterState),
}

/// Commands issued by the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothCommand {
    StartScan,
    StopScan,
    SelectDevice(DeviceId),
    Cancel,
    Disconnect,
    ResetEnergyExpended,
}
