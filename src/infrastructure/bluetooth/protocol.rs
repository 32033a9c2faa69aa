//! Heart Rate Service Protocol
//!
//! Assigned numbers and the binary layout of the Heart Rate Measurement
//! characteristic.

use crate::domain::error::DecodeError;
use crate::domain::models::{BodySensorLocation, HeartRateMeasurement};
use anyhow::Result;
use tracing::trace;
use uuid::Uuid;

/// Bluetooth Base UUID; 16-bit assigned numbers live in bits 96..112.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number against the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Heart Rate service (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid = uuid_from_u16(0x180D);

/// Heart Rate Measurement characteristic (0x2A37), notify only
pub const HEART_RATE_MEASUREMENT_UUID: Uuid = uuid_from_u16(0x2A37);

/// Body Sensor Location characteristic (0x2A38), read only
pub const BODY_SENSOR_LOCATION_UUID: Uuid = uuid_from_u16(0x2A38);

/// Heart Rate Control Point characteristic (0x2A39), write only
pub const HEART_RATE_CONTROL_POINT_UUID: Uuid = uuid_from_u16(0x2A39);

/// Control point command resetting the cumulative energy expended to zero.
pub const RESET_ENERGY_EXPENDED: u8 = 0x01;

/// Heart Rate Measurement flag bits
pub mod flags {
    /// Rate is a u16 instead of a u8
    pub const RATE_U16: u8 = 1 << 0;
    /// Skin contact detected (only meaningful with CONTACT_SUPPORTED)
    pub const CONTACT_DETECTED: u8 = 1 << 1;
    /// Sensor contact feature supported
    pub const CONTACT_SUPPORTED: u8 = 1 << 2;
    pub const ENERGY_EXPENDED: u8 = 1 << 3;
    pub const RR_INTERVALS: u8 = 1 << 4;
}

/// Cursor over a notification payload; every read checks the remaining length.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() < count {
            return Err(DecodeError::TooShort {
                needed: count,
                remaining: self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at(count);
        self.bytes = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
}

/// Decode a Heart Rate Measurement notification.
///
/// # Layout (little-endian)
///
/// ```text
/// [0]      : Flags
///            bit 0   : rate format (0 = u8, 1 = u16)
///            bit 1   : contact detected
///            bit 2   : contact supported
///            bit 3   : energy expended present
///            bit 4   : RR intervals present
///            bit 5-7 : reserved, ignored
/// [1..]    : Rate (u8 or u16)
/// [..]     : Energy expended, kJ (u16), if flagged
/// [..]     : RR intervals, 1/1024 s (u16 each) until the end, if flagged
/// ```
pub fn decode_measurement(bytes: &[u8]) -> Result<HeartRateMeasurement, DecodeError> {
    trace!("Raw measurement: {:02X?}", bytes);

    let mut reader = Reader { bytes };
    let flag_byte = reader.u8()?;

    let beats_per_minute = if flag_byte & flags::RATE_U16 != 0 {
        reader.u16()?
    } else {
        u16::from(reader.u8()?)
    };

    // 0b00 / 0b01: not supported, 0b10: supported but no contact, 0b11: contact
    let sensor_contact_supported = flag_byte & flags::CONTACT_SUPPORTED != 0;
    let sensor_contact_detected =
        sensor_contact_supported && flag_byte & flags::CONTACT_DETECTED != 0;

    let energy_expended_kjoules = if flag_byte & flags::ENERGY_EXPENDED != 0 {
        Some(reader.u16()?)
    } else {
        None
    };

    let mut rr_intervals = Vec::new();
    if flag_byte & flags::RR_INTERVALS != 0 {
        let rest = reader.bytes;
        if rest.len() % 2 != 0 {
            return Err(DecodeError::TrailingOddByte);
        }
        rr_intervals.extend(
            rest.chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]])),
        );
    }

    Ok(HeartRateMeasurement {
        beats_per_minute,
        sensor_contact_supported,
        sensor_contact_detected,
        energy_expended_kjoules,
        rr_intervals,
    })
}

impl HeartRateMeasurement {
    /// Encode in the notification layout, using the 8-bit rate format
    /// whenever the rate fits.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut flag_byte = 0u8;
        let mut body = Vec::with_capacity(4 + self.rr_intervals.len() * 2);

        match u8::try_from(self.beats_per_minute) {
            Ok(rate) => body.push(rate),
            Err(_) => {
                flag_byte |= flags::RATE_U16;
                body.extend_from_slice(&self.beats_per_minute.to_le_bytes());
            }
        }
        if self.sensor_contact_supported {
            flag_byte |= flags::CONTACT_SUPPORTED;
            if self.sensor_contact_detected {
                flag_byte |= flags::CONTACT_DETECTED;
            }
        }
        if let Some(energy) = self.energy_expended_kjoules {
            flag_byte |= flags::ENERGY_EXPENDED;
            body.extend_from_slice(&energy.to_le_bytes());
        }
        if !self.rr_intervals.is_empty() {
            flag_byte |= flags::RR_INTERVALS;
            for rr in &self.rr_intervals {
                body.extend_from_slice(&rr.to_le_bytes());
            }
        }

        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(flag_byte);
        bytes.extend_from_slice(&body);
        bytes
    }
}

/// Decode a Body Sensor Location read: a single enumerated byte.
pub fn decode_sensor_location(bytes: &[u8]) -> Result<BodySensorLocation, DecodeError> {
    bytes
        .first()
        .map(|b| BodySensorLocation::from(*b))
        .ok_or(DecodeError::TooShort {
            needed: 1,
            remaining: 0,
        })
}

/// Parse a UUID string: either a 16-bit assigned number ("180D", "0x180D")
/// or the full 128-bit form.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let trimmed = uuid_str.trim();
    let short = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if short.len() == 4 {
        let value = u16::from_str_radix(short, 16)
            .map_err(|e| anyhow::anyhow!("Invalid short UUID {:?}: {}", uuid_str, e))?;
        return Ok(uuid_from_u16(value));
    }

    Uuid::parse_str(trimmed).map_err(|e| anyhow::anyhow!("Invalid UUID {:?}: {}", uuid_str, e))
}
