use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::domain::models::{DeviceId, DiscoveredDevice};

/// Peripherals seen during the current scan cycle, one entry per identifier.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DiscoveredDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh the entry for `identifier`.
    ///
    /// Name and manufacturer data from the earliest advertisement that carried
    /// them are kept; rssi and last-seen time always follow the newest one.
    /// Returns `None` for malformed identifiers, which are not recorded.
    pub fn record_advertisement(
        &mut self,
        identifier: &DeviceId,
        display_name: Option<&str>,
        manufacturer_data: Option<&[u8]>,
        rssi: i16,
        now: DateTime<Utc>,
    ) -> Option<DiscoveredDevice> {
        if !identifier.is_valid() {
            return None;
        }

        let display_name = display_name.map(str::trim).filter(|n| !n.is_empty());
        let manufacturer_data = manufacturer_data.filter(|d| !d.is_empty());

        let entry = self
            .devices
            .entry(identifier.clone())
            .or_insert_with(|| DiscoveredDevice {
                identifier: identifier.clone(),
                display_name: String::new(),
                manufacturer_data: None,
                last_seen_at: now,
                rssi,
            });

        if entry.display_name.is_empty() {
            if let Some(name) = display_name {
                entry.display_name = name.to_string();
            }
        }
        if entry.manufacturer_data.is_none() {
            entry.manufacturer_data = manufacturer_data.map(<[u8]>::to_vec);
        }
        entry.rssi = rssi;
        entry.last_seen_at = now;

        Some(entry.clone())
    }

    pub fn get(&self, identifier: &DeviceId) -> Option<&DiscoveredDevice> {
        self.devices.get(identifier)
    }

    pub fn contains(&self, identifier: &DeviceId) -> bool {
        self.devices.contains_key(identifier)
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Drop entries last seen before `cutoff`. Returns how many were removed.
    pub fn prune_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.devices.len();
        self.devices.retain(|_, device| device.last_seen_at >= cutoff);
        before - self.devices.len()
    }

    /// Snapshot ordered most recently seen first.
    pub fn all(&self) -> Vec<DiscoveredDevice> {
        let mut devices: Vec<_> = self.devices.values().cloned().collect();
        devices.sort_by(|a, b| {
            b.last_seen_at
                .cmp(&a.last_seen_at)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
