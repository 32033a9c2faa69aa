//! BLE Scanner Module
//!
//! Scan lifecycle and the device registry it feeds.

use crate::domain::models::DiscoveredDevice;
use crate::domain::registry::DeviceRegistry;
use crate::infrastructure::bluetooth::radio::{Advertisement, Radio};
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

/// Outcome of recording one advertisement.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub device: DiscoveredDevice,
    /// The advertisement lists the filtered service UUID.
    pub advertises_service: bool,
    /// Stale entries were pruned while recording.
    pub pruned: usize,
}

/// BLE Scanner for discovering heart rate sensors
pub struct BleScanner {
    registry: DeviceRegistry,
    service_filter: Uuid,
    stale_after: Option<chrono::Duration>,
    scanning: bool,
}

impl BleScanner {
    /// Create a new scanner
    ///
    /// # Arguments
    /// * `service_filter` - Service UUID passed to the radio and checked for auto-connect
    /// * `stale_after` - Forget devices not seen for this long (None keeps them)
    pub fn new(service_filter: Uuid, stale_after: Option<chrono::Duration>) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            service_filter,
            stale_after,
            scanning: false,
        }
    }

    /// Start a new scan cycle. The registry is emptied so only currently
    /// visible devices are listed.
    pub fn start<R: Radio + ?Sized>(&mut self, radio: &mut R) {
        self.stop(radio);

        info!("Starting BLE scan for service UUID: {}", self.service_filter);
        self.registry.clear();
        radio.start_scan(self.service_filter);
        self.scanning = true;
    }

    /// Stop scanning. Registry contents are kept for display.
    pub fn stop<R: Radio + ?Sized>(&mut self, radio: &mut R) {
        if self.scanning {
            info!("Stopping BLE scan...");
            radio.stop_scan();
            self.scanning = false;
        }
    }

    /// Forget the scan without talking to the radio (the adapter went away).
    pub fn abandon(&mut self) {
        self.scanning = false;
    }

    /// Record an advertisement. Packets arriving outside a scan are dropped.
    pub fn on_advertisement(
        &mut self,
        advertisement: &Advertisement,
        now: DateTime<Utc>,
    ) -> Option<ScanResult> {
        if !self.scanning {
            debug!(
                "Ignoring advertisement from {} outside of a scan",
                advertisement.identifier
            );
            return None;
        }

        // A cutoff before the representable range means nothing is stale yet
        let pruned = match self.stale_after.and_then(|age| now.checked_sub_signed(age)) {
            Some(cutoff) => self.registry.prune_older_than(cutoff),
            None => 0,
        };

        let device = self.registry.record_advertisement(
            &advertisement.identifier,
            advertisement.local_name.as_deref(),
            advertisement.manufacturer_data.as_deref(),
            advertisement.rssi,
            now,
        )?;

        debug!(
            "Advertisement from {} ({}) rssi {}",
            device.identifier,
            device.label(),
            device.rssi
        );

        Some(ScanResult {
            device,
            advertises_service: advertisement.service_uuids.contains(&self.service_filter),
            pruned,
        })
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.scanning
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceId;
    use crate::infrastructure::bluetooth::protocol::HEART_RATE_SERVICE_UUID;
    use crate::infrastructure::bluetooth::radio::testing::{RadioCall, RecordingRadio};

    fn advert(id: &str, services: Vec<Uuid>) -> Advertisement {
        Advertisement {
            identifier: DeviceId::from(id),
            local_name: Some(format!("HRM {id}")),
            manufacturer_data: None,
            service_uuids: services,
            rssi: -60,
        }
    }

    #[test]
    fn test_start_clears_registry_and_filters_by_service() {
        let mut radio = RecordingRadio::default();
        let mut scanner = BleScanner::new(HEART_RATE_SERVICE_UUID, None);

        scanner.start(&mut radio);
        scanner.on_advertisement(&advert("a", vec![]), Utc::now());
        assert_eq!(scanner.registry().len(), 1);

        scanner.start(&mut radio);
        assert!(scanner.registry().is_empty());
        assert_eq!(
            radio.take_calls(),
            vec![
                RadioCall::StartScan(HEART_RATE_SERVICE_UUID),
                RadioCall::StopScan,
                RadioCall::StartScan(HEART_RATE_SERVICE_UUID),
            ]
        );
    }

    #[test]
    fn test_advertisement_outside_scan_is_ignored() {
        let mut scanner = BleScanner::new(HEART_RATE_SERVICE_UUID, None);
        assert!(scanner
            .on_advertisement(&advert("a", vec![]), Utc::now())
            .is_none());
        assert!(scanner.registry().is_empty());
    }

    #[test]
    fn test_service_match_reported() {
        let mut radio = RecordingRadio::default();
        let mut scanner = BleScanner::new(HEART_RATE_SERVICE_UUID, None);
        scanner.start(&mut radio);

        let hr = scanner
            .on_advertisement(&advert("hr", vec![HEART_RATE_SERVICE_UUID]), Utc::now())
            .unwrap();
        let other = scanner
            .on_advertisement(&advert("other", vec![]), Utc::now())
            .unwrap();
        assert!(hr.advertises_service);
        assert!(!other.advertises_service);
    }

    #[test]
    fn test_stale_devices_pruned() {
        let mut radio = RecordingRadio::default();
        let mut scanner =
            BleScanner::new(HEART_RATE_SERVICE_UUID, Some(chrono::Duration::seconds(10)));
        scanner.start(&mut radio);

        let start = Utc::now();
        scanner.on_advertisement(&advert("a", vec![]), start);
        let result = scanner
            .on_advertisement(&advert("b", vec![]), start + chrono::Duration::seconds(11))
            .unwrap();

        assert_eq!(result.pruned, 1);
        assert_eq!(scanner.registry().len(), 1);
    }

    #[test]
    fn test_huge_stale_age_never_prunes() {
        let mut radio = RecordingRadio::default();
        let mut scanner = BleScanner::new(
            HEART_RATE_SERVICE_UUID,
            Some(chrono::Duration::seconds(10_000_000_000_000)),
        );
        scanner.start(&mut radio);

        let result = scanner
            .on_advertisement(&advert("a", vec![]), Utc::now())
            .unwrap();
        assert_eq!(result.pruned, 0);
        assert_eq!(scanner.registry().len(), 1);
    }

    #[test]
    fn test_stop_keeps_registry() {
        let mut radio = RecordingRadio::default();
        let mut scanner = BleScanner::new(HEART_RATE_SERVICE_UUID, None);
        scanner.start(&mut radio);
        scanner.on_advertisement(&advert("a", vec![]), Utc::now());
        scanner.stop(&mut radio);
        scanner.stop(&mut radio);

        assert!(!scanner.is_scanning());
        assert_eq!(scanner.registry().len(), 1);
        assert_eq!(
            radio.take_calls(),
            vec![RadioCall::StartScan(HEART_RATE_SERVICE_UUID), RadioCall::StopScan]
        );
    }
}
