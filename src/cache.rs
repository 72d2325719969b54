use std::collections::HashMap;
use std::time::SystemTime;

use crate::address;
use crate::distance::DistanceEstimator;
use crate::messages::ScanEvent;

/// Latest observation of one allowed device.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceRecord {
    /// Canonical address.
    pub address: String,
    pub last_rssi: i16,
    pub last_seen_at: SystemTime,
    pub cached_distance: f64,
}

/// Most recent record per device address.
///
/// Only whitelisted sightings are upserted, so the cache never holds an
/// address outside the whitelist.
#[derive(Debug, Default)]
pub struct DeviceStateCache {
    records: HashMap<String, DeviceRecord>,
    estimator: DistanceEstimator,
}

impl DeviceStateCache {
    pub fn new(estimator: DistanceEstimator) -> Self {
        DeviceStateCache {
            records: HashMap::new(),
            estimator,
        }
    }

    /// Inserts or overwrites the record for the event's address.
    pub fn upsert(&mut self, event: &ScanEvent) -> &DeviceRecord {
        let address = address::canonical(&event.address);
        let record = DeviceRecord {
            address: address.clone(),
            last_rssi: event.rssi,
            last_seen_at: event.observed_at,
            cached_distance: self.estimator.distance(event.rssi),
        };
        self.records.insert(address.clone(), record);
        &self.records[&address]
    }

    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.values()
    }

    #[cfg(test)]
    pub fn get(&self, address: &str) -> Option<&DeviceRecord> {
        self.records.get(&address::canonical(address))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_overwrites() {
        let mut cache = DeviceStateCache::default();
        cache.upsert(&ScanEvent::new("aa:bb:cc:dd:ee:ff", -80));
        let record = cache.upsert(&ScanEvent::new("AA:BB:CC:DD:EE:FF", -69)).clone();

        assert_eq!(cache.len(), 1);
        assert_eq!(record.address, "AA-BB-CC-DD-EE-FF");
        assert_eq!(record.last_rssi, -69);
        assert_eq!(record.cached_distance, 1.0);
        assert_eq!(cache.get("aa-bb-cc-dd-ee-ff"), Some(&record));
    }

    #[test]
    fn test_clear() {
        let mut cache = DeviceStateCache::default();
        cache.upsert(&ScanEvent::new("aa:bb:cc:dd:ee:ff", -80));
        cache.upsert(&ScanEvent::new("11:22:33:44:55:66", -80));
        assert_eq!(cache.records().count(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }
}
