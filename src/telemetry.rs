use std::time::{SystemTime, UNIX_EPOCH};

use serde_derive::Serialize;
use uuid::Uuid;

use crate::address;
use crate::cache::DeviceRecord;
use crate::distance::format_distance;
use crate::messages::TelemetryBatch;

pub const EVENT_TYPE_NOTIFY: &str = "NOTIFY";

/// Wire representation of one device's latest state. Numeric fields travel
/// as strings.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetryEnvelope {
    pub uuid: String,
    pub device_id: String,
    pub tag_id: String,
    pub event_type: String,
    #[serde(rename = "event_dt")]
    pub event_timestamp: String,
    pub rssi: String,
    pub distance: String,
}

/// Turns cached device records into outbound telemetry.
#[derive(Clone, Debug)]
pub struct TelemetryPublisher {
    device_id: String,
}

impl TelemetryPublisher {
    pub fn new(device_id: String) -> Self {
        TelemetryPublisher { device_id }
    }

    /// One envelope per record, each with a fresh uuid.
    pub fn build<'a>(
        &self,
        records: impl IntoIterator<Item = &'a DeviceRecord>,
        flushed_at: SystemTime,
    ) -> TelemetryBatch {
        let event_timestamp = flushed_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default()
            .to_string();

        records
            .into_iter()
            .map(|record| TelemetryEnvelope {
                uuid: Uuid::new_v4().to_string(),
                device_id: self.device_id.clone(),
                tag_id: address::canonical(&record.address),
                event_type: EVENT_TYPE_NOTIFY.to_string(),
                event_timestamp: event_timestamp.clone(),
                rssi: record.last_rssi.to_string(),
                distance: format_distance(record.cached_distance),
            })
            .collect()
    }
}

pub fn encode(batch: &TelemetryBatch) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(batch)
}
