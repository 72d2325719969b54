use std::time::SystemTime;

use tokio::sync::oneshot;

use crate::telemetry::TelemetryEnvelope;

/// One sighting reported by the scan source.
#[derive(Clone, Debug)]
pub struct ScanEvent {
    pub address: String,
    pub rssi: i16,
    pub advertised_name: Option<String>,
    pub observed_at: SystemTime,
}

#[cfg(test)]
impl ScanEvent {
    pub fn new(address: impl Into<String>, rssi: i16) -> Self {
        ScanEvent {
            address: address.into(),
            rssi,
            advertised_name: None,
            observed_at: SystemTime::now(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ScanSignal {
    Sighting(ScanEvent),
    /// The scan source stopped on its own, carrying an opaque error code.
    Failed(i32),
}

#[derive(Debug)]
pub enum PipelineCommand {
    Start(oneshot::Sender<bool>),
    Stop(oneshot::Sender<()>),
    Restart,
    Shutdown,
}

pub type TelemetryBatch = Vec<TelemetryEnvelope>;
