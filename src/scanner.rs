use std::future::Future;
use std::time::SystemTime;

use btleplug::api::{Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::StreamExt as _;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ScanError;
use crate::messages::{ScanEvent, ScanSignal};

/// Error code reported when the adapter's event stream ends on its own.
pub const SCAN_STREAM_CLOSED: i32 = 1;

/// Start/stop interface over the platform scanner.
pub trait ScanSource: Send + 'static {
    /// Begins delivering signals into `sink`. An error means scanning did not
    /// start.
    fn start(
        &mut self,
        sink: mpsc::UnboundedSender<ScanSignal>,
    ) -> impl Future<Output = Result<(), ScanError>> + Send;

    fn stop(&mut self) -> impl Future<Output = Result<(), ScanError>> + Send;
}

/// Scan source backed by the first btleplug adapter.
pub struct BtleScanSource {
    adapter: Option<Adapter>,
    forwarder: Option<JoinHandle<()>>,
}

impl BtleScanSource {
    pub async fn first_adapter() -> Result<Self, ScanError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next();
        match &adapter {
            Some(adapter) => match adapter.adapter_info().await {
                Ok(info) => info!("Using bluetooth adapter {info}"),
                Err(err) => debug!("Could not describe bluetooth adapter: {err}"),
            },
            None => warn!("No bluetooth adapter found, scanning will be refused"),
        }
        Ok(BtleScanSource {
            adapter,
            forwarder: None,
        })
    }
}

impl ScanSource for BtleScanSource {
    async fn start(&mut self, sink: mpsc::UnboundedSender<ScanSignal>) -> Result<(), ScanError> {
        let adapter = self.adapter.clone().ok_or(ScanError::NoAdapter)?;
        if self.forwarder.as_ref().is_some_and(|f| !f.is_finished()) {
            return Err(ScanError::Refused("scan already running".to_string()));
        }

        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        self.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                match sighting(&adapter, &id).await {
                    Ok(Some(event)) => {
                        if sink.send(ScanSignal::Sighting(event)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => debug!("Could not read properties of {id:?}: {err}"),
                }
            }
            let _ = sink.send(ScanSignal::Failed(SCAN_STREAM_CLOSED));
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ScanError> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(adapter) = &self.adapter {
            adapter.stop_scan().await?;
        }
        Ok(())
    }
}

/// Reads the current advertisement of a peripheral. Devices without an RSSI
/// reading are skipped.
async fn sighting(adapter: &Adapter, id: &PeripheralId) -> Result<Option<ScanEvent>, ScanError> {
    let peripheral = adapter.peripheral(id).await?;
    let Some(properties) = peripheral.properties().await? else {
        return Ok(None);
    };
    Ok(properties.rssi.map(|rssi| ScanEvent {
        address: properties.address.to_string(),
        rssi,
        advertised_name: properties.local_name,
        observed_at: SystemTime::now(),
    }))
}
