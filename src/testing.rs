//! In-memory stand-ins for the scan source and the broker transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{BrokerError, ScanError};
use crate::messages::{ScanEvent, ScanSignal};
use crate::mqtt::{BrokerTransport, ConnectionStatus};
use crate::scanner::ScanSource;

#[derive(Default)]
struct ScanState {
    sink: Option<mpsc::UnboundedSender<ScanSignal>>,
    starts: usize,
    stops: usize,
    refuse: bool,
}

#[derive(Clone, Default)]
pub struct FakeScanSource {
    inner: Arc<Mutex<ScanState>>,
}

impl FakeScanSource {
    pub fn set_refuse(&self, refuse: bool) {
        self.inner.lock().unwrap().refuse = refuse;
    }

    pub fn starts(&self) -> usize {
        self.inner.lock().unwrap().starts
    }

    pub fn stops(&self) -> usize {
        self.inner.lock().unwrap().stops
    }

    /// Delivers a sighting if the source is currently started.
    pub fn emit(&self, address: &str, rssi: i16) {
        self.send(ScanSignal::Sighting(ScanEvent::new(address, rssi)));
    }

    pub fn fail(&self, code: i32) {
        self.send(ScanSignal::Failed(code));
    }

    fn send(&self, signal: ScanSignal) {
        if let Some(sink) = &self.inner.lock().unwrap().sink {
            let _ = sink.send(signal);
        }
    }
}

impl ScanSource for FakeScanSource {
    async fn start(&mut self, sink: mpsc::UnboundedSender<ScanSignal>) -> Result<(), ScanError> {
        let mut state = self.inner.lock().unwrap();
        if state.refuse {
            return Err(ScanError::Refused("bluetooth disabled".to_string()));
        }
        state.starts += 1;
        state.sink = Some(sink);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ScanError> {
        let mut state = self.inner.lock().unwrap();
        state.stops += 1;
        state.sink = None;
        Ok(())
    }
}

#[derive(Default)]
struct TransportState {
    unreachable: bool,
    connect_delay: Duration,
    lose_link_on_connect: bool,
    connect_calls: usize,
    disconnect_calls: usize,
    published: Vec<(String, Vec<u8>)>,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    inner: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().unwrap().unreachable = !reachable;
    }

    /// Every connect waits this long before it succeeds or fails.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().connect_delay = delay;
    }

    /// The link drops right after CONNACK, before connect returns.
    pub fn set_lose_link_on_connect(&self, lose: bool) {
        self.inner.lock().unwrap().lose_link_on_connect = lose;
    }

    pub fn connect_calls(&self) -> usize {
        self.inner.lock().unwrap().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.inner.lock().unwrap().disconnect_calls
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.inner.lock().unwrap().published.clone()
    }

    /// Published payloads decoded as JSON arrays.
    pub fn batches(&self) -> Vec<Vec<serde_json::Value>> {
        self.published()
            .iter()
            .map(|(_, payload)| serde_json::from_slice(payload).unwrap())
            .collect()
    }
}

impl BrokerTransport for FakeTransport {
    async fn connect(&mut self, status: ConnectionStatus) -> Result<(), BrokerError> {
        let delay = {
            let mut state = self.inner.lock().unwrap();
            state.connect_calls += 1;
            state.connect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let state = self.inner.lock().unwrap();
        if state.unreachable {
            return Err(BrokerError::NotConnected);
        }
        status.mark_connected();
        if state.lose_link_on_connect {
            status.mark_lost();
        }
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.inner.lock().unwrap();
        if state.unreachable {
            return Err(BrokerError::NotConnected);
        }
        state.published.push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.inner.lock().unwrap().disconnect_calls += 1;
    }
}
