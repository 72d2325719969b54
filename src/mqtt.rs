use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::task::JoinHandle;

use crate::config;
use crate::error::BrokerError;
use crate::messages::TelemetryBatch;
use crate::telemetry;

const REQUEST_CAPACITY: usize = 10;
const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(120);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Shared view of the broker link state.
///
/// The connection manager drives explicit transitions; the transport uses
/// its clone to report losses and recoveries from its background task.
#[derive(Clone, Debug)]
pub struct ConnectionStatus(Arc<Mutex<ConnectionState>>);

impl ConnectionStatus {
    fn new() -> Self {
        ConnectionStatus(Arc::new(Mutex::new(ConnectionState::Disconnected)))
    }

    pub fn get(&self) -> ConnectionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: ConnectionState) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Connecting -> Connected, once the broker has acknowledged the session.
    /// A loss reported after this point is never overwritten by the manager.
    pub fn mark_connected(&self) -> bool {
        self.transition(ConnectionState::Connecting, ConnectionState::Connected)
    }

    /// Connected -> Reconnecting. Returns whether the transition happened.
    pub fn mark_lost(&self) -> bool {
        self.transition(ConnectionState::Connected, ConnectionState::Reconnecting)
    }

    /// Reconnecting -> Connected. Returns whether the transition happened.
    pub fn mark_restored(&self) -> bool {
        self.transition(ConnectionState::Reconnecting, ConnectionState::Connected)
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }
}

/// The network side of the broker link.
pub trait BrokerTransport: Send + 'static {
    /// Opens a fresh session and resolves once the broker has acknowledged it.
    fn connect(
        &mut self,
        status: ConnectionStatus,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// rumqttc-backed transport.
///
/// After the handshake the event loop is polled by a background task. Link
/// errors are reported as a loss and the task keeps polling, which makes
/// rumqttc reconnect, backing off between failed attempts.
pub struct MqttTransport {
    options: MqttOptions,
    connect_timeout: Duration,
    client: Option<AsyncClient>,
    driver: Option<JoinHandle<()>>,
}

impl MqttTransport {
    pub fn new(config: &config::MqttConfig) -> Self {
        let mut options = MqttOptions::new(config.client_id(), config.host.clone(), config.port());
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            options.set_credentials(username.clone(), password.clone());
        }

        MqttTransport {
            options,
            connect_timeout: config.connect_timeout(),
            client: None,
            driver: None,
        }
    }

    /// Stops the previous session's driver so it can no longer report on
    /// the shared status.
    async fn abort_driver(&mut self) {
        self.client = None;
        if let Some(driver) = self.driver.take() {
            driver.abort();
            let _ = driver.await;
        }
    }
}

impl BrokerTransport for MqttTransport {
    async fn connect(&mut self, status: ConnectionStatus) -> Result<(), BrokerError> {
        self.abort_driver().await;

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        match tokio::time::timeout(self.connect_timeout, wait_for_connack(&mut eventloop)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(BrokerError::ConnectTimeout(self.connect_timeout)),
        }

        status.mark_connected();
        self.driver = Some(tokio::spawn(drive_event_loop(eventloop, status)));
        self.client = Some(client);
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError> {
        let client = self.client.as_ref().ok_or(BrokerError::NotConnected)?;
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(err) = client.try_disconnect() {
                debug!("Could not queue MQTT disconnect: {:?}", err);
            }
        }
        if let Some(mut driver) = self.driver.take() {
            // Give the event loop a moment to flush the DISCONNECT packet.
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver)
                .await
                .is_err()
            {
                driver.abort();
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            debug!("Connection acknowledged");
            return Ok(());
        }
    }
}

async fn drive_event_loop(mut eventloop: EventLoop, status: ConnectionStatus) {
    let mut delay = MIN_RECONNECT_DELAY;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                delay = MIN_RECONNECT_DELAY;
                if status.mark_restored() {
                    info!("Broker connection restored");
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!("Publish {} acknowledged", ack.pkid);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping MQTT event loop");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                if status.mark_lost() {
                    warn!("Broker connection lost: {err}");
                } else {
                    debug!("Reconnect attempt failed: {err}");
                }
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RECONNECT_DELAY);
            }
        }
    }
}

/// Owns the broker link and its state machine.
pub struct BrokerConnectionManager<T> {
    transport: T,
    topic: String,
    status: ConnectionStatus,
    connect_attempts: u64,
}

impl<T: BrokerTransport> BrokerConnectionManager<T> {
    pub fn new(transport: T, topic: String) -> Self {
        BrokerConnectionManager {
            transport,
            topic,
            status: ConnectionStatus::new(),
            connect_attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.get()
    }

    #[cfg(test)]
    pub fn status(&self) -> ConnectionStatus {
        self.status.clone()
    }

    #[cfg(test)]
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts
    }

    pub async fn connect(&mut self) -> Result<(), BrokerError> {
        self.status.set(ConnectionState::Connecting);
        self.connect_attempts += 1;

        match self.transport.connect(self.status.clone()).await {
            Ok(()) => {
                self.status.mark_connected();
                if self.state() == ConnectionState::Reconnecting {
                    warn!("Connected to MQTT broker, but the link dropped right away");
                } else {
                    info!("Connected to MQTT broker");
                }
                Ok(())
            }
            Err(err) => {
                self.status.set(ConnectionState::Disconnected);
                warn!("MQTT connect failed: {err}");
                Err(err)
            }
        }
    }

    /// Sends a batch, making at most one inline connect attempt first.
    ///
    /// A batch that cannot be delivered is dropped; nothing is queued for a
    /// later retry.
    pub async fn publish(&mut self, batch: &TelemetryBatch) -> Result<(), BrokerError> {
        if batch.is_empty() {
            return Ok(());
        }

        if self.state() != ConnectionState::Connected {
            if let Err(err) = self.connect().await {
                warn!("Dropping batch of {} envelopes: {err}", batch.len());
                return Err(err);
            }
        }

        let payload = match telemetry::encode(batch) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Dropping batch of {} envelopes: {err}", batch.len());
                return Err(err.into());
            }
        };
        match self.transport.publish(&self.topic, payload).await {
            Ok(()) => {
                debug!("Published {} envelopes to {}", batch.len(), self.topic);
                Ok(())
            }
            Err(err) => {
                warn!("Dropping batch of {} envelopes: {err}", batch.len());
                if matches!(err, BrokerError::Client(_) | BrokerError::NotConnected) {
                    self.status.set(ConnectionState::Disconnected);
                }
                Err(err)
            }
        }
    }

    /// Tears the link down. Safe to call in any state, any number of times.
    pub async fn disconnect(&mut self) {
        if self.state() != ConnectionState::Disconnected {
            debug!("Disconnecting MQTT client");
        }
        self.transport.disconnect().await;
        self.status.set(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DeviceRecord;
    use crate::telemetry::TelemetryPublisher;
    use crate::testing::FakeTransport;

    fn batch() -> TelemetryBatch {
        let record = DeviceRecord {
            address: "AA-BB-CC-DD-EE-FF".to_string(),
            last_rssi: -69,
            last_seen_at: std::time::SystemTime::now(),
            cached_distance: 1.0,
        };
        TelemetryPublisher::new("dev".to_string()).build([&record], std::time::SystemTime::now())
    }

    #[tokio::test]
    async fn test_connect_transitions() {
        let transport = FakeTransport::default();
        let mut manager = BrokerConnectionManager::new(transport.clone(), "topic".to_string());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        transport.set_reachable(false);
        assert!(manager.connect().await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        transport.set_reachable(true);
        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_link_lost_during_connect_stays_reconnecting() {
        let transport = FakeTransport::default();
        transport.set_lose_link_on_connect(true);
        let mut manager = BrokerConnectionManager::new(transport.clone(), "topic".to_string());

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        // The next publish treats the link as down and retries inline once.
        transport.set_lose_link_on_connect(false);
        manager.publish(&batch()).await.unwrap();
        assert_eq!(manager.connect_attempts(), 2);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_connects_lazily() {
        let transport = FakeTransport::default();
        let mut manager = BrokerConnectionManager::new(transport.clone(), "ble/tags".to_string());

        manager.publish(&batch()).await.unwrap();
        assert_eq!(manager.connect_attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);

        let published = transport.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "ble/tags");

        // Already connected: no further attempts.
        manager.publish(&batch()).await.unwrap();
        assert_eq!(manager.connect_attempts(), 1);
        assert_eq!(transport.published().len(), 2);
    }

    #[tokio::test]
    async fn test_lost_link_gets_exactly_one_reconnect_attempt() {
        let transport = FakeTransport::default();
        let mut manager = BrokerConnectionManager::new(transport.clone(), "topic".to_string());
        manager.connect().await.unwrap();

        assert!(manager.status().mark_lost());
        assert_eq!(manager.state(), ConnectionState::Reconnecting);

        transport.set_reachable(false);
        assert!(manager.publish(&batch()).await.is_err());
        assert_eq!(manager.connect_attempts(), 2);
        assert_eq!(transport.connect_calls(), 2);
        assert!(transport.published().is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_inline_reconnect_delivers_batch() {
        let transport = FakeTransport::default();
        let mut manager = BrokerConnectionManager::new(transport.clone(), "topic".to_string());
        manager.connect().await.unwrap();
        manager.status().mark_lost();

        manager.publish(&batch()).await.unwrap();
        assert_eq!(manager.connect_attempts(), 2);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_recovers_link() {
        let transport = FakeTransport::default();
        let mut manager = BrokerConnectionManager::new(transport, "topic".to_string());
        manager.connect().await.unwrap();

        let status = manager.status();
        assert!(status.mark_lost());
        assert!(!status.mark_lost());
        assert!(status.mark_restored());
        assert_eq!(manager.state(), ConnectionState::Connected);

        manager.publish(&batch()).await.unwrap();
        assert_eq!(manager.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_skipped() {
        let transport = FakeTransport::default();
        let mut manager = BrokerConnectionManager::new(transport.clone(), "topic".to_string());
        manager.publish(&Vec::new()).await.unwrap();
        assert_eq!(transport.connect_calls(), 0);
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = FakeTransport::default();
        let mut manager = BrokerConnectionManager::new(transport.clone(), "topic".to_string());
        manager.disconnect().await;
        manager.connect().await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.disconnect_calls(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_mqtt_broker_times_out() {
        let config: config::MqttConfig = toml::de::from_str(
            "host = \"127.0.0.1\"\nport = 9\nconnect_timeout_seconds = 1\n",
        )
        .unwrap();
        let mut manager =
            BrokerConnectionManager::new(MqttTransport::new(&config), config.topic());
        assert!(manager.publish(&batch()).await.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.disconnect().await;
    }
}
