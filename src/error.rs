use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("no bluetooth adapter available")]
    NoAdapter,
    #[error("scan refused: {0}")]
    Refused(String),
    #[error(transparent)]
    Btle(#[from] btleplug::Error),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker did not acknowledge the connection within {0:?}")]
    ConnectTimeout(Duration),
    #[error("broker connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("mqtt client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("not connected to broker")]
    NotConnected,
    #[error("could not encode telemetry batch: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be {expected}")]
    Invalid {
        field: &'static str,
        expected: &'static str,
    },
}
