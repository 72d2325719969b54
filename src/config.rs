use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::error::ConfigError;

/// rumqttc rejects keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE_SECONDS: u64 = 5;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub devices: Option<Vec<BleDevice>>,
    pub scan: Option<ScanConfig>,
    pub distance: Option<DistanceConfig>,
    pub identity: Option<IdentityConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub enabled: Option<bool>,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub topic: Option<String>,
    pub keep_alive_seconds: Option<u64>,
    pub connect_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct BleDevice {
    pub address: MacAddress,
    pub name: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub whitelist_enabled: Option<bool>,
    pub throttle_millis: Option<u64>,
    pub restart_interval_seconds: Option<u64>,
    pub settle_delay_millis: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DistanceConfig {
    pub reference_power: Option<f64>,
    pub path_loss_exponent: Option<f64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct IdentityConfig {
    pub device_id: Option<String>,
    pub radio_adapter: Option<String>,
    pub network_interface: Option<String>,
    pub installation_id_path: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: AppConfig = toml::de::from_str(&contents)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scan = self.scan();
        if scan.throttle_interval().is_zero() {
            return Err(ConfigError::Invalid {
                field: "scan.throttle_millis",
                expected: "greater than zero",
            });
        }
        if scan.restart_interval() <= scan.settle_delay() {
            return Err(ConfigError::Invalid {
                field: "scan.restart_interval_seconds",
                expected: "longer than scan.settle_delay_millis",
            });
        }
        let exponent = self.distance().path_loss_exponent();
        if !exponent.is_finite() || exponent <= 0.0 {
            return Err(ConfigError::Invalid {
                field: "distance.path_loss_exponent",
                expected: "a positive number",
            });
        }
        Ok(())
    }

    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }

    pub fn distance(&self) -> DistanceConfig {
        self.distance.clone().unwrap_or_default()
    }

    pub fn identity(&self) -> IdentityConfig {
        self.identity.clone().unwrap_or_default()
    }

    pub fn devices(&self) -> &[BleDevice] {
        self.devices.as_deref().unwrap_or_default()
    }
}

impl MqttConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(1883)
    }

    pub fn topic(&self) -> String {
        self.topic
            .clone()
            .unwrap_or_else(|| "ble-topic-data/device".to_string())
    }

    pub fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis())
                .unwrap_or_default();
            format!("beacon-relay-{millis}")
        })
    }

    pub fn keep_alive(&self) -> Duration {
        let seconds = self.keep_alive_seconds.unwrap_or(60);
        Duration::from_secs(seconds.max(MIN_KEEP_ALIVE_SECONDS))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds.unwrap_or(10))
    }
}

impl ScanConfig {
    pub fn whitelist_enabled(&self) -> bool {
        self.whitelist_enabled.unwrap_or(true)
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_millis.unwrap_or(1000))
    }

    /// Restart period, kept under the platform's five minute scan ceiling.
    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.restart_interval_seconds.unwrap_or(4 * 60))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_millis.unwrap_or(1000))
    }
}

impl DistanceConfig {
    pub fn reference_power(&self) -> f64 {
        self.reference_power.unwrap_or(-69.0)
    }

    pub fn path_loss_exponent(&self) -> f64 {
        self.path_loss_exponent.unwrap_or(2.0)
    }
}

impl IdentityConfig {
    pub fn radio_adapter(&self) -> String {
        self.radio_adapter
            .clone()
            .unwrap_or_else(|| "hci0".to_string())
    }

    pub fn network_interface(&self) -> String {
        self.network_interface
            .clone()
            .unwrap_or_else(|| "wlan0".to_string())
    }

    pub fn installation_id_path(&self) -> PathBuf {
        self.installation_id_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("/etc/machine-id"))
    }
}
