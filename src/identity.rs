use std::fs;
use std::path::PathBuf;

use log::{debug, info};
use mac_address::{MacAddress, MacAddressIterator};

use crate::address;
use crate::config::IdentityConfig;

/// One step of the device-id fallback chain.
pub trait IdentityProvider {
    fn name(&self) -> &'static str;

    /// Raw identity, or `None` when this source is unavailable.
    fn lookup(&self) -> Option<String>;

    /// Address-shaped results are canonicalized and checked for
    /// placeholders. Other results are used as given.
    fn is_address(&self) -> bool {
        true
    }
}

/// Resolves the scanning node's own identifier.
///
/// Providers are tried in order and the first result that is neither empty
/// nor a placeholder address wins. If every provider comes up empty a random
/// MAC-like token is generated. A configured id is taken verbatim.
pub struct IdentityResolver {
    providers: Vec<Box<dyn IdentityProvider + Send>>,
}

impl IdentityResolver {
    pub fn new(providers: Vec<Box<dyn IdentityProvider + Send>>) -> Self {
        IdentityResolver { providers }
    }

    pub fn from_config(config: &IdentityConfig) -> Self {
        let mut providers: Vec<Box<dyn IdentityProvider + Send>> = Vec::new();
        if let Some(device_id) = &config.device_id {
            providers.push(Box::new(Configured(device_id.clone())));
        }
        providers.push(Box::new(RadioAddress {
            path: PathBuf::from(format!(
                "/sys/class/bluetooth/{}/address",
                config.radio_adapter()
            )),
        }));
        providers.push(Box::new(InterfaceAddress {
            interface: config.network_interface(),
        }));
        providers.push(Box::new(AnyInterfaceAddress));
        providers.push(Box::new(InstallationId {
            path: config.installation_id_path(),
        }));
        IdentityResolver::new(providers)
    }

    pub fn resolve(&self) -> String {
        for provider in &self.providers {
            if !provider.is_address() {
                match provider.lookup().map(|raw| raw.trim().to_string()) {
                    Some(id) if !id.is_empty() => {
                        info!("Using device id {id} from {}", provider.name());
                        return id;
                    }
                    _ => debug!("No device id available from {}", provider.name()),
                }
                continue;
            }
            match provider.lookup() {
                Some(raw) if !address::is_placeholder(&raw) => {
                    let id = address::canonical(&raw);
                    info!("Using device id {id} from {}", provider.name());
                    return id;
                }
                Some(raw) => debug!("Ignoring placeholder {raw:?} from {}", provider.name()),
                None => debug!("No device id available from {}", provider.name()),
            }
        }
        let id = random_token();
        info!("Using randomly generated device id {id}");
        id
    }
}

struct Configured(String);

impl IdentityProvider for Configured {
    fn name(&self) -> &'static str {
        "configuration"
    }

    fn lookup(&self) -> Option<String> {
        Some(self.0.clone())
    }

    fn is_address(&self) -> bool {
        false
    }
}

/// Bluetooth controller address as exposed through sysfs.
struct RadioAddress {
    path: PathBuf,
}

impl IdentityProvider for RadioAddress {
    fn name(&self) -> &'static str {
        "bluetooth adapter"
    }

    fn lookup(&self) -> Option<String> {
        fs::read_to_string(&self.path).ok()
    }
}

struct InterfaceAddress {
    interface: String,
}

impl IdentityProvider for InterfaceAddress {
    fn name(&self) -> &'static str {
        "network interface"
    }

    fn lookup(&self) -> Option<String> {
        mac_address::mac_address_by_name(&self.interface)
            .ok()
            .flatten()
            .map(|mac| mac.to_string())
    }
}

struct AnyInterfaceAddress;

impl IdentityProvider for AnyInterfaceAddress {
    fn name(&self) -> &'static str {
        "any network interface"
    }

    fn lookup(&self) -> Option<String> {
        MacAddressIterator::new()
            .ok()?
            .map(|mac| mac.to_string())
            .find(|mac| !address::is_placeholder(mac))
    }
}

struct InstallationId {
    path: PathBuf,
}

impl IdentityProvider for InstallationId {
    fn name(&self) -> &'static str {
        "installation id"
    }

    fn lookup(&self) -> Option<String> {
        let id = fs::read_to_string(&self.path).ok()?;
        mac_like(&id)
    }
}

/// Reshapes an installation identifier into a MAC-like token from its first
/// twelve characters.
fn mac_like(id: &str) -> Option<String> {
    let id = id.trim();
    if id.chars().count() < 12 {
        return None;
    }
    let head: String = id.chars().take(12).collect();
    Some(address::canonical(&head))
}

fn random_token() -> String {
    let bytes: [u8; 6] = rand::random();
    address::canonical(&MacAddress::new(bytes).to_string())
}
