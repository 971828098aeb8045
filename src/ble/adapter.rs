//! Adapter role assignment and radio capability flags.
//!
//! Hardware discovery itself lives outside this crate; the BLE layer is
//! driven by adapter names ("hci0" or a bare index) and a handful of
//! environment variables holding numeric indices and boolean flags.

use thiserror::Error;

/// HCI device index for the scanning (bike/HR) side.
pub const ENV_SCAN_ADAPTER: &str = "GYMNASTICON_HCI_SCAN";
/// HCI device index for the advertising side.
pub const ENV_ADVERTISE_ADAPTER: &str = "GYMNASTICON_HCI_ADVERTISE";
/// Maximum simultaneous inbound connections on the GATT server.
pub const ENV_MAX_CONNECTIONS: &str = "GYMNASTICON_BLE_MAX_CONNECTIONS";
/// Set to 1 when the radio may scan and advertise at the same time.
pub const ENV_MULTI_ROLE: &str = "GYMNASTICON_BLE_MULTI_ROLE";
/// Set to 1 to enable extended scanning (requires a Bluetooth 5.0 controller).
pub const ENV_EXTENDED_SCAN: &str = "GYMNASTICON_BLE_EXTENDED_SCAN";

/// HCI version code for Bluetooth core 5.0.
const HCI_VERSION_5_0: u8 = 9;

/// Controllers known to handle concurrent scan+advertise on one radio.
const MULTI_ROLE_CONTROLLERS: &[&str] = &["bcm43", "cypress", "raspberry pi"];

/// Function assigned to one physical adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterRole {
    /// Scans for and connects to the bike.
    Bike(String),
    /// Advertises and serves the outbound GATT tree.
    Server { name: String, primary: bool },
    /// Scans for and connects to the heart-rate monitor.
    HeartRate(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter name {0:?} is not an hci index")]
    BadName(String),

    #[error("adapter {0} cannot scan and advertise without multi-role support")]
    RoleConflict(String),
}

/// Parse "hci1" or "1" into the numeric controller index.
pub fn adapter_index(name: &str) -> Result<u16, AdapterError> {
    let digits = name.strip_prefix("hci").unwrap_or(name);
    digits
        .parse()
        .map_err(|_| AdapterError::BadName(name.to_owned()))
}

/// Whether a controller model is whitelisted for single-radio scan+advertise.
pub fn multi_role_capable(controller: &str) -> bool {
    let lower = controller.to_ascii_lowercase();
    MULTI_ROLE_CONTROLLERS.iter().any(|m| lower.contains(m))
}

/// Whether extended scanning may be enabled for the given HCI version.
///
/// Forcing extended scan on older radios suppresses discover events, so the
/// gate errs on the side of legacy scanning.
pub fn extended_scan_supported(hci_version: u8) -> bool {
    hci_version >= HCI_VERSION_5_0
}

/// Capability flags read once at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdapterCapabilities {
    pub multi_role: bool,
    pub extended_scan: bool,
}

impl AdapterCapabilities {
    pub fn from_env() -> Self {
        Self {
            multi_role: env_flag(ENV_MULTI_ROLE),
            extended_scan: env_flag(ENV_EXTENDED_SCAN),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true"))
}

/// Inbound connection cap for the GATT server, when configured.
pub fn max_connections() -> Option<usize> {
    std::env::var(ENV_MAX_CONNECTIONS).ok()?.parse().ok()
}

/// Validated assignment of adapters to roles for one process.
///
/// At most one bike role, one or more server roles, at most one HR role.
/// The bike adapter may double as a server only on a multi-role radio.
#[derive(Debug)]
pub struct AdapterPlan {
    pub bike: String,
    pub servers: Vec<(String, bool)>,
    pub heart_rate: Option<String>,
    pub multi_role: bool,
}

impl AdapterPlan {
    pub fn new(
        bike: &str,
        server_adapters: &[String],
        heart_rate: Option<&str>,
        multi_role: bool,
    ) -> Result<Self, AdapterError> {
        let mut servers: Vec<(String, bool)> = Vec::new();
        for name in server_adapters {
            if !servers.iter().any(|(existing, _)| existing == name) {
                servers.push((name.clone(), servers.is_empty()));
            }
        }
        // A multi-role radio also serves on the bike adapter; deduplicated so
        // a single-radio host never ends up with a double entry.
        if multi_role && !servers.iter().any(|(name, _)| name == bike) {
            servers.push((bike.to_owned(), servers.is_empty()));
        }
        if !multi_role && servers.iter().any(|(name, _)| name == bike) {
            return Err(AdapterError::RoleConflict(bike.to_owned()));
        }
        Ok(Self {
            bike: bike.to_owned(),
            servers,
            heart_rate: heart_rate.map(str::to_owned),
            multi_role,
        })
    }

    /// All roles in this plan.
    pub fn roles(&self) -> Vec<AdapterRole> {
        let mut roles = vec![AdapterRole::Bike(self.bike.clone())];
        roles.extend(
            self.servers
                .iter()
                .map(|(name, primary)| AdapterRole::Server {
                    name: name.clone(),
                    primary: *primary,
                }),
        );
        roles.extend(self.heart_rate.clone().map(AdapterRole::HeartRate));
        roles
    }

    /// Publish the numeric indices for the underlying stack.
    pub fn export_env(&self) -> Result<(), AdapterError> {
        std::env::set_var(ENV_SCAN_ADAPTER, adapter_index(&self.bike)?.to_string());
        if let Some((name, _)) = self.servers.first() {
            std::env::set_var(ENV_ADVERTISE_ADAPTER, adapter_index(name)?.to_string());
        }
        if self.multi_role {
            std::env::set_var(ENV_MULTI_ROLE, "1");
        }
        Ok(())
    }
}
