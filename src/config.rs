//! Settings: built-in defaults, JSON config file, CLI overrides.
//!
//! Precedence, lowest to highest: compiled defaults, config file values,
//! flags the user actually typed. File keys may be kebab-case or camelCase.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Cli;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gymnasticon.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Fully merged runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    pub bike: String,
    pub bike_adapter: String,
    pub server_adapter: String,
    pub server_adapters: Vec<String>,
    pub server_name: String,
    pub flywheel_address: Option<String>,
    pub flywheel_name: Option<String>,
    pub peloton_path: PathBuf,
    pub bot_power: u16,
    pub bot_cadence: u16,
    pub bot_host: String,
    pub bot_port: u16,
    pub server_ping_interval: f64,
    pub bike_receive_timeout: f64,
    pub bike_connect_timeout: f64,
    pub power_scale: f64,
    pub power_offset: f64,
    pub heart_rate_enabled: bool,
    pub heart_rate_adapter: Option<String>,
    pub ant_plus: bool,
    pub ant_device_id: u16,
    pub speed_circumference: f64,
    pub speed_gear_factor: f64,
    pub speed_min: f64,
    pub speed_max: f64,
    pub ble_multi_output: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bike: "autodetect".to_owned(),
            bike_adapter: "hci0".to_owned(),
            server_adapter: "hci0".to_owned(),
            server_adapters: Vec::new(),
            server_name: "Gymnasticon".to_owned(),
            flywheel_address: None,
            flywheel_name: None,
            peloton_path: PathBuf::from("/dev/ttyUSB0"),
            bot_power: 0,
            bot_cadence: 0,
            bot_host: "0.0.0.0".to_owned(),
            bot_port: 3000,
            server_ping_interval: 1.0,
            bike_receive_timeout: 10.0,
            bike_connect_timeout: 30.0,
            power_scale: 1.0,
            power_offset: 0.0,
            heart_rate_enabled: false,
            heart_rate_adapter: None,
            ant_plus: true,
            ant_device_id: crate::ant::DEFAULT_DEVICE_ID,
            speed_circumference: 2.096,
            speed_gear_factor: 1.0,
            speed_min: 0.0,
            speed_max: 30.0,
            ble_multi_output: false,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, tolerating a missing file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(ConfigError::Io {
                    path: path.to_owned(),
                    source: err,
                })
            }
        };
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|err| ConfigError::Parse {
                path: path.to_owned(),
                source: err,
            })?;
        let normalized = normalize_keys(value);
        serde_json::from_value(normalized).map_err(|err| ConfigError::Parse {
            path: path.to_owned(),
            source: err,
        })
    }

    /// Overlay the flags the user actually typed.
    pub fn apply_cli(&mut self, cli: &Cli) {
        macro_rules! overlay {
            ($field:ident) => {
                if let Some(value) = &cli.$field {
                    self.$field = value.clone();
                }
            };
        }
        overlay!(bike);
        overlay!(bike_adapter);
        overlay!(server_adapter);
        overlay!(server_adapters);
        overlay!(server_name);
        overlay!(peloton_path);
        if cli.flywheel_address.is_some() {
            self.flywheel_address = cli.flywheel_address.clone();
        }
        if cli.flywheel_name.is_some() {
            self.flywheel_name = cli.flywheel_name.clone();
        }
        if cli.heart_rate_adapter.is_some() {
            self.heart_rate_adapter = cli.heart_rate_adapter.clone();
        }
        overlay!(bot_host);
        if let Some(value) = cli.bot_power {
            self.bot_power = value;
        }
        if let Some(value) = cli.bot_cadence {
            self.bot_cadence = value;
        }
        if let Some(value) = cli.bot_port {
            self.bot_port = value;
        }
        if let Some(value) = cli.server_ping_interval {
            self.server_ping_interval = value;
        }
        if let Some(value) = cli.bike_receive_timeout {
            self.bike_receive_timeout = value;
        }
        if let Some(value) = cli.bike_connect_timeout {
            self.bike_connect_timeout = value;
        }
        if let Some(value) = cli.power_scale {
            self.power_scale = value;
        }
        if let Some(value) = cli.power_offset {
            self.power_offset = value;
        }
        if let Some(value) = cli.heart_rate_enabled() {
            self.heart_rate_enabled = value;
        }
        if let Some(value) = cli.ant_plus() {
            self.ant_plus = value;
        }
        if let Some(value) = cli.ant_device_id {
            self.ant_device_id = value;
        }
        if let Some(value) = cli.speed_circumference {
            self.speed_circumference = value;
        }
        if let Some(value) = cli.speed_gear_factor {
            self.speed_gear_factor = value;
        }
        if let Some(value) = cli.speed_min {
            self.speed_min = value;
        }
        if let Some(value) = cli.speed_max {
            self.speed_max = value;
        }
        if cli.ble_multi_output {
            self.ble_multi_output = true;
        }
    }

    /// Effective list of advertising adapters.
    pub fn server_adapter_list(&self) -> Vec<String> {
        if self.ble_multi_output && !self.server_adapters.is_empty() {
            self.server_adapters.clone()
        } else {
            vec![self.server_adapter.clone()]
        }
    }
}

/// Accept camelCase keys by rewriting them to kebab-case.
fn normalize_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let normalized = kebab_case(&key);
                    if !KNOWN_KEYS.contains(&normalized.as_str()) {
                        tracing::warn!("ignoring unknown config key {key:?}");
                    }
                    (normalized, value)
                })
                .collect(),
        ),
        other => other,
    }
}

fn kebab_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('-');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

const KNOWN_KEYS: &[&str] = &[
    "bike",
    "bike-adapter",
    "server-adapter",
    "server-adapters",
    "server-name",
    "flywheel-address",
    "flywheel-name",
    "peloton-path",
    "bot-power",
    "bot-cadence",
    "bot-host",
    "bot-port",
    "server-ping-interval",
    "bike-receive-timeout",
    "bike-connect-timeout",
    "power-scale",
    "power-offset",
    "heart-rate-enabled",
    "heart-rate-adapter",
    "ant-plus",
    "ant-device-id",
    "speed-circumference",
    "speed-gear-factor",
    "speed-min",
    "speed-max",
    "ble-multi-output",
];
