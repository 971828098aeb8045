//! Command-line surface.
//!
//! Every option is optional at the parser level: values the user did not
//! type must not override config-file settings, so defaults are applied
//! during the merge in [`crate::config`], not here.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Default, Parser)]
#[command(name = "gymnasticon", version, about = "Bridge a proprietary indoor bike to standard BLE and ANT+ fitness profiles")]
pub struct Cli {
    /// Bike type: autodetect, flywheel, peloton, ic4, ic5, ic8, keiser or bot
    #[arg(long)]
    pub bike: Option<String>,

    /// Adapter used to scan for and connect to the bike (hciN or index)
    #[arg(long)]
    pub bike_adapter: Option<String>,

    /// Adapter used to advertise to apps
    #[arg(long)]
    pub server_adapter: Option<String>,

    /// Comma-separated list of adapters to advertise on
    #[arg(long, value_delimiter = ',')]
    pub server_adapters: Option<Vec<String>>,

    /// Advertised device name
    #[arg(long)]
    pub server_name: Option<String>,

    /// Connect to the Flywheel at this address only
    #[arg(long)]
    pub flywheel_address: Option<String>,

    /// Connect to the Flywheel with this advertised name only
    #[arg(long)]
    pub flywheel_name: Option<String>,

    /// Peloton head-unit serial device
    #[arg(long)]
    pub peloton_path: Option<PathBuf>,

    /// Initial power for the bot bike
    #[arg(long)]
    pub bot_power: Option<u16>,

    /// Initial cadence for the bot bike
    #[arg(long)]
    pub bot_cadence: Option<u16>,

    /// Bind host for the bot bike control socket
    #[arg(long)]
    pub bot_host: Option<String>,

    /// Bind port for the bot bike control socket
    #[arg(long)]
    pub bot_port: Option<u16>,

    /// Keep-alive notification interval in seconds
    #[arg(long)]
    pub server_ping_interval: Option<f64>,

    /// Exit when the bike is silent this many seconds
    #[arg(long)]
    pub bike_receive_timeout: Option<f64>,

    /// Give up on the initial bike connection after this many seconds
    #[arg(long)]
    pub bike_connect_timeout: Option<f64>,

    /// Multiply reported power by this factor
    #[arg(long)]
    pub power_scale: Option<f64>,

    /// Add this many watts to reported power
    #[arg(long)]
    pub power_offset: Option<f64>,

    /// Relay an external heart-rate monitor
    #[arg(long, overrides_with = "no_heart_rate_enabled")]
    pub heart_rate_enabled: bool,

    /// Disable the heart-rate relay
    #[arg(long)]
    pub no_heart_rate_enabled: bool,

    /// Adapter used to scan for the heart-rate monitor
    #[arg(long)]
    pub heart_rate_adapter: Option<String>,

    /// Broadcast on ANT+ when a stick is present
    #[arg(long, overrides_with = "no_ant_plus")]
    pub ant_plus: bool,

    /// Disable ANT+ broadcasting
    #[arg(long)]
    pub no_ant_plus: bool,

    /// ANT+ device ID
    #[arg(long)]
    pub ant_device_id: Option<u16>,

    /// Wheel circumference in meters for synthesized speed
    #[arg(long)]
    pub speed_circumference: Option<f64>,

    /// Gear factor applied to reported speed
    #[arg(long)]
    pub speed_gear_factor: Option<f64>,

    /// Lower clamp on reported speed in m/s
    #[arg(long)]
    pub speed_min: Option<f64>,

    /// Upper clamp on reported speed in m/s
    #[arg(long)]
    pub speed_max: Option<f64>,

    /// Advertise on every configured server adapter
    #[arg(long)]
    pub ble_multi_output: bool,

    /// Configuration file location
    #[arg(long)]
    pub config_path: Option<PathBuf>,
}

impl Cli {
    /// Tri-state of the paired enable/disable heart-rate flags.
    pub fn heart_rate_enabled(&self) -> Option<bool> {
        match (self.heart_rate_enabled, self.no_heart_rate_enabled) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }

    /// Tri-state of the paired enable/disable ANT+ flags.
    pub fn ant_plus(&self) -> Option<bool> {
        match (self.ant_plus, self.no_ant_plus) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}
