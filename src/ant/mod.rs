//! ANT+ broadcasting over a Garmin USB stick.
//!
//! The stick is optional: when none is present, or when it dies mid-session,
//! ANT+ is disabled and the BLE pipeline keeps running.

pub mod broadcaster;
pub mod stick;

use thiserror::Error;

pub use broadcaster::PowerBroadcast;
pub use stick::AntStick;

/// Errors from the ANT+ subsystem.
#[derive(Debug, Error)]
pub enum AntError {
    #[error("no ANT+ stick found")]
    NoStickFound,

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("stick rejected message id {0:#04x}")]
    Rejected(u8),
}

/// ANT+ Bike Power device type.
pub const DEVICE_TYPE_POWER: u8 = 11;

/// Channel period for Bike Power (32768 / 8182 ≈ 4.00 Hz).
pub const CHANNEL_PERIOD_POWER: u16 = 8182;

/// ANT+ RF frequency offset from 2400 MHz (2457 MHz).
pub const RF_FREQUENCY: u8 = 57;

/// Default 16-bit device ID when none is configured.
pub const DEFAULT_DEVICE_ID: u16 = 11234;
