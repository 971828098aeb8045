//! Bike ingress drivers.
//!
//! One driver per supported transport, all speaking the same contract: a
//! push-style event stream of samples, plus a single terminal disconnect
//! event carrying the canonical peripheral address. Classification of
//! discovered advertisements lives here too.

pub mod bot;
pub mod flywheel;
pub mod ftms;
pub mod ic8;
pub mod keiser;
pub mod peloton;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ble::filter::normalize_address;
use crate::ble::BleError;

/// One normalized telemetry frame from a bike source.
#[derive(Debug, Clone, Copy)]
pub struct BikeSample {
    /// Power in watts.
    pub power_w: u16,
    /// Cadence in RPM.
    pub cadence_rpm: u16,
    /// Ground speed in m/s, only for sources that natively report it.
    pub speed_mps: Option<f32>,
    /// When the frame was decoded.
    pub t: Instant,
}

impl BikeSample {
    pub fn new(power_w: u16, cadence_rpm: u16) -> Self {
        Self {
            power_w,
            cadence_rpm,
            speed_mps: None,
            t: Instant::now(),
        }
    }

    pub fn with_speed(power_w: u16, cadence_rpm: u16, speed_mps: f32) -> Self {
        Self {
            speed_mps: Some(speed_mps),
            ..Self::new(power_w, cadence_rpm)
        }
    }
}

/// Events pushed from a driver to the supervisor.
#[derive(Debug, Clone)]
pub enum BikeEvent {
    Sample(BikeSample),
    /// Terminal failure. Emitted exactly once per driver lifetime.
    Disconnect { address: String },
}

/// Errors from driver setup and teardown.
#[derive(Debug, Error)]
pub enum BikeError {
    #[error(transparent)]
    Ble(#[from] BleError),

    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("required characteristic {0} not found")]
    MissingCharacteristic(Uuid),
}

/// Supported bike models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BikeKind {
    Autodetect,
    Flywheel,
    Peloton,
    Ic4,
    Ic5,
    Ic8,
    Keiser,
    Bot,
}

impl fmt::Display for BikeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BikeKind::Autodetect => "autodetect",
            BikeKind::Flywheel => "flywheel",
            BikeKind::Peloton => "peloton",
            BikeKind::Ic4 => "ic4",
            BikeKind::Ic5 => "ic5",
            BikeKind::Ic8 => "ic8",
            BikeKind::Keiser => "keiser",
            BikeKind::Bot => "bot",
        };
        write!(f, "{name}")
    }
}

impl FromStr for BikeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "autodetect" => Ok(BikeKind::Autodetect),
            "flywheel" => Ok(BikeKind::Flywheel),
            "peloton" => Ok(BikeKind::Peloton),
            "ic4" => Ok(BikeKind::Ic4),
            "ic5" => Ok(BikeKind::Ic5),
            "ic8" => Ok(BikeKind::Ic8),
            "keiser" => Ok(BikeKind::Keiser),
            "bot" => Ok(BikeKind::Bot),
            other => Err(format!("unknown bike type {other:?}")),
        }
    }
}

/// Advertisement summary handed to the classification matchers.
#[derive(Debug, Default)]
pub struct Advertised<'a> {
    pub local_name: Option<&'a str>,
    pub manufacturer_data: Option<&'a HashMap<u16, Vec<u8>>>,
    pub services: &'a [Uuid],
}

/// Classification matcher: a predicate paired with the model it selects.
pub struct BikeMatcher {
    pub kind: BikeKind,
    pub matches: fn(&Advertised) -> bool,
}

/// Matchers in priority order; first hit wins.
pub const MATCHERS: &[BikeMatcher] = &[
    BikeMatcher {
        kind: BikeKind::Flywheel,
        matches: flywheel::matches,
    },
    BikeMatcher {
        kind: BikeKind::Ic4,
        matches: ftms::matches_ic4,
    },
    BikeMatcher {
        kind: BikeKind::Ic5,
        matches: ftms::matches_ic5,
    },
    BikeMatcher {
        kind: BikeKind::Ic8,
        matches: ic8::matches,
    },
    BikeMatcher {
        kind: BikeKind::Keiser,
        matches: keiser::matches,
    },
];

/// Classify one advertisement, if any matcher accepts it.
pub fn classify(adv: &Advertised) -> Option<BikeKind> {
    MATCHERS
        .iter()
        .find(|m| (m.matches)(adv))
        .map(|m| m.kind)
}

/// Detect which bike is present.
///
/// A Peloton console is preferred without scanning whenever its serial
/// device path exists. Otherwise a scan session runs for `window`; if no
/// matcher fires, `default_bike` is returned.
pub async fn autodetect(
    adapter: &Adapter,
    peloton_path: &Path,
    window: Duration,
    default_bike: BikeKind,
) -> Result<BikeKind, BikeError> {
    if peloton_path.exists() {
        tracing::info!("found peloton console at {}", peloton_path.display());
        return Ok(BikeKind::Peloton);
    }

    adapter.start_scan(ScanFilter::default()).await.map_err(BleError::from)?;
    let mut events = adapter.events().await.map_err(BleError::from)?;
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    let detected = loop {
        tokio::select! {
            event = events.next() => {
                let Some(CentralEvent::DeviceDiscovered(id)) = event else { continue };
                let Ok(peripheral) = adapter.peripheral(&id).await else { continue };
                let Ok(Some(props)) = peripheral.properties().await else { continue };
                let adv = Advertised {
                    local_name: props.local_name.as_deref(),
                    manufacturer_data: Some(&props.manufacturer_data),
                    services: &props.services,
                };
                if let Some(kind) = classify(&adv) {
                    tracing::info!("detected {} ({})", kind, peripheral.address());
                    break kind;
                }
            }
            _ = &mut deadline => {
                tracing::info!("no bike detected, falling back to {}", default_bike);
                break default_bike;
            }
        }
    };
    let _ = adapter.stop_scan().await;
    Ok(detected)
}

/// Scan until a peripheral satisfying `accept` is discovered.
pub async fn scan_for(
    adapter: &Adapter,
    scan_filter: ScanFilter,
    timeout: Duration,
    mut accept: impl FnMut(&Advertised, &str) -> bool,
) -> Result<Peripheral, BikeError> {
    adapter.start_scan(scan_filter).await.map_err(BleError::from)?;
    let mut events = adapter.events().await.map_err(BleError::from)?;
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let found = loop {
        tokio::select! {
            event = events.next() => {
                let Some(CentralEvent::DeviceDiscovered(id)) = event else { continue };
                let Ok(peripheral) = adapter.peripheral(&id).await else { continue };
                let Ok(Some(props)) = peripheral.properties().await else { continue };
                let adv = Advertised {
                    local_name: props.local_name.as_deref(),
                    manufacturer_data: Some(&props.manufacturer_data),
                    services: &props.services,
                };
                let address = normalize_address(&props.address.to_string());
                if accept(&adv, &address) {
                    break Ok(peripheral);
                }
            }
            _ = &mut deadline => break Err(BikeError::Ble(BleError::ScanTimeout)),
        }
    };
    let _ = adapter.stop_scan().await;
    found
}

/// Canonical lowercase address of a peripheral.
pub fn peripheral_address(peripheral: &Peripheral) -> String {
    normalize_address(&peripheral.address().to_string())
}

/// Find a characteristic by UUID after service discovery.
pub fn find_characteristic(
    peripheral: &Peripheral,
    uuid: Uuid,
) -> Result<btleplug::api::Characteristic, BikeError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or(BikeError::MissingCharacteristic(uuid))
}

/// A running driver of any transport, dispatched as a tagged variant.
pub enum BikeClient {
    Flywheel(flywheel::FlywheelBike),
    Ftms(ftms::FtmsBike),
    Ic8(ic8::Ic8Bike),
    Keiser(keiser::KeiserBike),
    Peloton(peloton::PelotonBike),
    Bot(bot::BotBike),
}

impl BikeClient {
    /// Tear down the driver. Idempotent across all transports.
    pub async fn disconnect(&self) {
        match self {
            BikeClient::Flywheel(bike) => bike.disconnect().await,
            BikeClient::Ftms(bike) => bike.disconnect().await,
            BikeClient::Ic8(bike) => bike.disconnect().await,
            BikeClient::Keiser(bike) => bike.disconnect().await,
            BikeClient::Peloton(bike) => bike.disconnect().await,
            BikeClient::Bot(bike) => bike.disconnect().await,
        }
    }
}

/// Sends the terminal disconnect event at most once.
#[derive(Debug)]
pub(crate) struct DisconnectOnce {
    address: String,
    sent: bool,
}

impl DisconnectOnce {
    pub(crate) fn new(address: String) -> Self {
        Self {
            address,
            sent: false,
        }
    }

    pub(crate) async fn send(&mut self, events: &mpsc::Sender<BikeEvent>) {
        if !self.sent {
            self.sent = true;
            let _ = events
                .send(BikeEvent::Disconnect {
                    address: self.address.clone(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bike_kind_round_trip() {
        for kind in [
            BikeKind::Autodetect,
            BikeKind::Flywheel,
            BikeKind::Peloton,
            BikeKind::Ic4,
            BikeKind::Ic5,
            BikeKind::Ic8,
            BikeKind::Keiser,
            BikeKind::Bot,
        ] {
            assert_eq!(kind.to_string().parse::<BikeKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_classify_priority_order() {
        let adv = Advertised {
            local_name: Some("Flywheel 1"),
            ..Default::default()
        };
        assert_eq!(classify(&adv), Some(BikeKind::Flywheel));

        let adv = Advertised {
            local_name: Some("M3i-12345"),
            ..Default::default()
        };
        assert_eq!(classify(&adv), Some(BikeKind::Keiser));

        let adv = Advertised {
            local_name: Some("Treadmill"),
            ..Default::default()
        };
        assert_eq!(classify(&adv), None);
    }
}
