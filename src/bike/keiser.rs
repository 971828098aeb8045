//! Keiser M-series driver.
//!
//! M3i bikes never accept a GATT connection; telemetry rides in the
//! manufacturer-data block of their advertisements. The driver runs a
//! continuous duplicate-allowing scan and locks onto the first bike whose
//! beacon parses.

use std::time::Duration;

use btleplug::api::{Central, CentralEvent, ScanFilter};
use btleplug::platform::Adapter;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::{Advertised, BikeError, BikeEvent, BikeSample, DisconnectOnce};
use crate::ble::filter::name_has_prefix;
use crate::ble::{BleError, ConnectionState};
use crate::pipeline::DropoutFilter;

/// Keiser beacons start with these two manufacturer-data bytes (company
/// identifier 0x0102 on the wire).
const BEACON_MAGIC: [u8; 2] = [0x02, 0x01];
const KEISER_COMPANY_ID: u16 = 0x0102;

/// Give up on the bike after this long without a valid beacon.
const KEISER_BIKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Realtime telemetry decoded from one beacon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeiserStats {
    /// Power in watts.
    pub power: u16,
    /// Cadence in RPM, rounded from the 0.1 RPM wire unit.
    pub cadence: u16,
}

/// Console firmware version with its stats staleness deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BikeVersion {
    /// Dotted form, e.g. "6.30".
    pub version: String,
    /// Seconds between broadcasts of fresh realtime data.
    pub stats_timeout: Duration,
}

fn minor_decimal(minor: u8) -> u16 {
    ((minor >> 4) * 10 + (minor & 0x0f)) as u16
}

/// Firmware version from a beacon: major at 2, minor at 3, BCD-coded.
///
/// Consoles before 6.30 rebroadcast realtime data only every 30 s; newer
/// firmware shortens that to 20 s.
pub fn bike_version(data: &[u8]) -> Option<BikeVersion> {
    if data.len() < 4 || data[..2] != BEACON_MAGIC {
        return None;
    }
    let major = data[2];
    let minor = data[3];
    let newer = (major as u16, minor_decimal(minor)) >= (6, 30);
    Some(BikeVersion {
        version: format!("{:x}.{:02x}", major, minor),
        stats_timeout: Duration::from_secs(if newer { 20 } else { 30 }),
    })
}

/// Parse realtime stats from a beacon payload.
///
/// The realtime marker at 4 must be 0 or in (128, 255); anything else is a
/// cached/review broadcast and is ignored. Cadence is u16 LE at 6 in 0.1
/// RPM; power is u16 LE at 10.
pub fn parse_beacon(data: &[u8]) -> Option<KeiserStats> {
    if data.len() < 12 || data[..2] != BEACON_MAGIC {
        return None;
    }
    let realtime = data[4];
    if !(realtime == 0 || (realtime > 128 && realtime < 255)) {
        return None;
    }
    let cadence_raw = u16::from_le_bytes([data[6], data[7]]);
    let power = u16::from_le_bytes([data[10], data[11]]);
    Some(KeiserStats {
        power,
        cadence: ((cadence_raw as u32 + 5) / 10) as u16,
    })
}

pub fn matches(adv: &Advertised) -> bool {
    if let Some(name) = adv.local_name {
        if name_has_prefix(name, "m3") {
            return true;
        }
    }
    // Cached beacons may stop advertising a name; fall back to the
    // manufacturer-data magic.
    adv.manufacturer_data
        .map(|data| data.contains_key(&KEISER_COMPANY_ID))
        .unwrap_or(false)
}

/// Rebuild the full beacon payload from the btleplug manufacturer-data map,
/// which splits off the company identifier.
fn beacon_payload(company_id: u16, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + data.len());
    payload.extend_from_slice(&company_id.to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

/// Beacon-following Keiser client.
#[derive(Debug)]
pub struct KeiserBike {
    adapter: Adapter,
    task: JoinHandle<()>,
}

impl KeiserBike {
    /// Start the continuous scan and follow the first matching bike.
    pub async fn connect(
        adapter: &Adapter,
        events: mpsc::Sender<BikeEvent>,
    ) -> Result<Self, BikeError> {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(BleError::from)?;
        let central_events = adapter.events().await.map_err(BleError::from)?;
        let adapter = adapter.clone();

        let task = tokio::spawn(run(adapter.clone(), central_events, events));
        Ok(Self { adapter, task })
    }

    /// Stop following the bike. Idempotent.
    pub async fn disconnect(&self) {
        self.task.abort();
        if let Err(err) = self.adapter.stop_scan().await {
            tracing::debug!("stop scan: {}", err);
        }
    }
}

async fn run(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: mpsc::Sender<BikeEvent>,
) {
    let mut dropout = DropoutFilter::new();
    let mut state = ConnectionState::default();
    state.advance(ConnectionState::Connecting);
    let mut locked: Option<btleplug::platform::PeripheralId> = None;
    let mut address = String::from("unknown");
    let mut stats_timeout = Duration::from_secs(30);
    let mut stats_deadline = Instant::now() + stats_timeout;
    let mut bike_deadline = Instant::now() + KEISER_BIKE_TIMEOUT;

    loop {
        tokio::select! {
            event = central_events.next() => {
                let Some(event) = event else { break };
                let CentralEvent::ManufacturerDataAdvertisement { id, manufacturer_data } = event
                else { continue };
                let Some(data) = manufacturer_data.get(&KEISER_COMPANY_ID) else { continue };
                if let Some(lock) = &locked {
                    if *lock != id {
                        continue;
                    }
                }
                let payload = beacon_payload(KEISER_COMPANY_ID, data);
                let Some(stats) = parse_beacon(&payload) else { continue };
                if locked.is_none() {
                    let version = bike_version(&payload);
                    if let Some(version) = &version {
                        stats_timeout = version.stats_timeout;
                        tracing::info!("following keiser m3 (firmware {})", version.version);
                    }
                    if let Ok(peripheral) = adapter.peripheral(&id).await {
                        address = super::peripheral_address(&peripheral);
                    }
                    locked = Some(id);
                }
                if state != ConnectionState::Connected {
                    state.advance(ConnectionState::Connected);
                }
                stats_deadline = Instant::now() + stats_timeout;
                bike_deadline = Instant::now() + KEISER_BIKE_TIMEOUT;
                let (power, cadence) = dropout.apply(stats.power, stats.cadence);
                let _ = events.send(BikeEvent::Sample(BikeSample::new(power, cadence))).await;
            }
            _ = sleep_until(stats_deadline), if locked.is_some() => {
                // Stale stats read as a stopped rider, not a lost bike.
                if state == ConnectionState::Connected {
                    state.advance(ConnectionState::Reconnecting);
                }
                stats_deadline = Instant::now() + stats_timeout;
                let _ = events.send(BikeEvent::Sample(BikeSample::new(0, 0))).await;
            }
            _ = sleep_until(bike_deadline) => {
                tracing::warn!("no keiser beacon for {:?}", KEISER_BIKE_TIMEOUT);
                break;
            }
        }
    }
    state.advance(ConnectionState::Disconnected);
    DisconnectOnce::new(address).send(&events).await;
}
