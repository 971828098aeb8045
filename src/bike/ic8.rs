//! Schwinn IC8 / Bowflex C6 driver.
//!
//! These consoles expose the standard Cycling Speed and Cadence service plus
//! a vendor resistance characteristic, but no power. Power is estimated from
//! cadence and the resistance setting, then smoothed inside the driver
//! before the global pipeline sees it.

use btleplug::api::{Central, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{
    find_characteristic, peripheral_address, scan_for, Advertised, BikeError, BikeEvent,
    BikeSample, DisconnectOnce,
};
use crate::ble::connect::{connect_peripheral, ConnectOptions};
use crate::ble::filter::name_has_prefix;
use crate::ble::DeviceFilter;
use crate::pipeline::crank::{cadence_between, CrankEvent};
use crate::pipeline::{DropoutFilter, PowerSmoother};

/// Cycling Speed and Cadence Service UUID (0x1816)
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

/// CSC Measurement Characteristic UUID (0x2A5B)
pub const CSC_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

/// Vendor resistance characteristic (0xFFF2)
pub const RESISTANCE_UUID: Uuid = Uuid::from_u128(0x0000_fff2_0000_1000_8000_0080_5f9b_34fb);

/// Smoothing factor for the in-driver power estimate.
const ESTIMATE_ALPHA: f64 = 0.25;

const SCAN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Crank block of a CSC Measurement frame.
pub fn parse_crank(data: &[u8]) -> Option<CrankEvent> {
    let flags = *data.first()?;
    if flags & 0x02 == 0 {
        return None;
    }
    // Skip the wheel block (u32 revolutions + u16 event time) when present.
    let offset = if flags & 0x01 != 0 { 7 } else { 1 };
    if data.len() < offset + 4 {
        return None;
    }
    Some(CrankEvent {
        revolutions: u16::from_le_bytes([data[offset], data[offset + 1]]),
        last_event_time: u16::from_le_bytes([data[offset + 2], data[offset + 3]]),
    })
}

/// Resistance as a 0..1 fraction from the vendor characteristic.
pub fn parse_resistance(data: &[u8]) -> Option<f64> {
    let level = *data.first()?;
    Some(level.min(100) as f64 / 100.0)
}

/// Power estimate from cadence and resistance fraction.
pub fn estimate_power(rpm: f64, resistance: f64) -> f64 {
    0.35 * rpm.powf(1.75) * (0.4 + 0.6 * resistance)
}

pub fn matches(adv: &Advertised) -> bool {
    adv.local_name
        .map(|name| name_has_prefix(name, "IC8") || name_has_prefix(name, "C6"))
        .unwrap_or(false)
}

/// Connected IC8/C6 console.
#[derive(Debug)]
pub struct Ic8Bike {
    peripheral: Peripheral,
    task: JoinHandle<()>,
}

impl Ic8Bike {
    /// Scan for, connect to and subscribe to the console.
    pub async fn connect(
        adapter: &Adapter,
        filter: DeviceFilter,
        opts: &ConnectOptions,
        events: mpsc::Sender<BikeEvent>,
    ) -> Result<Self, BikeError> {
        let peripheral = scan_for(
            adapter,
            ScanFilter {
                services: vec![CSC_SERVICE_UUID],
            },
            SCAN_TIMEOUT,
            |adv, address| filter.matches(adv.local_name, address) && matches(adv),
        )
        .await?;
        let address = peripheral_address(&peripheral);
        tracing::info!("connecting to {}", address);

        connect_peripheral(adapter, &peripheral, opts).await?;
        peripheral
            .discover_services()
            .await
            .map_err(crate::ble::BleError::from)?;

        let csc = find_characteristic(&peripheral, CSC_MEASUREMENT_UUID)?;
        peripheral
            .subscribe(&csc)
            .await
            .map_err(crate::ble::BleError::from)?;

        // Resistance is optional; older consoles omit it.
        match find_characteristic(&peripheral, RESISTANCE_UUID) {
            Ok(resistance) => {
                if let Err(err) = peripheral.subscribe(&resistance).await {
                    tracing::warn!("resistance subscribe failed: {}", err);
                }
            }
            Err(_) => tracing::info!("console has no resistance characteristic"),
        }

        let notifications = peripheral
            .notifications()
            .await
            .map_err(crate::ble::BleError::from)?;
        let central_events = adapter.events().await.map_err(crate::ble::BleError::from)?;

        let id = peripheral.id();
        let task = tokio::spawn(async move {
            let mut notifications = notifications;
            let mut central_events = central_events;
            let mut dropout = DropoutFilter::new();
            let mut smoother = PowerSmoother::new(ESTIMATE_ALPHA);
            let mut disconnect = DisconnectOnce::new(address);
            let mut last_crank: Option<CrankEvent> = None;
            let mut resistance: f64 = 0.0;
            loop {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(data) = notification else { break };
                        match data.uuid {
                            RESISTANCE_UUID => {
                                if let Some(level) = parse_resistance(&data.value) {
                                    resistance = level;
                                }
                            }
                            CSC_MEASUREMENT_UUID => {
                                let Some(crank) = parse_crank(&data.value) else {
                                    tracing::debug!("csc frame without crank data");
                                    continue;
                                };
                                let cadence = last_crank
                                    .replace(crank)
                                    .and_then(|prev| cadence_between(&prev, &crank))
                                    .unwrap_or(0);
                                let estimate = estimate_power(cadence as f64, resistance);
                                let power = smoother.add(estimate.round() as u16);
                                let (power, cadence) = dropout.apply(power, cadence);
                                let _ = events
                                    .send(BikeEvent::Sample(BikeSample::new(power, cadence)))
                                    .await;
                            }
                            _ => {}
                        }
                    }
                    event = central_events.next() => {
                        match event {
                            Some(btleplug::api::CentralEvent::DeviceDisconnected(gone))
                                if gone == id => break,
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
            disconnect.send(&events).await;
        });

        Ok(Self { peripheral, task })
    }

    /// Tear down the link. Safe to call when the console is already gone.
    pub async fn disconnect(&self) {
        self.task.abort();
        if let Err(err) = self.peripheral.disconnect().await {
            tracing::debug!("disconnect: {}", err);
        }
    }
}
