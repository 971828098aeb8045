//! Heart-rate monitor relay (ingress side).
//!
//! Connects to any peripheral advertising the Heart Rate service and
//! forwards its measurements. The ingress parser always reads the 8-bit
//! value form; strap-side 16-bit encodings are not seen in practice and the
//! outbound characteristic re-encodes as 8-bit regardless.

use std::time::Duration;

use btleplug::api::{Central, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ble::connect::{connect_peripheral, ConnectOptions};
use crate::ble::BleError;
use crate::bike::{find_characteristic, peripheral_address, scan_for};

/// Heart Rate Service UUID (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement Characteristic UUID (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

const SCAN_TIMEOUT: Duration = Duration::from_secs(30);

/// One relayed heart-rate reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HrSample {
    pub bpm: u8,
}

/// Events pushed from the HR client to the supervisor.
#[derive(Debug, Clone)]
pub enum HrEvent {
    Sample(HrSample),
    /// The monitor went away. The relay is best-effort; this is not fatal.
    Disconnect { address: String },
}

/// Read the bpm byte of a Heart Rate Measurement notification.
pub fn parse_measurement(data: &[u8]) -> Option<HrSample> {
    if data.len() < 2 {
        return None;
    }
    Some(HrSample { bpm: data[1] })
}

/// Connected heart-rate monitor.
#[derive(Debug)]
pub struct HeartRateClient {
    peripheral: Peripheral,
    task: JoinHandle<()>,
}

impl HeartRateClient {
    /// Scan for, connect to and subscribe to a monitor.
    ///
    /// `name_filter` is an optional case-insensitive substring of the
    /// advertised local name.
    pub async fn connect(
        adapter: &Adapter,
        name_filter: Option<&str>,
        opts: &ConnectOptions,
        events: mpsc::Sender<HrEvent>,
    ) -> Result<Self, crate::bike::BikeError> {
        let wanted = name_filter.map(str::to_ascii_lowercase);
        let peripheral = scan_for(
            adapter,
            ScanFilter {
                services: vec![HEART_RATE_SERVICE_UUID],
            },
            SCAN_TIMEOUT,
            |adv, _| match (&wanted, adv.local_name) {
                (None, _) => true,
                (Some(want), Some(name)) => name.to_ascii_lowercase().contains(want),
                (Some(_), None) => false,
            },
        )
        .await?;
        let address = peripheral_address(&peripheral);
        tracing::info!("connecting to heart-rate monitor {}", address);

        connect_peripheral(adapter, &peripheral, opts).await?;
        peripheral.discover_services().await.map_err(BleError::from)?;

        let measurement = find_characteristic(&peripheral, HEART_RATE_MEASUREMENT_UUID)?;
        peripheral
            .subscribe(&measurement)
            .await
            .map_err(BleError::from)?;

        let notifications = peripheral.notifications().await.map_err(BleError::from)?;
        let central_events = adapter.events().await.map_err(BleError::from)?;

        let id = peripheral.id();
        let task = tokio::spawn(async move {
            let mut notifications = notifications;
            let mut central_events = central_events;
            loop {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(data) = notification else { break };
                        if data.uuid != HEART_RATE_MEASUREMENT_UUID {
                            continue;
                        }
                        let Some(sample) = parse_measurement(&data.value) else {
                            tracing::debug!("short heart-rate frame");
                            continue;
                        };
                        let _ = events.send(HrEvent::Sample(sample)).await;
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
            let _ = events.send(HrEvent::Disconnect { address }).await;
        });

        Ok(Self { peripheral, task })
    }

    /// Tear down the link. Safe to call when the monitor is already gone.
    pub async fn disconnect(&self) {
        self.task.abort();
        if let Err(err) = self.peripheral.disconnect().await {
            tracing::debug!("disconnect: {}", err);
        }
    }
}
