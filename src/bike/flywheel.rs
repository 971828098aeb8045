//! Flywheel Home Bike driver (vendor protocol over Nordic UART).

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
use crate::pipeline::DropoutFilter;

/// Nordic UART Service UUID
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Nordic UART RX Characteristic UUID (bike-to-host notifications)
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

/// Leading bytes of a telemetry frame.
const FRAME_MAGIC: [u8; 2] = [0xff, 0x1f];

const SCAN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Decoded Flywheel telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlywheelData {
    /// Power in watts, rounded from the 0.1 W wire unit.
    pub power: u16,
    /// Cadence in RPM, rounded from the 0.1 RPM wire unit.
    pub cadence: u16,
}

/// Parse one vendor frame: power u16 BE at 3, cadence u16 BE at 12, both in
/// tenths.
pub fn parse_frame(data: &[u8]) -> Option<FlywheelData> {
    if data.len() < 14 || data[..2] != FRAME_MAGIC {
        return None;
    }
    let power_raw = u16::from_be_bytes([data[3], data[4]]);
    let cadence_raw = u16::from_be_bytes([data[12], data[13]]);
    Some(FlywheelData {
        power: ((power_raw as u32 + 5) / 10) as u16,
        cadence: ((cadence_raw as u32 + 5) / 10) as u16,
    })
}

pub fn matches(adv: &Advertised) -> bool {
    adv.local_name
        .map(|name| name_has_prefix(name, "Flywheel"))
        .unwrap_or(false)
}

/// Connected Flywheel bike.
#[derive(Debug)]
pub struct FlywheelBike {
    peripheral: Peripheral,
    task: JoinHandle<()>,
}

impl FlywheelBike {
    /// Scan for, connect to and subscribe to the bike.
    pub async fn connect(
        adapter: &Adapter,
        filter: DeviceFilter,
        opts: &ConnectOptions,
        events: mpsc::Sender<BikeEvent>,
    ) -> Result<Self, BikeError> {
        let peripheral = scan_for(
            adapter,
            ScanFilter::default(),
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

        let rx = find_characteristic(&peripheral, UART_RX_UUID)?;
        peripheral
            .subscribe(&rx)
            .await
            .map_err(crate::ble::BleError::from)?;

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
            let mut disconnect = DisconnectOnce::new(address);
            loop {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(data) = notification else { break };
                        if data.uuid != UART_RX_UUID {
                            continue;
                        }
                        let Some(frame) = parse_frame(&data.value) else {
                            tracing::debug!("unparseable flywheel frame: {:02x?}", data.value);
                            continue;
                        };
                        let (power, cadence) = dropout.apply(frame.power, frame.cadence);
                        let _ = events.send(BikeEvent::Sample(BikeSample::new(power, cadence))).await;
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

    /// Tear down the link. Safe to call when the bike is already gone.
    pub async fn disconnect(&self) {
        self.task.abort();
        if let Err(err) = self.peripheral.disconnect().await {
            tracing::debug!("disconnect: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(power_tenths: u16, cadence_tenths: u16) -> [u8; 14] {
        let mut data = [0u8; 14];
        data[0] = 0xff;
        data[1] = 0x1f;
        data[3..5].copy_from_slice(&power_tenths.to_be_bytes());
        data[12..14].copy_from_slice(&cadence_tenths.to_be_bytes());
        data
    }

    #[test]
    fn test_parse_frame() {
        let data = frame(2155, 843);
        let parsed = parse_frame(&data).unwrap();
        assert_eq!(parsed.power, 216);
        assert_eq!(parsed.cadence, 84);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut data = frame(100, 100);
        data[1] = 0x20;
        assert!(parse_frame(&data).is_none());
    }

    #[test]
    fn test_parse_rejects_short_frame() {
        assert!(parse_frame(&[0xff, 0x1f, 0x00]).is_none());
    }

    #[test]
    fn test_matcher() {
        let adv = Advertised {
            local_name: Some("Flywheel 1"),
            ..Default::default()
        };
        assert!(matches(&adv));
        let adv = Advertised {
            local_name: Some("Peloton"),
            ..Default::default()
        };
        assert!(!matches(&adv));
    }
}
