//! Schwinn IC4/IC5 driver (Bluetooth Fitness Machine Service).
//!
//! These consoles expose the standard FTMS Indoor Bike Data characteristic
//! but ship a quirky subscription handshake: the standard subscribe is
//! sometimes ignored, so after connecting the driver writes the Client
//! Characteristic Configuration descriptor by hand.

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

/// Fitness Machine Service UUID (0x1826)
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Indoor Bike Data Characteristic UUID (0x2AD2)
pub const INDOOR_BIKE_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2ad2_0000_1000_8000_0080_5f9b_34fb);

/// Client Characteristic Configuration descriptor UUID (0x2902)
pub const CCC_DESCRIPTOR_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// Leading bytes of every Indoor Bike Data frame these consoles emit.
const FRAME_MAGIC: [u8; 2] = [0x44, 0x02];

/// Scan window for locating the console.
const SCAN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Decoded Indoor Bike Data frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndoorBikeData {
    /// Instantaneous power in watts; may be negative during calibration.
    pub power: i16,
    /// Cadence in RPM, rounded from the half-RPM wire unit.
    pub cadence: u16,
    /// Speed in km/h.
    pub speed_kmh: f32,
}

/// Parse an Indoor Bike Data frame.
///
/// Fixed offsets: speed u16 LE at 2 (0.01 km/h), cadence u16 LE at 4
/// (half-RPM), power i16 LE at 6.
pub fn parse_indoor_bike_data(data: &[u8]) -> Option<IndoorBikeData> {
    if data.len() < 8 || data[..2] != FRAME_MAGIC {
        return None;
    }
    let speed_raw = u16::from_le_bytes([data[2], data[3]]);
    let cadence_raw = u16::from_le_bytes([data[4], data[5]]);
    let power = i16::from_le_bytes([data[6], data[7]]);
    Some(IndoorBikeData {
        power,
        cadence: ((cadence_raw as u32 + 1) / 2) as u16,
        speed_kmh: speed_raw as f32 / 100.0,
    })
}

pub fn matches_ic4(adv: &Advertised) -> bool {
    adv.local_name
        .map(|name| name_has_prefix(name, "IC Bike"))
        .unwrap_or(false)
        || adv.services.contains(&FTMS_SERVICE_UUID)
}

pub fn matches_ic5(adv: &Advertised) -> bool {
    adv.local_name
        .map(|name| name_has_prefix(name, "C5"))
        .unwrap_or(false)
}

/// Connected IC4/IC5 console.
#[derive(Debug)]
pub struct FtmsBike {
    peripheral: Peripheral,
    task: JoinHandle<()>,
}

impl FtmsBike {
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
                services: vec![FTMS_SERVICE_UUID],
            },
            SCAN_TIMEOUT,
            |adv, address| {
                filter.matches(adv.local_name, address)
                    && (matches_ic4(adv) || matches_ic5(adv))
            },
        )
        .await?;
        let address = peripheral_address(&peripheral);
        tracing::info!("connecting to {}", address);

        connect_peripheral(adapter, &peripheral, opts).await?;
        peripheral.discover_services().await.map_err(crate::ble::BleError::from)?;

        let bike_data = find_characteristic(&peripheral, INDOOR_BIKE_DATA_UUID)?;
        peripheral
            .subscribe(&bike_data)
            .await
            .map_err(crate::ble::BleError::from)?;

        // Handshake workaround: write the CCC descriptor explicitly for
        // consoles that ignore the subscribe request.
        if let Some(ccc) = bike_data
            .descriptors
            .iter()
            .find(|d| d.uuid == CCC_DESCRIPTOR_UUID)
        {
            if let Err(err) = peripheral.write_descriptor(ccc, &[0x01, 0x00]).await {
                tracing::warn!("CCC descriptor write failed: {}", err);
            }
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
            let mut disconnect = DisconnectOnce::new(address);
            loop {
                tokio::select! {
                    notification = notifications.next() => {
                        let Some(data) = notification else { break };
                        if data.uuid != INDOOR_BIKE_DATA_UUID {
                            continue;
                        }
                        let Some(frame) = parse_indoor_bike_data(&data.value) else {
                            tracing::debug!("unparseable bike data frame: {:02x?}", data.value);
                            continue;
                        };
                        let (power, cadence) =
                            dropout.apply(frame.power.max(0) as u16, frame.cadence);
                        let mut sample = BikeSample::new(power, cadence);
                        if frame.speed_kmh > 0.0 {
                            sample.speed_mps = Some(frame.speed_kmh / 3.6);
                        }
                        let _ = events.send(BikeEvent::Sample(sample)).await;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_frame() {
        // speed 7.30 km/h, cadence 129 rpm, power 290 W
        let data = [0x44, 0x02, 0xDA, 0x02, 0x02, 0x01, 0x22, 0x01, 0x00];
        let frame = parse_indoor_bike_data(&data).unwrap();
        assert_eq!(frame.power, 290);
        assert_eq!(frame.cadence, 129);
        assert!((frame.speed_kmh - 7.30).abs() < 0.001);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let data = [0x43, 0x02, 0xDA, 0x02, 0x02, 0x01, 0x22, 0x01];
        assert!(parse_indoor_bike_data(&data).is_none());
    }

    #[test]
    fn test_parse_rejects_short_frame() {
        assert!(parse_indoor_bike_data(&[0x44, 0x02, 0x00]).is_none());
    }

    #[test]
    fn test_parse_negative_power() {
        let data = [0x44, 0x02, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF];
        assert_eq!(parse_indoor_bike_data(&data).unwrap().power, -1);
    }

    #[test]
    fn test_cadence_rounds_half_rpm() {
        // 259 half-revolutions rounds up to 130 rpm.
        let data = [0x44, 0x02, 0x00, 0x00, 0x03, 0x01, 0x00, 0x00];
        assert_eq!(parse_indoor_bike_data(&data).unwrap().cadence, 130);
    }

    #[test]
    fn test_ic4_matcher() {
        let adv = Advertised {
            local_name: Some("IC Bike 0042"),
            ..Default::default()
        };
        assert!(matches_ic4(&adv));
        let services = [FTMS_SERVICE_UUID];
        let adv = Advertised {
            services: &services,
            ..Default::default()
        };
        assert!(matches_ic4(&adv));
        assert!(!matches_ic5(&adv));
    }
}
