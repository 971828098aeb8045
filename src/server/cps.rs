//! Cycling Power Service (0x1818) payloads and GATT tree.

use bluer::gatt::local::{Characteristic, CharacteristicNotify, CharacteristicNotifyMethod, Service};
use uuid::Uuid;

use super::{read_value, NotifySlot};
use crate::pipeline::CrankEvent;

/// Cycling Power Service UUID (0x1818)
pub const CYCLING_POWER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1818_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Measurement Characteristic UUID (0x2A63)
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a63_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Feature Characteristic UUID (0x2A65)
pub const CYCLING_POWER_FEATURE_UUID: Uuid =
    Uuid::from_u128(0x0000_2a65_0000_1000_8000_0080_5f9b_34fb);

/// Sensor Location Characteristic UUID (0x2A5D)
pub const SENSOR_LOCATION_UUID: Uuid =
    Uuid::from_u128(0x0000_2a5d_0000_1000_8000_0080_5f9b_34fb);

/// Feature bits: crank revolution data supported (bit 3).
pub const FEATURE_VALUE: [u8; 4] = [0x08, 0x00, 0x00, 0x00];

/// Sensor location: rear hub.
pub const SENSOR_LOCATION_VALUE: [u8; 1] = [0x0d];

/// Measurement flags: crank revolution data present (bit 5).
const FLAG_CRANK_REVOLUTION_DATA: u16 = 1 << 5;

/// Encode a Cycling Power Measurement notification.
///
/// Layout: flags u16 LE, instantaneous power i16 LE, cumulative crank
/// revolutions u16 LE, last crank event time u16 LE (1/1024 s). Always
/// exactly 8 bytes since the crank data flag is always set.
pub fn encode_measurement(power: i16, crank: &CrankEvent) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[0..2].copy_from_slice(&FLAG_CRANK_REVOLUTION_DATA.to_le_bytes());
    buf[2..4].copy_from_slice(&power.to_le_bytes());
    buf[4..6].copy_from_slice(&crank.revolutions.to_le_bytes());
    buf[6..8].copy_from_slice(&crank.last_event_time.to_le_bytes());
    buf
}

/// Build the GATT service; notifications flow through `measurement`.
pub fn build_service(measurement: NotifySlot) -> Service {
    Service {
        uuid: CYCLING_POWER_SERVICE_UUID,
        primary: true,
        characteristics: vec![
            Characteristic {
                uuid: CYCLING_POWER_MEASUREMENT_UUID,
                notify: Some(CharacteristicNotify {
                    notify: true,
                    method: CharacteristicNotifyMethod::Fun(measurement.install()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Characteristic {
                uuid: CYCLING_POWER_FEATURE_UUID,
                read: Some(read_value(FEATURE_VALUE.to_vec())),
                ..Default::default()
            },
            Characteristic {
                uuid: SENSOR_LOCATION_UUID,
                read: Some(read_value(SENSOR_LOCATION_VALUE.to_vec())),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}
