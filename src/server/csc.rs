//! Cycling Speed and Cadence Service (0x1816) payloads and GATT tree.

use bluer::gatt::local::{Characteristic, CharacteristicNotify, CharacteristicNotifyMethod, Service};
use uuid::Uuid;

use super::{read_slot, NotifySlot, ValueSlot};
use crate::pipeline::{CrankEvent, WheelEvent};

/// Cycling Speed and Cadence Service UUID (0x1816)
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

/// CSC Measurement Characteristic UUID (0x2A5B)
pub const CSC_MEASUREMENT_UUID: Uuid = Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

/// CSC Feature Characteristic UUID (0x2A5C)
pub const CSC_FEATURE_UUID: Uuid = Uuid::from_u128(0x0000_2a5c_0000_1000_8000_0080_5f9b_34fb);

/// Feature value while only crank data flows.
pub const FEATURE_CRANK_ONLY: [u8; 2] = [0x02, 0x00];

/// Feature value once wheel data is available too.
pub const FEATURE_WHEEL_AND_CRANK: [u8; 2] = [0x03, 0x00];

const FLAG_WHEEL_DATA: u8 = 1 << 0;
const FLAG_CRANK_DATA: u8 = 1 << 1;

/// One CSC Measurement: either block may be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CscMeasurement {
    pub wheel: Option<WheelEvent>,
    pub crank: Option<CrankEvent>,
}

/// Encode a CSC Measurement notification, trimmed to the populated blocks.
///
/// Wheel block: cumulative revolutions u32 LE, event time u16 LE. Crank
/// block: cumulative revolutions u16 LE, event time u16 LE. A crank-only
/// measurement is exactly 5 bytes.
pub fn encode_measurement(measurement: &CscMeasurement) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11);
    let mut flags = 0u8;
    buf.push(0);
    if let Some(wheel) = &measurement.wheel {
        flags |= FLAG_WHEEL_DATA;
        buf.extend_from_slice(&wheel.revolutions.to_le_bytes());
        buf.extend_from_slice(&wheel.last_event_time.to_le_bytes());
    }
    if let Some(crank) = &measurement.crank {
        flags |= FLAG_CRANK_DATA;
        buf.extend_from_slice(&crank.revolutions.to_le_bytes());
        buf.extend_from_slice(&crank.last_event_time.to_le_bytes());
    }
    buf[0] = flags;
    buf
}

/// Decode a CSC Measurement notification.
pub fn decode_measurement(data: &[u8]) -> Option<CscMeasurement> {
    let flags = *data.first()?;
    let mut offset = 1;
    let mut measurement = CscMeasurement::default();
    if flags & FLAG_WHEEL_DATA != 0 {
        if data.len() < offset + 6 {
            return None;
        }
        measurement.wheel = Some(WheelEvent {
            revolutions: u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]),
            last_event_time: u16::from_le_bytes([data[offset + 4], data[offset + 5]]),
        });
        offset += 6;
    }
    if flags & FLAG_CRANK_DATA != 0 {
        if data.len() < offset + 4 {
            return None;
        }
        measurement.crank = Some(CrankEvent {
            revolutions: u16::from_le_bytes([data[offset], data[offset + 1]]),
            last_event_time: u16::from_le_bytes([data[offset + 2], data[offset + 3]]),
        });
    }
    Some(measurement)
}

/// Build the GATT service.
///
/// `feature` starts as crank-only and is upgraded in place when wheel data
/// appears; reads always see the current value.
pub fn build_service(measurement: NotifySlot, feature: ValueSlot) -> Service {
    Service {
        uuid: CSC_SERVICE_UUID,
        primary: true,
        characteristics: vec![
            Characteristic {
                uuid: CSC_MEASUREMENT_UUID,
                notify: Some(CharacteristicNotify {
                    notify: true,
                    method: CharacteristicNotifyMethod::Fun(measurement.install()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Characteristic {
                uuid: CSC_FEATURE_UUID,
                read: Some(read_slot(feature)),
                ..Default::default()
            },
        ],
        ..Default::default()
    }
}
