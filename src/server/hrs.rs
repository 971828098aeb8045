//! Heart Rate Service (0x180D) payload and GATT tree (egress side).

use bluer::gatt::local::{Characteristic, CharacteristicNotify, CharacteristicNotifyMethod, Service};
use uuid::Uuid;

use super::NotifySlot;

/// Heart Rate Service UUID (0x180D)
pub const HEART_RATE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_180d_0000_1000_8000_0080_5f9b_34fb);

/// Heart Rate Measurement Characteristic UUID (0x2A37)
pub const HEART_RATE_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a37_0000_1000_8000_0080_5f9b_34fb);

/// Encode a Heart Rate Measurement: flags byte fixed at 0 (8-bit value).
pub fn encode_measurement(bpm: u8) -> [u8; 2] {
    [0x00, bpm]
}

/// Build the GATT service.
pub fn build_service(measurement: NotifySlot) -> Service {
    Service {
        uuid: HEART_RATE_SERVICE_UUID,
        primary: true,
        characteristics: vec![Characteristic {
            uuid: HEART_RATE_MEASUREMENT_UUID,
            notify: Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(measurement.install()),
                ..Default::default()
            }),
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_layout() {
        assert_eq!(encode_measurement(145), [0x00, 0x91]);
        assert_eq!(encode_measurement(0), [0x00, 0x00]);
    }
}
