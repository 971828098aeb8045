//! Unit tests for the outbound GATT payload encoders.

use gymnasticon::pipeline::{CrankEvent, WheelEvent};
use gymnasticon::server::advertising::{AdvertisingData, MAX_ADVERTISEMENT_LEN};
use gymnasticon::server::{cps, csc, hrs};

#[test]
fn test_cps_measurement_is_eight_bytes() {
    let crank = CrankEvent {
        revolutions: 3,
        last_event_time: 3072,
    };
    let buf = cps::encode_measurement(180, &crank);
    assert_eq!(buf.len(), 8);
    // Crank-data flag (bit 5) and nothing else.
    assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 0x0020);
    assert_eq!(i16::from_le_bytes([buf[2], buf[3]]), 180);
    assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 3);
    assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 3072);
}

#[test]
fn test_cps_negative_power_sign_extended() {
    let buf = cps::encode_measurement(-1, &CrankEvent::default());
    assert_eq!(buf[2..4], [0xFF, 0xFF]);
}

#[test]
fn test_csc_crank_only_round_trip() {
    let measurement = csc::CscMeasurement {
        wheel: None,
        crank: Some(CrankEvent {
            revolutions: 4242,
            last_event_time: 62000,
        }),
    };
    let buf = csc::encode_measurement(&measurement);
    assert_eq!(buf.len(), 5);
    assert_eq!(csc::decode_measurement(&buf), Some(measurement));
}

#[test]
fn test_csc_full_round_trip() {
    let measurement = csc::CscMeasurement {
        wheel: Some(WheelEvent {
            revolutions: 123_456,
            last_event_time: 100,
        }),
        crank: Some(CrankEvent {
            revolutions: 321,
            last_event_time: 200,
        }),
    };
    let buf = csc::encode_measurement(&measurement);
    assert_eq!(buf.len(), 11);
    assert_eq!(buf[0], 0x03);
    assert_eq!(csc::decode_measurement(&buf), Some(measurement));
}

#[test]
fn test_csc_feature_values() {
    assert_eq!(csc::FEATURE_CRANK_ONLY, [0x02, 0x00]);
    assert_eq!(csc::FEATURE_WHEEL_AND_CRANK, [0x03, 0x00]);
}

#[test]
fn test_hrs_measurement_layout() {
    assert_eq!(hrs::encode_measurement(160), [0x00, 0xA0]);
}

#[test]
fn test_advertisement_fits_31_bytes_with_all_services() {
    let adv = AdvertisingData::new("Gymnasticon 123456")
        .with_uuids16(&[0x1818, 0x1816, 0x180d])
        .encode_advertisement();
    assert!(adv.len() <= MAX_ADVERTISEMENT_LEN);
    // Flags first, then the complete 16-bit UUID list.
    assert_eq!(adv[..3], [0x02, 0x01, 0x06]);
    assert_eq!(adv[3..5], [0x07, 0x03]);
}

#[test]
fn test_scan_response_complete_name() {
    let data = AdvertisingData::new("Gymnasticon");
    let rsp = data.encode_scan_response();
    assert_eq!(rsp[1], 0x09);
    assert_eq!(&rsp[2..], b"Gymnasticon");
}
