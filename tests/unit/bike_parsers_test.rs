//! Unit tests for ingress frame parsing.

use gymnasticon::bike::flywheel;
use gymnasticon::bike::ftms::parse_indoor_bike_data;
use gymnasticon::bike::keiser::{bike_version, parse_beacon};
use gymnasticon::bike::peloton::{Command, ReplyParser};

/// Build an Indoor Bike Data frame at the console's fixed offsets.
fn ic4_frame(speed_raw: u16, cadence_raw: u16, power: i16) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[0] = 0x44;
    data[1] = 0x02;
    data[2..4].copy_from_slice(&speed_raw.to_le_bytes());
    data[4..6].copy_from_slice(&cadence_raw.to_le_bytes());
    data[6..8].copy_from_slice(&power.to_le_bytes());
    data
}

#[test]
fn test_ic4_fields_match_raw_offsets() {
    for (speed, cadence, power) in [
        (0u16, 0u16, 0i16),
        (730, 258, 290),
        (2500, 181, -15),
        (65535, 65535, i16::MAX),
    ] {
        let frame = ic4_frame(speed, cadence, power);
        let parsed = parse_indoor_bike_data(&frame).unwrap();
        assert_eq!(parsed.power, power);
        assert_eq!(parsed.cadence, (cadence + 1) / 2);
    }
}

#[test]
fn test_ic4_literal_frame() {
    let data = [0x44, 0x02, 0xDA, 0x02, 0x02, 0x01, 0x22, 0x01, 0x00];
    let parsed = parse_indoor_bike_data(&data).unwrap();
    assert_eq!(parsed.power, 290);
    assert_eq!(parsed.cadence, 129);
}

#[test]
fn test_keiser_literal_beacon() {
    let data = [
        0x02, 0x01, 0x06, 0x30, 0x00, 0x38, 0x38, 0x03, 0x46, 0x05, 0x73, 0x00, 0x0D, 0x00,
        0x04, 0x27, 0x01, 0x00, 0x0A,
    ];
    let stats = parse_beacon(&data).unwrap();
    assert_eq!(stats.power, 115);
    assert_eq!(stats.cadence, 82);

    let version = bike_version(&data).unwrap();
    assert_eq!(version.version, "6.30");
    assert_eq!(version.stats_timeout.as_secs(), 20);
}

#[test]
fn test_keiser_cadence_rounds_tenths() {
    let mut data = [0u8; 12];
    data[0] = 0x02;
    data[1] = 0x01;
    // 82.9 rpm rounds to 83, 82.4 rounds to 82.
    data[6..8].copy_from_slice(&829u16.to_le_bytes());
    assert_eq!(parse_beacon(&data).unwrap().cadence, 83);
    data[6..8].copy_from_slice(&824u16.to_le_bytes());
    assert_eq!(parse_beacon(&data).unwrap().cadence, 82);
}

#[test]
fn test_peloton_power_decimal_digit() {
    let digits = b"01234";
    let mut frame = vec![0xF6, 0xF5, Command::Power as u8, digits.len() as u8];
    frame.extend_from_slice(digits);
    let sum: u16 = frame[1..].iter().map(|&b| b as u16).sum();
    frame.push((sum & 0xff) as u8);

    let mut parser = ReplyParser::new();
    let replies = parser.push(&frame);
    assert_eq!(replies.len(), 1);
    assert!((replies[0].value - 123.4).abs() < 1e-9);
}

#[test]
fn test_flywheel_tenths_rounding() {
    let mut data = [0u8; 14];
    data[0] = 0xff;
    data[1] = 0x1f;
    data[3..5].copy_from_slice(&997u16.to_be_bytes());
    data[12..14].copy_from_slice(&601u16.to_be_bytes());
    let parsed = flywheel::parse_frame(&data).unwrap();
    assert_eq!(parsed.power, 100);
    assert_eq!(parsed.cadence, 60);
}
