//! Advertising payload construction.
//!
//! BlueZ assembles advertisements from structured properties, but the exact
//! EIR byte layout still matters: the advertisement must stay within 31
//! bytes, and some fitness apps only recognize the session when the service
//! list and name land in the expected structures. The encoders here build
//! the raw payloads; [`build_advertisement`] maps the same data onto the
//! BlueZ advertisement properties.

use std::collections::BTreeSet;

use bluer::adv::{Advertisement, Type};
use uuid::Uuid;

/// Advertising channel PDU payload limit.
pub const MAX_ADVERTISEMENT_LEN: usize = 31;

// EIR structure types.
const EIR_FLAGS: u8 = 0x01;
const EIR_COMPLETE_UUIDS_16: u8 = 0x03;
const EIR_COMPLETE_UUIDS_32: u8 = 0x05;
const EIR_COMPLETE_UUIDS_128: u8 = 0x07;
const EIR_SHORTENED_LOCAL_NAME: u8 = 0x08;
const EIR_COMPLETE_LOCAL_NAME: u8 = 0x09;
const EIR_MANUFACTURER_DATA: u8 = 0xff;

/// LE General Discoverable Mode, BR/EDR not supported.
const FLAGS_VALUE: u8 = 0x06;

/// Everything the outbound advertisement can carry.
#[derive(Debug, Clone, Default)]
pub struct AdvertisingData {
    pub name: String,
    pub uuids16: Vec<u16>,
    pub uuids32: Vec<u32>,
    pub uuids128: Vec<Uuid>,
    pub manufacturer_data: Option<(u16, Vec<u8>)>,
}

impl AdvertisingData {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn with_uuids16(mut self, uuids: &[u16]) -> Self {
        self.uuids16 = uuids.to_vec();
        self
    }

    /// Encode the advertisement payload.
    ///
    /// Structure order: flags, one complete-UUID list per width,
    /// manufacturer data, then as much of the name as still fits (shortened
    /// form). Never exceeds 31 bytes.
    pub fn encode_advertisement(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_ADVERTISEMENT_LEN);
        push_structure(&mut buf, EIR_FLAGS, &[FLAGS_VALUE]);

        if !self.uuids16.is_empty() {
            let bytes: Vec<u8> = self
                .uuids16
                .iter()
                .flat_map(|u| u.to_le_bytes())
                .collect();
            push_structure(&mut buf, EIR_COMPLETE_UUIDS_16, &bytes);
        }
        if !self.uuids32.is_empty() {
            let bytes: Vec<u8> = self
                .uuids32
                .iter()
                .flat_map(|u| u.to_le_bytes())
                .collect();
            push_structure(&mut buf, EIR_COMPLETE_UUIDS_32, &bytes);
        }
        if !self.uuids128.is_empty() {
            let bytes: Vec<u8> = self
                .uuids128
                .iter()
                .flat_map(|u| u.as_u128().to_le_bytes())
                .collect();
            push_structure(&mut buf, EIR_COMPLETE_UUIDS_128, &bytes);
        }
        if let Some((company, data)) = &self.manufacturer_data {
            let mut bytes = company.to_le_bytes().to_vec();
            bytes.extend_from_slice(data);
            push_structure(&mut buf, EIR_MANUFACTURER_DATA, &bytes);
        }

        let room = MAX_ADVERTISEMENT_LEN.saturating_sub(buf.len() + 2);
        if room > 0 && !self.name.is_empty() {
            let take = self.name.len().min(room);
            push_structure(&mut buf, EIR_SHORTENED_LOCAL_NAME, &self.name.as_bytes()[..take]);
        }
        buf
    }

    /// Encode the scan response: the complete name, when it fits.
    pub fn encode_scan_response(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_ADVERTISEMENT_LEN);
        if !self.name.is_empty() && self.name.len() + 2 <= MAX_ADVERTISEMENT_LEN {
            push_structure(&mut buf, EIR_COMPLETE_LOCAL_NAME, self.name.as_bytes());
        }
        buf
    }
}

fn push_structure(buf: &mut Vec<u8>, kind: u8, value: &[u8]) {
    debug_assert!(buf.len() + 2 + value.len() <= MAX_ADVERTISEMENT_LEN);
    buf.push((value.len() + 1) as u8);
    buf.push(kind);
    buf.extend_from_slice(value);
}

/// Expand a 16-bit SIG UUID onto the Bluetooth base UUID.
fn uuid_from_short(short: u16) -> Uuid {
    Uuid::from_u128(0x0000_0000_0000_1000_8000_00805f9b34fb | ((short as u128) << 96))
}

/// Map the advertising data onto the BlueZ advertisement properties.
pub fn build_advertisement(data: &AdvertisingData) -> Advertisement {
    let service_uuids: BTreeSet<Uuid> = data
        .uuids16
        .iter()
        .map(|&short| uuid_from_short(short))
        .chain(data.uuids128.iter().copied())
        .collect();
    Advertisement {
        advertisement_type: Type::Peripheral,
        service_uuids,
        manufacturer_data: data
            .manufacturer_data
            .iter()
            .map(|(company, bytes)| (*company, bytes.clone()))
            .collect(),
        discoverable: Some(true),
        local_name: Some(data.name.clone()),
        ..Default::default()
    }
}
