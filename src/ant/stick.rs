//! Garmin USB stick access and ANT message framing.

use std::time::Duration;

use rusb::{Device, DeviceHandle, GlobalContext};

use super::AntError;

/// Garmin/Dynastream USB vendor ID.
pub const GARMIN_VENDOR_ID: u16 = 0x0fcf;

/// USB2 ANT Stick, the preferred model.
pub const PRODUCT_USB2: u16 = 0x1009;

/// USB1 ANT Stick, the fallback model.
pub const PRODUCT_USB1: u16 = 0x1008;

/// Older stick recognized during detection but not opened for broadcast.
pub const PRODUCT_LEGACY: u16 = 0x1006;

/// Public ANT+ network key.
const NETWORK_KEY: [u8; 8] = [0xb9, 0xa5, 0x21, 0xfb, 0xbd, 0x72, 0xc3, 0x45];

const SYNC_BYTE: u8 = 0xa4;
const ENDPOINT_OUT: u8 = 0x01;
const USB_TIMEOUT: Duration = Duration::from_millis(500);

// ANT message ids.
const MSG_RESET_SYSTEM: u8 = 0x4a;
const MSG_SET_NETWORK_KEY: u8 = 0x46;
const MSG_ASSIGN_CHANNEL: u8 = 0x42;
const MSG_CHANNEL_ID: u8 = 0x51;
const MSG_CHANNEL_PERIOD: u8 = 0x43;
const MSG_CHANNEL_RF_FREQUENCY: u8 = 0x45;
const MSG_OPEN_CHANNEL: u8 = 0x4b;
const MSG_BROADCAST_DATA: u8 = 0x4e;

/// Bidirectional master channel.
const CHANNEL_TYPE_MASTER: u8 = 0x10;

/// ANT+ transmission type for an independent sensor.
const TRANSMISSION_TYPE: u8 = 0x05;

/// Frame a message: sync, length, id, payload, XOR checksum.
pub fn frame_message(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 4);
    buf.push(SYNC_BYTE);
    buf.push(payload.len() as u8);
    buf.push(id);
    buf.extend_from_slice(payload);
    let checksum = buf.iter().fold(0u8, |acc, &b| acc ^ b);
    buf.push(checksum);
    buf
}

/// Locate the first usable stick, in preference order.
pub fn find_stick() -> Option<(u16, Device<GlobalContext>)> {
    let devices = match rusb::devices() {
        Ok(devices) => devices,
        Err(err) => {
            tracing::debug!("usb enumeration failed: {}", err);
            return None;
        }
    };
    for wanted in [PRODUCT_USB2, PRODUCT_USB1, PRODUCT_LEGACY] {
        for device in devices.iter() {
            let Ok(descriptor) = device.device_descriptor() else {
                continue;
            };
            if descriptor.vendor_id() == GARMIN_VENDOR_ID && descriptor.product_id() == wanted {
                return Some((wanted, device));
            }
        }
    }
    None
}

/// Open, claimed ANT+ stick.
pub struct AntStick {
    handle: DeviceHandle<GlobalContext>,
    closed: bool,
}

impl AntStick {
    /// Open the first present stick and bring up a Bike Power master
    /// channel 0 with the given device ID.
    pub fn open(device_id: u16) -> Result<Self, AntError> {
        let (product, device) = find_stick().ok_or(AntError::NoStickFound)?;
        if product == PRODUCT_LEGACY {
            tracing::warn!("legacy ANT stick detected; broadcast unsupported");
            return Err(AntError::NoStickFound);
        }
        let mut handle = device.open()?;
        let _ = handle.set_auto_detach_kernel_driver(true);
        handle.claim_interface(0)?;
        tracing::info!("opened ANT+ stick {:04x}:{:04x}", GARMIN_VENDOR_ID, product);

        let mut stick = Self {
            handle,
            closed: false,
        };
        stick.configure(device_id)?;
        Ok(stick)
    }

    fn configure(&mut self, device_id: u16) -> Result<(), AntError> {
        self.write_message(MSG_RESET_SYSTEM, &[0x00])?;
        // Give the chip its post-reset settle time.
        std::thread::sleep(Duration::from_millis(500));

        let mut key = vec![0x00];
        key.extend_from_slice(&NETWORK_KEY);
        self.write_message(MSG_SET_NETWORK_KEY, &key)?;
        self.write_message(MSG_ASSIGN_CHANNEL, &[0x00, CHANNEL_TYPE_MASTER, 0x00])?;
        let id = device_id.to_le_bytes();
        self.write_message(
            MSG_CHANNEL_ID,
            &[0x00, id[0], id[1], super::DEVICE_TYPE_POWER, TRANSMISSION_TYPE],
        )?;
        let period = super::CHANNEL_PERIOD_POWER.to_le_bytes();
        self.write_message(MSG_CHANNEL_PERIOD, &[0x00, period[0], period[1]])?;
        self.write_message(MSG_CHANNEL_RF_FREQUENCY, &[0x00, super::RF_FREQUENCY])?;
        self.write_message(MSG_OPEN_CHANNEL, &[0x00])?;
        Ok(())
    }

    /// Send one framed message.
    pub fn write_message(&mut self, id: u8, payload: &[u8]) -> Result<(), AntError> {
        let frame = frame_message(id, payload);
        self.handle.write_bulk(ENDPOINT_OUT, &frame, USB_TIMEOUT)?;
        Ok(())
    }

    /// Broadcast an 8-byte page on channel 0.
    pub fn broadcast(&mut self, page: &[u8; 8]) -> Result<(), AntError> {
        let mut payload = vec![0x00];
        payload.extend_from_slice(page);
        self.write_message(MSG_BROADCAST_DATA, &payload)
    }

    /// Release the stick. Safe to call more than once; only the first call
    /// does anything.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.handle.release_interface(0);
    }
}

impl Drop for AntStick {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout_and_checksum() {
        let frame = frame_message(MSG_OPEN_CHANNEL, &[0x00]);
        assert_eq!(frame[0], 0xa4);
        assert_eq!(frame[1], 1);
        assert_eq!(frame[2], 0x4b);
        assert_eq!(frame[3], 0x00);
        // XOR of a4 01 4b 00
        assert_eq!(frame[4], 0xa4 ^ 0x01 ^ 0x4b);
    }

    #[test]
    fn test_network_key_frame() {
        let mut payload = vec![0x00];
        payload.extend_from_slice(&NETWORK_KEY);
        let frame = frame_message(MSG_SET_NETWORK_KEY, &payload);
        assert_eq!(frame.len(), 13);
        assert_eq!(frame[1], 9);
        let checksum = frame[..12].iter().fold(0u8, |acc, &b| acc ^ b);
        assert_eq!(frame[12], checksum);
    }
}
