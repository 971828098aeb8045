//! Bike Power page transmission at the native channel rate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::stick::AntStick;

/// Transmit interval matching the 8182-tick channel period.
const BROADCAST_INTERVAL: Duration = Duration::from_millis(250);

/// Standard power-only page number.
const PAGE_POWER_ONLY: u8 = 0x10;

/// No pedal balance reported.
const BALANCE_UNKNOWN: u8 = 0xff;

/// Accumulating state behind the power-only page.
#[derive(Debug, Default, Clone, Copy)]
pub struct PowerPage {
    event_count: u8,
    accumulated_power: u16,
    power: u16,
    cadence: u8,
}

impl PowerPage {
    /// Fold in a fresh measurement.
    pub fn update(&mut self, power: u16, cadence: u16) {
        self.event_count = self.event_count.wrapping_add(1);
        self.accumulated_power = self.accumulated_power.wrapping_add(power);
        self.power = power;
        self.cadence = cadence.min(u8::MAX as u16) as u8;
    }

    /// Encode the 8-byte page.
    pub fn encode(&self) -> [u8; 8] {
        let accumulated = self.accumulated_power.to_le_bytes();
        let instantaneous = self.power.to_le_bytes();
        [
            PAGE_POWER_ONLY,
            BALANCE_UNKNOWN,
            self.cadence,
            self.event_count,
            accumulated[0],
            accumulated[1],
            instantaneous[0],
            instantaneous[1],
        ]
    }
}

/// Background Bike Power broadcaster.
///
/// USB I/O is blocking, so the transmit loop runs on its own thread; the
/// async side only touches the shared page state. A write failure disables
/// broadcasting for the rest of the session.
pub struct PowerBroadcast {
    page: Arc<Mutex<PowerPage>>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<AntStick>>,
}

impl PowerBroadcast {
    /// Start transmitting on an opened stick.
    pub fn start(mut stick: AntStick) -> Self {
        let page = Arc::new(Mutex::new(PowerPage::default()));
        let running = Arc::new(AtomicBool::new(true));

        let thread_page = Arc::clone(&page);
        let thread_running = Arc::clone(&running);
        let thread = std::thread::spawn(move || {
            while thread_running.load(Ordering::SeqCst) {
                let encoded = match thread_page.lock() {
                    Ok(state) => state.encode(),
                    Err(_) => break,
                };
                if let Err(err) = stick.broadcast(&encoded) {
                    tracing::error!("ANT+ broadcast failed, disabling: {}", err);
                    break;
                }
                std::thread::sleep(BROADCAST_INTERVAL);
            }
            stick
        });

        Self {
            page,
            running,
            thread: Some(thread),
        }
    }

    /// Feed the current calibrated measurement.
    pub fn update(&self, power: u16, cadence: u16) {
        if let Ok(mut state) = self.page.lock() {
            state.update(power, cadence);
        }
    }

    /// Stop the transmit loop and close the stick.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if let Ok(mut stick) = thread.join() {
                stick.close();
            }
        }
    }
}

impl Drop for PowerBroadcast {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_layout() {
        let mut page = PowerPage::default();
        page.update(200, 90);
        let encoded = page.encode();
        assert_eq!(encoded[0], 0x10);
        assert_eq!(encoded[1], 0xff);
        assert_eq!(encoded[2], 90);
        assert_eq!(encoded[3], 1);
        assert_eq!(u16::from_le_bytes([encoded[4], encoded[5]]), 200);
        assert_eq!(u16::from_le_bytes([encoded[6], encoded[7]]), 200);
    }

    #[test]
    fn test_accumulated_power_wraps() {
        let mut page = PowerPage::default();
        for _ in 0..300 {
            page.update(300, 90);
        }
        // 300 updates of 300 W overflow the 16-bit accumulator.
        assert_eq!(page.event_count, 300u32 as u8);
        assert_eq!(
            page.accumulated_power,
            ((300u32 * 300) % 65536) as u16
        );
    }

    #[test]
    fn test_cadence_saturates_at_u8() {
        let mut page = PowerPage::default();
        page.update(100, 300);
        assert_eq!(page.encode()[2], 255);
    }
}
