//! Peloton Bike driver (head-unit serial tap).
//!
//! The console speaks a simple polled protocol at 19200 8N1. The host sends
//! a request every 100 ms, rotating through cadence, power and resistance;
//! replies carry ASCII-coded digits. The bike pushes nothing unsolicited, so
//! a short staleness deadline stands in for a link-drop signal.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

use super::{BikeError, BikeEvent, BikeSample, DisconnectOnce};

const BAUD_RATE: u32 = 19200;
const FRAME_DELIMITER: u8 = 0xF6;
const REQUEST_MARKER: u8 = 0xF5;

/// Poll cycle spacing.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Reset power and cadence to zero when the console goes quiet this long.
const STATS_TIMEOUT: Duration = Duration::from_secs(1);

/// Pollable console metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Cadence = 0x41,
    Power = 0x44,
    Resistance = 0x4A,
}

impl Command {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x41 => Some(Command::Cadence),
            0x44 => Some(Command::Power),
            0x4A => Some(Command::Resistance),
            _ => None,
        }
    }
}

/// Build the 4-byte request for one metric.
pub fn request(command: Command) -> [u8; 4] {
    let cmd = command as u8;
    [
        FRAME_DELIMITER,
        REQUEST_MARKER,
        cmd,
        (REQUEST_MARKER as u16 + cmd as u16) as u8,
    ]
}

/// Decode ASCII digits with reversed place value.
///
/// The least significant digit is the last byte, so the place value grows
/// while walking backwards. Power replies carry one implicit decimal: the
/// trailing digit is tenths.
fn decode_digits(digits: &[u8]) -> Option<u32> {
    let mut value: u32 = 0;
    let mut place: u32 = 1;
    for &byte in digits.iter().rev() {
        let digit = byte.wrapping_sub(0x30);
        if digit > 9 {
            return None;
        }
        value += digit as u32 * place;
        place = place.saturating_mul(10);
    }
    Some(value)
}

/// One decoded console reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reply {
    pub command: Command,
    /// Metric value; power is in watts with one decimal of precision.
    pub value: f64,
}

/// Incremental reply-frame parser.
///
/// Frame layout after the 0xF6 delimiter: marker, command echo, digit
/// count, digits, sum checksum. Garbage between frames is skipped by
/// resyncing on the next delimiter; checksum failures drop the frame.
#[derive(Debug, Default)]
pub struct ReplyParser {
    buf: Vec<u8>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw serial bytes; returns every completed reply.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Reply> {
        self.buf.extend_from_slice(bytes);
        let mut replies = Vec::new();
        loop {
            // Resync to the next frame delimiter.
            match self.buf.iter().position(|&b| b == FRAME_DELIMITER) {
                Some(start) => {
                    self.buf.drain(..start);
                }
                None => {
                    self.buf.clear();
                    break;
                }
            }
            // buf[0] is the delimiter; need marker, command and count.
            if self.buf.len() < 4 {
                break;
            }
            if self.buf[1] != REQUEST_MARKER {
                self.buf.drain(..1);
                continue;
            }
            let count = self.buf[3] as usize;
            let total = 4 + count + 1;
            if self.buf.len() < total {
                break;
            }
            let frame: Vec<u8> = self.buf.drain(..total).collect();
            if let Some(reply) = decode_frame(&frame[1..]) {
                replies.push(reply);
            } else {
                tracing::debug!("dropped malformed reply: {:02x?}", frame);
            }
        }
        replies
    }
}

fn decode_frame(frame: &[u8]) -> Option<Reply> {
    let [_, cmd, count, rest @ ..] = frame else {
        return None;
    };
    let command = Command::from_byte(*cmd)?;
    let (digits, checksum) = rest.split_at(*count as usize);
    let sum: u16 = frame[..frame.len() - 1].iter().map(|&b| b as u16).sum();
    if checksum != [(sum & 0xff) as u8] {
        return None;
    }
    let raw = decode_digits(digits)?;
    let value = match command {
        Command::Power => raw as f64 / 10.0,
        _ => raw as f64,
    };
    Some(Reply { command, value })
}

/// Connected Peloton console.
#[derive(Debug)]
pub struct PelotonBike {
    task: JoinHandle<()>,
}

impl PelotonBike {
    /// Open the serial tap and start polling.
    pub async fn connect(
        path: &Path,
        events: mpsc::Sender<BikeEvent>,
    ) -> Result<Self, BikeError> {
        let port = tokio_serial::new(path.to_string_lossy(), BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()?;
        tracing::info!("opened peloton console at {}", path.display());

        let address = path.to_string_lossy().into_owned();
        let task = tokio::spawn(run(port, address, events));
        Ok(Self { task })
    }

    /// Stop polling. Idempotent.
    pub async fn disconnect(&self) {
        self.task.abort();
    }
}

async fn run(
    port: tokio_serial::SerialStream,
    address: String,
    events: mpsc::Sender<BikeEvent>,
) {
    const POLL_SEQUENCE: [Command; 3] = [Command::Cadence, Command::Power, Command::Resistance];

    let (mut reader, mut writer) = tokio::io::split(port);
    let mut parser = ReplyParser::new();
    let mut poll = interval(POLL_INTERVAL);
    let mut next_request = 0usize;
    let mut power: u16 = 0;
    let mut cadence: u16 = 0;
    let mut last_reply = Instant::now();
    let mut read_buf = [0u8; 64];
    let mut disconnect = DisconnectOnce::new(address);

    loop {
        tokio::select! {
            _ = poll.tick() => {
                if last_reply.elapsed() > STATS_TIMEOUT && (power != 0 || cadence != 0) {
                    power = 0;
                    cadence = 0;
                    let _ = events.send(BikeEvent::Sample(BikeSample::new(0, 0))).await;
                }
                let req = request(POLL_SEQUENCE[next_request]);
                next_request = (next_request + 1) % POLL_SEQUENCE.len();
                if let Err(err) = writer.write_all(&req).await {
                    tracing::warn!("peloton write failed: {}", err);
                    break;
                }
            }
            read = reader.read(&mut read_buf) => {
                let n = match read {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(err) => {
                        tracing::warn!("peloton read failed: {}", err);
                        break;
                    }
                };
                for reply in parser.push(&read_buf[..n]) {
                    last_reply = Instant::now();
                    match reply.command {
                        Command::Cadence => cadence = reply.value.round() as u16,
                        Command::Power => power = reply.value.round() as u16,
                        Command::Resistance => {
                            tracing::trace!("resistance {}", reply.value);
                            continue;
                        }
                    }
                    let _ = events
                        .send(BikeEvent::Sample(BikeSample::new(power, cadence)))
                        .await;
                }
            }
        }
    }
    disconnect.send(&events).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_frame(command: Command, digits: &[u8]) -> Vec<u8> {
        let mut frame = vec![FRAME_DELIMITER, REQUEST_MARKER, command as u8, digits.len() as u8];
        frame.extend_from_slice(digits);
        let sum: u16 = frame[1..].iter().map(|&b| b as u16).sum();
        frame.push((sum & 0xff) as u8);
        frame
    }

    #[test]
    fn test_request_checksums() {
        assert_eq!(request(Command::Cadence), [0xF6, 0xF5, 0x41, 0x36]);
        assert_eq!(request(Command::Power), [0xF6, 0xF5, 0x44, 0x39]);
        assert_eq!(request(Command::Resistance), [0xF6, 0xF5, 0x4A, 0x3F]);
    }

    #[test]
    fn test_power_has_one_decimal() {
        let mut parser = ReplyParser::new();
        let replies = parser.push(&reply_frame(Command::Power, b"01234"));
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].command, Command::Power);
        assert!((replies[0].value - 123.4).abs() < 1e-9);
    }

    #[test]
    fn test_cadence_is_whole_rpm() {
        let mut parser = ReplyParser::new();
        let replies = parser.push(&reply_frame(Command::Cadence, b"090"));
        assert_eq!(replies[0].value, 90.0);
    }

    #[test]
    fn test_split_delivery_reassembles() {
        let frame = reply_frame(Command::Power, b"00500");
        let mut parser = ReplyParser::new();
        assert!(parser.push(&frame[..3]).is_empty());
        let replies = parser.push(&frame[3..]);
        assert_eq!(replies.len(), 1);
        assert!((replies[0].value - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_checksum_failure_drops_frame() {
        let mut frame = reply_frame(Command::Cadence, b"090");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut parser = ReplyParser::new();
        assert!(parser.push(&frame).is_empty());
    }

    #[test]
    fn test_garbage_between_frames() {
        let mut bytes = vec![0x00, 0x13, 0x37];
        bytes.extend(reply_frame(Command::Cadence, b"080"));
        let mut parser = ReplyParser::new();
        let replies = parser.push(&bytes);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].value, 80.0);
    }

    #[test]
    fn test_non_digit_payload_rejected() {
        let mut parser = ReplyParser::new();
        assert!(parser.push(&reply_frame(Command::Cadence, b"0:0")).is_empty());
    }
}
