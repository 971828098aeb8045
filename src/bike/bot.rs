//! Scripted bike for test harnesses.
//!
//! Listens on UDP; each datagram replaces the reported power and cadence.
//! The current values are re-emitted once a second so downstream staleness
//! deadlines behave as they would with a live bike.

use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;

use super::{BikeError, BikeEvent, BikeSample};

const EMIT_INTERVAL: Duration = Duration::from_secs(1);

/// One remote-control datagram.
#[derive(Debug, Clone, Copy, Deserialize)]
struct BotCommand {
    power: Option<u16>,
    cadence: Option<u16>,
}

/// Scripted bike driver.
#[derive(Debug)]
pub struct BotBike {
    task: JoinHandle<()>,
}

impl BotBike {
    /// Bind the control socket and start emitting.
    pub async fn connect(
        host: &str,
        port: u16,
        power: u16,
        cadence: u16,
        events: mpsc::Sender<BikeEvent>,
    ) -> Result<Self, BikeError> {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
        let socket = UdpSocket::bind(addr).await?;
        tracing::info!("bot bike listening on {}", addr);

        let task = tokio::spawn(run(socket, power, cadence, events));
        Ok(Self { task })
    }

    /// Stop emitting. Idempotent.
    pub async fn disconnect(&self) {
        self.task.abort();
    }
}

async fn run(socket: UdpSocket, mut power: u16, mut cadence: u16, events: mpsc::Sender<BikeEvent>) {
    let mut emit = interval(EMIT_INTERVAL);
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            _ = emit.tick() => {
                let _ = events
                    .send(BikeEvent::Sample(BikeSample::new(power, cadence)))
                    .await;
            }
            received = socket.recv_from(&mut buf) => {
                let Ok((len, from)) = received else { continue };
                match serde_json::from_slice::<BotCommand>(&buf[..len]) {
                    Ok(command) => {
                        if let Some(value) = command.power {
                            power = value;
                        }
                        if let Some(value) = command.cadence {
                            cadence = value;
                        }
                        tracing::debug!("bot update from {}: {}w {}rpm", from, power, cadence);
                        let _ = events
                            .send(BikeEvent::Sample(BikeSample::new(power, cadence)))
                            .await;
                    }
                    Err(err) => tracing::debug!("ignoring bad bot datagram: {}", err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_updates_values() {
        let (tx, mut rx) = mpsc::channel(16);
        let bot = BotBike::connect("127.0.0.1", 0, 100, 80, tx).await;
        // Port 0 binds an ephemeral port; the driver itself must come up.
        let bot = bot.expect("bind");

        // First periodic emission carries the initial values.
        match rx.recv().await {
            Some(BikeEvent::Sample(sample)) => {
                assert_eq!(sample.power_w, 100);
                assert_eq!(sample.cadence_rpm, 80);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        bot.disconnect().await;
    }

    #[test]
    fn test_command_parses_partial_updates() {
        let command: BotCommand = serde_json::from_str(r#"{"power": 250}"#).unwrap();
        assert_eq!(command.power, Some(250));
        assert_eq!(command.cadence, None);
    }
}
