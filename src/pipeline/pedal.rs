//! Simulated pedal-stroke timeline.
//!
//! Most supported bikes report instantaneous cadence but no discrete crank
//! events. This task reconstructs a wall-clock-accurate stroke timeline from
//! the cadence so the outbound CSC/CPS crank counters advance exactly as a
//! real crank sensor would.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Handle to a running pedal-stroke simulator.
///
/// Stroke timestamps arrive on the receiver returned by [`PedalSimulator::spawn`].
#[derive(Debug)]
pub struct PedalSimulator {
    cadence_tx: mpsc::UnboundedSender<u16>,
    task: JoinHandle<()>,
}

impl PedalSimulator {
    /// Spawn the simulator task. Strokes are reported on the returned channel.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<Instant>) {
        let (cadence_tx, cadence_rx) = mpsc::unbounded_channel();
        let (pedal_tx, pedal_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(cadence_rx, pedal_tx));
        (Self { cadence_tx, task }, pedal_rx)
    }

    /// Update the current cadence. Zero cancels the pending stroke.
    pub fn set_cadence(&self, rpm: u16) {
        let _ = self.cadence_tx.send(rpm);
    }

    /// Stop the simulator task.
    pub fn stop(&self) {
        self.task.abort();
    }
}

fn period(rpm: u16) -> Duration {
    Duration::from_micros(60_000_000 / rpm as u64)
}

async fn run(mut cadence_rx: mpsc::UnboundedReceiver<u16>, pedal_tx: mpsc::UnboundedSender<Instant>) {
    let mut cadence: u16 = 0;
    let mut next: Option<Instant> = None;

    loop {
        // The sleep future owns a copy of the deadline so the handlers are
        // free to reschedule; the guard keeps a parked timeline from firing.
        let deadline = next.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            update = cadence_rx.recv() => {
                let Some(rpm) = update else { break };
                let now = Instant::now();
                if rpm == 0 {
                    next = None;
                } else {
                    let p = period(rpm);
                    match next {
                        // Starting from a standstill: stroke immediately.
                        None => next = Some(now),
                        // Faster cadence pulls the stroke closer. A pending
                        // stroke is never pushed out: slowing down mid-stroke
                        // leaves the already-scheduled event in place.
                        Some(at) if at > now + p => next = Some(now + p),
                        Some(_) => {}
                    }
                }
                cadence = rpm;
            }
            _ = sleep_until(deadline), if next.is_some() => {
                next = None;
                if pedal_tx.send(deadline).is_err() {
                    break;
                }
                if cadence > 0 {
                    next = Some(deadline + period(cadence));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Duration};

    async fn drain_at_most(rx: &mut mpsc::UnboundedReceiver<Instant>, max: usize) -> Vec<Instant> {
        let mut out = Vec::new();
        while out.len() < max {
            match rx.try_recv() {
                Ok(at) => out.push(at),
                Err(_) => {
                    // Let the simulator task observe the advanced clock.
                    tokio::task::yield_now().await;
                    if rx.try_recv().map(|at| out.push(at)).is_err() {
                        break;
                    }
                }
            }
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_cadence_strokes_on_period() {
        let (sim, mut rx) = PedalSimulator::spawn();
        let start = Instant::now();
        sim.set_cadence(60);
        tokio::task::yield_now().await;

        advance(Duration::from_millis(3000)).await;
        let stamps = drain_at_most(&mut rx, 8).await;
        let rel: Vec<u64> = stamps
            .iter()
            .map(|at| at.duration_since(start).as_millis() as u64)
            .collect();
        assert_eq!(rel, vec![0, 1000, 2000, 3000]);
        sim.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_restart() {
        let (sim, mut rx) = PedalSimulator::spawn();
        let start = Instant::now();
        sim.set_cadence(60);
        tokio::task::yield_now().await;

        let mut stamps = Vec::new();
        // Strokes at 0, 1000, 2000, 3000; stop at 3001.
        advance(Duration::from_millis(3001)).await;
        stamps.extend(drain_at_most(&mut rx, 8).await);
        sim.set_cadence(0);
        tokio::task::yield_now().await;

        // Nothing fires while stopped.
        advance(Duration::from_millis(96_999)).await;
        assert!(rx.try_recv().is_err());

        // Restart at t=100000 at 1000 rpm: stroke now, next after 60 ms.
        sim.set_cadence(1000);
        tokio::task::yield_now().await;
        advance(Duration::from_millis(60)).await;
        stamps.extend(drain_at_most(&mut rx, 8).await);

        let rel: Vec<u64> = stamps
            .iter()
            .map(|at| at.duration_since(start).as_millis() as u64)
            .collect();
        assert_eq!(rel, vec![0, 1000, 2000, 3000, 100_000, 100_060]);
        sim.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_rise_shortens_wait() {
        let (sim, mut rx) = PedalSimulator::spawn();
        let start = Instant::now();
        sim.set_cadence(30);
        tokio::task::yield_now().await;
        advance(Duration::from_millis(1)).await;
        let _ = drain_at_most(&mut rx, 1).await; // immediate stroke at t=0

        // Next stroke would be at 2000 ms; raising cadence to 60 at t=1
        // pulls it in to t=1001.
        sim.set_cadence(60);
        tokio::task::yield_now().await;
        advance(Duration::from_millis(1000)).await;
        let stamps = drain_at_most(&mut rx, 1).await;
        assert_eq!(
            stamps[0].duration_since(start).as_millis(),
            1001
        );
        sim.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cadence_drop_leaves_pending_stroke() {
        let (sim, mut rx) = PedalSimulator::spawn();
        let start = Instant::now();
        sim.set_cadence(60);
        tokio::task::yield_now().await;
        advance(Duration::from_millis(1)).await;
        let _ = drain_at_most(&mut rx, 1).await; // stroke at t=0

        // Pending stroke at t=1000. Dropping to 30 rpm must not push it out.
        sim.set_cadence(30);
        tokio::task::yield_now().await;
        advance(Duration::from_millis(999)).await;
        let stamps = drain_at_most(&mut rx, 1).await;
        assert_eq!(
            stamps[0].duration_since(start).as_millis(),
            1000
        );
        sim.stop();
    }
}
