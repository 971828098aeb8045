//! End-to-end pipeline: cadence and power in, notification payloads out.

use std::time::Duration;

use tokio::time::{advance, Instant};

use gymnasticon::pipeline::{
    CrankCounter, DropoutFilter, PedalSimulator, PowerCalibration, PowerPipeline, PowerSmoother,
};
use gymnasticon::server::cps;

/// Collect whatever pedal strokes are currently queued.
async fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Instant>) -> Vec<Instant> {
    let mut out = Vec::new();
    tokio::task::yield_now().await;
    while let Ok(at) = rx.try_recv() {
        out.push(at);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_constant_cadence_produces_crank_payloads() {
    let (sim, mut strokes) = PedalSimulator::spawn();
    let start = Instant::now();
    let mut crank = CrankCounter::new(start);

    sim.set_cadence(60);
    tokio::task::yield_now().await;
    advance(Duration::from_millis(2000)).await;

    let mut payloads = Vec::new();
    for at in drain(&mut strokes).await {
        let event = crank.stroke(at);
        payloads.push(cps::encode_measurement(200, &event));
    }
    sim.stop();

    // Strokes at 0, 1000 and 2000 ms.
    assert_eq!(payloads.len(), 3);
    for (index, payload) in payloads.iter().enumerate() {
        assert_eq!(payload.len(), 8);
        let revolutions = u16::from_le_bytes([payload[4], payload[5]]);
        let event_time = u16::from_le_bytes([payload[6], payload[7]]);
        assert_eq!(revolutions, index as u16 + 1);
        assert_eq!(event_time, index as u16 * 1024);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cadence_zero_halts_crank_counter() {
    let (sim, mut strokes) = PedalSimulator::spawn();
    let start = Instant::now();
    let mut crank = CrankCounter::new(start);

    sim.set_cadence(120);
    tokio::task::yield_now().await;
    advance(Duration::from_millis(500)).await;
    for at in drain(&mut strokes).await {
        crank.stroke(at);
    }
    let before = crank.current();

    sim.set_cadence(0);
    tokio::task::yield_now().await;
    advance(Duration::from_secs(10)).await;
    assert!(drain(&mut strokes).await.is_empty());
    assert_eq!(crank.current(), before);
    sim.stop();
}

#[test]
fn test_power_stages_in_order() {
    // Raw bike power runs dropout, then calibration, then smoothing.
    let mut dropout = DropoutFilter::new();
    let mut pipeline = PowerPipeline::new(
        PowerCalibration::new(2.0, -50.0),
        PowerSmoother::new(1.0), // no smoothing, isolate the calibrator
    );

    let raw = [100u16, 0, 0, 150];
    let mut out = Vec::new();
    for power in raw {
        let (masked, _) = dropout.apply(power, 80);
        out.push(pipeline.process(masked));
    }
    // 100 -> 150 (2x - 50); the first zero is masked to the previous 100;
    // the second zero passes through and calibrates to 0; 150 -> 250.
    assert_eq!(out, vec![150, 150, 0, 250]);
}

#[test]
fn test_smoothing_alpha_step() {
    let mut pipeline = PowerPipeline::new(
        PowerCalibration::default(),
        PowerSmoother::new(0.3),
    );
    assert_eq!(pipeline.process(100), 100);
    // 0.3*200 + 0.7*100
    assert_eq!(pipeline.process(200), 130);
}
