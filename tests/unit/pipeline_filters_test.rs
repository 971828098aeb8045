//! Unit tests for the normalization stages.

use gymnasticon::pipeline::crank::wrap_delta;
use gymnasticon::pipeline::{DropoutFilter, PowerCalibration, PowerSmoother};

#[test]
fn test_dropout_masks_one_zero_per_run() {
    let mut filter = DropoutFilter::new();
    let mut out = Vec::new();
    for (power, cadence) in [(200, 90), (0, 0), (0, 0)] {
        out.push(filter.apply(power, cadence));
    }
    assert_eq!(out, vec![(200, 90), (200, 90), (0, 0)]);
}

#[test]
fn test_calibrator_identity_and_monotonicity() {
    let identity = PowerCalibration::new(1.0, 0.0);
    for w in [0u16, 1, 77, 1500] {
        assert_eq!(identity.apply(w), w);
    }

    let scaled = PowerCalibration::new(1.25, 10.0);
    let mut prev = 0;
    for w in 1..1000u16 {
        let cur = scaled.apply(w);
        assert!(cur >= prev);
        prev = cur;
    }
}

#[test]
fn test_smoother_seeded_with_first_sample() {
    let mut smoother = PowerSmoother::default();
    assert_eq!(smoother.add(137), 137);
}

#[test]
fn test_smoother_survives_zero_runs() {
    let mut smoother = PowerSmoother::new(0.5);
    smoother.add(200);
    smoother.add(0);
    // 0.5*0 + 0.5*200 = 100, then halfway back up toward 200.
    assert_eq!(smoother.add(200), 150);
}

#[test]
fn test_wrap_delta_mod_2_16() {
    assert_eq!(wrap_delta(65535, 0), 1);
    assert_eq!(wrap_delta(65000, 500), 1036);
    assert_eq!(wrap_delta(0, 0), 0);
    assert_eq!(wrap_delta(1, 0), 65535);
}
