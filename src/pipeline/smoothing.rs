//! Power smoothing for noisy trainer data.

/// Exponentially weighted moving average over calibrated power.
///
/// Seeded with the first sample so the reported value does not fade in from
/// zero. State survives transient bike disconnects; it is only dropped when
/// the process exits.
#[derive(Debug)]
pub struct PowerSmoother {
    alpha: f64,
    value: Option<f64>,
}

impl PowerSmoother {
    /// Default smoothing factor.
    pub const DEFAULT_ALPHA: f64 = 0.3;

    /// Create a smoother with the given smoothing factor (0 < alpha <= 1).
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    /// Add a sample and return the smoothed value, rounded to whole watts.
    pub fn add(&mut self, power: u16) -> u16 {
        let x = power as f64;
        let y = match self.value {
            None => x,
            Some(prev) => self.alpha * x + (1.0 - self.alpha) * prev,
        };
        self.value = Some(y);
        y.round() as u16
    }
}

impl Default for PowerSmoother {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ALPHA)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_with_first_sample() {
        let mut smoother = PowerSmoother::default();
        assert_eq!(smoother.add(200), 200);
    }

    #[test]
    fn test_converges_toward_input() {
        let mut smoother = PowerSmoother::new(0.3);
        smoother.add(100);
        let mut last = 100;
        for _ in 0..50 {
            last = smoother.add(300);
        }
        assert_eq!(last, 300);
    }

    #[test]
    fn test_single_step() {
        let mut smoother = PowerSmoother::new(0.5);
        smoother.add(100);
        // 0.5 * 200 + 0.5 * 100
        assert_eq!(smoother.add(200), 150);
    }
}
