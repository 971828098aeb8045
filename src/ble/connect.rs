//! Peripheral connection manager: per-attempt deadline, bounded retry with
//! jittered backoff, and proactive cleanup of half-open handles.

use std::future::Future;
use std::time::Duration;

use btleplug::api::{Central, CentralEvent, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use rand::Rng;

use super::{BleError, ConnectionState};

/// Spacing between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// `min(max_backoff, 100ms * 2^n)`, jittered by ±20%.
    #[default]
    Exponential,
    /// `min(max_backoff, 500ms * n)`, jittered by ±20%.
    Linear,
}

/// Connect behavior knobs.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    /// Deadline for a single attempt.
    pub timeout: Duration,
    /// Total attempts before giving up.
    pub max_retries: u32,
    /// Upper bound on any single backoff sleep.
    pub max_backoff: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            max_backoff: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

fn backoff_delay(strategy: BackoffStrategy, attempt: u32, max: Duration) -> Duration {
    let base = match strategy {
        BackoffStrategy::Exponential => {
            Duration::from_millis(100u64.saturating_mul(1u64 << attempt.min(20)))
        }
        BackoffStrategy::Linear => Duration::from_millis(500 * attempt as u64),
    };
    base.min(max)
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    delay.mul_f64(factor)
}

/// Run `attempt` up to `max_retries` times, each under `timeout`.
///
/// `cleanup` runs after a timed-out attempt so a half-open handle is not
/// left dangling into the next attempt. Deadlines and backoff sleeps are
/// plain futures dropped at settlement, so a settled attempt's timer can
/// never fire afterwards.
pub async fn retry_with_backoff<T, F, Fut, C, CFut>(
    opts: &ConnectOptions,
    mut attempt: F,
    mut cleanup: C,
) -> Result<T, BleError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BleError>>,
    C: FnMut() -> CFut,
    CFut: Future<Output = ()>,
{
    let mut n = 0;
    loop {
        n += 1;
        match tokio::time::timeout(opts.timeout, attempt(n)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                tracing::warn!("connect attempt {} failed: {}", n, err);
            }
            Err(_) => {
                tracing::warn!("connect attempt {} timed out", n);
                cleanup().await;
            }
        }
        if n >= opts.max_retries {
            return Err(BleError::ConnectFailed { attempts: n });
        }
        let delay = jittered(backoff_delay(opts.strategy, n, opts.max_backoff));
        tracing::debug!("retrying connect in {:?}", delay);
        tokio::time::sleep(delay).await;
    }
}

/// Connect a discovered peripheral with retry.
///
/// A disconnect watch is registered before each attempt so a mid-handshake
/// drop (for example an MTU exchange crash on the console side) settles the
/// attempt instead of waiting out the full deadline.
pub async fn connect_peripheral(
    adapter: &Adapter,
    peripheral: &Peripheral,
    opts: &ConnectOptions,
) -> Result<(), BleError> {
    let mut state = ConnectionState::default();
    state.advance(ConnectionState::Connecting);
    let id = peripheral.id();
    let result = retry_with_backoff(
        opts,
        |_| {
            let id = id.clone();
            async move {
                let mut events = adapter.events().await?;
                tokio::select! {
                    res = peripheral.connect() => res.map_err(BleError::from),
                    dropped = async {
                        while let Some(event) = events.next().await {
                            if matches!(&event, CentralEvent::DeviceDisconnected(gone) if *gone == id) {
                                return true;
                            }
                        }
                        false
                    } => {
                        if dropped {
                            Err(BleError::LinkLost)
                        } else {
                            Err(BleError::ConnectTimeout)
                        }
                    }
                }
            }
        },
        || async {
            // Tear down the half-open handle; the peripheral may already be
            // gone, which is fine.
            let _ = peripheral.disconnect().await;
        },
    )
    .await;
    state.advance(match result {
        Ok(()) => ConnectionState::Connected,
        Err(_) => ConnectionState::Disconnected,
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn test_opts() -> ConnectOptions {
        ConnectOptions {
            timeout: Duration::from_millis(100),
            max_retries: 3,
            max_backoff: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_are_terminal() {
        let cleanups = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &test_opts(),
            |_| std::future::pending(),
            || async {
                cleanups.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
        assert!(matches!(result, Err(BleError::ConnectFailed { attempts: 3 })));
        // Every timed-out attempt tore down its half-open handle.
        assert_eq!(cleanups.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_time_within_jitter_bounds() {
        let started = Instant::now();
        let _: Result<(), _> = retry_with_backoff(
            &test_opts(),
            |_| std::future::pending(),
            || async {},
        )
        .await;
        let elapsed = started.elapsed();
        // 3 timeouts plus two jittered exponential backoffs (200ms, 400ms).
        let min = Duration::from_millis(300 + 160 + 320);
        let max = Duration::from_millis(300 + 240 + 480);
        assert!(elapsed >= min, "elapsed {:?} below {:?}", elapsed, min);
        assert!(elapsed <= max, "elapsed {:?} above {:?}", elapsed, max);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_error_skips_cleanup() {
        let cleanups = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            &test_opts(),
            |_| async { Err(BleError::LinkLost) },
            || async {
                cleanups.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
        assert!(matches!(result, Err(BleError::ConnectFailed { .. })));
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_retrying() {
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(
            &test_opts(),
            |n| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BleError::ConnectTimeout)
                    } else {
                        Ok(42)
                    }
                }
            },
            || async {},
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_progression() {
        let max = Duration::from_secs(10);
        assert_eq!(
            backoff_delay(BackoffStrategy::Exponential, 1, max),
            Duration::from_millis(200)
        );
        assert_eq!(
            backoff_delay(BackoffStrategy::Exponential, 2, max),
            Duration::from_millis(400)
        );
        assert_eq!(
            backoff_delay(BackoffStrategy::Linear, 3, max),
            Duration::from_millis(1500)
        );
        // Capped by max_backoff.
        assert_eq!(
            backoff_delay(BackoffStrategy::Exponential, 12, Duration::from_secs(1)),
            Duration::from_secs(1)
        );
    }
}
