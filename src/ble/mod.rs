//! Shared BLE plumbing: error kinds, scan filters, adapter roles and the
//! connection/retry manager used by every GATT-based ingress driver.

pub mod adapter;
pub mod connect;
pub mod filter;

use thiserror::Error;

pub use adapter::{AdapterCapabilities, AdapterPlan, AdapterRole};
pub use connect::{BackoffStrategy, ConnectOptions};
pub use filter::DeviceFilter;

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn test_legal_connection_cycle() {
        let mut state = super::ConnectionState::default();
        for next in [Connecting, Connected, Disconnecting, Disconnected] {
            assert!(state.can_transition(next));
            state.advance(next);
        }
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(!Disconnected.can_transition(Connected));
        assert!(!Disconnected.can_transition(Disconnecting));
        assert!(!Connecting.can_transition(Disconnecting));
        assert!(!Disconnecting.can_transition(Connecting));
    }

    #[test]
    fn test_beacon_reconnect_path() {
        assert!(Connected.can_transition(Reconnecting));
        assert!(Reconnecting.can_transition(Connected));
        assert!(Reconnecting.can_transition(Disconnected));
    }
}

/// Link state of one peripheral.
///
/// `Reconnecting` only applies to beacon-style sources that never hold a
/// link and silently resume when advertisements return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

impl ConnectionState {
    /// Whether `next` is a legal successor state.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
                | (Disconnecting, Disconnected)
        )
    }

    /// Move to `next`, flagging illegal transitions as programming errors.
    pub fn advance(&mut self, next: ConnectionState) {
        if !self.can_transition(next) {
            debug_assert!(false, "illegal transition {:?} -> {:?}", self, next);
            tracing::error!("illegal connection transition {:?} -> {:?}", self, next);
        }
        *self = next;
    }
}

/// Errors surfaced by the BLE layer.
#[derive(Debug, Error)]
pub enum BleError {
    /// Adapter is powered off, unsupported or unauthorized.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// No matching peripheral discovered within the scan window.
    #[error("scan timed out without a matching device")]
    ScanTimeout,

    /// A single connect attempt exceeded its deadline.
    #[error("connect attempt timed out")]
    ConnectTimeout,

    /// All connect attempts exhausted.
    #[error("connect failed after {attempts} attempts")]
    ConnectFailed { attempts: u32 },

    /// Established link dropped.
    #[error("link lost")]
    LinkLost,

    /// Underlying stack error.
    #[error(transparent)]
    Stack(#[from] btleplug::Error),
}
