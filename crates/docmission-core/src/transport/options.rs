//! Transport tuning

use std::time::Duration;

/// Backoff between reconnection attempts
///
/// Starts at `initial`, doubles per failed attempt, never exceeds `max`.
/// The attempt counter resets after every successful connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// A policy that always waits `interval`
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
        }
    }

    /// Delay before reconnection attempt number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Transport adapter options
///
/// Liveness is not configured here: the server announces its own ping
/// schedule in the Engine.IO handshake.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Upper bound for a single connect attempt
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}
