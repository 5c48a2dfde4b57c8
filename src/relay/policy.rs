//! Timing and retry knobs for the relay subsystem.
//!
//! All reconnection cadence lives in [`ReconnectPolicy`]; the control link
//! itself never retries.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// First backoff delay; doubles per consecutive attempt
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Minimum spacing between supervised attempts on one endpoint
    pub cooldown: Duration,
    /// Supervised attempts allowed before giving up until the next `connect_all`
    pub max_attempts: u32,
    /// Bound on a single transport handshake
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            cooldown: Duration::from_secs(30),
            max_attempts: 10,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpRelayPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
    /// Wall-clock bound on the whole attempt loop
    pub deadline: Duration,
    pub ack_timeout: Duration,
    /// How long a publish waits for the control link to come back
    pub reconnect_wait: Duration,
    pub cache_ttl: Duration,
}

impl Default for HttpRelayPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            deadline: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            reconnect_wait: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsRelayPolicy {
    pub connect_timeout: Duration,
    /// Frames held per direction while a session is opening
    pub buffer_capacity: usize,
}

impl Default for WsRelayPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            buffer_capacity: 1024,
        }
    }
}
