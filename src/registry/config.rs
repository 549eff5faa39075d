//! Registry and per-channel configuration.

use std::time::Duration;

/// Per-channel tuning knobs.
///
/// Applied only on first creation for a key; later calls for the same key
/// with a different config are ignored (first-writer-wins).
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Keep-alive cadence while connected.
    pub heartbeat_interval: Duration,

    /// Handshake timeout passed to the transport.
    pub connect_timeout: Duration,

    /// Reconnect attempts before the channel degrades to `Error`.
    pub max_reconnect_attempts: u32,

    /// Backoff lower bound.
    pub base_delay: Duration,

    /// Backoff upper bound (before jitter).
    pub max_delay: Duration,

    /// Whether disconnection triggers automatic recovery.
    pub auto_reconnect: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            auto_reconnect: true,
        }
    }
}

/// Registry-wide configuration.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Delay between a channel's subscriber count reaching zero and its
    /// teardown. Absorbs rapid unsubscribe/resubscribe churn.
    pub grace_period: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
        }
    }
}
