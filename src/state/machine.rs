//! Pure connection state machine for a single channel.
//!
//! The transition function has no side effects and owns no timers; the
//! registry feeds it transport callbacks and timer firings and acts on the
//! resulting state changes. Unhandled (state, event) pairs return the input
//! unchanged, so the function is total by construction.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Connection lifecycle states.
///
/// `Error` and `Closed` are terminal with respect to automatic transitions:
/// only an explicit [`ProtocolEvent::Reconnect`] or [`ProtocolEvent::Connect`]
/// from a caller leaves them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    /// Never connected, or manually disconnected with auto-reconnect off.
    Idle,
    /// Initial handshake in flight.
    Connecting,
    /// Healthy.
    Connected,
    /// Recovering from a drop; backoff pending or handshake retried.
    Reconnecting,
    /// Retries exhausted or auto-reconnect disabled.
    Error,
    /// Explicitly torn down.
    Closed,
}

/// Events fed through the state machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// Caller asked for a connection (also revives `Closed`).
    Connect,
    /// Transport completed the handshake.
    ConnectionSuccess,
    /// Handshake or rejoin failed.
    ConnectionFailed { reason: String },
    /// An established connection dropped.
    Disconnect,
    /// The transport reported a mid-stream error.
    Error { reason: String },
    /// Caller tore the channel down.
    Close,
    /// Caller explicitly retries out of the terminal `Error` state.
    Reconnect,
}

/// Reconnect policy and progress carried alongside the state.
///
/// Treated as immutable per transition: [`transition`] returns a fresh
/// context rather than mutating in place.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelContext {
    /// Attempts since the last successful connection.
    pub reconnect_attempts: u32,
    /// Cap; reaching it moves the machine to `Error`.
    pub max_reconnect_attempts: u32,
    /// Backoff lower bound.
    pub base_delay: Duration,
    /// Backoff upper bound (before jitter).
    pub max_delay: Duration,
    /// Most recent failure reason, for diagnostics.
    pub last_error: Option<String>,
    /// Whether disconnection triggers automatic recovery.
    pub auto_reconnect: bool,
}

impl ChannelContext {
    pub fn new(
        max_reconnect_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        auto_reconnect: bool,
    ) -> Self {
        Self {
            reconnect_attempts: 0,
            max_reconnect_attempts,
            base_delay,
            max_delay,
            last_error: None,
            auto_reconnect,
        }
    }

    fn fresh_start(&self) -> Self {
        Self {
            reconnect_attempts: 0,
            last_error: None,
            ..self.clone()
        }
    }

    fn attempts_reset(&self) -> Self {
        Self {
            reconnect_attempts: 0,
            ..self.clone()
        }
    }
}

/// Retry-or-give-up branch shared by every failure path.
///
/// Increments the attempt counter while retries remain; otherwise lands in
/// the terminal `Error` state. The failure reason is recorded either way.
fn retry_or_error(ctx: &ChannelContext, reason: &str) -> (ChannelState, ChannelContext) {
    let mut next = ctx.clone();
    next.last_error = Some(reason.to_string());
    if ctx.auto_reconnect && ctx.reconnect_attempts < ctx.max_reconnect_attempts {
        next.reconnect_attempts += 1;
        (ChannelState::Reconnecting, next)
    } else {
        (ChannelState::Error, next)
    }
}

/// Apply one event to a channel's state machine.
///
/// Pure and deterministic; identical inputs yield identical outputs.
/// Combinations not covered by the table are ignored (the input is returned
/// unchanged), which is a deliberate policy, not an error.
pub fn transition(
    state: ChannelState,
    ctx: &ChannelContext,
    event: &ProtocolEvent,
) -> (ChannelState, ChannelContext) {
    use ChannelState::*;
    use ProtocolEvent::*;

    match (state, event) {
        (Idle, Connect) => (Connecting, ctx.fresh_start()),

        (Connecting, ConnectionSuccess) => (Connected, ctx.attempts_reset()),
        (Connecting, ConnectionFailed { reason }) => retry_or_error(ctx, reason),
        (Connecting, Close) => (Closed, ctx.clone()),

        (Connected, Disconnect) => {
            if ctx.auto_reconnect {
                (Reconnecting, ctx.attempts_reset())
            } else {
                (Idle, ctx.clone())
            }
        }
        // `Error` must be qualified here: both enums are glob-imported and
        // both have an `Error` variant.
        (Connected, ConnectionFailed { reason }) | (Connected, ProtocolEvent::Error { reason }) => {
            retry_or_error(ctx, reason)
        }
        (Connected, Close) => (Closed, ctx.clone()),

        (Reconnecting, ConnectionSuccess) => (Connected, ctx.attempts_reset()),
        (Reconnecting, ConnectionFailed { reason }) => retry_or_error(ctx, reason),
        (Reconnecting, Close) => (Closed, ctx.clone()),

        (Error, Reconnect) => (Connecting, ctx.fresh_start()),
        (Error, Close) => (Closed, ctx.clone()),

        (Closed, Connect) => (Connecting, ctx.fresh_start()),

        // Everything else is deliberately ignored.
        _ => (state, ctx.clone()),
    }
}
