//! Reconnect delay calculation.

use super::ChannelContext;
use rand::Rng;
use std::time::Duration;

/// Upper bound on the random jitter added to every delay.
///
/// Jitter de-synchronizes many channels recovering from a shared outage so
/// they do not hammer the service in lockstep.
pub const MAX_JITTER: Duration = Duration::from_millis(1000);

/// Doubling the base more than this many times exceeds any sane `max_delay`.
const MAX_SHIFT: u32 = 20;

/// Delay before the next reconnect attempt: exponential in the attempt
/// count, capped at `ctx.max_delay`, plus up to [`MAX_JITTER`] of jitter.
pub fn reconnect_delay(ctx: &ChannelContext) -> Duration {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64));
    reconnect_delay_with_jitter(
        ctx.base_delay,
        ctx.max_delay,
        ctx.reconnect_attempts,
        jitter,
    )
}

/// Deterministic core of [`reconnect_delay`], with the jitter passed in.
pub fn reconnect_delay_with_jitter(
    base: Duration,
    max: Duration,
    attempts: u32,
    jitter: Duration,
) -> Duration {
    let factor = 1u32 << attempts.min(MAX_SHIFT);
    let exponential = base.saturating_mul(factor);
    exponential.min(max).saturating_add(jitter.min(MAX_JITTER))
}
