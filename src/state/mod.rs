//! Connection state machine and reconnect backoff.

mod backoff;
mod machine;

pub use backoff::{reconnect_delay, reconnect_delay_with_jitter, MAX_JITTER};
pub use machine::{transition, ChannelContext, ChannelState, ProtocolEvent};
