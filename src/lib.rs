//! # Realtime Channels
//!
//! A client-side registry for long-lived subscriptions to a remote
//! change-notification service (row changes, presence, broadcast pings).
//!
//! ## Core Concepts
//!
//! - **Channels**: named, multiplexed logical connections, one transport
//!   handle per key, shared by every overlapping interest
//! - **State machine**: a pure transition function supervises each
//!   connection (backoff with jitter, capped retries, terminal error state)
//! - **Replay**: stored subscriptions are re-attached to freshly created
//!   handles after reconnection, so callers never resubscribe by hand
//! - **Grace window**: channels linger briefly at zero subscribers to
//!   absorb rapid unsubscribe/resubscribe churn
//!
//! ## Example
//!
//! ```ignore
//! use realtime_channels::{
//!     ChangeEventKind, ChangeInterest, ChannelConfig, ChannelManager,
//! };
//! use std::sync::Arc;
//!
//! let manager = ChannelManager::new(transport);
//!
//! let subscription = manager.subscribe_to_changes(
//!     "rows:db42",
//!     ChangeInterest::new(ChangeEventKind::All, Arc::new(|msg| {
//!         println!("change: {msg:?}");
//!     }))
//!     .with_table("rows"),
//!     ChannelConfig::default(),
//! )?;
//!
//! // ... later
//! subscription.dispose();
//! ```

pub mod error;
pub mod registry;
pub mod state;
pub mod transport;
pub mod types;

// Re-exports
pub use error::{ChannelError, Result};
pub use registry::{
    ChangeInterest, ChannelConfig, ChannelManager, PresenceCallbacks, PresenceDiffCallback,
    PresenceSyncCallback, RegistryConfig, RegistryStats, SubscriptionDescriptor, SubscriptionGuard,
};
pub use state::{
    reconnect_delay, reconnect_delay_with_jitter, transition, ChannelContext, ChannelState,
    ProtocolEvent, MAX_JITTER,
};
pub use transport::{
    EventBinding, MessageCallback, OutboundMessage, StatusCallback, Transport, TransportHandle,
    TransportOptions, TransportStatus,
};
pub use types::*;
