//! Channel registry: multiplexes subscriptions onto supervised transport
//! handles.

mod config;
mod manager;
mod subscription;

pub use config::{ChannelConfig, RegistryConfig};
pub use manager::{ChannelManager, RegistryStats};
pub use subscription::{
    ChangeInterest, PresenceCallbacks, PresenceDiffCallback, PresenceSyncCallback,
    SubscriptionDescriptor, SubscriptionGuard,
};
