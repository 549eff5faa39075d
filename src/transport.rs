//! Transport abstraction the registry drives.
//!
//! The registry never talks to a socket directly. It consumes a
//! [`Transport`] factory that opens one [`TransportHandle`] per channel key,
//! registers event interest and a status callback on the handle, and closes
//! it on teardown. Handles are replaced wholesale on reconnect; the registry
//! treats them as opaque.

use crate::error::Result;
use crate::types::{ChangeEventKind, ChannelMessage, SubscriptionId};
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked with each matching incoming event.
pub type MessageCallback = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

/// Callback invoked with asynchronous connection status updates.
pub type StatusCallback = Box<dyn Fn(TransportStatus) + Send + Sync>;

/// Connection status reported asynchronously by the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    /// Handshake completed; the handle is live.
    Subscribed,
    /// Handshake or rejoin timed out.
    TimedOut,
    /// The connection dropped.
    Closed,
    /// The remote end reported a channel-level error.
    ChannelError(String),
    /// The transport re-established the connection on its own.
    Reopened,
}

/// Options passed to [`Transport::open`].
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// How long the transport should wait for the handshake.
    pub connect_timeout: Duration,
}

/// A caller's registered interest on a handle.
///
/// The `filter` string on change bindings is evaluated by the remote
/// service; locally it is opaque. [`EventBinding::matches`] checks only the
/// parts that can be decided client-side (kind, schema, table, event name).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventBinding {
    /// Row-change events, optionally narrowed by schema/table/filter.
    Changes {
        event: ChangeEventKind,
        schema: Option<String>,
        table: Option<String>,
        filter: Option<String>,
    },
    /// Presence sync/join/leave events.
    Presence,
    /// Broadcast pings with a specific event name.
    Broadcast { event: String },
}

impl EventBinding {
    /// Whether an incoming message falls under this binding.
    pub fn matches(&self, message: &ChannelMessage) -> bool {
        match self {
            EventBinding::Changes {
                event,
                schema,
                table,
                ..
            } => {
                let Some(kind) = message.change_kind() else {
                    return false;
                };
                if !event.matches(kind) {
                    return false;
                }
                let change = match message {
                    ChannelMessage::ChangeInsert { change }
                    | ChannelMessage::ChangeUpdate { change }
                    | ChannelMessage::ChangeDelete { change } => change,
                    _ => unreachable!("change_kind() returned Some"),
                };
                if let Some(schema) = schema {
                    if schema != &change.schema {
                        return false;
                    }
                }
                if let Some(table) = table {
                    if table != &change.table {
                        return false;
                    }
                }
                true
            }
            EventBinding::Presence => message.is_presence(),
            EventBinding::Broadcast { event } => {
                matches!(message, ChannelMessage::Broadcast { event: e, .. } if e == event)
            }
        }
    }
}

/// Message pushed from the client to the remote service.
#[derive(Clone, Debug)]
pub enum OutboundMessage {
    /// Lightweight keep-alive.
    Heartbeat,
    /// Application broadcast relayed to other subscribers of the channel.
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
}

/// One live connection instance for a channel key.
pub trait TransportHandle: Send + Sync {
    /// Register interest. May be called many times per handle; `id` is used
    /// to remove the interest again with [`TransportHandle::off`].
    fn on(&self, id: SubscriptionId, binding: &EventBinding, callback: MessageCallback);

    /// Remove a previously registered interest. Unknown ids are a no-op.
    fn off(&self, id: SubscriptionId);

    /// Arm status tracking. The callback may fire from the transport's own
    /// thread at any time until the handle is closed.
    fn track_status(&self, callback: StatusCallback);

    /// Push a message to the remote service.
    fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Release the underlying connection. Idempotent.
    fn close(&self);
}

/// Factory for transport handles, keyed by channel name.
pub trait Transport: Send + Sync {
    fn open(&self, key: &str, options: &TransportOptions) -> Result<Arc<dyn TransportHandle>>;
}
