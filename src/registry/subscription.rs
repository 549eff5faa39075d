//! Subscription descriptors and the caller-facing disposer.

use crate::transport::{EventBinding, MessageCallback};
use crate::types::{ChangeEventKind, ChannelMessage, PresenceState, SubscriptionId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Callback invoked with the full presence state after a sync.
pub type PresenceSyncCallback = Arc<dyn Fn(&PresenceState) + Send + Sync>;

/// Callback invoked with (presence key, metas) on join/leave.
pub type PresenceDiffCallback = Arc<dyn Fn(&str, &[serde_json::Value]) + Send + Sync>;

/// A caller's interest in row-change events.
#[derive(Clone)]
pub struct ChangeInterest {
    pub event: ChangeEventKind,
    pub schema: Option<String>,
    pub table: Option<String>,
    /// Server-side filter expression, opaque to the client.
    pub filter: Option<String>,
    pub callback: MessageCallback,
}

impl ChangeInterest {
    pub fn new(event: ChangeEventKind, callback: MessageCallback) -> Self {
        Self {
            event,
            schema: None,
            table: None,
            filter: None,
            callback,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

impl fmt::Debug for ChangeInterest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeInterest")
            .field("event", &self.event)
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// A caller's interest in presence events. All handlers are optional.
#[derive(Clone, Default)]
pub struct PresenceCallbacks {
    pub on_sync: Option<PresenceSyncCallback>,
    pub on_join: Option<PresenceDiffCallback>,
    pub on_leave: Option<PresenceDiffCallback>,
}

impl fmt::Debug for PresenceCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceCallbacks")
            .field("on_sync", &self.on_sync.is_some())
            .field("on_join", &self.on_join.is_some())
            .field("on_leave", &self.on_leave.is_some())
            .finish()
    }
}

/// One registered interest within a channel.
///
/// Descriptors are stored per key and replayed verbatim onto any freshly
/// created transport handle for that key; they disappear only through
/// explicit disposal.
#[derive(Clone)]
pub enum SubscriptionDescriptor {
    Changes(ChangeInterest),
    Presence(PresenceCallbacks),
    Broadcast {
        event: String,
        callback: MessageCallback,
    },
}

impl SubscriptionDescriptor {
    /// The transport binding this descriptor registers.
    pub fn binding(&self) -> EventBinding {
        match self {
            SubscriptionDescriptor::Changes(interest) => EventBinding::Changes {
                event: interest.event,
                schema: interest.schema.clone(),
                table: interest.table.clone(),
                filter: interest.filter.clone(),
            },
            SubscriptionDescriptor::Presence(_) => EventBinding::Presence,
            SubscriptionDescriptor::Broadcast { event, .. } => EventBinding::Broadcast {
                event: event.clone(),
            },
        }
    }

    /// The single message callback attached to the handle.
    ///
    /// Presence handlers are adapted here so the transport sees one uniform
    /// callback shape regardless of descriptor kind.
    pub fn callback(&self) -> MessageCallback {
        match self {
            SubscriptionDescriptor::Changes(interest) => interest.callback.clone(),
            SubscriptionDescriptor::Broadcast { callback, .. } => callback.clone(),
            SubscriptionDescriptor::Presence(callbacks) => {
                let callbacks = callbacks.clone();
                Arc::new(move |message: &ChannelMessage| match message {
                    ChannelMessage::PresenceSync { state } => {
                        if let Some(on_sync) = &callbacks.on_sync {
                            on_sync(state);
                        }
                    }
                    ChannelMessage::PresenceJoin { key, joins } => {
                        if let Some(on_join) = &callbacks.on_join {
                            on_join(key, joins);
                        }
                    }
                    ChannelMessage::PresenceLeave { key, leaves } => {
                        if let Some(on_leave) = &callbacks.on_leave {
                            on_leave(key, leaves);
                        }
                    }
                    _ => {}
                })
            }
        }
    }
}

impl fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionDescriptor::Changes(interest) => {
                f.debug_tuple("Changes").field(interest).finish()
            }
            SubscriptionDescriptor::Presence(callbacks) => {
                f.debug_tuple("Presence").field(callbacks).finish()
            }
            SubscriptionDescriptor::Broadcast { event, .. } => f
                .debug_struct("Broadcast")
                .field("event", event)
                .finish_non_exhaustive(),
        }
    }
}

/// Disposer returned from every subscribe call.
///
/// Disposing removes the descriptor from the bookkeeping map and from the
/// live transport handle, then decrements the channel's reference count.
/// Idempotent. Dropping the guard without calling [`dispose`] leaves the
/// subscription alive: the caller owns the lifecycle explicitly.
///
/// [`dispose`]: SubscriptionGuard::dispose
pub struct SubscriptionGuard {
    key: String,
    id: SubscriptionId,
    disposer: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SubscriptionGuard {
    pub(crate) fn new(
        key: String,
        id: SubscriptionId,
        disposer: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            key,
            id,
            disposer: Mutex::new(Some(disposer)),
        }
    }

    /// The channel key this subscription is attached to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The registry-wide subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the subscription. Returns false if already disposed.
    pub fn dispose(&self) -> bool {
        match self.disposer.lock().take() {
            Some(disposer) => {
                disposer();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("disposed", &self.disposer.lock().is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_change_descriptor_binding() {
        let interest = ChangeInterest::new(ChangeEventKind::Insert, Arc::new(|_| {}))
            .with_schema("public")
            .with_table("rows")
            .with_filter("id=eq.1");
        let binding = SubscriptionDescriptor::Changes(interest).binding();
        assert_eq!(
            binding,
            EventBinding::Changes {
                event: ChangeEventKind::Insert,
                schema: Some("public".into()),
                table: Some("rows".into()),
                filter: Some("id=eq.1".into()),
            }
        );
    }

    #[test]
    fn test_presence_adapter_routes_by_variant() {
        let syncs = Arc::new(AtomicUsize::new(0));
        let joins = Arc::new(AtomicUsize::new(0));

        let callbacks = PresenceCallbacks {
            on_sync: Some({
                let syncs = Arc::clone(&syncs);
                Arc::new(move |_| {
                    syncs.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_join: Some({
                let joins = Arc::clone(&joins);
                Arc::new(move |_, _| {
                    joins.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_leave: None,
        };

        let adapted = SubscriptionDescriptor::Presence(callbacks).callback();
        adapted(&ChannelMessage::PresenceSync {
            state: HashMap::new(),
        });
        adapted(&ChannelMessage::PresenceJoin {
            key: "user-1".into(),
            joins: vec![json!({"cursor": 0})],
        });
        // Leave handler absent: must be a no-op, not a panic.
        adapted(&ChannelMessage::PresenceLeave {
            key: "user-1".into(),
            leaves: vec![],
        });
        // Non-presence messages are ignored by the adapter.
        adapted(&ChannelMessage::Broadcast {
            event: "ping".into(),
            payload: json!(null),
        });

        assert_eq!(syncs.load(Ordering::SeqCst), 1);
        assert_eq!(joins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_dispose_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let guard = SubscriptionGuard::new(
            "rows:db42".into(),
            SubscriptionId(7),
            Box::new({
                let calls = Arc::clone(&calls);
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        assert!(guard.dispose());
        assert!(!guard.dispose());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
