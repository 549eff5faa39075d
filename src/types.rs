//! Core types for channels and the events they deliver.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier for a subscription within the registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generation counter for transport handles.
///
/// Every handle created for a key gets the next epoch. Status callbacks
/// carry the epoch of the handle that produced them, so a late callback
/// from a superseded handle can be told apart from the live one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HandleEpoch(pub u64);

impl HandleEpoch {
    pub fn next(self) -> Self {
        HandleEpoch(self.0 + 1)
    }
}

impl fmt::Debug for HandleEpoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Epoch({})", self.0)
    }
}

/// Row-change kinds a change subscription can filter on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeEventKind {
    Insert,
    Update,
    Delete,
    /// Matches any of the above.
    All,
}

impl ChangeEventKind {
    /// Whether a subscription filtered on `self` wants an event of `kind`.
    pub fn matches(self, kind: ChangeEventKind) -> bool {
        self == ChangeEventKind::All || self == kind
    }
}

/// A single row-change notification from the remote store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangePayload {
    pub schema: String,
    pub table: String,
    /// Commit timestamp as reported by the transport, if any.
    pub commit_timestamp: Option<String>,
    /// Row contents after the change (inserts and updates).
    pub new: Option<serde_json::Value>,
    /// Row contents before the change (updates and deletes).
    pub old: Option<serde_json::Value>,
}

/// Full presence state for a channel: presence key to tracked metas.
pub type PresenceState = HashMap<String, Vec<serde_json::Value>>;

/// Events delivered to subscription callbacks.
///
/// One concrete variant per event kind; payload shapes are fixed per
/// variant rather than dynamically typed.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    // --- Row changes ---
    ChangeInsert { change: ChangePayload },
    ChangeUpdate { change: ChangePayload },
    ChangeDelete { change: ChangePayload },

    // --- Presence ---
    /// Full state replacement after (re)join.
    PresenceSync { state: PresenceState },
    /// One key's metas were added.
    PresenceJoin {
        key: String,
        joins: Vec<serde_json::Value>,
    },
    /// One key's metas went away.
    PresenceLeave {
        key: String,
        leaves: Vec<serde_json::Value>,
    },

    // --- Broadcast ---
    /// Application-level ping relayed through the channel.
    Broadcast {
        event: String,
        payload: serde_json::Value,
    },
}

impl ChannelMessage {
    /// The change kind of this message, if it is a row change.
    pub fn change_kind(&self) -> Option<ChangeEventKind> {
        match self {
            ChannelMessage::ChangeInsert { .. } => Some(ChangeEventKind::Insert),
            ChannelMessage::ChangeUpdate { .. } => Some(ChangeEventKind::Update),
            ChannelMessage::ChangeDelete { .. } => Some(ChangeEventKind::Delete),
            _ => None,
        }
    }

    /// Whether this is a presence event.
    pub fn is_presence(&self) -> bool {
        matches!(
            self,
            ChannelMessage::PresenceSync { .. }
                | ChannelMessage::PresenceJoin { .. }
                | ChannelMessage::PresenceLeave { .. }
        )
    }
}
