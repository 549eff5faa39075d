//! Channel manager: the only stateful, side-effecting component.
//!
//! One transport handle is owned per channel key. Transport status callbacks
//! and timer firings all funnel through [`Inner::apply_event`], which runs
//! the pure state machine under the registry lock and acts on the observed
//! transition. Transport calls (open/close/send) happen outside the lock so
//! a reentrant transport cannot deadlock the registry.

use crate::error::{ChannelError, Result};
use crate::registry::config::{ChannelConfig, RegistryConfig};
use crate::registry::subscription::{
    ChangeInterest, PresenceCallbacks, SubscriptionDescriptor, SubscriptionGuard,
};
use crate::state::{
    reconnect_delay, transition, ChannelContext, ChannelState, ProtocolEvent,
};
use crate::transport::{
    EventBinding, MessageCallback, OutboundMessage, Transport, TransportHandle, TransportOptions,
    TransportStatus,
};
use crate::types::{HandleEpoch, SubscriptionId};
use crossbeam_channel::{after, bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Cancels its timer thread when dropped.
struct TimerGuard {
    _cancel: Sender<()>,
}

impl TimerGuard {
    /// Pairs a guard with the receiver its timer thread selects on.
    fn new() -> (Self, crossbeam_channel::Receiver<()>) {
        let (tx, rx) = bounded(1);
        (Self { _cancel: tx }, rx)
    }
}

/// Per-key bookkeeping, owned exclusively by the manager.
struct ChannelInfo {
    key: String,
    handle: Arc<dyn TransportHandle>,
    epoch: HandleEpoch,
    state: ChannelState,
    context: ChannelContext,
    /// Number of live callers; drives the lifecycle.
    subscribe_count: usize,
    created_at: Instant,
    last_activity: Instant,
    config: ChannelConfig,
    subscriptions: HashMap<SubscriptionId, SubscriptionDescriptor>,
    reconnect_timer: Option<TimerGuard>,
    heartbeat_timer: Option<TimerGuard>,
    grace_timer: Option<TimerGuard>,
}

impl ChannelInfo {
    fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            connect_timeout: self.config.connect_timeout,
        }
    }
}

/// Registry-wide diagnostics snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub channels: usize,
    pub subscriptions: usize,
    pub connected: usize,
    pub recovering: usize,
    pub errored: usize,
}

/// Supervises one multiplexed channel per key.
///
/// Cheap to clone; clones share the same registry. Construct one per
/// process and hand it to whoever needs channels — there is no hidden
/// global instance.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: RegistryConfig,
    channels: Mutex<HashMap<String, ChannelInfo>>,
    next_subscription_id: AtomicU64,
}

impl ChannelManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_config(transport, RegistryConfig::default())
    }

    pub fn with_config(transport: Arc<dyn Transport>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                channels: Mutex::new(HashMap::new()),
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }

    /// Return the handle for `key`, creating the channel if needed.
    ///
    /// Increments the channel's reference count either way. `config` is
    /// applied only on first creation for the key (first-writer-wins);
    /// subsequent calls with a different config are ignored.
    ///
    /// Most callers want [`subscribe_to_changes`] or
    /// [`subscribe_to_presence`] instead, which pair the increment with a
    /// disposer.
    ///
    /// [`subscribe_to_changes`]: ChannelManager::subscribe_to_changes
    /// [`subscribe_to_presence`]: ChannelManager::subscribe_to_presence
    pub fn get_channel(
        &self,
        key: &str,
        config: ChannelConfig,
    ) -> Result<Arc<dyn TransportHandle>> {
        self.inner.get_channel(key, config)
    }

    /// Subscribe to row-change events on `key`.
    ///
    /// Creates and connects the channel if needed. The returned guard is the
    /// only way to end the subscription.
    pub fn subscribe_to_changes(
        &self,
        key: &str,
        interest: ChangeInterest,
        config: ChannelConfig,
    ) -> Result<SubscriptionGuard> {
        self.inner
            .subscribe(key, SubscriptionDescriptor::Changes(interest), config)
    }

    /// Subscribe to presence sync/join/leave events on `key`.
    pub fn subscribe_to_presence(
        &self,
        key: &str,
        callbacks: PresenceCallbacks,
        config: ChannelConfig,
    ) -> Result<SubscriptionGuard> {
        self.inner
            .subscribe(key, SubscriptionDescriptor::Presence(callbacks), config)
    }

    /// Subscribe to broadcast pings named `event` on `key`.
    pub fn subscribe_to_broadcast(
        &self,
        key: &str,
        event: impl Into<String>,
        callback: MessageCallback,
        config: ChannelConfig,
    ) -> Result<SubscriptionGuard> {
        self.inner.subscribe(
            key,
            SubscriptionDescriptor::Broadcast {
                event: event.into(),
                callback,
            },
            config,
        )
    }

    /// Push a broadcast message to other subscribers of `key`.
    ///
    /// Requires an existing, connected channel.
    pub fn send_broadcast(
        &self,
        key: &str,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.inner.send_broadcast(key, event.into(), payload)
    }

    /// Current state of a channel, or `None` if the key is unknown.
    pub fn channel_state(&self, key: &str) -> Option<ChannelState> {
        self.inner.channels.lock().get(key).map(|info| info.state)
    }

    /// Most recent failure reason recorded for a channel.
    pub fn last_error(&self, key: &str) -> Option<String> {
        self.inner
            .channels
            .lock()
            .get(key)
            .and_then(|info| info.context.last_error.clone())
    }

    /// Explicitly retry a channel stuck in the terminal `Error` state.
    ///
    /// Returns false if the key is unknown or the channel is not errored.
    pub fn reconnect_channel(&self, key: &str) -> bool {
        self.inner.reconnect_channel(key)
    }

    /// Force immediate teardown of a channel. Idempotent; returns false if
    /// the key is unknown.
    pub fn remove_channel(&self, key: &str) -> bool {
        self.inner.remove_channel(key)
    }

    /// Immediately remove every channel with no subscribers, bypassing the
    /// grace window. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        self.inner.cleanup()
    }

    /// Tear down every channel. Used at process shutdown.
    pub fn destroy_all(&self) {
        self.inner.destroy_all();
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn stats(&self) -> RegistryStats {
        let channels = self.inner.channels.lock();
        let mut stats = RegistryStats {
            channels: channels.len(),
            ..Default::default()
        };
        for info in channels.values() {
            stats.subscriptions += info.subscriptions.len();
            match info.state {
                ChannelState::Connected => stats.connected += 1,
                ChannelState::Connecting | ChannelState::Reconnecting => stats.recovering += 1,
                ChannelState::Error => stats.errored += 1,
                _ => {}
            }
        }
        stats
    }
}

/// Map a transport status onto its protocol event.
fn protocol_event(status: TransportStatus) -> ProtocolEvent {
    match status {
        TransportStatus::Subscribed => ProtocolEvent::ConnectionSuccess,
        TransportStatus::TimedOut => ProtocolEvent::ConnectionFailed {
            reason: "handshake timed out".to_string(),
        },
        TransportStatus::Closed => ProtocolEvent::Disconnect,
        TransportStatus::ChannelError(reason) => ProtocolEvent::Error { reason },
        TransportStatus::Reopened => ProtocolEvent::Connect,
    }
}

impl Inner {
    fn get_channel(
        self: &Arc<Self>,
        key: &str,
        config: ChannelConfig,
    ) -> Result<Arc<dyn TransportHandle>> {
        if let Some(handle) = self.retain_existing(key) {
            return Ok(handle);
        }

        // Open outside the lock; a reentrant transport must not observe the
        // registry mid-insert.
        let options = TransportOptions {
            connect_timeout: config.connect_timeout,
        };
        let handle = self.transport.open(key, &options)?;

        let outcome = {
            let mut channels = self.channels.lock();
            match channels.entry(key.to_string()) {
                Entry::Occupied(mut entry) => {
                    // Lost a creation race; adopt the winner's handle.
                    let info = entry.get_mut();
                    info.subscribe_count += 1;
                    info.last_activity = Instant::now();
                    info.grace_timer = None;
                    Err(Arc::clone(&info.handle))
                }
                Entry::Vacant(entry) => {
                    let now = Instant::now();
                    let context = ChannelContext::new(
                        config.max_reconnect_attempts,
                        config.base_delay,
                        config.max_delay,
                        config.auto_reconnect,
                    );
                    entry.insert(ChannelInfo {
                        key: key.to_string(),
                        handle: Arc::clone(&handle),
                        epoch: HandleEpoch(1),
                        state: ChannelState::Idle,
                        context,
                        subscribe_count: 1,
                        created_at: now,
                        last_activity: now,
                        config,
                        subscriptions: HashMap::new(),
                        reconnect_timer: None,
                        heartbeat_timer: None,
                        grace_timer: None,
                    });
                    Ok(())
                }
            }
        };

        match outcome {
            Ok(()) => {
                debug!(key, "channel created");
                self.arm_status(&handle, key, HandleEpoch(1));
                Ok(handle)
            }
            Err(existing) => {
                handle.close();
                Ok(existing)
            }
        }
    }

    /// Fast path: bump the refcount on an existing channel.
    fn retain_existing(&self, key: &str) -> Option<Arc<dyn TransportHandle>> {
        let mut channels = self.channels.lock();
        let info = channels.get_mut(key)?;
        info.subscribe_count += 1;
        info.last_activity = Instant::now();
        // A pending grace teardown is implicitly cancelled.
        info.grace_timer = None;
        Some(Arc::clone(&info.handle))
    }

    fn subscribe(
        self: &Arc<Self>,
        key: &str,
        descriptor: SubscriptionDescriptor,
        config: ChannelConfig,
    ) -> Result<SubscriptionGuard> {
        self.get_channel(key, config)?;
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst));
        let binding = descriptor.binding();
        let callback = descriptor.callback();

        // Attach to the handle current at insert time, not the one
        // get_channel returned: a reconnect may swap the handle in between,
        // and its replay snapshot would not include this descriptor yet.
        let (handle, needs_connect) = {
            let mut channels = self.channels.lock();
            let Some(info) = channels.get_mut(key) else {
                // Torn down between get_channel and here; benign race.
                return Err(ChannelError::UnknownChannel(key.to_string()));
            };
            info.subscriptions.insert(id, descriptor);
            (
                Arc::clone(&info.handle),
                matches!(info.state, ChannelState::Idle | ChannelState::Closed),
            )
        };

        handle.on(id, &binding, callback);
        if needs_connect {
            self.apply_event(key, ProtocolEvent::Connect, None);
        }

        let weak = Arc::downgrade(self);
        let owned_key = key.to_string();
        Ok(SubscriptionGuard::new(
            key.to_string(),
            id,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.unsubscribe(&owned_key, id);
                }
            }),
        ))
    }

    fn unsubscribe(self: &Arc<Self>, key: &str, id: SubscriptionId) {
        let handle = {
            let mut channels = self.channels.lock();
            let Some(info) = channels.get_mut(key) else {
                return;
            };
            info.subscriptions.remove(&id);
            info.subscribe_count = info.subscribe_count.saturating_sub(1);
            info.last_activity = Instant::now();
            if info.subscribe_count == 0 {
                self.arm_grace_locked(info);
            }
            Arc::clone(&info.handle)
        };
        // Detach from the live handle so the callback cannot fire again,
        // even if a reconnect replay is in flight.
        handle.off(id);
        debug!(key, %id, "subscription disposed");
    }

    fn send_broadcast(&self, key: &str, event: String, payload: serde_json::Value) -> Result<()> {
        let (handle, state) = {
            let channels = self.channels.lock();
            let info = channels
                .get(key)
                .ok_or_else(|| ChannelError::UnknownChannel(key.to_string()))?;
            (Arc::clone(&info.handle), info.state)
        };
        if state != ChannelState::Connected {
            return Err(ChannelError::NotConnected {
                key: key.to_string(),
                state,
            });
        }
        handle.send(OutboundMessage::Broadcast { event, payload })
    }

    fn remove_channel(&self, key: &str) -> bool {
        let removed = self.channels.lock().remove(key);
        match removed {
            Some(info) => {
                // Dropping the info cancels all of its timers.
                debug!(
                    key,
                    state = ?info.state,
                    uptime = ?info.created_at.elapsed(),
                    "channel removed"
                );
                info.handle.close();
                true
            }
            None => false,
        }
    }

    fn cleanup(&self) -> usize {
        let removed: Vec<ChannelInfo> = {
            let mut channels = self.channels.lock();
            let dead: Vec<String> = channels
                .iter()
                .filter(|(_, info)| info.subscribe_count == 0)
                .map(|(key, _)| key.clone())
                .collect();
            dead.into_iter()
                .filter_map(|key| channels.remove(&key))
                .collect()
        };
        for info in &removed {
            debug!(
                key = %info.key,
                idle = ?info.last_activity.elapsed(),
                "channel cleaned up"
            );
            info.handle.close();
        }
        removed.len()
    }

    fn destroy_all(&self) {
        let drained: Vec<ChannelInfo> = {
            let mut channels = self.channels.lock();
            channels.drain().map(|(_, info)| info).collect()
        };
        for info in &drained {
            info.handle.close();
        }
        debug!(count = drained.len(), "registry destroyed");
    }

    fn reconnect_channel(self: &Arc<Self>, key: &str) -> bool {
        let errored = {
            let channels = self.channels.lock();
            match channels.get(key) {
                None => return false,
                Some(info) => info.state == ChannelState::Error,
            }
        };
        if !errored {
            return false;
        }

        self.apply_event(key, ProtocolEvent::Reconnect, None);

        // The dead handle is replaced immediately; no backoff on an
        // explicit caller request.
        let pending = {
            let channels = self.channels.lock();
            channels
                .get(key)
                .filter(|info| info.state == ChannelState::Connecting)
                .map(|info| (info.transport_options(), info.epoch))
        };
        if let Some((options, epoch)) = pending {
            self.reattach(key, epoch, options, ChannelState::Connecting);
        }
        true
    }

    // --- Event funnel ---

    /// Run one event through a channel's state machine and act on the
    /// transition. `epoch` filters out callbacks from superseded handles.
    fn apply_event(self: &Arc<Self>, key: &str, event: ProtocolEvent, epoch: Option<HandleEpoch>) {
        let mut channels = self.channels.lock();
        let Some(info) = channels.get_mut(key) else {
            trace!(key, ?event, "event for unknown channel ignored");
            return;
        };
        if let Some(epoch) = epoch {
            if epoch != info.epoch {
                trace!(key, ?epoch, current = ?info.epoch, "stale handle event ignored");
                return;
            }
        }

        let prev = info.state;
        let (next, context) = transition(prev, &info.context, &event);
        info.state = next;
        info.context = context;
        info.last_activity = Instant::now();

        if next != prev {
            debug!(key, ?prev, ?next, ?event, "channel transition");
        }

        // Side effects, keyed on the observed transition.
        if prev == ChannelState::Connected && next != ChannelState::Connected {
            info.heartbeat_timer = None;
        }
        match next {
            ChannelState::Reconnecting
                if matches!(
                    event,
                    ProtocolEvent::Disconnect
                        | ProtocolEvent::ConnectionFailed { .. }
                        | ProtocolEvent::Error { .. }
                ) =>
            {
                self.schedule_reconnect_locked(info);
            }
            ChannelState::Connected if prev != ChannelState::Connected => {
                self.start_heartbeat_locked(info);
            }
            ChannelState::Error if prev != ChannelState::Error => {
                info.reconnect_timer = None;
                info.heartbeat_timer = None;
                warn!(
                    key,
                    last_error = info.context.last_error.as_deref().unwrap_or("unknown"),
                    attempts = info.context.reconnect_attempts,
                    "channel degraded to terminal error state"
                );
            }
            _ => {}
        }
    }

    /// Arm status tracking on a handle. Events are tagged with the handle's
    /// epoch so the funnel can discard them once the handle is replaced.
    fn arm_status(self: &Arc<Self>, handle: &Arc<dyn TransportHandle>, key: &str, epoch: HandleEpoch) {
        let weak = Arc::downgrade(self);
        let key = key.to_string();
        handle.track_status(Box::new(move |status| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_event(&key, protocol_event(status), Some(epoch));
            }
        }));
    }

    // --- Timers ---

    /// Schedule the next reconnect attempt for a channel in `Reconnecting`.
    /// Replaces (and thereby cancels) any previously scheduled attempt.
    fn schedule_reconnect_locked(self: &Arc<Self>, info: &mut ChannelInfo) {
        let delay = reconnect_delay(&info.context);
        let (guard, cancel) = TimerGuard::new();
        info.reconnect_timer = Some(guard);

        let weak = Arc::downgrade(self);
        let key = info.key.clone();
        let epoch = info.epoch;
        debug!(key = %info.key, ?delay, attempt = info.context.reconnect_attempts, "reconnect scheduled");
        thread::spawn(move || {
            select! {
                recv(after(delay)) -> _ => Inner::reconnect_fire(&weak, &key, epoch),
                recv(cancel) -> _ => {}
            }
        });
    }

    fn reconnect_fire(weak: &Weak<Inner>, key: &str, expected_epoch: HandleEpoch) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let options = {
            let mut channels = inner.channels.lock();
            let Some(info) = channels.get_mut(key) else {
                return;
            };
            if info.epoch != expected_epoch || info.state != ChannelState::Reconnecting {
                trace!(key, "reconnect timer superseded");
                return;
            }
            if info.subscribe_count == 0 {
                trace!(key, "reconnect abandoned, no subscribers left");
                return;
            }
            info.reconnect_timer = None;
            info.transport_options()
        };
        inner.reattach(key, expected_epoch, options, ChannelState::Reconnecting);
    }

    /// Replace a channel's transport handle and replay every stored
    /// subscription onto the replacement.
    ///
    /// The subscription set is read at fire time, not captured earlier, so
    /// a descriptor disposed during the outage is never re-attached.
    fn reattach(
        self: &Arc<Self>,
        key: &str,
        expected_epoch: HandleEpoch,
        options: TransportOptions,
        required_state: ChannelState,
    ) {
        let new_handle = match self.transport.open(key, &options) {
            Ok(handle) => handle,
            Err(e) => {
                debug!(key, error = %e, "reconnect open failed");
                self.apply_event(
                    key,
                    ProtocolEvent::ConnectionFailed {
                        reason: e.to_string(),
                    },
                    None,
                );
                return;
            }
        };

        enum Outcome {
            Adopted {
                stale: Arc<dyn TransportHandle>,
                epoch: HandleEpoch,
                replays: Vec<(SubscriptionId, EventBinding, MessageCallback)>,
            },
            Superseded,
        }

        let outcome = {
            let mut channels = self.channels.lock();
            match channels.get_mut(key) {
                Some(info)
                    if info.epoch == expected_epoch
                        && info.state == required_state
                        && info.subscribe_count > 0 =>
                {
                    let stale = std::mem::replace(&mut info.handle, Arc::clone(&new_handle));
                    info.epoch = info.epoch.next();
                    let replays = info
                        .subscriptions
                        .iter()
                        .map(|(id, descriptor)| {
                            (*id, descriptor.binding(), descriptor.callback())
                        })
                        .collect();
                    Outcome::Adopted {
                        stale,
                        epoch: info.epoch,
                        replays,
                    }
                }
                _ => Outcome::Superseded,
            }
        };

        match outcome {
            Outcome::Adopted {
                stale,
                epoch,
                replays,
            } => {
                stale.close();
                debug!(key, count = replays.len(), "replaying subscriptions");
                for (id, binding, callback) in replays {
                    new_handle.on(id, &binding, callback);
                }
                self.arm_status(&new_handle, key, epoch);
            }
            Outcome::Superseded => {
                // The channel moved on while we were opening; discard.
                new_handle.close();
            }
        }
    }

    fn start_heartbeat_locked(self: &Arc<Self>, info: &mut ChannelInfo) {
        let (guard, cancel) = TimerGuard::new();
        info.heartbeat_timer = Some(guard);

        let weak = Arc::downgrade(self);
        let key = info.key.clone();
        let epoch = info.epoch;
        let interval = info.config.heartbeat_interval;
        thread::spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        if !Inner::heartbeat_fire(&weak, &key, epoch) {
                            break;
                        }
                    }
                    recv(cancel) -> _ => break,
                }
            }
        });
    }

    /// One heartbeat tick. Returns false when the ticker should stop.
    fn heartbeat_fire(weak: &Weak<Inner>, key: &str, epoch: HandleEpoch) -> bool {
        let Some(inner) = weak.upgrade() else {
            return false;
        };
        let handle = {
            let channels = inner.channels.lock();
            let Some(info) = channels.get(key) else {
                return false;
            };
            if info.epoch != epoch {
                return false;
            }
            if info.state != ChannelState::Connected {
                // Tick raced a state change; not an error.
                trace!(key, state = ?info.state, "heartbeat tick ignored");
                return true;
            }
            Arc::clone(&info.handle)
        };
        if let Err(e) = handle.send(OutboundMessage::Heartbeat) {
            debug!(key, error = %e, "heartbeat send failed");
        }
        true
    }

    /// Defer teardown of a now-unreferenced channel by the grace period.
    fn arm_grace_locked(self: &Arc<Self>, info: &mut ChannelInfo) {
        let (guard, cancel) = TimerGuard::new();
        info.grace_timer = Some(guard);

        let weak = Arc::downgrade(self);
        let key = info.key.clone();
        let delay = self.config.grace_period;
        trace!(key = %info.key, ?delay, "grace window armed");
        thread::spawn(move || {
            select! {
                recv(after(delay)) -> _ => Inner::grace_fire(&weak, &key),
                recv(cancel) -> _ => {}
            }
        });
    }

    fn grace_fire(weak: &Weak<Inner>, key: &str) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let removed = {
            let mut channels = inner.channels.lock();
            match channels.get(key) {
                // A subscriber arrived during the window; keep the channel.
                Some(info) if info.subscribe_count > 0 => None,
                Some(_) => channels.remove(key),
                None => None,
            }
        };
        if let Some(info) = removed {
            debug!(key, "grace window expired, channel torn down");
            info.handle.close();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Timer threads exit on their own once the cancel senders drop with
        // the map; handles still need closing.
        for info in self.channels.get_mut().values() {
            info.handle.close();
        }
    }
}
