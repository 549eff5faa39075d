//! Scripted in-memory transport shared by the integration tests.

#![allow(dead_code)]

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use realtime_channels::{
    ChannelError, ChannelMessage, EventBinding, MessageCallback, OutboundMessage, Result,
    StatusCallback, SubscriptionId, Transport, TransportHandle, TransportOptions, TransportStatus,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One scripted connection instance. Tests drive it by hand: emit status
/// transitions with [`emit_status`], push events with [`deliver`].
///
/// [`emit_status`]: MockHandle::emit_status
/// [`deliver`]: MockHandle::deliver
pub struct MockHandle {
    pub key: String,
    bindings: Mutex<HashMap<SubscriptionId, (EventBinding, MessageCallback)>>,
    status: Mutex<Option<StatusCallback>>,
    pub sent: Mutex<Vec<OutboundMessage>>,
    closed: AtomicBool,
}

impl TransportHandle for MockHandle {
    fn on(&self, id: SubscriptionId, binding: &EventBinding, callback: MessageCallback) {
        self.bindings.lock().insert(id, (binding.clone(), callback));
    }

    fn off(&self, id: SubscriptionId) {
        self.bindings.lock().remove(&id);
    }

    fn track_status(&self, callback: StatusCallback) {
        *self.status.lock() = Some(callback);
    }

    fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Transport("handle closed".into()));
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl MockHandle {
    /// Push a status update through the registered status callback, as the
    /// real transport would from its own thread.
    pub fn emit_status(&self, status: TransportStatus) {
        let guard = self.status.lock();
        if let Some(callback) = guard.as_ref() {
            callback(status);
        }
    }

    /// Dispatch a message to every matching binding. Returns the number of
    /// callbacks invoked.
    pub fn deliver(&self, message: &ChannelMessage) -> usize {
        let matching: Vec<MessageCallback> = self
            .bindings
            .lock()
            .values()
            .filter(|(binding, _)| binding.matches(message))
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in &matching {
            callback(message);
        }
        matching.len()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.lock().len()
    }

    /// Whether the registry has armed status tracking on this handle yet.
    pub fn has_status(&self) -> bool {
        self.status.lock().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| matches!(m, OutboundMessage::Heartbeat))
            .count()
    }
}

/// Handle factory recording every open, with scriptable failures and an
/// optional gate that parks an open call mid-flight.
#[derive(Default)]
pub struct MockTransport {
    handles: Mutex<Vec<Arc<MockHandle>>>,
    fail_next_opens: AtomicUsize,
    opens_started: AtomicUsize,
    open_gate: Mutex<Option<Receiver<()>>>,
}

impl Transport for MockTransport {
    fn open(&self, key: &str, _options: &TransportOptions) -> Result<Arc<dyn TransportHandle>> {
        self.opens_started.fetch_add(1, Ordering::SeqCst);
        let gate = self.open_gate.lock().take();
        if let Some(gate) = gate {
            // Parked until the test drops its sender.
            let _ = gate.recv();
        }
        if self.fail_next_opens.load(Ordering::SeqCst) > 0 {
            self.fail_next_opens.fetch_sub(1, Ordering::SeqCst);
            return Err(ChannelError::Transport("connection refused".into()));
        }
        let handle = Arc::new(MockHandle {
            key: key.to_string(),
            bindings: Mutex::new(HashMap::new()),
            status: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.handles.lock().push(Arc::clone(&handle));
        Ok(handle)
    }
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        // Registry tracing goes to the per-test capture; visible with
        // `cargo test -- --nocapture` on failure.
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Arc::new(Self::default())
    }

    /// Fail the next `n` open calls with a transport error.
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_next_opens.store(n, Ordering::SeqCst);
    }

    /// Park the next open call until the returned sender is dropped. Lets a
    /// test interleave registry calls with an in-flight reconnect.
    pub fn hold_next_open(&self) -> Sender<()> {
        let (tx, rx) = bounded(1);
        *self.open_gate.lock() = Some(rx);
        tx
    }

    /// Open calls entered so far, including parked and failed ones.
    pub fn opens_started(&self) -> usize {
        self.opens_started.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// The most recently opened handle.
    pub fn latest(&self) -> Arc<MockHandle> {
        Arc::clone(self.handles.lock().last().expect("no handle opened yet"))
    }

    /// The most recently opened handle for a specific key.
    pub fn latest_for(&self, key: &str) -> Arc<MockHandle> {
        self.handles
            .lock()
            .iter()
            .rev()
            .find(|h| h.key == key)
            .map(Arc::clone)
            .unwrap_or_else(|| panic!("no handle opened for {key}"))
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
