//! Push-event hub for live dashboard updates.
//!
//! Fans named JSON events out to many long-lived subscribers. Each subscriber
//! owns a bounded queue; a subscriber whose queue is full simply misses the
//! event, so a slow consumer never blocks the broadcaster or anyone else.

use crate::lock;
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Outbound queue capacity of each subscriber.
pub const CLIENT_QUEUE_CAPACITY: usize = 64;

/// Interval between keepalive frames on an idle subscription.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Event names published on a stack's hub.
pub mod events {
    pub const STACK_STARTING: &str = "stack_starting";
    pub const STACK_STOPPING: &str = "stack_stopping";
    pub const STACK_STARTED: &str = "stack_started";
    pub const STACK_STOPPED: &str = "stack_stopped";
    pub const STACK_ERROR: &str = "stack_error";
    pub const STACK_PROGRESS: &str = "stack_progress";
    pub const STACK_STATUS: &str = "stack_status";
    pub const SERVICES: &str = "services";
    pub const SERVICE_ACTION: &str = "service_action";
    pub const HEALTH: &str = "health";
    pub const LOG: &str = "log";
    pub const DIAGNOSE_STARTED: &str = "diagnose_started";
    pub const DIAGNOSE_STREAM: &str = "diagnose_stream";
    pub const DIAGNOSE_RESULT: &str = "diagnose_result";
    pub const DIAGNOSE_ERROR: &str = "diagnose_error";
    pub const DIAGNOSE_INTERRUPTED: &str = "diagnose_interrupted";
    pub const DIAGNOSE_SESSION_CLOSED: &str = "diagnose_session_closed";
}

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    /// Generate a new unique client ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

/// One named broadcast payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushEvent {
    pub name: String,
    pub data: serde_json::Value,
}

/// What a subscription yields to its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum HubFrame {
    /// Sent once, right after registration.
    Connected { client_id: u64 },
    /// A broadcast event, in publish order.
    Event(PushEvent),
    /// Emitted when nothing else was sent for a keepalive interval.
    KeepAlive,
}

/// A registered subscriber: its queue and its done signal.
#[derive(Debug)]
pub struct PushClient {
    pub id: ClientId,
    rx: mpsc::Receiver<PushEvent>,
    done: CancellationToken,
}

impl PushClient {
    /// Receives the next queued event, or `None` once the client is closed.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        tokio::select! {
            biased;
            () = self.done.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    /// Non-blocking receive, for tests and polling transports.
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.done.is_cancelled()
    }
}

struct ClientHandle {
    tx: mpsc::Sender<PushEvent>,
    done: CancellationToken,
}

struct HubInner {
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
    stopped: CancellationToken,
    capacity: usize,
    keepalive: Duration,
}

/// Hub for managing subscribers and broadcasting events.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    /// Create a new hub with the default queue capacity and keepalive.
    pub fn new() -> Self {
        Self::with_settings(CLIENT_QUEUE_CAPACITY, KEEPALIVE_INTERVAL)
    }

    pub fn with_settings(capacity: usize, keepalive: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                clients: Mutex::new(HashMap::new()),
                stopped: CancellationToken::new(),
                capacity: capacity.max(1),
                keepalive,
            }),
        }
    }

    /// Register a new subscriber.
    ///
    /// Registering on a stopped hub yields an already-closed client.
    pub fn register(&self) -> PushClient {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = ClientId::new();
        let done = self.inner.stopped.child_token();

        if !self.inner.stopped.is_cancelled() {
            lock(&self.inner.clients).insert(
                id,
                ClientHandle {
                    tx,
                    done: done.clone(),
                },
            );
            tracing::debug!(client = id.0, "push client registered");
        }

        PushClient { id, rx, done }
    }

    /// Remove a subscriber. Unknown or already-removed IDs are ignored.
    pub fn unregister(&self, id: ClientId) {
        let removed = lock(&self.inner.clients).remove(&id);
        if let Some(handle) = removed {
            handle.done.cancel();
            tracing::debug!(client = id.0, "push client unregistered");
        }
    }

    /// Broadcast an event to every subscriber without blocking.
    ///
    /// A payload that fails to serialize is logged and dropped. A subscriber
    /// whose queue is full misses this event; others are unaffected.
    pub fn broadcast<T: Serialize + ?Sized>(&self, name: &str, data: &T) {
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(event = name, "Failed to encode push event: {}", e);
                return;
            }
        };
        let event = PushEvent {
            name: name.to_string(),
            data,
        };

        let clients = lock(&self.inner.clients);
        for (id, handle) in clients.iter() {
            match handle.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(client = id.0, event = name, "client queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Broadcast an event with a `null` payload.
    pub fn notify(&self, name: &str) {
        self.broadcast(name, &serde_json::Value::Null);
    }

    /// Register a subscriber and return its dispatch loop as a stream.
    ///
    /// The stream yields `Connected` first, then queued events in publish
    /// order, with a keepalive frame after every idle interval. It ends when
    /// the client is unregistered or the hub stops. Dropping the stream
    /// unregisters the client.
    pub fn serve(&self) -> BoxStream<'static, HubFrame> {
        let client = self.register();
        let connected = HubFrame::Connected {
            client_id: client.id.0,
        };

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.inner.keepalive,
            self.inner.keepalive,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let state = Dispatch {
            _guard: ClientGuard {
                hub: self.clone(),
                id: client.id,
            },
            client,
            ticker,
        };

        let dispatch = stream::unfold(state, |mut st| async move {
            let frame = tokio::select! {
                biased;
                () = st.client.done.cancelled() => None,
                event = st.client.rx.recv() => event.map(HubFrame::Event),
                _ = st.ticker.tick() => Some(HubFrame::KeepAlive),
            };
            if matches!(frame, Some(HubFrame::Event(_))) {
                st.ticker.reset();
            }
            frame.map(|f| (f, st))
        });

        stream::once(futures::future::ready(connected))
            .chain(dispatch)
            .boxed()
    }

    /// Stop the hub and close every still-connected subscriber exactly once.
    pub fn stop(&self) {
        self.inner.stopped.cancel();
        let drained: Vec<(ClientId, ClientHandle)> =
            lock(&self.inner.clients).drain().collect();
        let count = drained.len();
        for (_, handle) in drained {
            handle.done.cancel();
        }
        if count > 0 {
            tracing::info!("Event hub stopped, closed {} client(s)", count);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    /// Get the current number of subscribers.
    pub fn client_count(&self) -> usize {
        lock(&self.inner.clients).len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

struct Dispatch {
    /// Held for its `Drop`
    _guard: ClientGuard,
    client: PushClient,
    ticker: tokio::time::Interval,
}

/// Unregisters its client when the subscription stream is dropped.
struct ClientGuard {
    hub: EventHub,
    id: ClientId,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}
