//! Telemetry Module
//!
//! Persistent pub/sub link to the tracking broker. Owns connect, reconnect
//! with fixed backoff, topic subscription, inbound decoding and best-effort
//! publishing.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerEvent, SessionOptions};
use crate::position::{self, PositionSample};
use crate::retry::Timers;

/// Link settings
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub topic: String,
    pub client_id: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

impl LinkOptions {
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            client_id: format!("bus-tracker-{}", uuid::Uuid::new_v4()),
            connect_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Link connection state.
///
/// `Connecting` doubles as the claim on the single in-flight attempt: only
/// the task that moved the link out of `Disconnected` may move it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Notifications for the link's consumer
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    Position(PositionSample),
}

/// What happened to a publish request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the broker session
    Queued,
    /// Not connected (a connect was triggered) or not encodable
    Dropped,
}

/// Reconnecting pub/sub link.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct TelemetryLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    broker: Arc<dyn Broker>,
    options: LinkOptions,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<LinkEvent>,
    inbound: mpsc::UnboundedSender<BrokerEvent>,
    timers: Timers,
    pump: Mutex<Option<JoinHandle<()>>>,
    failures: AtomicU32,
    closed: AtomicBool,
}

impl TelemetryLink {
    /// Create a link and the receiver for its events.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        broker: Arc<dyn Broker>,
        options: LinkOptions,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new(LinkInner {
            broker,
            options,
            state,
            events: events_tx,
            inbound: inbound_tx,
            timers: Timers::new(),
            pump: Mutex::new(None),
            failures: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });

        let pump = tokio::spawn(pump_inbound(Arc::downgrade(&inner), inbound_rx));
        if let Ok(mut slot) = inner.pump.lock() {
            *slot = Some(pump);
        }

        (Self { inner }, events_rx)
    }

    /// Start a connection attempt in the background.
    ///
    /// Returns `false` without doing anything if an attempt is already in
    /// progress, the session is up, or the link was closed.
    pub fn connect(&self) -> bool {
        self.inner.connect()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn topic(&self) -> &str {
        &self.inner.options.topic
    }

    /// Publish a position, fire-and-forget.
    ///
    /// While disconnected the sample is dropped (never queued) and a connect
    /// is triggered instead.
    pub fn publish(&self, sample: &PositionSample) -> PublishOutcome {
        if !self.is_connected() {
            debug!("MQTT client not connected, attempting to reconnect...");
            self.connect();
            return PublishOutcome::Dropped;
        }

        let payload = match position::encode(sample) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Not publishing unencodable sample: {}", e);
                return PublishOutcome::Dropped;
            }
        };

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.broker.publish(&inner.options.topic, payload).await {
                Ok(()) => debug!("Published location for {}", inner.options.topic),
                Err(e) => {
                    error!("Error publishing message: {}", e);
                    inner.connect();
                }
            }
        });
        PublishOutcome::Queued
    }

    /// Disconnect and stop reconnecting. Teardown errors are logged only.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        inner.timers.cancel_all();

        match inner.broker.disconnect().await {
            Ok(()) => info!("MQTT connection closed"),
            Err(e) => error!("Error closing MQTT connection: {}", e),
        }

        inner.set_state(ConnectionState::Disconnected);

        if let Some(pump) = inner.pump.lock().ok().and_then(|mut p| p.take()) {
            pump.abort();
        }
    }
}

impl LinkInner {
    fn connect(self: &Arc<Self>) -> bool {
        if self.closed.load(Ordering::Acquire) {
            debug!("Link closed, ignoring connect request");
            return false;
        }
        if !self.begin_connecting() {
            debug!("Already connected or connecting, skipping duplicate request");
            return false;
        }

        let inner = self.clone();
        tokio::spawn(async move { inner.attempt().await });
        true
    }

    /// Disconnected -> Connecting in one step on the state value.
    ///
    /// A `Connected` link whose session has died underneath it may also be
    /// claimed; the late loss report then leaves the claim in place.
    fn begin_connecting(&self) -> bool {
        self.state.send_if_modified(|current| {
            let claimable = match *current {
                ConnectionState::Disconnected => true,
                ConnectionState::Connected => !self.broker.is_connected(),
                ConnectionState::Connecting => false,
            };
            if claimable {
                debug!("link state: {} -> connecting", current);
                *current = ConnectionState::Connecting;
            }
            claimable
        })
    }

    async fn attempt(self: Arc<Self>) {
        if self.broker.is_connected() {
            self.mark_connected();
            return;
        }

        let session = SessionOptions {
            client_id: self.options.client_id.clone(),
            connect_timeout: self.options.connect_timeout,
            keep_alive: self.options.keep_alive,
            clean_session: true,
        };

        match self.broker.connect(&session, self.inbound.clone()).await {
            Ok(()) => {
                if self.closed.load(Ordering::Acquire) {
                    let _ = self.broker.disconnect().await;
                    self.set_state(ConnectionState::Disconnected);
                    return;
                }

                match self.broker.subscribe(&self.options.topic).await {
                    Ok(()) => info!("Subscribed to topic: {}", self.options.topic),
                    Err(e) => error!("Error subscribing to topic: {}", e),
                }

                self.failures.store(0, Ordering::Release);
                self.mark_connected();
            }
            Err(e) => {
                error!("Error connecting to MQTT broker: {}", e);
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    fn mark_connected(&self) {
        self.set_state(ConnectionState::Connected);
        let _ = self.events.send(LinkEvent::Connected);
    }

    fn connection_lost(self: &Arc<Self>, cause: &str) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // Loss reported by a session that has since been replaced
        if self.broker.is_connected() {
            debug!("Ignoring stale connection-lost: {}", cause);
            return;
        }

        error!("Connection to MQTT broker lost: {}", cause);

        // Only Connected -> Disconnected; an attempt already under way keeps
        // its Connecting claim
        self.state.send_if_modified(|current| {
            if *current != ConnectionState::Connected {
                return false;
            }
            debug!("link state: connected -> disconnected");
            *current = ConnectionState::Disconnected;
            true
        });
        let _ = self.events.send(LinkEvent::Disconnected);
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let attempt = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        let delay = self.options.reconnect_delay;

        debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
        let weak = Arc::downgrade(self);
        self.timers.schedule(delay, async move {
            let Some(inner) = weak.upgrade() else { return };
            if *inner.state.borrow() != ConnectionState::Connected {
                inner.connect();
            }
        });
    }

    fn handle_message(&self, topic: &str, payload: &[u8]) {
        match position::decode(payload) {
            Ok(sample) => {
                debug!("Received position for {} on {}", sample.bus_id, topic);
                let _ = self.events.send(LinkEvent::Position(sample));
            }
            Err(e) => warn!("Dropping malformed message on {}: {}", topic, e),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("link state: {} -> {}", current, next);
            *current = next;
            true
        });
    }
}

async fn pump_inbound(link: Weak<LinkInner>, mut inbound: mpsc::UnboundedReceiver<BrokerEvent>) {
    while let Some(event) = inbound.recv().await {
        let Some(inner) = link.upgrade() else { break };
        match event {
            BrokerEvent::ConnectionLost(cause) => inner.connection_lost(&cause),
            BrokerEvent::Message { topic, payload } => inner.handle_message(&topic, &payload),
        }
    }
}
