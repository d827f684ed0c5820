//! In-process doubles for the broker and the position source.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::broker::{Broker, BrokerEvent, LinkError, SessionOptions};
use crate::location::{Fix, LocationRequest, PositionError, PositionEvent, PositionSource};

/// Shared record of calls, for ordering assertions
pub type Journal = Arc<Mutex<Vec<&'static str>>>;

fn record(journal: &Option<Journal>, entry: &'static str) {
    if let Some(journal) = journal {
        journal.lock().unwrap().push(entry);
    }
}

#[derive(Default)]
pub struct FakeBroker {
    connect_delay: Duration,
    failures_left: AtomicUsize,
    connected: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    subscriptions: Mutex<Vec<String>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    events: Mutex<Option<mpsc::UnboundedSender<BrokerEvent>>>,
    journal: Option<Journal>,
}

impl FakeBroker {
    pub fn with_connect_delay(delay: Duration) -> Self {
        Self {
            connect_delay: delay,
            ..Self::default()
        }
    }

    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    /// Simulate the session dropping underneath the link
    pub fn drop_connection(&self, cause: &str) {
        self.connected.store(false, Ordering::SeqCst);
        self.send(BrokerEvent::ConnectionLost(cause.to_string()));
    }

    /// Simulate an inbound message on `topic`
    pub fn deliver(&self, topic: &str, payload: &[u8]) {
        self.send(BrokerEvent::Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    fn send(&self, event: BrokerEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn connect(
        &self,
        _options: &SessionOptions,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<(), LinkError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LinkError::Connect("connection refused".into()));
        }

        *self.events.lock().unwrap() = Some(events);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.subscriptions.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), LinkError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(LinkError::NotConnected);
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        record(&self.journal, "disconnect");
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeSource {
    requests: AtomicUsize,
    removals: AtomicUsize,
    failures_left: AtomicUsize,
    last_request: Mutex<Option<LocationRequest>>,
    last_known: Mutex<Option<Fix>>,
    sink: Mutex<Option<mpsc::UnboundedSender<PositionEvent>>>,
    journal: Option<Journal>,
}

impl FakeSource {
    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            ..Self::default()
        }
    }

    pub fn with_last_known(fix: Fix) -> Self {
        Self {
            last_known: Mutex::new(Some(fix)),
            ..Self::default()
        }
    }

    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal: Some(journal),
            ..Self::default()
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<LocationRequest> {
        *self.last_request.lock().unwrap()
    }

    /// Deliver a fix as if the device produced it
    pub fn emit(&self, latitude: f64, longitude: f64) {
        self.send(PositionEvent::Fix(Fix {
            latitude,
            longitude,
            timestamp_millis: 1_700_000_000_000,
        }));
    }

    pub fn set_available(&self, available: bool) {
        self.send(PositionEvent::Availability(available));
    }

    fn send(&self, event: PositionEvent) {
        if let Some(tx) = self.sink.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }
}

impl PositionSource for FakeSource {
    fn request_updates(
        &self,
        request: &LocationRequest,
        events: mpsc::UnboundedSender<PositionEvent>,
    ) -> Result<(), PositionError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(*request);

        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PositionError::PermissionDenied);
        }

        *self.sink.lock().unwrap() = Some(events);
        Ok(())
    }

    fn remove_updates(&self) -> Result<(), PositionError> {
        record(&self.journal, "remove_updates");
        self.removals.fetch_add(1, Ordering::SeqCst);
        *self.sink.lock().unwrap() = None;
        Ok(())
    }

    fn last_known_position(&self) -> Option<Fix> {
        *self.last_known.lock().unwrap()
    }
}
