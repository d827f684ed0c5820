//! Tracking Module
//!
//! Glues the position source to the telemetry link and keeps both alive:
//! publishes every fix, relays other buses' positions to consumers, and
//! restarts whatever has gone quiet.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::location::{Fix, LocationRequest, PositionEvent, PositionSource};
use crate::position::{BusPositionTable, PositionSample};
use crate::retry::{InFlight, Timers};
use crate::telemetry::{ConnectionState, LinkEvent, PublishOutcome, TelemetryLink};

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct TrackingOptions {
    pub bus_name: String,
    pub request: LocationRequest,
    pub health_check_interval: Duration,
    pub location_retry_delay: Duration,
    pub relay_capacity: usize,
}

impl TrackingOptions {
    pub fn new(bus_name: &str) -> Self {
        Self {
            bus_name: bus_name.to_string(),
            request: LocationRequest::default(),
            health_check_interval: Duration::from_secs(30),
            location_retry_delay: Duration::from_secs(5),
            relay_capacity: 64,
        }
    }
}

/// Liveness counters inspected by the health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCounters {
    pub location_update_count: u64,
    pub last_connection_state: ConnectionState,
}

impl Default for HealthCounters {
    fn default() -> Self {
        Self {
            location_update_count: 0,
            last_connection_state: ConnectionState::Disconnected,
        }
    }
}

/// Single consumer loop over link events, position events, retries and the
/// health timer.
pub struct TrackingCoordinator {
    options: TrackingOptions,
    link: TelemetryLink,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    source: Arc<dyn PositionSource>,
    position_tx: mpsc::UnboundedSender<PositionEvent>,
    position_rx: mpsc::UnboundedReceiver<PositionEvent>,
    retry_tx: mpsc::UnboundedSender<()>,
    retry_rx: mpsc::UnboundedReceiver<()>,
    /// Held while the source has a live registration
    requesting: InFlight,
    location_failures: u32,
    timers: Timers,
    counters: HealthCounters,
    health_tx: watch::Sender<HealthCounters>,
    table_tx: watch::Sender<Arc<BusPositionTable>>,
    relay_tx: broadcast::Sender<PositionSample>,
    last_known_sent: bool,
}

/// Control and observation of a running coordinator.
///
/// Dropping the handle stops tracking as well.
pub struct TrackingHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    link: TelemetryLink,
    positions: watch::Receiver<Arc<BusPositionTable>>,
    health: watch::Receiver<HealthCounters>,
    relay: broadcast::Sender<PositionSample>,
}

impl TrackingHandle {
    /// Latest position per bus; each value is a complete snapshot
    pub fn positions(&self) -> watch::Receiver<Arc<BusPositionTable>> {
        self.positions.clone()
    }

    /// Stream of positions received from the broker
    pub fn subscribe(&self) -> broadcast::Receiver<PositionSample> {
        self.relay.subscribe()
    }

    pub fn health(&self) -> HealthCounters {
        *self.health.borrow()
    }

    pub fn link(&self) -> &TelemetryLink {
        &self.link
    }

    /// Stop tracking and wait for teardown to finish
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            error!("Tracking task ended abnormally: {}", e);
        }
    }
}

impl TrackingCoordinator {
    pub fn new(
        options: TrackingOptions,
        link: TelemetryLink,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        source: Arc<dyn PositionSource>,
    ) -> Self {
        let (position_tx, position_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (health_tx, _) = watch::channel(HealthCounters::default());
        let (table_tx, _) = watch::channel(Arc::new(BusPositionTable::new()));
        let (relay_tx, _) = broadcast::channel(options.relay_capacity.max(1));

        Self {
            options,
            link,
            link_events,
            source,
            position_tx,
            position_rx,
            retry_tx,
            retry_rx,
            requesting: InFlight::new(),
            location_failures: 0,
            timers: Timers::new(),
            counters: HealthCounters::default(),
            health_tx,
            table_tx,
            relay_tx,
            last_known_sent: false,
        }
    }

    /// Spawn the coordinator loop
    pub fn start(self) -> TrackingHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let link = self.link.clone();
        let positions = self.table_tx.subscribe();
        let health = self.health_tx.subscribe();
        let relay = self.relay_tx.clone();

        let task = tokio::spawn(self.run(stop_rx));

        TrackingHandle {
            stop: Some(stop_tx),
            task,
            link,
            positions,
            health,
            relay,
        }
    }

    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        info!("Tracking started for {}", self.options.bus_name);
        self.link.connect();

        let period = self.options.health_check_interval;
        let mut health = tokio::time::interval_at(Instant::now() + period, period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                Some(event) = self.link_events.recv() => self.on_link_event(event),
                Some(event) = self.position_rx.recv() => self.on_position_event(event),
                Some(()) = self.retry_rx.recv() => self.on_location_retry(),
                _ = health.tick() => self.health_check(),
            }
        }

        self.shutdown().await;
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                self.set_connection_state(ConnectionState::Connected);
                info!("MQTT connected, requesting location updates");

                if !self.last_known_sent {
                    self.last_known_sent = true;
                    match self.source.last_known_position() {
                        Some(fix) => {
                            let sample = self.sample_from(fix);
                            if self.link.publish(&sample) == PublishOutcome::Queued {
                                info!("Published last known location");
                            }
                        }
                        None => debug!("No last known location, waiting for updates"),
                    }
                }

                self.request_location_updates();
            }
            LinkEvent::Disconnected => self.set_connection_state(ConnectionState::Disconnected),
            LinkEvent::Position(sample) => {
                debug!(
                    "Position for {}: {}, {}",
                    sample.bus_id, sample.latitude, sample.longitude
                );
                let next = self.table_tx.borrow().with(sample.clone());
                self.table_tx.send_replace(Arc::new(next));
                let _ = self.relay_tx.send(sample);
            }
        }
    }

    fn on_position_event(&mut self, event: PositionEvent) {
        match event {
            PositionEvent::Fix(fix) => {
                self.counters.location_update_count += 1;
                self.health_tx.send_replace(self.counters);
                debug!(
                    "Location update {}: {}, {}",
                    self.counters.location_update_count, fix.latitude, fix.longitude
                );

                // A dropped publish has already triggered a reconnect
                if self.link.publish(&self.sample_from(fix)) == PublishOutcome::Dropped {
                    warn!("MQTT not connected, skipping location publish");
                }
            }
            PositionEvent::Availability(true) => debug!("Location available"),
            PositionEvent::Availability(false) => {
                warn!("Location is not available, will retry location request");
                self.retry_location_request();
            }
        }
    }

    fn on_location_retry(&mut self) {
        if self.link.is_connected() {
            debug!("Retrying location request now");
            self.request_location_updates();
        } else {
            debug!("MQTT not connected during retry, connecting first");
            self.link.connect();
        }
    }

    /// Register with the source unless a registration is already live.
    ///
    /// The claim is released by `stop_location_updates` or when the source
    /// reports itself unavailable.
    fn request_location_updates(&mut self) {
        if !self.requesting.try_begin() {
            debug!("Already requesting location updates, skipping");
            return;
        }

        match self
            .source
            .request_updates(&self.options.request, self.position_tx.clone())
        {
            Ok(()) => {
                info!(
                    "Location updates requested every {:?}",
                    self.options.request.interval
                );
                self.location_failures = 0;
            }
            Err(e) => {
                error!("Error requesting location updates: {}", e);
                self.retry_location_request();
            }
        }
    }

    fn retry_location_request(&mut self) {
        self.requesting.finish();
        self.location_failures += 1;

        let delay = self.options.location_retry_delay;
        debug!(
            "Will retry location request in {:?} (attempt {})",
            delay, self.location_failures
        );
        let retry = self.retry_tx.clone();
        self.timers.schedule(delay, async move {
            let _ = retry.send(());
        });
    }

    fn stop_location_updates(&self) {
        match self.source.remove_updates() {
            Ok(()) => debug!("Location updates stopped"),
            Err(e) => error!("Error stopping location updates: {}", e),
        }
        self.requesting.finish();
    }

    fn health_check(&mut self) {
        let connected = self.link.is_connected();
        info!(
            "Health check - location updates received: {}, MQTT connected: {}",
            self.counters.location_update_count, connected
        );

        if self.counters.location_update_count == 0 {
            warn!("No location updates received, restarting location updates");
            self.stop_location_updates();
            self.request_location_updates();
        }

        if !connected {
            warn!("MQTT not connected, attempting to reconnect");
            self.link.connect();
        }
    }

    fn set_connection_state(&mut self, state: ConnectionState) {
        self.counters.last_connection_state = state;
        self.health_tx.send_replace(self.counters);
    }

    fn sample_from(&self, fix: Fix) -> PositionSample {
        PositionSample {
            bus_id: self.options.bus_name.clone(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            timestamp_millis: fix.timestamp_millis,
        }
    }

    async fn shutdown(self) {
        self.timers.cancel_all();
        self.stop_location_updates();
        self.link.close().await;
        info!("Tracking stopped for {}", self.options.bus_name);
    }
}
