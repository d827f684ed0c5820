//! Location Module
//!
//! Contract for continuous device position acquisition, plus a source that
//! reads fixes from a gpsd daemon.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use gpsd_json::client::{GpsdClient, StreamOptions};
use gpsd_json::error::GpsdJsonError;
use gpsd_json::protocol::v3::response::Tpv;
use gpsd_json::protocol::v3::types::FixMode;
use gpsd_json::protocol::v3::ResponseMessage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often and how precisely to deliver fixes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocationRequest {
    pub interval: Duration,
    pub max_delay: Duration,
    /// Prefer accuracy over power
    pub high_accuracy: bool,
    /// Hold back fixes until the receiver has a 3D solution
    pub wait_for_accurate_fix: bool,
}

impl Default for LocationRequest {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            high_accuracy: true,
            wait_for_accurate_fix: false,
        }
    }
}

/// A device position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp_millis: i64,
}

/// Output of a position source
#[derive(Debug, Clone, PartialEq)]
pub enum PositionEvent {
    Fix(Fix),
    Availability(bool),
}

/// Continuous position acquisition.
///
/// After `request_updates`, fixes and availability changes are delivered on
/// `events` until `remove_updates`.
pub trait PositionSource: Send + Sync {
    fn request_updates(
        &self,
        request: &LocationRequest,
        events: mpsc::UnboundedSender<PositionEvent>,
    ) -> Result<(), PositionError>;

    fn remove_updates(&self) -> Result<(), PositionError>;

    fn last_known_position(&self) -> Option<Fix>;
}

/// Position source backed by gpsd's JSON protocol
pub struct GpsdSource {
    addr: String,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_fix: Arc<Mutex<Option<Fix>>>,
}

impl GpsdSource {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            worker: Mutex::new(None),
            last_fix: Arc::new(Mutex::new(None)),
        }
    }
}

impl PositionSource for GpsdSource {
    fn request_updates(
        &self,
        request: &LocationRequest,
        events: mpsc::UnboundedSender<PositionEvent>,
    ) -> Result<(), PositionError> {
        let mut worker = self.worker.lock().map_err(|_| PositionError::Poisoned)?;
        if let Some(previous) = worker.take() {
            previous.abort();
        }

        if !request.high_accuracy {
            debug!("gpsd reports every fix; low-accuracy mode is advisory");
        }

        info!("Requesting gpsd updates from {} every {:?}", self.addr, request.interval);
        *worker = Some(tokio::spawn(stream_fixes(
            self.addr.clone(),
            *request,
            events,
            self.last_fix.clone(),
        )));
        Ok(())
    }

    fn remove_updates(&self) -> Result<(), PositionError> {
        let mut worker = self.worker.lock().map_err(|_| PositionError::Poisoned)?;
        if let Some(handle) = worker.take() {
            handle.abort();
            info!("gpsd updates stopped");
        }
        Ok(())
    }

    fn last_known_position(&self) -> Option<Fix> {
        self.last_fix.lock().ok().and_then(|fix| *fix)
    }
}

async fn stream_fixes(
    addr: String,
    request: LocationRequest,
    events: mpsc::UnboundedSender<PositionEvent>,
    last_fix: Arc<Mutex<Option<Fix>>>,
) {
    let client = match GpsdClient::connect(addr.as_str()).await {
        Ok(client) => client,
        Err(e) => {
            warn!("Cannot reach gpsd at {}: {}", addr, e);
            let _ = events.send(PositionEvent::Availability(false));
            return;
        }
    };

    let mut stream = match client.stream(StreamOptions::json()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to enable gpsd watch: {}", e);
            let _ = events.send(PositionEvent::Availability(false));
            return;
        }
    };

    let mut available: Option<bool> = None;
    let mut last_emit: Option<Instant> = None;

    while let Some(message) = stream.next().await {
        let report = match message {
            Ok(ResponseMessage::Tpv(tpv)) => report_from(&tpv, request.wait_for_accurate_fix),
            Ok(_) => continue,
            Err(GpsdJsonError::SerdeError(e)) => {
                debug!("Skipping unreadable gpsd message: {}", e);
                continue;
            }
            Err(e) => {
                warn!("Error reading from gpsd: {}", e);
                break;
            }
        };

        let has_fix = matches!(report, Report::Fix(_));
        if available != Some(has_fix) {
            available = Some(has_fix);
            if events.send(PositionEvent::Availability(has_fix)).is_err() {
                return;
            }
        }

        if let Report::Fix(fix) = report {
            if let Ok(mut last) = last_fix.lock() {
                *last = Some(fix);
            }
            if last_emit.map_or(true, |at| at.elapsed() >= request.interval) {
                last_emit = Some(Instant::now());
                if events.send(PositionEvent::Fix(fix)).is_err() {
                    return;
                }
            }
        }
    }

    warn!("gpsd stream ended");
    let _ = events.send(PositionEvent::Availability(false));
}

#[derive(Debug, PartialEq)]
enum Report {
    Fix(Fix),
    NoFix,
}

/// A TPV report counts as a fix once it carries coordinates in 2D or 3D mode
fn report_from(tpv: &Tpv, require_3d: bool) -> Report {
    let solved = match tpv.mode {
        FixMode::Fix3D => true,
        FixMode::Fix2D => !require_3d,
        FixMode::NoFix | FixMode::NotSeen => false,
    };

    match (solved, tpv.lat, tpv.lon) {
        (true, Some(latitude), Some(longitude)) => Report::Fix(Fix {
            latitude,
            longitude,
            timestamp_millis: tpv
                .time
                .map(|t| t.timestamp_millis())
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
        }),
        _ => Report::NoFix,
    }
}

/// Position source errors
#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("Location permission not granted")]
    PermissionDenied,

    #[error("Position source lock poisoned")]
    Poisoned,
}
