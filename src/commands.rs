//! Commands Module
//!
//! Operations behind the CLI subcommands.

use std::sync::Arc;

use reqwest::Method;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};

use crate::api::{
    self, ApiClient, LoginRequest, RegistrationRequest, RegistrationResponse, REGISTER_PATH,
};
use crate::auth::{Credentials, SessionManager, SessionNotifier, SignOutReason};
use crate::broker::MqttBroker;
use crate::config::Config;
use crate::gateway::AuthenticatedClient;
use crate::location::GpsdSource;
use crate::position::{BusPositionTable, PositionSample};
use crate::storage::{SecretStore, SecureStorage};
use crate::telemetry::{LinkEvent, LinkOptions, TelemetryLink};
use crate::tracking::{TrackingCoordinator, TrackingOptions};

/// Application state shared across commands
pub struct AppState {
    pub config: Config,
    pub session: SessionManager,
    pub api: ApiClient,
    pub client: AuthenticatedClient,
}

impl AppState {
    /// State backed by the encrypted secrets file under the data directory
    pub fn new(config: Config) -> Result<Self, String> {
        let store = Arc::new(SecureStorage::new(&config.data_dir));
        Self::with_store(config, store)
    }

    pub fn with_store(config: Config, store: Arc<dyn SecretStore>) -> Result<Self, String> {
        let api = ApiClient::new(&config.api_url).map_err(|e| e.to_string())?;
        let session = SessionManager::new(store, SessionNotifier::new());
        let client = AuthenticatedClient::new(api.clone(), session.clone());

        Ok(Self {
            config,
            session,
            api,
            client,
        })
    }
}

// Response types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub user_id: String,
    pub display_name: String,
    pub role: api::Role,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub logged_in: bool,
    pub api_url: String,
    pub broker: String,
    pub topic: String,
    pub bus_name: String,
}

// Commands

/// Sign in and persist both tokens in one commit
pub async fn sign_in(
    state: &AppState,
    email: &str,
    password: &str,
) -> Result<SessionResponse, String> {
    info!("Signing in");

    let request = LoginRequest {
        email: email.trim().to_string(),
        password: password.to_string(),
    };

    let response = state.api.login(&request).await.map_err(|e| {
        error!("Sign-in failed: {}", e);
        format!("Couldn't log in: {}", e.user_message())
    })?;

    let credentials = Credentials {
        access_token: response.access_token.clone(),
        refresh_token: response.refresh_token.clone(),
    };
    if let Err(e) = state.session.save_credentials(&credentials) {
        error!("Failed to save tokens: {}", e);
        return Err("Couldn't log in: Failed to save tokens".into());
    }

    Ok(SessionResponse {
        user_id: response.id,
        display_name: format!("{} {}", response.first_name, response.last_name)
            .trim()
            .to_string(),
        role: response.role,
    })
}

/// Create an account; sent with the current session's credentials if any
pub async fn sign_up(
    state: &AppState,
    request: &RegistrationRequest,
) -> Result<RegistrationResponse, String> {
    info!("Registering {}", request.email);

    let builder = state
        .client
        .request(Method::POST, REGISTER_PATH)
        .json(request);

    let result = match state.client.send(builder).await {
        Ok(response) => api::read_registration(response).await,
        Err(e) => Err(e),
    };

    result.map_err(|e| {
        error!("Registration failed: {}", e);
        format!("Couldn't register user: {}", e.user_message())
    })
}

/// Clear stored tokens and announce the sign-out
pub fn logout(state: &AppState) {
    info!("Logging out");
    state.session.sign_out(SignOutReason::UserRequested);
}

pub fn status(state: &AppState) -> StatusReport {
    StatusReport {
        logged_in: state.session.is_logged_in(),
        api_url: state.api.base_url().to_string(),
        broker: state.config.broker.to_string(),
        topic: state.config.topic.clone(),
        bus_name: state.config.bus_name.clone(),
    }
}

/// Publish this device's position until Ctrl-C or a forced sign-out.
///
/// Positions of other buses are printed as they arrive.
pub async fn track(state: &AppState, bus_name: Option<String>) -> Result<(), String> {
    if !state.session.is_logged_in() {
        return Err("Not logged in. Run `bus-tracker login` first.".into());
    }

    let bus_name = bus_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| state.config.bus_name.clone());

    let broker = Arc::new(MqttBroker::new(state.config.broker.clone()));
    let (link, events) = TelemetryLink::new(broker, LinkOptions::new(&state.config.topic));
    let source = Arc::new(GpsdSource::new(&state.config.gpsd_addr));

    let handle =
        TrackingCoordinator::new(TrackingOptions::new(&bus_name), link, events, source).start();
    let mut positions = handle.subscribe();
    let mut sign_outs = state.session.notifier().subscribe();

    println!("Tracking as {} (Ctrl-C to stop)", bus_name);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Interrupted, stopping tracking");
                break;
            }
            Some(event) = sign_outs.recv() => {
                warn!("Session ended ({}), stopping tracking", event.reason);
                println!("Signed out: {}", event.reason);
                break;
            }
            received = positions.recv() => match received {
                Ok(sample) if sample.bus_id != bus_name => print_position(&sample),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} positions", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let health = handle.health();
    handle.stop().await;
    println!(
        "Stopped after {} location updates",
        health.location_update_count
    );
    Ok(())
}

/// Follow every bus on the topic without publishing
pub async fn watch(state: &AppState) -> Result<(), String> {
    let broker = Arc::new(MqttBroker::new(state.config.broker.clone()));
    let (link, mut events) = TelemetryLink::new(broker, LinkOptions::new(&state.config.topic));
    let mut table = BusPositionTable::new();

    link.connect();
    println!("Watching {} (Ctrl-C to stop)", link.topic());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(LinkEvent::Position(sample)) => {
                    print_position(&sample);
                    table = table.with(sample);
                }
                Some(LinkEvent::Connected) => println!("Connected to {}", state.config.broker),
                Some(LinkEvent::Disconnected) => println!("Connection lost, retrying"),
                None => break,
            },
        }
    }

    link.close().await;
    println!("Saw {} buses, last positions:", table.len());
    let mut last: Vec<&PositionSample> = table.iter().collect();
    last.sort_by(|a, b| a.bus_id.cmp(&b.bus_id));
    for sample in last {
        print_position(sample);
    }
    Ok(())
}

fn print_position(sample: &PositionSample) {
    let at = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(sample.timestamp_millis)
        .map(|t| t.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());
    println!(
        "{}  {:<16} {:>10.6} {:>11.6}",
        at, sample.bus_id, sample.latitude, sample.longitude
    );
}
