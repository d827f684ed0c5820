//! Sign-in and registration commands against a local HTTP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use bus_tracker_lib::api::{RegistrationRequest, Role};
use bus_tracker_lib::auth::Credentials;
use bus_tracker_lib::commands::{self, AppState};
use bus_tracker_lib::config::{BrokerAddress, Config};
use bus_tracker_lib::storage::{MemoryStore, SecureStorage};

#[derive(Default)]
struct Backend {
    registrations: AtomicUsize,
    refreshes: AtomicUsize,
}

async fn login(Json(body): Json<Value>) -> impl IntoResponse {
    match (body["email"].as_str(), body["password"].as_str()) {
        (Some("driver@example.com"), Some("secret")) => Json(json!({
            "id": "u-1",
            "firstName": "Amina",
            "lastName": "Haddad",
            "email": "driver@example.com",
            "role": "DRIVER",
            "accessToken": "a1",
            "refreshToken": "r1"
        }))
        .into_response(),
        (Some("empty@example.com"), _) => StatusCode::OK.into_response(),
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn create_user(
    State(backend): State<Arc<Backend>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    backend.registrations.fetch_add(1, Ordering::SeqCst);

    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer a2");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body["email"] == "taken@example.com" {
        return StatusCode::CONFLICT.into_response();
    }
    if body["email"] == "silent@example.com" {
        return StatusCode::CREATED.into_response();
    }

    (
        StatusCode::CREATED,
        Json(json!({ "id": "u-2", "email": body["email"], "role": body["role"] })),
    )
        .into_response()
}

async fn refresh(State(backend): State<Arc<Backend>>) -> Json<Value> {
    backend.refreshes.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "accessToken": "a2", "refreshToken": "r2" }))
}

async fn serve(backend: Arc<Backend>) -> String {
    let app = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/user/create", post(create_user))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

fn config(api_url: &str, data_dir: &std::path::Path) -> Config {
    Config {
        api_url: api_url.to_string(),
        broker: BrokerAddress::parse("tcp://127.0.0.1:1883").unwrap(),
        topic: "tracking/coordinates".into(),
        gpsd_addr: "127.0.0.1:2947".into(),
        data_dir: data_dir.to_path_buf(),
        bus_name: "Bus 42".into(),
    }
}

fn registration(email: &str) -> RegistrationRequest {
    RegistrationRequest {
        first_name: "Karim".into(),
        last_name: "Benali".into(),
        email: email.into(),
        phone_number: None,
        password: "secret".into(),
        role: Role::Passenger,
    }
}

#[tokio::test]
async fn sign_in_persists_both_tokens() {
    let base = serve(Arc::new(Backend::default())).await;
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(config(&base, dir.path())).unwrap();

    let session = commands::sign_in(&state, "driver@example.com", "secret")
        .await
        .unwrap();
    assert_eq!(session.user_id, "u-1");
    assert_eq!(session.display_name, "Amina Haddad");
    assert_eq!(session.role, Role::Driver);
    assert!(commands::status(&state).logged_in);

    // Survives a restart
    let reopened = AppState::new(config(&base, dir.path())).unwrap();
    assert_eq!(
        reopened.session.credentials(),
        Some(Credentials {
            access_token: "a1".into(),
            refresh_token: "r1".into(),
        })
    );
}

#[tokio::test]
async fn sign_in_reports_empty_response() {
    let base = serve(Arc::new(Backend::default())).await;
    let dir = tempfile::tempdir().unwrap();
    let state = AppState::new(config(&base, dir.path())).unwrap();

    let err = commands::sign_in(&state, "empty@example.com", "x")
        .await
        .unwrap_err();
    assert_eq!(err, "Couldn't log in: Empty response");
    assert!(!state.session.is_logged_in());
}

#[tokio::test]
async fn sign_in_reports_rejection_and_network_failure() {
    let base = serve(Arc::new(Backend::default())).await;
    let state =
        AppState::with_store(config(&base, std::path::Path::new(".")), Arc::new(MemoryStore::new()))
            .unwrap();

    let err = commands::sign_in(&state, "driver@example.com", "wrong")
        .await
        .unwrap_err();
    assert_eq!(
        err,
        "Couldn't log in: Invalid credentials. Please check your email or password."
    );

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let offline =
        AppState::with_store(config(&dead, std::path::Path::new(".")), Arc::new(MemoryStore::new()))
            .unwrap();
    let err = commands::sign_in(&offline, "driver@example.com", "secret")
        .await
        .unwrap_err();
    assert_eq!(err, "Couldn't log in: Check your internet connection");
}

#[tokio::test]
async fn sign_up_refreshes_expired_session_and_replays() {
    let backend = Arc::new(Backend::default());
    let base = serve(backend.clone()).await;
    let state =
        AppState::with_store(config(&base, std::path::Path::new(".")), Arc::new(MemoryStore::new()))
            .unwrap();
    commands::sign_in(&state, "driver@example.com", "secret")
        .await
        .unwrap();

    let created = commands::sign_up(&state, &registration("new@example.com"))
        .await
        .unwrap();

    assert_eq!(created.id, "u-2");
    assert_eq!(created.role, Some(Role::Passenger));
    assert_eq!(backend.registrations.load(Ordering::SeqCst), 2);
    assert_eq!(backend.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(state.session.access_token().as_deref(), Some("a2"));
    assert_eq!(state.session.refresh_token().as_deref(), Some("r2"));

    let err = commands::sign_up(&state, &registration("taken@example.com"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        "Couldn't register user: User already exists. Try logging in instead."
    );
}

#[tokio::test]
async fn sign_up_reports_empty_response() {
    let base = serve(Arc::new(Backend::default())).await;
    let state =
        AppState::with_store(config(&base, std::path::Path::new(".")), Arc::new(MemoryStore::new()))
            .unwrap();
    commands::sign_in(&state, "driver@example.com", "secret")
        .await
        .unwrap();

    let err = commands::sign_up(&state, &registration("silent@example.com"))
        .await
        .unwrap_err();
    assert_eq!(err, "Couldn't register user: Empty response");
}

#[tokio::test]
async fn logout_clears_session_and_notifies() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SecureStorage::new(dir.path()));
    let state = AppState::with_store(config("http://127.0.0.1:9", dir.path()), store).unwrap();
    state
        .session
        .save_credentials(&Credentials {
            access_token: "a1".into(),
            refresh_token: "r1".into(),
        })
        .unwrap();

    commands::logout(&state);

    assert!(!commands::status(&state).logged_in);
    assert!(state.session.notifier().subscribe().try_recv().is_some());
}
