//! API Module
//!
//! HTTP communication with the Bus Tracker backend: sign-in, registration
//! and token refresh, plus the wire types they exchange.

use std::time::Duration;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const LOGIN_PATH: &str = "/api/auth/login";
pub const REGISTER_PATH: &str = "/api/user/create";
pub const REFRESH_PATH: &str = "/api/auth/refresh";

/// API client for the Bus Tracker backend
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Underlying HTTP client, shared with the authenticated gateway
    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Sign in with email (or phone number) and password
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, ApiError> {
        let url = self.url(LOGIN_PATH);
        debug!("Signing in at: {}", url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Login rejected with status {}", status);
            return Err(ApiError::rejected(Operation::Login, status.as_u16()));
        }

        let data: LoginResponse = read_json(response).await?;
        info!("Signed in as user {}", data.id);
        Ok(data)
    }

    /// Exchange a refresh token for a new access token
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshResponse, ApiError> {
        let url = self.url(REFRESH_PATH);

        let response = self
            .client
            .post(&url)
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::rejected(Operation::Refresh, status.as_u16()));
        }

        let data: RefreshResponse = read_json(response).await?;
        if data.access_token.trim().is_empty() {
            return Err(ApiError::EmptyResponse);
        }
        Ok(data)
    }
}

/// Interpret the answer to `POST /api/user/create`.
///
/// Registration is sent through the authenticated gateway, so only the
/// response handling lives here.
pub async fn read_registration(
    response: reqwest::Response,
) -> Result<RegistrationResponse, ApiError> {
    let status = response.status();
    if !status.is_success() {
        warn!("Registration rejected with status {}", status);
        return Err(ApiError::rejected(Operation::Register, status.as_u16()));
    }

    let data: RegistrationResponse = read_json(response).await?;
    info!("Registered user {}", data.id);
    Ok(data)
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
    let body = response
        .bytes()
        .await
        .map_err(|e| ApiError::Network(e.to_string()))?;

    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::EmptyResponse);
    }

    serde_json::from_slice(&body).map_err(|e| ApiError::Parse(e.to_string()))
}

/// Which call a status code came from; the same code reads differently per call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Login,
    Register,
    Refresh,
}

/// Human-readable message for a failed call
pub fn status_message(operation: Operation, code: u16) -> String {
    match (operation, code) {
        (Operation::Login, 400) => "Invalid credentials. Please check your email or password.".into(),
        (Operation::Login, 401) => "Unauthorized. Your session may have expired.".into(),
        (Operation::Login, 403) => "Access denied. Contact support.".into(),
        (Operation::Register, 400) => "Invalid registration data. Please check your inputs.".into(),
        (Operation::Register, 409) => "User already exists. Try logging in instead.".into(),
        (_, 500) => "Server error. Try again later.".into(),
        (Operation::Login, code) => format!("Login failed with error code: {}", code),
        (Operation::Register, code) => format!("Registration failed with error code: {}", code),
        (Operation::Refresh, code) => format!("Token refresh failed with error code: {}", code),
    }
}

// Request/Response types

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Driver,
    Passenger,
    Admin,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "driver" => Ok(Role::Driver),
            "passenger" => Ok(Role::Passenger),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Sign-in request; `email` also accepts a phone number
#[derive(Debug, Serialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    pub role: Role,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub password: String,
    pub role: Role,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    pub id: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// API errors
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("Empty response")]
    EmptyResponse,

    #[error("Parse error: {0}")]
    Parse(String),
}

impl ApiError {
    fn rejected(operation: Operation, status: u16) -> Self {
        ApiError::Rejected {
            status,
            message: status_message(operation, status),
        }
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Network(_) => "Check your internet connection".into(),
            ApiError::Rejected { message, .. } => message.clone(),
            ApiError::EmptyResponse => "Empty response".into(),
            ApiError::Parse(e) => format!("Unexpected error: {}", e),
        }
    }
}
