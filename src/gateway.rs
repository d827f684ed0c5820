//! Authenticated Request Gateway
//!
//! Attaches the stored bearer token to outbound calls and, when the server
//! answers 401, refreshes the token and replays the call a bounded number of
//! times before forcing a logout.

use std::sync::Arc;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Method, Request, RequestBuilder, Response, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, ApiError};
use crate::auth::{SessionManager, SignOutReason};

/// Header carrying how many refresh-driven replays a request has had
pub const RETRY_HEADER: &str = "X-Refresh-Retry";

/// Replays allowed after the original attempt
pub const MAX_REFRESH_RETRIES: u32 = 2;

/// Exchanges the stored refresh token for a new access token.
///
/// Refreshes are serialized: concurrent 401s wait on one another instead of
/// racing independent refresh calls.
pub struct CredentialRefresher {
    api: ApiClient,
    session: SessionManager,
    lock: Mutex<()>,
}

impl CredentialRefresher {
    pub fn new(api: ApiClient, session: SessionManager) -> Self {
        Self {
            api,
            session,
            lock: Mutex::new(()),
        }
    }

    /// Build the replay for a request that was rejected with 401.
    ///
    /// `None` means no replay; by then the session has been signed out.
    pub async fn authenticate(&self, failed: Request) -> Option<Request> {
        let _guard = self.lock.lock().await;

        let Some(refresh_token) = self.session.refresh_token() else {
            self.session.sign_out(SignOutReason::MissingRefreshToken);
            return None;
        };

        let retry_count = retry_count(&failed);
        if retry_count >= MAX_REFRESH_RETRIES {
            warn!("Refresh retry limit reached for {}", failed.url());
            self.session.sign_out(SignOutReason::RetryLimitReached);
            return None;
        }

        // Another request may have refreshed while this one waited on the lock
        let sent = bearer_token(&failed);
        let access_token = match self.session.access_token() {
            Some(current) if sent.is_some() && sent.as_deref() != Some(current.as_str()) => {
                debug!("Access token already refreshed, reusing it");
                current
            }
            _ => self.refresh(&refresh_token).await?,
        };

        match rebuild(failed, &access_token, retry_count + 1) {
            Some(request) => Some(request),
            None => {
                self.session.sign_out(SignOutReason::RefreshFailed);
                None
            }
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Option<String> {
        match self.api.refresh(refresh_token).await {
            Ok(response) => {
                if let Err(e) = self.session.save_access_token(&response.access_token) {
                    error!("Failed to store refreshed access token: {}", e);
                }
                if let Some(rotated) = response.refresh_token.filter(|t| !t.trim().is_empty()) {
                    if let Err(e) = self.session.save_refresh_token(&rotated) {
                        error!("Failed to store rotated refresh token: {}", e);
                    }
                }
                info!("Access token refreshed");
                Some(response.access_token)
            }
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                self.session.sign_out(SignOutReason::RefreshFailed);
                None
            }
        }
    }
}

/// HTTP client that authenticates every call.
#[derive(Clone)]
pub struct AuthenticatedClient {
    api: ApiClient,
    session: SessionManager,
    refresher: Arc<CredentialRefresher>,
}

impl AuthenticatedClient {
    pub fn new(api: ApiClient, session: SessionManager) -> Self {
        let refresher = Arc::new(CredentialRefresher::new(api.clone(), session.clone()));
        Self {
            api,
            session,
            refresher,
        }
    }

    /// Start a request against an API path
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.api.http().request(method, self.api.url(path))
    }

    pub async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let request = builder
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;
        self.execute(request).await
    }

    /// Send a request, refreshing credentials and replaying on 401.
    ///
    /// The final response is returned as-is, including a 401 once the retry
    /// budget is spent or the session was signed out.
    pub async fn execute(&self, mut request: Request) -> Result<Response, ApiError> {
        self.attach_bearer(&mut request);

        loop {
            let replay = request.try_clone();
            let response = self
                .api
                .http()
                .execute(request)
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            let Some(failed) = replay else {
                warn!("Streaming request body cannot be replayed after 401");
                return Ok(response);
            };

            match self.refresher.authenticate(failed).await {
                Some(next) => {
                    debug!("Replaying {} with refreshed token", next.url());
                    request = next;
                }
                None => return Ok(response),
            }
        }
    }

    fn attach_bearer(&self, request: &mut Request) {
        let Some(token) = self.session.access_token() else {
            return;
        };
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(value) => {
                request.headers_mut().insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("Stored access token is not a valid header value"),
        }
    }
}

fn retry_count(request: &Request) -> u32 {
    request
        .headers()
        .get(RETRY_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn rebuild(mut request: Request, access_token: &str, retry_count: u32) -> Option<Request> {
    let bearer = HeaderValue::from_str(&format!("Bearer {}", access_token)).ok()?;
    let headers = request.headers_mut();
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(RETRY_HEADER, HeaderValue::from(retry_count));
    Some(request)
}
