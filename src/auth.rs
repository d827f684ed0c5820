//! Authentication Module
//!
//! Stored credentials, session state and the sign-out broadcast.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::storage::{Edit, SecretStore, StorageError};

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Access/refresh token pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    UserRequested,
    MissingRefreshToken,
    RetryLimitReached,
    RefreshFailed,
}

impl std::fmt::Display for SignOutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignOutReason::UserRequested => write!(f, "signed out"),
            SignOutReason::MissingRefreshToken => write!(f, "no refresh token stored"),
            SignOutReason::RetryLimitReached => write!(f, "token refresh retry limit reached"),
            SignOutReason::RefreshFailed => write!(f, "token refresh failed"),
        }
    }
}

/// A sign-out event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignOut {
    pub reason: SignOutReason,
    pub at: DateTime<Utc>,
}

/// Process-wide "user is now logged out" broadcast.
///
/// Keeps the latest event, so a listener created after a sign-out still
/// observes it exactly once.
#[derive(Clone)]
pub struct SessionNotifier {
    tx: Arc<watch::Sender<Option<SignOut>>>,
}

impl SessionNotifier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a sign-out, replacing any earlier one
    pub fn notify(&self, reason: SignOutReason) {
        self.tx.send_replace(Some(SignOut { reason, at: Utc::now() }));
    }

    /// Listen for sign-outs, starting with the most recent one (if any)
    pub fn subscribe(&self) -> SignOutListener {
        let mut rx = self.tx.subscribe();
        if rx.borrow().is_some() {
            rx.mark_changed();
        }
        SignOutListener { rx }
    }
}

impl Default for SessionNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of [`SessionNotifier`]
pub struct SignOutListener {
    rx: watch::Receiver<Option<SignOut>>,
}

impl SignOutListener {
    /// Wait for the next unseen sign-out
    pub async fn recv(&mut self) -> Option<SignOut> {
        loop {
            if self.rx.changed().await.is_err() {
                return None;
            }
            if let Some(event) = self.rx.borrow_and_update().clone() {
                return Some(event);
            }
        }
    }

    /// Take the pending sign-out without waiting
    pub fn try_recv(&mut self) -> Option<SignOut> {
        match self.rx.has_changed() {
            Ok(true) => self.rx.borrow_and_update().clone(),
            _ => None,
        }
    }
}

/// Reads and writes session tokens; owns forced logout.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SecretStore>,
    notifier: SessionNotifier,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SecretStore>, notifier: SessionNotifier) -> Self {
        Self { store, notifier }
    }

    pub fn notifier(&self) -> &SessionNotifier {
        &self.notifier
    }

    /// Current access token, if stored and non-blank
    pub fn access_token(&self) -> Option<String> {
        self.read(ACCESS_TOKEN_KEY)
    }

    /// Current refresh token, if stored and non-blank
    pub fn refresh_token(&self) -> Option<String> {
        self.read(REFRESH_TOKEN_KEY)
    }

    /// Both tokens, or nothing: a lone token counts as no session
    pub fn credentials(&self) -> Option<Credentials> {
        Some(Credentials {
            access_token: self.access_token()?,
            refresh_token: self.refresh_token()?,
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.credentials().is_some()
    }

    pub fn save_credentials(&self, credentials: &Credentials) -> Result<(), StorageError> {
        self.store.commit(
            Edit::new()
                .put(ACCESS_TOKEN_KEY, &credentials.access_token)
                .put(REFRESH_TOKEN_KEY, &credentials.refresh_token),
        )?;
        info!("Session credentials stored");
        Ok(())
    }

    pub fn save_access_token(&self, token: &str) -> Result<(), StorageError> {
        self.store.commit(Edit::new().put(ACCESS_TOKEN_KEY, token))
    }

    pub fn save_refresh_token(&self, token: &str) -> Result<(), StorageError> {
        self.store.commit(Edit::new().put(REFRESH_TOKEN_KEY, token))
    }

    /// Clear both tokens and broadcast the sign-out
    pub fn sign_out(&self, reason: SignOutReason) {
        warn!("Signing out: {}", reason);

        if let Err(e) = self
            .store
            .commit(Edit::new().remove(ACCESS_TOKEN_KEY).remove(REFRESH_TOKEN_KEY))
        {
            error!("Failed to clear stored tokens: {}", e);
        }

        self.notifier.notify(reason);
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(e) => {
                error!("Failed to read {} from secure storage: {}", key, e);
                None
            }
        }
    }
}
