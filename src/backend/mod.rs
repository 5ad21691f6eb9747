//! HTTP adapters for the hosted backend (auth REST API + profiles table).
//!
//! DESIGN
//! ======
//! One [`Backend`] value owns the HTTP client, configuration and the cached
//! session for an application instance. The auth and profile adapters are
//! cheap handles onto it, so the profile adapter always sends the token the
//! auth adapter last stored. Nothing here is process-global: two `Backend`s
//! are two independent sessions.

pub mod auth;
pub mod rest;

pub use auth::BackendAuth;
pub use rest::BackendProfiles;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, broadcast};

use crate::auth::AuthProviderError;
use crate::config::BackendConfig;
use crate::types::{Session, SessionEvent, SessionEventKind};

const SESSION_EVENT_CAPACITY: usize = 32;

/// Owned backend connection: HTTP client, config and cached session.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

struct BackendInner {
    http: reqwest::Client,
    config: BackendConfig,
    session: RwLock<Option<Session>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Backend {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: BackendConfig) -> Result<Self, AuthProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| AuthProviderError::HttpClientBuild(e.to_string()))?;
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Ok(Self { inner: Arc::new(BackendInner { http, config, session: RwLock::new(None), events }) })
    }

    #[must_use]
    pub fn auth(&self) -> BackendAuth {
        BackendAuth::new(Arc::clone(&self.inner))
    }

    #[must_use]
    pub fn profiles(&self) -> BackendProfiles {
        BackendProfiles::new(Arc::clone(&self.inner))
    }

    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.inner.config
    }
}

impl BackendInner {
    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.url)
    }

    /// Bearer credential: the session's access token, else the anon key.
    async fn bearer(&self) -> String {
        match self.session.read().await.as_ref() {
            Some(session) => session.access_token.clone(),
            None => self.config.anon_key.clone(),
        }
    }

    async fn session(&self) -> Option<Session> {
        self.session.read().await.clone()
    }

    /// Replace the cached session and announce the change.
    async fn store_session(&self, kind: SessionEventKind, session: Option<Session>) {
        *self.session.write().await = session.clone();
        let receivers = self.events.send(SessionEvent { kind, session }).unwrap_or(0);
        tracing::debug!(?kind, receivers, "session event published");
    }
}

/// Human-readable message from an error response body.
///
/// Auth endpoints use `msg`/`error_description`, the REST layer uses
/// `message`; fall back to the raw body, then the status code.
pub(crate) fn error_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["msg", "error_description", "message", "error"] {
            if let Some(text) = value.get(key).and_then(serde_json::Value::as_str) {
                if !text.is_empty() {
                    return text.to_owned();
                }
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() { format!("request failed with status {status}") } else { trimmed.to_owned() }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
