//! Auth REST adapter: magic links, password grants, sign-up, logout and
//! token refresh.
//!
//! Pure parsing lives in free functions (`parse_session`, `parse_sign_up`,
//! `parse_redirect`) so response handling is testable without a server.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use tokio::sync::broadcast;

use super::{BackendInner, error_message};
use crate::auth::{AuthProvider, AuthProviderError, SignIn, SignUp, SignUpOptions};
use crate::types::{Session, SessionEvent, SessionEventKind, User, UserMetadata};

// =============================================================================
// CLIENT
// =============================================================================

/// [`AuthProvider`] backed by the auth REST API.
#[derive(Clone)]
pub struct BackendAuth {
    inner: Arc<BackendInner>,
}

impl BackendAuth {
    pub(super) fn new(inner: Arc<BackendInner>) -> Self {
        Self { inner }
    }

    /// Exchange the cached refresh token for a new session.
    ///
    /// # Errors
    ///
    /// Returns [`AuthProviderError::MissingSession`] without a cached session,
    /// or the provider's error if the refresh token was rejected.
    pub async fn refresh_session(&self) -> Result<Session, AuthProviderError> {
        let refresh_token = self
            .inner
            .session()
            .await
            .map(|s| s.refresh_token)
            .filter(|t| !t.is_empty())
            .ok_or(AuthProviderError::MissingSession)?;

        let body = self
            .post_json(
                "/auth/v1/token",
                &[("grant_type", "refresh_token")],
                &serde_json::json!({ "refresh_token": refresh_token }),
            )
            .await?;
        let session = parse_session(&body)?;
        self.inner.store_session(SessionEventKind::TokenRefreshed, Some(session.clone())).await;
        Ok(session)
    }

    /// Adopt tokens issued elsewhere (a previous run, another device) after
    /// confirming them against the user endpoint.
    ///
    /// # Errors
    ///
    /// Returns the provider's error if the access token is not accepted.
    pub async fn restore_session(&self, access_token: &str, refresh_token: &str) -> Result<Session, AuthProviderError> {
        let user = self.fetch_user(access_token).await?;
        let session = Session {
            access_token: access_token.to_owned(),
            refresh_token: refresh_token.to_owned(),
            token_type: "bearer".to_owned(),
            expires_in: None,
            expires_at: None,
            user,
        };
        self.inner.store_session(SessionEventKind::InitialSession, Some(session.clone())).await;
        Ok(session)
    }

    /// Finish a magic-link or email-confirmation sign-in from the URL the
    /// link redirected to.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL carries an error, lacks tokens, or the
    /// tokens are rejected.
    pub async fn complete_magic_link(&self, redirect: &str) -> Result<Session, AuthProviderError> {
        let tokens = parse_redirect(redirect)?;
        let user = self.fetch_user(&tokens.access_token).await?;
        let session = Session {
            expires_at: tokens.expires_in.map(|secs| now_unix().saturating_add(secs)),
            expires_in: tokens.expires_in,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: "bearer".to_owned(),
            user,
        };
        self.inner.store_session(SessionEventKind::SignedIn, Some(session.clone())).await;
        Ok(session)
    }

    /// Replace the signed-in user's display metadata.
    ///
    /// # Errors
    ///
    /// Returns [`AuthProviderError::MissingSession`] without a session, or the
    /// provider's error.
    pub async fn update_user_metadata(&self, metadata: &UserMetadata) -> Result<User, AuthProviderError> {
        let mut session = self.inner.session().await.ok_or(AuthProviderError::MissingSession)?;
        let response = self
            .inner
            .http
            .put(self.inner.endpoint("/auth/v1/user"))
            .header("apikey", &self.inner.config.anon_key)
            .bearer_auth(&session.access_token)
            .json(&serde_json::json!({ "data": metadata }))
            .send()
            .await
            .map_err(|e| AuthProviderError::Request(e.to_string()))?;
        let body = read_body(response).await?;
        let user: User = serde_json::from_str(&body).map_err(|e| AuthProviderError::Parse(e.to_string()))?;

        session.user = user.clone();
        self.inner.store_session(SessionEventKind::UserUpdated, Some(session)).await;
        Ok(user)
    }

    async fn fetch_user(&self, access_token: &str) -> Result<User, AuthProviderError> {
        let response = self
            .inner
            .http
            .get(self.inner.endpoint("/auth/v1/user"))
            .header("apikey", &self.inner.config.anon_key)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| AuthProviderError::Request(e.to_string()))?;
        let body = read_body(response).await?;
        serde_json::from_str(&body).map_err(|e| AuthProviderError::Parse(e.to_string()))
    }

    async fn post_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
        payload: &serde_json::Value,
    ) -> Result<String, AuthProviderError> {
        let response = self
            .inner
            .http
            .post(self.inner.endpoint(path))
            .query(query)
            .header("apikey", &self.inner.config.anon_key)
            .bearer_auth(&self.inner.config.anon_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| AuthProviderError::Request(e.to_string()))?;
        read_body(response).await
    }
}

#[async_trait]
impl AuthProvider for BackendAuth {
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthProviderError> {
        let Some(session) = self.inner.session().await else {
            return Ok(None);
        };
        if !session.is_expired_at(now_unix()) {
            return Ok(Some(session));
        }

        tracing::debug!("cached session expired; refreshing");
        match self.refresh_session().await {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!(error = %e, "session refresh failed; clearing session");
                self.inner.store_session(SessionEventKind::SignedOut, None).await;
                Err(e)
            }
        }
    }

    async fn request_magic_link(&self, email: &str, redirect_to: Option<&str>) -> Result<(), AuthProviderError> {
        let query: Vec<(&str, &str)> = redirect_to.map(|r| ("redirect_to", r)).into_iter().collect();
        self.post_json(
            "/auth/v1/otp",
            &query,
            &serde_json::json!({ "email": email, "create_user": true }),
        )
        .await?;
        tracing::info!(email, "magic link requested");
        Ok(())
    }

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<SignIn, AuthProviderError> {
        let body = self
            .post_json(
                "/auth/v1/token",
                &[("grant_type", "password")],
                &serde_json::json!({ "email": email, "password": password }),
            )
            .await?;
        let session = parse_session(&body)?;
        self.inner.store_session(SessionEventKind::SignedIn, Some(session.clone())).await;
        Ok(SignIn { user: session.user.clone(), session })
    }

    async fn sign_out(&self) -> Result<(), AuthProviderError> {
        if let Some(session) = self.inner.session().await {
            let response = self
                .inner
                .http
                .post(self.inner.endpoint("/auth/v1/logout"))
                .header("apikey", &self.inner.config.anon_key)
                .bearer_auth(&session.access_token)
                .send()
                .await
                .map_err(|e| AuthProviderError::Request(e.to_string()))?;

            let status = response.status();
            // 401/404: the server already forgot this session.
            if !(status.is_success() || status == StatusCode::UNAUTHORIZED || status == StatusCode::NOT_FOUND) {
                read_body(response).await?;
            }
        }
        self.inner.store_session(SessionEventKind::SignedOut, None).await;
        Ok(())
    }

    async fn sign_up(&self, email: &str, password: &str, options: &SignUpOptions) -> Result<SignUp, AuthProviderError> {
        let query: Vec<(&str, &str)> = options.redirect_to.as_deref().map(|r| ("redirect_to", r)).into_iter().collect();
        let mut payload = serde_json::json!({ "email": email, "password": password });
        if !options.metadata.is_empty() {
            payload["data"] = serde_json::to_value(&options.metadata).map_err(|e| AuthProviderError::Parse(e.to_string()))?;
        }

        let body = self.post_json("/auth/v1/signup", &query, &payload).await?;
        let signed_up = parse_sign_up(&body)?;
        if let Some(session) = &signed_up.session {
            self.inner.store_session(SessionEventKind::SignedIn, Some(session.clone())).await;
        }
        Ok(signed_up)
    }
}

// =============================================================================
// WIRE HELPERS
// =============================================================================

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

async fn read_body(response: reqwest::Response) -> Result<String, AuthProviderError> {
    let status = response.status().as_u16();
    let text = response.text().await.map_err(|e| AuthProviderError::Request(e.to_string()))?;
    if !(200..300).contains(&status) {
        return Err(AuthProviderError::Api { status, message: error_message(status, &text) });
    }
    Ok(text)
}

/// Parse a token-grant response. Fills `expires_at` from `expires_in` when
/// the server omits it.
pub(crate) fn parse_session(json: &str) -> Result<Session, AuthProviderError> {
    let mut session: Session = serde_json::from_str(json).map_err(|e| AuthProviderError::Parse(e.to_string()))?;
    if session.expires_at.is_none() {
        session.expires_at = session.expires_in.map(|secs| now_unix().saturating_add(secs));
    }
    Ok(session)
}

/// Sign-up answers with a full session when the project auto-confirms, and
/// with the bare user record when confirmation is pending.
pub(crate) fn parse_sign_up(json: &str) -> Result<SignUp, AuthProviderError> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| AuthProviderError::Parse(e.to_string()))?;

    if value.get("access_token").is_some() {
        let session = parse_session(json)?;
        return Ok(SignUp { user: Some(session.user.clone()), session: Some(session) });
    }
    if value.get("id").is_some() {
        let user: User = serde_json::from_value(value).map_err(|e| AuthProviderError::Parse(e.to_string()))?;
        return Ok(SignUp { user: Some(user), session: None });
    }
    Ok(SignUp::default())
}

/// Tokens carried by a magic-link redirect.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RedirectTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: Option<i64>,
}

/// Read tokens (or an error) from the fragment, falling back to the query
/// string, of a redirect URL.
pub(crate) fn parse_redirect(redirect: &str) -> Result<RedirectTokens, AuthProviderError> {
    let mut url = Url::parse(redirect).map_err(|e| AuthProviderError::Parse(format!("invalid redirect URL: {e}")))?;
    if let Some(fragment) = url.fragment().map(str::to_owned) {
        url.set_query(Some(&fragment));
    }

    let mut access_token = None;
    let mut refresh_token = None;
    let mut expires_in = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "access_token" => access_token = Some(value.into_owned()),
            "refresh_token" => refresh_token = Some(value.into_owned()),
            "expires_in" => expires_in = value.parse::<i64>().ok(),
            "error_description" => error = Some(value.into_owned()),
            "error" if error.is_none() => error = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(message) = error {
        return Err(AuthProviderError::Api { status: 401, message });
    }
    match (access_token, refresh_token) {
        (Some(access_token), Some(refresh_token)) => Ok(RedirectTokens { access_token, refresh_token, expires_in }),
        _ => Err(AuthProviderError::Parse("redirect URL carries no session tokens".to_owned())),
    }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
