//! Auth provider seam.
//!
//! ARCHITECTURE
//! ============
//! The provider is push-based: it owns the current session and announces
//! every change on a broadcast channel. Request methods return their own
//! results, but state consumers should follow [`AuthProvider::subscribe`]
//! rather than the return values.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::types::{Session, SessionEvent, User, UserMetadata};

/// Errors returned by auth provider requests.
#[derive(Debug, thiserror::Error)]
pub enum AuthProviderError {
    /// Transport-level failure (connect, timeout, body read).
    #[error("auth request failed: {0}")]
    Request(String),

    /// The provider rejected the request. Displays the provider's message
    /// verbatim so it can be shown to the user.
    #[error("{message}")]
    Api { status: u16, message: String },

    /// The provider response could not be decoded.
    #[error("auth response parse failed: {0}")]
    Parse(String),

    /// An operation that needs a session was called without one.
    #[error("no active session")]
    MissingSession,

    /// The underlying HTTP client could not be constructed.
    #[error("HTTP client build failed: {0}")]
    HttpClientBuild(String),
}

/// Result of a password sign-in.
#[derive(Clone, Debug)]
pub struct SignIn {
    pub user: User,
    pub session: Session,
}

/// Result of account creation. `user` is absent when the provider withholds
/// it until the address is confirmed; `session` is present only when the
/// provider auto-confirms.
#[derive(Clone, Debug, Default)]
pub struct SignUp {
    pub user: Option<User>,
    pub session: Option<Session>,
}

#[derive(Clone, Debug, Default)]
pub struct SignUpOptions {
    /// Where the confirmation link should land.
    pub redirect_to: Option<String>,
    /// Initial `user_metadata` for the new account.
    pub metadata: UserMetadata,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Register for session-change notifications. Dropping the receiver
    /// unregisters.
    fn subscribe(&self) -> broadcast::Receiver<SessionEvent>;

    /// Snapshot of the current session, if any.
    async fn current_session(&self) -> Result<Option<Session>, AuthProviderError>;

    /// Email a one-time sign-in link.
    async fn request_magic_link(&self, email: &str, redirect_to: Option<&str>) -> Result<(), AuthProviderError>;

    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<SignIn, AuthProviderError>;

    async fn sign_out(&self) -> Result<(), AuthProviderError>;

    async fn sign_up(&self, email: &str, password: &str, options: &SignUpOptions) -> Result<SignUp, AuthProviderError>;
}
