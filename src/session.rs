//! Session manager: the current user, their profile, and the auth operations
//! the UI invokes.
//!
//! ARCHITECTURE
//! ============
//! The auth provider pushes session changes; this module mirrors them into
//! an [`AuthState`] published on a `watch` channel. Two independent paths
//! write `user`:
//!
//! 1. the listener task, fed by [`AuthProvider::subscribe`], and
//! 2. the one-shot initial snapshot (`current_session`), which also ends
//!    the loading phase.
//!
//! The listener is registered before the snapshot is requested so no
//! change that lands during the snapshot request is lost.
//!
//! ORDERING
//! ========
//! Every notification bumps a session epoch. A snapshot issued before the
//! latest applied notification is discarded instead of overwriting newer
//! state. Profile fetches run on their own task after a session appears and
//! carry a ticket plus the user id they were issued for; only the newest
//! ticket for the still-signed-in user is applied. Together these keep
//! `profile` empty whenever `user` is empty, for any interleaving.
//!
//! ERROR HANDLING
//! ==============
//! Sign-in and sign-up errors are returned so forms can show them.
//! Sign-out, profile fetch and profile update failures are absorbed: they
//! are logged and, where the user needs to know, surfaced as notifications.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::auth::{AuthProvider, AuthProviderError, SignUpOptions};
use crate::notify::{Notification, NotificationSink};
use crate::profile::ProfileStore;
use crate::types::{Profile, ProfileUpdate, Session, SessionEvent, User, UserMetadata};

pub const VERIFY_LINK_MESSAGE: &str = "Please check your email for a verification link.";

// =============================================================================
// STATE
// =============================================================================

/// Snapshot of the session as seen by UI consumers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthState {
    pub user: Option<User>,
    pub profile: Option<Profile>,
    /// `true` until the initial session check has completed.
    pub is_loading: bool,
}

impl AuthState {
    /// State at mount time: nothing known yet, initial check pending.
    #[must_use]
    pub fn loading() -> Self {
        Self { user: None, profile: None, is_loading: true }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        if self.is_loading {
            SessionPhase::CheckingSession
        } else if self.user.is_some() {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Unauthenticated
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    CheckingSession,
    Authenticated,
    Unauthenticated,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    AuthRequest(#[from] AuthProviderError),

    #[error("not authenticated")]
    NotAuthenticated,
}

#[derive(Clone, Debug, Default)]
pub struct SessionConfig {
    /// Landing URL embedded in magic-link and confirmation emails.
    pub redirect_url: Option<String>,
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// State reachable from spawned tasks.
struct Shared {
    state: watch::Sender<AuthState>,
    profiles: Arc<dyn ProfileStore>,
    /// Count of applied session changes. Only mutated inside state writes.
    session_epoch: AtomicU64,
    /// Latest issued profile-fetch ticket. Only mutated inside state writes.
    fetch_ticket: AtomicU64,
}

impl Shared {
    /// Mirror `session` into state.
    ///
    /// `snapshot_epoch` is `Some` for the initial snapshot: the write is
    /// skipped if any notification was applied since that epoch was read.
    /// Returns whether the write was applied.
    fn apply_session(self: &Arc<Self>, session: Option<Session>, snapshot_epoch: Option<u64>) -> bool {
        let user = session.map(|s| s.user);
        let mut fetch = None;

        let applied = self.state.send_if_modified(|state| {
            match snapshot_epoch {
                Some(seen) if self.session_epoch.load(Ordering::SeqCst) != seen => return false,
                Some(_) => {}
                None => {
                    self.session_epoch.fetch_add(1, Ordering::SeqCst);
                }
            }

            let ticket = self.fetch_ticket.fetch_add(1, Ordering::SeqCst) + 1;
            match &user {
                Some(next) => {
                    if state.user.as_ref().is_some_and(|prev| prev.id != next.id) {
                        state.profile = None;
                    }
                    fetch = Some((next.id, ticket));
                }
                None => state.profile = None,
            }
            state.user = user;
            true
        });

        if let Some((user_id, ticket)) = fetch {
            // Runs on a later scheduler turn, outside the provider callback.
            tokio::spawn(Arc::clone(self).refresh_profile(user_id, ticket));
        }
        applied
    }

    async fn refresh_profile(self: Arc<Self>, user_id: Uuid, ticket: u64) {
        let profile = self.load_profile(user_id).await;
        let applied = self.state.send_if_modified(|state| {
            if self.fetch_ticket.load(Ordering::SeqCst) != ticket {
                return false;
            }
            if state.user.as_ref().map(|u| u.id) != Some(user_id) {
                return false;
            }
            state.profile = profile;
            true
        });
        if !applied {
            tracing::debug!(%user_id, ticket, "discarding superseded profile fetch");
        }
    }

    async fn load_profile(&self, user_id: Uuid) -> Option<Profile> {
        match self.profiles.select_profile_by_id(user_id).await {
            Ok(profile) => Some(profile),
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "profile fetch failed");
                None
            }
        }
    }
}

// =============================================================================
// LISTENER
// =============================================================================

async fn listen(shared: Arc<Shared>, mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => {
                tracing::debug!(kind = ?event.kind, signed_in = event.session.is_some(), "session changed");
                shared.apply_session(event.session, None);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "session listener lagged; waiting for next change");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("auth provider closed session channel");
                break;
            }
        }
    }
}

async fn check_initial_session(shared: Arc<Shared>, auth: Arc<dyn AuthProvider>) {
    let epoch = shared.session_epoch.load(Ordering::SeqCst);
    match auth.current_session().await {
        Ok(session) => {
            if !shared.apply_session(session, Some(epoch)) {
                tracing::debug!("initial session snapshot superseded by a newer change");
            }
        }
        Err(e) => tracing::warn!(error = %e, "initial session check failed"),
    }
    shared.state.send_modify(|state| state.is_loading = false);
}

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Owns the mirrored session state for one application instance.
///
/// Construct with [`SessionManager::mount`]; dropping the manager (or
/// calling [`SessionManager::unmount`]) unregisters the session listener.
pub struct SessionManager {
    shared: Arc<Shared>,
    auth: Arc<dyn AuthProvider>,
    notifier: Arc<dyn NotificationSink>,
    config: SessionConfig,
    listener: Option<JoinHandle<()>>,
}

impl SessionManager {
    /// Subscribe to session changes, then start the one-shot initial
    /// session check.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn mount(
        auth: Arc<dyn AuthProvider>,
        profiles: Arc<dyn ProfileStore>,
        notifier: Arc<dyn NotificationSink>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::loading());
        let shared = Arc::new(Shared {
            state,
            profiles,
            session_epoch: AtomicU64::new(0),
            fetch_ticket: AtomicU64::new(0),
        });

        let events = auth.subscribe();
        let listener = tokio::spawn(listen(Arc::clone(&shared), events));
        tokio::spawn(check_initial_session(Arc::clone(&shared), Arc::clone(&auth)));

        Self { shared, auth, notifier, config, listener: Some(listener) }
    }

    /// Unregister the session listener. State stops following the provider.
    pub fn unmount(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
            tracing::debug!("session listener unregistered");
        }
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.listener.is_some()
    }

    // -------------------------------------------------------------------------
    // State access
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> AuthState {
        self.shared.state.borrow().clone()
    }

    /// Receiver that wakes on every state change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn user(&self) -> Option<User> {
        self.shared.state.borrow().user.clone()
    }

    #[must_use]
    pub fn profile(&self) -> Option<Profile> {
        self.shared.state.borrow().profile.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.shared.state.borrow().is_loading
    }

    /// Wait for the initial session check to finish and return the state.
    pub async fn ready(&self) -> AuthState {
        let mut rx = self.watch();
        let ready = rx.wait_for(|state| !state.is_loading).await.map(|state| (*state).clone());
        ready.unwrap_or_else(|_| self.state())
    }

    fn current_user_id(&self) -> Option<Uuid> {
        self.shared.state.borrow().user.as_ref().map(|u| u.id)
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Request a passwordless sign-in link for `email`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthRequest`] if the provider rejects the request.
    pub async fn sign_in(&self, email: &str) -> Result<(), SessionError> {
        self.auth
            .request_magic_link(email, self.config.redirect_url.as_deref())
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "magic link request failed"))?;
        self.notifier
            .notify(Notification::new("Check your email").description("We sent you a link to sign in."));
        Ok(())
    }

    /// Password sign-in. State follows through the session listener.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthRequest`] if the provider rejects the credentials.
    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<User, SessionError> {
        let signed_in = self
            .auth
            .sign_in_with_password(email, password)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "password sign-in failed"))?;
        let shown = signed_in.user.email.as_deref().unwrap_or(email);
        self.notifier
            .notify(Notification::new("Signed in").description(format!("Signed in as {shown}")));
        Ok(signed_in.user)
    }

    /// End the session. Local state is cleared only after the provider
    /// confirms; failures are reported as a notification.
    pub async fn sign_out(&self) {
        match self.auth.sign_out().await {
            Ok(()) => {
                self.shared.apply_session(None, None);
                self.notifier
                    .notify(Notification::new("Signed out").description("You have been signed out."));
            }
            Err(e) => {
                tracing::warn!(error = %e, "sign-out failed");
                self.notifier.notify(Notification::error("Error signing out", e.to_string()));
            }
        }
    }

    /// Create an account. Returns the new user when the provider reveals it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthRequest`] if the provider rejects the request.
    pub async fn sign_up(&self, email: &str, password: &str) -> Result<Option<User>, SessionError> {
        self.sign_up_with(email, password, UserMetadata::default()).await
    }

    /// [`SessionManager::sign_up`] with initial display metadata.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AuthRequest`] if the provider rejects the request.
    pub async fn sign_up_with(
        &self,
        email: &str,
        password: &str,
        metadata: UserMetadata,
    ) -> Result<Option<User>, SessionError> {
        let options = SignUpOptions { redirect_to: self.config.redirect_url.clone(), metadata };
        let signed_up = self
            .auth
            .sign_up(email, password, &options)
            .await
            .inspect_err(|e| tracing::warn!(error = %e, "sign-up failed"))?;

        let notification = match &signed_up.user {
            Some(user) => {
                let shown = user.email.as_deref().unwrap_or(email);
                Notification::new("Verify your email")
                    .description(format!("We sent a confirmation link to {shown}. Verify your email to finish signing up."))
            }
            None => Notification::new("Check your email").description(VERIFY_LINK_MESSAGE),
        };
        self.notifier.notify(notification);
        Ok(signed_up.user)
    }

    /// Fetch the signed-in user's profile. `None` without a user (no request
    /// is made) or when the fetch fails.
    pub async fn get_profile(&self) -> Option<Profile> {
        let user_id = self.current_user_id()?;
        self.shared.load_profile(user_id).await
    }

    /// Write `fields` to the profile store, then merge them into the cached
    /// profile. A failed write leaves the cache untouched and is reported as
    /// a notification.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotAuthenticated`] without contacting the
    /// store when no user is signed in.
    pub async fn update_profile(&self, fields: &ProfileUpdate) -> Result<(), SessionError> {
        let user_id = self.current_user_id().ok_or(SessionError::NotAuthenticated)?;

        match self.shared.profiles.update_profile_by_id(user_id, fields).await {
            Ok(()) => {
                let mut refetch = None;
                self.shared.state.send_if_modified(|state| {
                    if state.user.as_ref().map(|u| u.id) != Some(user_id) {
                        return false;
                    }
                    // Fetches issued before the write carry the old row.
                    let ticket = self.shared.fetch_ticket.fetch_add(1, Ordering::SeqCst) + 1;
                    match state.profile.as_mut() {
                        Some(profile) => {
                            profile.apply(fields);
                            true
                        }
                        None => {
                            refetch = Some(ticket);
                            false
                        }
                    }
                });
                if let Some(ticket) = refetch {
                    tokio::spawn(Arc::clone(&self.shared).refresh_profile(user_id, ticket));
                }
                self.notifier
                    .notify(Notification::new("Profile updated").description("Your profile has been saved."));
            }
            Err(e) => {
                tracing::warn!(%user_id, error = %e, "profile update failed");
                self.notifier.notify(Notification::error("Error updating profile", e.to_string()));
            }
        }
        Ok(())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.unmount();
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
