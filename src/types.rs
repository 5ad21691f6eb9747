//! Identity and profile DTOs shared by the session core and backend adapters.
//!
//! DESIGN
//! ======
//! `User` is a deliberately narrow view of the backend's auth record: only
//! the fields the application reads are modeled, everything else is
//! dropped at deserialization time so the rest of the crate never depends
//! on the provider's full schema.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// USER
// =============================================================================

/// Display metadata embedded in the auth record (`user_metadata`).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl UserMetadata {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.username.is_none() && self.full_name.is_none() && self.avatar_url.is_none()
    }
}

/// The signed-in identity, mirrored from the current session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "user_metadata")]
    pub metadata: UserMetadata,
}

impl User {
    /// Best label for greeting the user: username, then full name, then email.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.metadata
            .username
            .as_deref()
            .or(self.metadata.full_name.as_deref())
            .or(self.email.as_deref())
            .unwrap_or("there")
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Server-issued proof of authentication. Only the embedded user is read by
/// the session manager; tokens are forwarded to the backend untouched.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Expiry as unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_owned()
}

impl Session {
    #[must_use]
    pub fn is_expired_at(&self, unix_secs: i64) -> bool {
        self.expires_at.is_some_and(|at| at <= unix_secs)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

/// Why a session-change notification was emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEventKind {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

/// Push notification from the auth provider carrying the new session, or
/// `None` once the session has been cleared.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: Option<Session>,
}

impl SessionEvent {
    #[must_use]
    pub fn signed_in(session: Session) -> Self {
        Self { kind: SessionEventKind::SignedIn, session: Some(session) }
    }

    #[must_use]
    pub fn signed_out() -> Self {
        Self { kind: SessionEventKind::SignedOut, session: None }
    }
}

// =============================================================================
// PROFILE
// =============================================================================

/// Application profile row, one per user, keyed by the user's id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub is_artist: bool,
}

impl Profile {
    /// Empty profile for `id`, all optional columns unset.
    #[must_use]
    pub fn empty(id: Uuid) -> Self {
        Self {
            id,
            username: None,
            full_name: None,
            avatar_url: None,
            website: None,
            bio: None,
            created_at: None,
            updated_at: None,
            is_artist: false,
        }
    }

    /// Shallow merge: every field present in `update` overwrites ours,
    /// absent fields are left alone.
    pub fn apply(&mut self, update: &ProfileUpdate) {
        fn merge<T: Clone>(slot: &mut T, value: Option<&T>) {
            if let Some(v) = value {
                slot.clone_from(v);
            }
        }
        merge(&mut self.username, update.username.as_ref());
        merge(&mut self.full_name, update.full_name.as_ref());
        merge(&mut self.avatar_url, update.avatar_url.as_ref());
        merge(&mut self.website, update.website.as_ref());
        merge(&mut self.bio, update.bio.as_ref());
        merge(&mut self.is_artist, update.is_artist.as_ref());
    }
}

/// Partial profile write.
///
/// Outer `None` means "leave untouched"; for nullable columns `Some(None)`
/// clears the value and serializes as JSON `null`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_artist: Option<bool>,
}

impl ProfileUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn username(mut self, value: impl Into<String>) -> Self {
        self.username = Some(Some(value.into()));
        self
    }

    #[must_use]
    pub fn full_name(mut self, value: impl Into<String>) -> Self {
        self.full_name = Some(Some(value.into()));
        self
    }

    #[must_use]
    pub fn avatar_url(mut self, value: impl Into<String>) -> Self {
        self.avatar_url = Some(Some(value.into()));
        self
    }

    #[must_use]
    pub fn website(mut self, value: impl Into<String>) -> Self {
        self.website = Some(Some(value.into()));
        self
    }

    #[must_use]
    pub fn bio(mut self, value: impl Into<String>) -> Self {
        self.bio = Some(Some(value.into()));
        self
    }

    #[must_use]
    pub fn is_artist(mut self, value: bool) -> Self {
        self.is_artist = Some(value);
        self
    }
}

#[cfg(test)]
#[path = "types_test.rs"]
mod tests;
