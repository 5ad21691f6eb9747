//! Songbook session core.
//!
//! SYSTEM CONTEXT
//! ==============
//! Mirrors the hosted backend's authentication session into local state
//! (`user`, `profile`, `is_loading`) and exposes sign-in, sign-up, sign-out
//! and profile operations on top of it. The auth provider, profile store and
//! notification surface are traits; [`backend`] supplies HTTP
//! implementations for the first two and [`notify`] a couple of sinks.

pub mod auth;
pub mod backend;
pub mod config;
pub mod notify;
pub mod profile;
pub mod session;
pub mod types;

pub use auth::{AuthProvider, AuthProviderError};
pub use backend::Backend;
pub use config::BackendConfig;
pub use notify::{Notification, NotificationSink};
pub use profile::{ProfileStore, ProfileStoreError};
pub use session::{AuthState, SessionConfig, SessionError, SessionManager};
pub use types::{Profile, ProfileUpdate, Session, User};
