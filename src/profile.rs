//! Profile store seam.

use async_trait::async_trait;
use uuid::Uuid;

use crate::types::{Profile, ProfileUpdate};

#[derive(Debug, thiserror::Error)]
pub enum ProfileStoreError {
    #[error("profile not found: {0}")]
    NotFound(Uuid),

    #[error("profile request failed: {0}")]
    Request(String),

    #[error("{message}")]
    Api { status: u16, message: String },

    #[error("profile response parse failed: {0}")]
    Parse(String),
}

/// Persistent profile rows keyed by user id.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn select_profile_by_id(&self, id: Uuid) -> Result<Profile, ProfileStoreError>;

    /// Write only the fields present in `fields`.
    async fn update_profile_by_id(&self, id: Uuid, fields: &ProfileUpdate) -> Result<(), ProfileStoreError>;
}
