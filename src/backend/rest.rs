//! Profiles table over the REST data API.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use uuid::Uuid;

use super::{BackendInner, error_message};
use crate::profile::{ProfileStore, ProfileStoreError};
use crate::types::{Profile, ProfileUpdate};

/// Ask for a single JSON object instead of an array.
const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";

/// [`ProfileStore`] backed by the profiles table.
#[derive(Clone)]
pub struct BackendProfiles {
    inner: Arc<BackendInner>,
}

impl BackendProfiles {
    pub(super) fn new(inner: Arc<BackendInner>) -> Self {
        Self { inner }
    }

    fn table_url(&self) -> String {
        self.inner.endpoint(&format!("/rest/v1/{}", self.inner.config.profiles_table))
    }
}

#[async_trait]
impl ProfileStore for BackendProfiles {
    async fn select_profile_by_id(&self, id: Uuid) -> Result<Profile, ProfileStoreError> {
        let response = self
            .inner
            .http
            .get(self.table_url())
            .query(&[("id", format!("eq.{id}")), ("select", "*".to_owned())])
            .header("apikey", &self.inner.config.anon_key)
            .header(reqwest::header::ACCEPT, SINGLE_OBJECT)
            .bearer_auth(self.inner.bearer().await)
            .send()
            .await
            .map_err(|e| ProfileStoreError::Request(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| ProfileStoreError::Request(e.to_string()))?;
        // Zero rows under the single-object Accept header come back as 406.
        if status == StatusCode::NOT_ACCEPTABLE {
            return Err(ProfileStoreError::NotFound(id));
        }
        if !status.is_success() {
            return Err(ProfileStoreError::Api { status: status.as_u16(), message: error_message(status.as_u16(), &body) });
        }

        let value: serde_json::Value = serde_json::from_str(&body).map_err(|e| ProfileStoreError::Parse(e.to_string()))?;
        let row = match value {
            serde_json::Value::Null => None,
            serde_json::Value::Array(rows) => rows.into_iter().next(),
            row => Some(row),
        }
        .ok_or(ProfileStoreError::NotFound(id))?;
        serde_json::from_value(row).map_err(|e| ProfileStoreError::Parse(e.to_string()))
    }

    async fn update_profile_by_id(&self, id: Uuid, fields: &ProfileUpdate) -> Result<(), ProfileStoreError> {
        if fields.is_empty() {
            tracing::debug!(%id, "empty profile update; skipping request");
            return Ok(());
        }

        let response = self
            .inner
            .http
            .patch(self.table_url())
            .query(&[("id", format!("eq.{id}"))])
            .header("apikey", &self.inner.config.anon_key)
            .header("Prefer", "return=minimal")
            .bearer_auth(self.inner.bearer().await)
            .json(fields)
            .send()
            .await
            .map_err(|e| ProfileStoreError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProfileStoreError::Api { status: status.as_u16(), message: error_message(status.as_u16(), &body) });
        }
        Ok(())
    }
}
