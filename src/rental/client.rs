/// Reservation source REST client
///
/// Fetches entity states from the reservation system's HTTP API with a
/// bearer token. Event entities are addressed as
/// `{integration_id}_event_{index}`.
use crate::config::ReservationConfig;
use crate::error::{PortalError, PortalResult};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Raw entity state as returned by the reservation source
#[derive(Debug, Clone, Deserialize)]
pub struct EntityState {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

#[derive(Clone)]
pub struct ReservationClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReservationClient {
    pub fn new(config: &ReservationConfig) -> PortalResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", config.token))
            .map_err(|_| PortalError::Validation("Invalid reservation token".to_string()))?;
        headers.insert(reqwest::header::AUTHORIZATION, value);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .default_headers(headers)
            .build()
            .map_err(|e| PortalError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Entity id for an integration's event slot
    pub fn event_entity_id(integration_id: &str, index: i64) -> String {
        format!("{}_event_{}", integration_id, index)
    }

    /// Fetch one entity state. 404 means the entity does not exist and is
    /// reported as None; other failures are errors the poller backs off on.
    pub async fn get_entity_state(&self, entity_id: &str) -> PortalResult<Option<EntityState>> {
        let url = format!("{}/states/{}", self.base_url, entity_id);
        debug!("Fetching reservation state from {}", url);

        let response = self.http.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                PortalError::ControllerTimeout(format!("Reservation source timeout: {}", e))
            } else {
                PortalError::Internal(format!("Reservation source request failed: {}", e))
            }
        })?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(PortalError::Internal(format!(
                "Reservation source returned HTTP {}",
                response.status()
            )));
        }

        let state: EntityState = response
            .json()
            .await
            .map_err(|e| PortalError::Internal(format!("Bad reservation state payload: {}", e)))?;

        Ok(Some(state))
    }
}
