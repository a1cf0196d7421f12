/// Wi-Fi controller capability interface
///
/// The portal drives whichever controller is configured through this
/// trait; `omada` is the TP-Omada external-portal implementation.
pub mod omada;

use crate::error::PortalResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Controller health probe result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerHealth {
    Ok,
    Degraded(String),
}

/// Operations the portal needs from a controller.
///
/// All operations are idempotent at this level: re-authorizing an identical
/// `(mac, end)` pair is a no-op returning the known grant id, and
/// revoke/extend on an unknown grant succeed.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Authorize `mac` until `end_utc`; returns the controller grant id.
    async fn authorize(
        &self,
        mac: &str,
        end_utc: DateTime<Utc>,
        up_kbps: Option<i64>,
        down_kbps: Option<i64>,
    ) -> PortalResult<String>;

    /// Remove authorization for `mac`. Absent grants are a no-op success.
    async fn revoke(&self, mac: &str) -> PortalResult<()>;

    /// Move the expiration of an existing authorization.
    async fn extend(&self, mac: &str, new_end_utc: DateTime<Utc>) -> PortalResult<()>;

    async fn health(&self) -> ControllerHealth;
}
