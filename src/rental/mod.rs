/// Reservation integrations: cached rental events and per-integration
/// configuration
///
/// The poller projects reservation-source states into `rental_events`
/// rows; the booking validator matches guest codes against them.
pub mod client;
pub mod poller;
pub mod validator;

use crate::error::{PortalError, PortalResult};
use crate::timeutil::{fmt_db, parse_db};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Missed polls before an integration is logged as stale
pub const STALE_WARN_THRESHOLD: i64 = 3;
/// Missed polls before booking-derived grants are refused
pub const STALE_BLOCK_THRESHOLD: i64 = 6;

/// Which event attribute guests authenticate with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierAttr {
    SlotCode,
    SlotName,
    LastFour,
}

impl IdentifierAttr {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierAttr::SlotCode => "slot_code",
            IdentifierAttr::SlotName => "slot_name",
            IdentifierAttr::LastFour => "last_four",
        }
    }

    pub fn parse(s: &str) -> PortalResult<Self> {
        match s {
            "slot_code" => Ok(IdentifierAttr::SlotCode),
            "slot_name" => Ok(IdentifierAttr::SlotName),
            "last_four" => Ok(IdentifierAttr::LastFour),
            other => Err(PortalError::Validation(format!(
                "Invalid auth attribute: {}",
                other
            ))),
        }
    }
}

/// Per-integration reservation mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub id: Uuid,
    pub integration_id: String,
    pub enabled: bool,
    pub auth_attribute: IdentifierAttr,
    pub checkout_grace_minutes: i64,
    pub last_sync_utc: Option<DateTime<Utc>>,
    pub stale_count: i64,
}

impl IntegrationConfig {
    /// Stale enough that booking grants must be refused
    pub fn is_blocked(&self) -> bool {
        self.stale_count >= STALE_BLOCK_THRESHOLD
    }
}

/// One cached reservation event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RentalEvent {
    pub id: i64,
    pub integration_id: String,
    pub event_index: i64,
    pub slot_name: Option<String>,
    pub slot_code: Option<String>,
    pub last_four: Option<String>,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    /// Full attribute payload, kept verbatim for forensics
    pub raw_attributes: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl RentalEvent {
    /// The identifier for `attr`, falling back per the projection rule:
    /// configured attribute, then slot_code, then slot_name.
    pub fn identifier_for(&self, attr: IdentifierAttr) -> Option<&str> {
        let direct = match attr {
            IdentifierAttr::SlotCode => self.slot_code.as_deref(),
            IdentifierAttr::SlotName => self.slot_name.as_deref(),
            IdentifierAttr::LastFour => self.last_four.as_deref(),
        };
        direct
            .or(self.slot_code.as_deref())
            .or(self.slot_name.as_deref())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Clone)]
pub struct IntegrationManager {
    db: SqlitePool,
}

impl IntegrationManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        integration_id: &str,
        auth_attribute: IdentifierAttr,
        checkout_grace_minutes: i64,
    ) -> PortalResult<IntegrationConfig> {
        if !(0..=30).contains(&checkout_grace_minutes) {
            return Err(PortalError::InvalidInput(
                "checkout_grace_minutes must be between 0 and 30".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO integration_configs
                (id, integration_id, enabled, auth_attribute, checkout_grace_minutes,
                 last_sync_utc, stale_count)
            VALUES (?1, ?2, 1, ?3, ?4, NULL, 0)
            "#,
        )
        .bind(id.to_string())
        .bind(integration_id)
        .bind(auth_attribute.as_str())
        .bind(checkout_grace_minutes)
        .execute(&self.db)
        .await;

        match result {
            Ok(_) => Ok(IntegrationConfig {
                id,
                integration_id: integration_id.to_string(),
                enabled: true,
                auth_attribute,
                checkout_grace_minutes,
                last_sync_utc: None,
                stale_count: 0,
            }),
            Err(sqlx::Error::Database(db_err))
                if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                Err(PortalError::Conflict(format!(
                    "Integration {} already configured",
                    integration_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(
        &self,
        integration_id: &str,
        enabled: bool,
        auth_attribute: IdentifierAttr,
        checkout_grace_minutes: i64,
    ) -> PortalResult<IntegrationConfig> {
        if !(0..=30).contains(&checkout_grace_minutes) {
            return Err(PortalError::InvalidInput(
                "checkout_grace_minutes must be between 0 and 30".to_string(),
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE integration_configs
            SET enabled = ?1, auth_attribute = ?2, checkout_grace_minutes = ?3
            WHERE integration_id = ?4
            "#,
        )
        .bind(enabled)
        .bind(auth_attribute.as_str())
        .bind(checkout_grace_minutes)
        .bind(integration_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PortalError::NotFound(format!(
                "Integration {} not found",
                integration_id
            )));
        }

        self.find(integration_id).await?.ok_or_else(|| {
            PortalError::Internal("Integration vanished during update".to_string())
        })
    }

    pub async fn delete(&self, integration_id: &str) -> PortalResult<()> {
        let result = sqlx::query("DELETE FROM integration_configs WHERE integration_id = ?1")
            .bind(integration_id)
            .execute(&self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(PortalError::NotFound(format!(
                "Integration {} not found",
                integration_id
            )));
        }
        Ok(())
    }

    pub async fn find(&self, integration_id: &str) -> PortalResult<Option<IntegrationConfig>> {
        let row = sqlx::query(
            "SELECT id, integration_id, enabled, auth_attribute, checkout_grace_minutes,
                    last_sync_utc, stale_count
             FROM integration_configs WHERE integration_id = ?1",
        )
        .bind(integration_id)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(row_to_integration).transpose()
    }

    pub async fn list(&self) -> PortalResult<Vec<IntegrationConfig>> {
        let rows = sqlx::query(
            "SELECT id, integration_id, enabled, auth_attribute, checkout_grace_minutes,
                    last_sync_utc, stale_count
             FROM integration_configs ORDER BY integration_id",
        )
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_integration).collect()
    }

    pub async fn list_enabled(&self) -> PortalResult<Vec<IntegrationConfig>> {
        let rows = sqlx::query(
            "SELECT id, integration_id, enabled, auth_attribute, checkout_grace_minutes,
                    last_sync_utc, stale_count
             FROM integration_configs WHERE enabled = 1 ORDER BY integration_id",
        )
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_integration).collect()
    }

    /// Successful poll: reset staleness and stamp the sync time
    pub async fn record_sync_success(
        &self,
        integration_id: &str,
        now: DateTime<Utc>,
    ) -> PortalResult<()> {
        sqlx::query(
            "UPDATE integration_configs SET stale_count = 0, last_sync_utc = ?1
             WHERE integration_id = ?2",
        )
        .bind(fmt_db(now))
        .bind(integration_id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Missed poll: bump the stale counter, returning the new value
    pub async fn record_sync_miss(&self, integration_id: &str) -> PortalResult<i64> {
        sqlx::query(
            "UPDATE integration_configs SET stale_count = stale_count + 1
             WHERE integration_id = ?1",
        )
        .bind(integration_id)
        .execute(&self.db)
        .await?;

        let row = sqlx::query("SELECT stale_count FROM integration_configs WHERE integration_id = ?1")
            .bind(integration_id)
            .fetch_one(&self.db)
            .await?;
        Ok(row.get("stale_count"))
    }
}

/// Fields accepted for an event upsert
#[derive(Debug, Clone)]
pub struct EventUpsert {
    pub integration_id: String,
    pub event_index: i64,
    pub slot_name: Option<String>,
    pub slot_code: Option<String>,
    pub last_four: Option<String>,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub raw_attributes: String,
}

#[derive(Clone)]
pub struct EventStore {
    db: SqlitePool,
}

impl EventStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Insert or refresh the cached event for `(integration_id, event_index)`
    pub async fn upsert(&self, event: EventUpsert) -> PortalResult<()> {
        let now = fmt_db(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO rental_events
                (integration_id, event_index, slot_name, slot_code, last_four,
                 start_utc, end_utc, raw_attributes, created_utc, updated_utc)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT (integration_id, event_index) DO UPDATE SET
                slot_name = excluded.slot_name,
                slot_code = excluded.slot_code,
                last_four = excluded.last_four,
                start_utc = excluded.start_utc,
                end_utc = excluded.end_utc,
                raw_attributes = excluded.raw_attributes,
                updated_utc = excluded.updated_utc
            "#,
        )
        .bind(&event.integration_id)
        .bind(event.event_index)
        .bind(&event.slot_name)
        .bind(&event.slot_code)
        .bind(&event.last_four)
        .bind(fmt_db(event.start_utc))
        .bind(fmt_db(event.end_utc))
        .bind(&event.raw_attributes)
        .bind(&now)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Cached events for one integration, index order
    pub async fn for_integration(&self, integration_id: &str) -> PortalResult<Vec<RentalEvent>> {
        let rows = sqlx::query(
            "SELECT id, integration_id, event_index, slot_name, slot_code, last_four,
                    start_utc, end_utc, raw_attributes, created_utc, updated_utc
             FROM rental_events WHERE integration_id = ?1 ORDER BY event_index",
        )
        .bind(integration_id)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Retention cleanup: drop events whose stay ended before `cutoff`
    pub async fn delete_where_end_before(&self, cutoff: DateTime<Utc>) -> PortalResult<u64> {
        let result = sqlx::query("DELETE FROM rental_events WHERE end_utc < ?1")
            .bind(fmt_db(cutoff))
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

fn row_to_integration(row: &sqlx::sqlite::SqliteRow) -> PortalResult<IntegrationConfig> {
    let id: String = row.get("id");
    let attr: String = row.get("auth_attribute");
    let last_sync: Option<String> = row.get("last_sync_utc");

    Ok(IntegrationConfig {
        id: Uuid::parse_str(&id)
            .map_err(|e| PortalError::Internal(format!("Bad integration id: {}", e)))?,
        integration_id: row.get("integration_id"),
        enabled: row.get("enabled"),
        auth_attribute: IdentifierAttr::parse(&attr)?,
        checkout_grace_minutes: row.get("checkout_grace_minutes"),
        last_sync_utc: last_sync.as_deref().map(parse_db).transpose()?,
        stale_count: row.get("stale_count"),
    })
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> PortalResult<RentalEvent> {
    let start: String = row.get("start_utc");
    let end: String = row.get("end_utc");
    let created: String = row.get("created_utc");
    let updated: String = row.get("updated_utc");

    Ok(RentalEvent {
        id: row.get("id"),
        integration_id: row.get("integration_id"),
        event_index: row.get("event_index"),
        slot_name: row.get("slot_name"),
        slot_code: row.get("slot_code"),
        last_four: row.get("last_four"),
        start_utc: parse_db(&start)?,
        end_utc: parse_db(&end)?,
        raw_attributes: row.get("raw_attributes"),
        created_utc: parse_db(&created)?,
        updated_utc: parse_db(&updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::{Duration, TimeZone};

    #[tokio::test]
    async fn test_integration_crud_and_grace_bounds() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = IntegrationManager::new(pool);

        let config = mgr
            .create("sensor.rental_unit_a", IdentifierAttr::SlotCode, 15)
            .await
            .unwrap();
        assert!(config.enabled);
        assert_eq!(config.stale_count, 0);

        // Duplicate integration id conflicts.
        let dup = mgr
            .create("sensor.rental_unit_a", IdentifierAttr::SlotCode, 15)
            .await;
        assert!(matches!(dup, Err(PortalError::Conflict(_))));

        // Grace bounds.
        let bad = mgr.create("sensor.other", IdentifierAttr::SlotCode, 31).await;
        assert!(matches!(bad, Err(PortalError::InvalidInput(_))));

        let updated = mgr
            .update("sensor.rental_unit_a", false, IdentifierAttr::LastFour, 30)
            .await
            .unwrap();
        assert!(!updated.enabled);
        assert_eq!(updated.auth_attribute, IdentifierAttr::LastFour);

        mgr.delete("sensor.rental_unit_a").await.unwrap();
        assert!(mgr.find("sensor.rental_unit_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_counter_lifecycle() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = IntegrationManager::new(pool);
        mgr.create("sensor.unit", IdentifierAttr::SlotCode, 15)
            .await
            .unwrap();

        for expected in 1..=STALE_BLOCK_THRESHOLD {
            assert_eq!(mgr.record_sync_miss("sensor.unit").await.unwrap(), expected);
        }
        let config = mgr.find("sensor.unit").await.unwrap().unwrap();
        assert!(config.is_blocked());

        mgr.record_sync_success("sensor.unit", Utc::now()).await.unwrap();
        let config = mgr.find("sensor.unit").await.unwrap().unwrap();
        assert_eq!(config.stale_count, 0);
        assert!(!config.is_blocked());
        assert!(config.last_sync_utc.is_some());
    }

    #[tokio::test]
    async fn test_event_upsert_replaces_by_index() {
        let pool = db::connect_memory().await.unwrap();
        let store = EventStore::new(pool);
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 16, 0, 0).unwrap();

        let mut event = EventUpsert {
            integration_id: "sensor.unit".to_string(),
            event_index: 0,
            slot_name: Some("Jane Guest".to_string()),
            slot_code: Some("4821".to_string()),
            last_four: Some("4821".to_string()),
            start_utc: start,
            end_utc: start + Duration::days(3),
            raw_attributes: r#"{"slot_code":"4821"}"#.to_string(),
        };
        store.upsert(event.clone()).await.unwrap();

        event.slot_code = Some("9999".to_string());
        store.upsert(event).await.unwrap();

        let events = store.for_integration("sensor.unit").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].slot_code.as_deref(), Some("9999"));
    }

    #[tokio::test]
    async fn test_retention_cleanup() {
        let pool = db::connect_memory().await.unwrap();
        let store = EventStore::new(pool);
        let now = Utc::now();

        for (idx, end) in [(0, now - Duration::days(10)), (1, now - Duration::days(2))] {
            store
                .upsert(EventUpsert {
                    integration_id: "sensor.unit".to_string(),
                    event_index: idx,
                    slot_name: None,
                    slot_code: Some(format!("100{}", idx)),
                    last_four: None,
                    start_utc: end - Duration::days(3),
                    end_utc: end,
                    raw_attributes: "{}".to_string(),
                })
                .await
                .unwrap();
        }

        let deleted = store
            .delete_where_end_before(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.for_integration("sensor.unit").await.unwrap().len(), 1);
    }

    #[test]
    fn test_identifier_fallback_order() {
        let event = RentalEvent {
            id: 1,
            integration_id: "sensor.unit".to_string(),
            event_index: 0,
            slot_name: Some("Jane Guest".to_string()),
            slot_code: None,
            last_four: None,
            start_utc: Utc::now(),
            end_utc: Utc::now(),
            raw_attributes: "{}".to_string(),
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };

        // Configured slot_code absent, falls through to slot_name.
        assert_eq!(
            event.identifier_for(IdentifierAttr::SlotCode),
            Some("Jane Guest")
        );
        assert_eq!(
            event.identifier_for(IdentifierAttr::LastFour),
            Some("Jane Guest")
        );
    }
}
