/// Booking-code validation against cached reservation events
///
/// Matching is case-insensitive; the returned event keeps identifiers in
/// their original case for audit. The admission window runs from one hour
/// before check-in to checkout plus the integration's grace minutes.
use crate::error::{PortalError, PortalResult};
use crate::grants::GrantManager;
use crate::rental::{EventStore, IntegrationConfig, RentalEvent};
use chrono::{DateTime, Duration, Utc};

/// Fixed early check-in window
pub const EARLY_CHECKIN_MINUTES: i64 = 60;

#[derive(Clone)]
pub struct BookingValidator {
    events: EventStore,
    grants: GrantManager,
}

impl BookingValidator {
    pub fn new(events: EventStore, grants: GrantManager) -> Self {
        Self { events, grants }
    }

    /// Validate a guest-entered code for one integration.
    ///
    /// Order matters: an unmatched code is NotFound even on a stale
    /// integration, but a matched code on a blocked integration must not
    /// produce a grant.
    pub async fn validate(
        &self,
        user_input: &str,
        integration: &IntegrationConfig,
        mac: Option<&str>,
        now: DateTime<Utc>,
    ) -> PortalResult<RentalEvent> {
        let input = user_input.trim();
        if input.is_empty() {
            return Err(PortalError::InvalidInput("Empty booking code".to_string()));
        }

        let events = self.events.for_integration(&integration.integration_id).await?;

        let matched = events.into_iter().find(|event| {
            event
                .identifier_for(integration.auth_attribute)
                .map(|id| id.eq_ignore_ascii_case(input))
                .unwrap_or(false)
        });

        let event = matched
            .ok_or_else(|| PortalError::NotFound(format!("No booking matches '{}'", input)))?;

        if integration.is_blocked() {
            return Err(PortalError::IntegrationUnavailable(format!(
                "Integration {} has missed {} polls",
                integration.integration_id, integration.stale_count
            )));
        }

        let earliest = event.start_utc - Duration::minutes(EARLY_CHECKIN_MINUTES);
        let latest = event.end_utc + Duration::minutes(integration.checkout_grace_minutes);

        if now < earliest {
            return Err(PortalError::OutsideWindow(format!(
                "Booking begins at {}; early check-in opens {} minutes before",
                event.start_utc, EARLY_CHECKIN_MINUTES
            )));
        }
        if now > latest {
            return Err(PortalError::OutsideWindow(format!(
                "Booking ended at {}",
                event.end_utc
            )));
        }

        // Duplicate detection is per device; other devices on the same
        // booking are always admitted.
        if let Some(mac) = mac {
            if let Some(identifier) = event.identifier_for(integration.auth_attribute) {
                if self.grants.has_non_revoked(mac, identifier).await? {
                    return Err(PortalError::DuplicateGrant(
                        "This device already has access for this booking".to_string(),
                    ));
                }
            }
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::rental::{EventUpsert, IdentifierAttr, IntegrationManager, STALE_BLOCK_THRESHOLD};
    use chrono::TimeZone;
    use sqlx::SqlitePool;

    async fn setup(pool: &SqlitePool) -> (BookingValidator, IntegrationConfig) {
        let integrations = IntegrationManager::new(pool.clone());
        let integration = integrations
            .create("sensor.unit", IdentifierAttr::SlotCode, 15)
            .await
            .unwrap();

        let events = EventStore::new(pool.clone());
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 16, 0, 0).unwrap();
        events
            .upsert(EventUpsert {
                integration_id: "sensor.unit".to_string(),
                event_index: 0,
                slot_name: Some("Jane Guest".to_string()),
                slot_code: Some("4821".to_string()),
                last_four: None,
                start_utc: start,
                end_utc: Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap() + Duration::days(3),
                raw_attributes: "{}".to_string(),
            })
            .await
            .unwrap();

        let validator = BookingValidator::new(events, GrantManager::new(pool.clone()));
        (validator, integration)
    }

    fn in_window() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 2, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_case_insensitive_match_preserves_case() {
        let pool = db::connect_memory().await.unwrap();
        let integrations = IntegrationManager::new(pool.clone());
        let integration = integrations
            .create("sensor.unit", IdentifierAttr::SlotName, 15)
            .await
            .unwrap();

        let events = EventStore::new(pool.clone());
        events
            .upsert(EventUpsert {
                integration_id: "sensor.unit".to_string(),
                event_index: 0,
                slot_name: Some("Jane Guest".to_string()),
                slot_code: None,
                last_four: None,
                start_utc: in_window() - Duration::days(1),
                end_utc: in_window() + Duration::days(1),
                raw_attributes: "{}".to_string(),
            })
            .await
            .unwrap();

        let validator = BookingValidator::new(events, GrantManager::new(pool));
        for input in ["jane guest", "JANE GUEST", "Jane Guest", "  Jane Guest  "] {
            let event = validator
                .validate(input, &integration, None, in_window())
                .await
                .unwrap();
            assert_eq!(event.slot_name.as_deref(), Some("Jane Guest"));
        }
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let pool = db::connect_memory().await.unwrap();
        let (validator, integration) = setup(&pool).await;
        let result = validator
            .validate("0000", &integration, None, in_window())
            .await;
        assert!(matches!(result, Err(PortalError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_grace_boundary() {
        let pool = db::connect_memory().await.unwrap();
        let (validator, integration) = setup(&pool).await;

        let events = EventStore::new(pool.clone());
        let end = Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap();
        events
            .upsert(EventUpsert {
                integration_id: "sensor.unit".to_string(),
                event_index: 0,
                slot_name: None,
                slot_code: Some("4821".to_string()),
                last_four: None,
                start_utc: end - Duration::days(3),
                end_utc: end,
                raw_attributes: "{}".to_string(),
            })
            .await
            .unwrap();

        // Exactly end + grace admits.
        let at_grace = end + Duration::minutes(15);
        assert!(validator
            .validate("4821", &integration, None, at_grace)
            .await
            .is_ok());

        // One second past fails.
        let past = at_grace + Duration::seconds(1);
        let result = validator.validate("4821", &integration, None, past).await;
        assert!(matches!(result, Err(PortalError::OutsideWindow(_))));
    }

    #[tokio::test]
    async fn test_early_checkin_window() {
        let pool = db::connect_memory().await.unwrap();
        let (validator, integration) = setup(&pool).await;

        let start = Utc.with_ymd_and_hms(2025, 3, 1, 16, 0, 0).unwrap();

        // 60 minutes early is fine.
        assert!(validator
            .validate("4821", &integration, None, start - Duration::minutes(60))
            .await
            .is_ok());

        // 61 minutes early is not.
        let result = validator
            .validate("4821", &integration, None, start - Duration::minutes(61))
            .await;
        assert!(matches!(result, Err(PortalError::OutsideWindow(_))));
    }

    #[tokio::test]
    async fn test_blocked_integration_refuses_matched_code() {
        let pool = db::connect_memory().await.unwrap();
        let (validator, _) = setup(&pool).await;

        let integrations = IntegrationManager::new(pool.clone());
        for _ in 0..STALE_BLOCK_THRESHOLD {
            integrations.record_sync_miss("sensor.unit").await.unwrap();
        }
        let stale = integrations.find("sensor.unit").await.unwrap().unwrap();

        let result = validator.validate("4821", &stale, None, in_window()).await;
        assert!(matches!(result, Err(PortalError::IntegrationUnavailable(_))));
    }

    #[tokio::test]
    async fn test_duplicate_same_device_only() {
        let pool = db::connect_memory().await.unwrap();
        let (validator, integration) = setup(&pool).await;
        let grants = GrantManager::new(pool.clone());

        grants
            .create(crate::grants::NewGrant {
                voucher_code: None,
                booking_ref: Some("4821".to_string()),
                integration_id: Some("sensor.unit".to_string()),
                user_input_code: Some("4821".to_string()),
                mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
                session_token: None,
                start_utc: in_window(),
                end_utc: in_window() + Duration::hours(4),
                up_kbps: None,
                down_kbps: None,
            })
            .await
            .unwrap();

        // Same device: duplicate.
        let result = validator
            .validate("4821", &integration, Some("AA:BB:CC:DD:EE:FF"), in_window())
            .await;
        assert!(matches!(result, Err(PortalError::DuplicateGrant(_))));

        // Different device: allowed.
        assert!(validator
            .validate("4821", &integration, Some("11:22:33:44:55:66"), in_window())
            .await
            .is_ok());
    }
}
