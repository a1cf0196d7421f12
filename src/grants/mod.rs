/// Access grant lifecycle management
///
/// Grants move PENDING -> ACTIVE -> EXPIRED / REVOKED. REVOKED is
/// terminal; extending an EXPIRED grant reactivates it. Lifetimes are
/// minute-rounded: start floors, end ceils. Every mutation that needs a
/// controller call enqueues it in the same transaction.
use crate::error::{PortalError, PortalResult};
use crate::retry_queue::{enqueue_tx, OpPayload, OpType};
use crate::timeutil::{ceil_to_minute, floor_to_minute, fmt_db, parse_db, truncate_to_second};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Seconds a session-token grant may stay unreconciled before revocation
pub const MAC_RECONCILE_WINDOW_SECONDS: i64 = 30;

/// Access grant lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Pending,
    Active,
    Expired,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Pending => "pending",
            GrantStatus::Active => "active",
            GrantStatus::Expired => "expired",
            GrantStatus::Revoked => "revoked",
        }
    }

    fn parse(s: &str) -> PortalResult<Self> {
        match s {
            "pending" => Ok(GrantStatus::Pending),
            "active" => Ok(GrantStatus::Active),
            "expired" => Ok(GrantStatus::Expired),
            "revoked" => Ok(GrantStatus::Revoked),
            other => Err(PortalError::Internal(format!("Invalid grant status: {}", other))),
        }
    }
}

/// An authorized (or historical) network access window for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessGrant {
    pub id: Uuid,
    pub voucher_code: Option<String>,
    pub booking_ref: Option<String>,
    pub integration_id: Option<String>,
    /// Original guest input, case preserved, for audit
    pub user_input_code: Option<String>,
    pub mac: Option<String>,
    pub session_token: Option<String>,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub controller_grant_id: Option<String>,
    pub status: GrantStatus,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl AccessGrant {
    /// The identifier this grant was issued against
    pub fn identifier(&self) -> Option<&str> {
        self.booking_ref.as_deref().or(self.voucher_code.as_deref())
    }
}

/// Parameters for creating a grant
#[derive(Debug, Clone)]
pub struct NewGrant {
    pub voucher_code: Option<String>,
    pub booking_ref: Option<String>,
    pub integration_id: Option<String>,
    pub user_input_code: Option<String>,
    pub mac: Option<String>,
    pub session_token: Option<String>,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub up_kbps: Option<i64>,
    pub down_kbps: Option<i64>,
}

#[derive(Clone)]
pub struct GrantManager {
    db: SqlitePool,
    /// Per-(mac, identifier) creation locks. The uniqueness check and the
    /// insert run as check-then-insert, so concurrent submissions for the
    /// same pair must not interleave.
    pair_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl GrantManager {
    pub fn new(db: SqlitePool) -> Self {
        Self {
            db,
            pair_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn pair_lock(&self, mac: &str, identifier: &str) -> Arc<tokio::sync::Mutex<()>> {
        let key = format!("{}|{}", mac, identifier.to_lowercase());
        let mut locks = self.pair_locks.lock().expect("grant lock table poisoned");
        Arc::clone(locks.entry(key).or_default())
    }

    /// Create a PENDING grant and enqueue its controller authorize in the
    /// same transaction. Timestamps are rounded here; callers pass raw
    /// times.
    pub async fn create(&self, params: NewGrant) -> PortalResult<AccessGrant> {
        if params.voucher_code.is_none() && params.booking_ref.is_none() {
            return Err(PortalError::InvalidInput(
                "Grant requires a voucher code or booking reference".to_string(),
            ));
        }
        if params.mac.is_none() && params.session_token.is_none() {
            return Err(PortalError::InvalidInput(
                "Grant requires a MAC address or session token".to_string(),
            ));
        }

        let start = floor_to_minute(params.start_utc);
        let end = ceil_to_minute(params.end_utc);
        if end <= start {
            return Err(PortalError::InvalidInput(
                "Grant end must be after start".to_string(),
            ));
        }

        let now = Utc::now();
        let id = Uuid::new_v4();

        // Serialize creations for the same (mac, identifier) pair; the
        // loser of a race sees the winner's row in the check below.
        let pair_lock = match (
            params.mac.as_deref(),
            params
                .booking_ref
                .as_deref()
                .or(params.voucher_code.as_deref()),
        ) {
            (Some(mac), Some(identifier)) => Some(self.pair_lock(mac, identifier)),
            _ => None,
        };
        let _pair_guard = match &pair_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let mut tx = self.db.begin().await?;

        // One non-revoked grant per (mac, identifier).
        if let (Some(mac), Some(identifier)) = (
            params.mac.as_deref(),
            params
                .booking_ref
                .as_deref()
                .or(params.voucher_code.as_deref()),
        ) {
            let row = sqlx::query(
                r#"
                SELECT COUNT(*) AS n FROM access_grants
                WHERE mac = ?1
                  AND status != 'revoked'
                  AND (LOWER(COALESCE(booking_ref, '')) = LOWER(?2)
                       OR LOWER(COALESCE(voucher_code, '')) = LOWER(?2))
                "#,
            )
            .bind(mac)
            .bind(identifier)
            .fetch_one(&mut *tx)
            .await?;
            let n: i64 = row.get("n");
            if n > 0 {
                return Err(PortalError::DuplicateGrant(format!(
                    "Device {} already has access for this code",
                    mac
                )));
            }
        }

        sqlx::query(
            r#"
            INSERT INTO access_grants
                (id, voucher_code, booking_ref, integration_id, user_input_code,
                 mac, session_token, start_utc, end_utc, controller_grant_id,
                 status, created_utc, updated_utc)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, 'pending', ?10, ?10)
            "#,
        )
        .bind(id.to_string())
        .bind(&params.voucher_code)
        .bind(&params.booking_ref)
        .bind(&params.integration_id)
        .bind(&params.user_input_code)
        .bind(&params.mac)
        .bind(&params.session_token)
        .bind(fmt_db(start))
        .bind(fmt_db(end))
        .bind(fmt_db(now))
        .execute(&mut *tx)
        .await?;

        // Session-token grants wait for MAC reconciliation before the
        // controller learns about them.
        if let Some(mac) = &params.mac {
            enqueue_tx(
                &mut tx,
                OpType::Authorize,
                id,
                &OpPayload {
                    mac: mac.clone(),
                    end_utc: Some(end),
                    up_kbps: params.up_kbps,
                    down_kbps: params.down_kbps,
                },
            )
            .await?;
        }

        tx.commit().await?;

        Ok(AccessGrant {
            id,
            voucher_code: params.voucher_code,
            booking_ref: params.booking_ref,
            integration_id: params.integration_id,
            user_input_code: params.user_input_code,
            mac: params.mac,
            session_token: params.session_token,
            start_utc: start,
            end_utc: end,
            controller_grant_id: None,
            status: GrantStatus::Pending,
            created_utc: now,
            updated_utc: now,
        })
    }

    /// Extend a grant by `additional_minutes`.
    ///
    /// REVOKED grants are not extensible. An EXPIRED grant reactivates
    /// with `end = ceil(max(end, now) + minutes)`; otherwise
    /// `end = ceil(end + minutes)`. Zero minutes is a rounding no-op.
    pub async fn extend(
        &self,
        grant_id: Uuid,
        additional_minutes: i64,
        now: DateTime<Utc>,
    ) -> PortalResult<AccessGrant> {
        if additional_minutes < 0 {
            return Err(PortalError::InvalidInput(
                "additional_minutes must not be negative".to_string(),
            ));
        }

        let mut tx = self.db.begin().await?;

        let mut grant = fetch_grant(&mut *tx, grant_id)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("Grant {} not found", grant_id)))?;

        if grant.status == GrantStatus::Revoked {
            return Err(PortalError::GrantOperation(format!(
                "Cannot extend revoked grant {}",
                grant_id
            )));
        }

        let base = if grant.status == GrantStatus::Expired {
            grant.end_utc.max(now)
        } else {
            grant.end_utc
        };
        let new_end = ceil_to_minute(base + Duration::minutes(additional_minutes));
        let new_status = if grant.status == GrantStatus::Expired {
            GrantStatus::Active
        } else {
            grant.status
        };

        sqlx::query(
            "UPDATE access_grants SET end_utc = ?1, status = ?2, updated_utc = ?3 WHERE id = ?4",
        )
        .bind(fmt_db(new_end))
        .bind(new_status.as_str())
        .bind(fmt_db(now))
        .bind(grant_id.to_string())
        .execute(&mut *tx)
        .await?;

        if let Some(mac) = &grant.mac {
            enqueue_tx(
                &mut tx,
                OpType::Update,
                grant_id,
                &OpPayload {
                    mac: mac.clone(),
                    end_utc: Some(new_end),
                    up_kbps: None,
                    down_kbps: None,
                },
            )
            .await?;
        }

        tx.commit().await?;

        grant.end_utc = new_end;
        grant.status = new_status;
        grant.updated_utc = now;
        Ok(grant)
    }

    /// Revoke a grant. Idempotent: an already-REVOKED grant is returned
    /// unchanged with no controller call and no state write.
    pub async fn revoke(&self, grant_id: Uuid, now: DateTime<Utc>) -> PortalResult<AccessGrant> {
        let mut tx = self.db.begin().await?;

        let mut grant = fetch_grant(&mut *tx, grant_id)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("Grant {} not found", grant_id)))?;

        if grant.status == GrantStatus::Revoked {
            return Ok(grant);
        }

        let end = truncate_to_second(now);
        sqlx::query(
            "UPDATE access_grants SET status = 'revoked', end_utc = ?1, updated_utc = ?2 WHERE id = ?3",
        )
        .bind(fmt_db(end))
        .bind(fmt_db(now))
        .bind(grant_id.to_string())
        .execute(&mut *tx)
        .await?;

        if let Some(mac) = &grant.mac {
            enqueue_tx(
                &mut tx,
                OpType::Revoke,
                grant_id,
                &OpPayload {
                    mac: mac.clone(),
                    end_utc: None,
                    up_kbps: None,
                    down_kbps: None,
                },
            )
            .await?;
        }

        tx.commit().await?;

        grant.status = GrantStatus::Revoked;
        grant.end_utc = end;
        grant.updated_utc = now;
        Ok(grant)
    }

    /// ACTIVE grants whose window has closed become EXPIRED. No controller
    /// call: expiry on the controller side rides the authorize `time`
    /// parameter.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> PortalResult<u64> {
        let result = sqlx::query(
            "UPDATE access_grants SET status = 'expired', updated_utc = ?1
             WHERE status = 'active' AND end_utc <= ?1",
        )
        .bind(fmt_db(now))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    /// Revoke session-token grants that never got a MAC within the
    /// reconciliation window.
    pub async fn orphan_sweep(&self, now: DateTime<Utc>) -> PortalResult<u64> {
        let cutoff = now - Duration::seconds(MAC_RECONCILE_WINDOW_SECONDS);
        let result = sqlx::query(
            "UPDATE access_grants SET status = 'revoked', updated_utc = ?1
             WHERE status = 'pending' AND mac IS NULL AND session_token IS NOT NULL
               AND created_utc <= ?2",
        )
        .bind(fmt_db(now))
        .bind(fmt_db(cutoff))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    /// Attach a MAC to a session-token grant and enqueue the deferred
    /// controller authorize.
    pub async fn reconcile_mac(
        &self,
        session_token: &str,
        mac: &str,
        now: DateTime<Utc>,
    ) -> PortalResult<AccessGrant> {
        let row = sqlx::query(
            "SELECT id FROM access_grants WHERE session_token = ?1 AND mac IS NULL AND status = 'pending'",
        )
        .bind(session_token)
        .fetch_optional(&self.db)
        .await?;

        let id: String = match row {
            Some(row) => row.get("id"),
            None => {
                return Err(PortalError::NotFound(
                    "No unreconciled grant for session token".to_string(),
                ))
            }
        };
        let grant_id = Uuid::parse_str(&id)
            .map_err(|e| PortalError::Internal(format!("Bad grant id: {}", e)))?;

        let pending = self
            .get_by_id(grant_id)
            .await?
            .ok_or_else(|| PortalError::Internal("Grant vanished during reconcile".to_string()))?;

        // Attaching the MAC creates a (mac, identifier) pair, so it takes
        // the same creation lock as a fresh grant for that pair.
        let pair_lock = pending
            .identifier()
            .map(|identifier| self.pair_lock(mac, identifier));
        let _pair_guard = match &pair_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let mut tx = self.db.begin().await?;

        // Re-check under the lock: the grant may have been reconciled,
        // swept, or revoked meanwhile.
        let current = fetch_grant(&mut *tx, grant_id)
            .await?
            .ok_or_else(|| PortalError::Internal("Grant vanished during reconcile".to_string()))?;
        if current.mac.is_some()
            || current.status != GrantStatus::Pending
            || current.session_token.as_deref() != Some(session_token)
        {
            return Err(PortalError::NotFound(
                "No unreconciled grant for session token".to_string(),
            ));
        }

        // The device may already hold a grant for this identifier; the
        // token grant is then redundant and left to the orphan sweep.
        if let Some(identifier) = current.identifier() {
            let row = sqlx::query(
                r#"
                SELECT COUNT(*) AS n FROM access_grants
                WHERE mac = ?1
                  AND status != 'revoked'
                  AND (LOWER(COALESCE(booking_ref, '')) = LOWER(?2)
                       OR LOWER(COALESCE(voucher_code, '')) = LOWER(?2))
                "#,
            )
            .bind(mac)
            .bind(identifier)
            .fetch_one(&mut *tx)
            .await?;
            let n: i64 = row.get("n");
            if n > 0 {
                return Err(PortalError::DuplicateGrant(format!(
                    "Device {} already has access for this code",
                    mac
                )));
            }
        }

        sqlx::query(
            "UPDATE access_grants SET mac = ?1, session_token = NULL, updated_utc = ?2 WHERE id = ?3",
        )
        .bind(mac)
        .bind(fmt_db(now))
        .bind(&id)
        .execute(&mut *tx)
        .await?;

        let grant = fetch_grant(&mut *tx, grant_id)
            .await?
            .ok_or_else(|| PortalError::Internal("Grant vanished during reconcile".to_string()))?;

        enqueue_tx(
            &mut tx,
            OpType::Authorize,
            grant_id,
            &OpPayload {
                mac: mac.to_string(),
                end_utc: Some(grant.end_utc),
                up_kbps: None,
                down_kbps: None,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(grant)
    }

    /// PENDING -> ACTIVE once the controller acknowledges
    pub async fn mark_controller_ack(
        &self,
        grant_id: Uuid,
        controller_grant_id: &str,
    ) -> PortalResult<()> {
        sqlx::query(
            "UPDATE access_grants SET controller_grant_id = ?1, status = 'active', updated_utc = ?2
             WHERE id = ?3 AND status = 'pending'",
        )
        .bind(controller_grant_id)
        .bind(fmt_db(Utc::now()))
        .bind(grant_id.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn get_by_id(&self, grant_id: Uuid) -> PortalResult<Option<AccessGrant>> {
        let row = sqlx::query(GRANT_COLUMNS_WHERE_ID)
            .bind(grant_id.to_string())
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(row_to_grant).transpose()
    }

    /// Non-expired, non-revoked grants for a device
    pub async fn find_active_by_mac(&self, mac: &str) -> PortalResult<Vec<AccessGrant>> {
        let rows = sqlx::query(
            &format!("{} WHERE mac = ?1 AND status IN ('pending', 'active')", GRANT_SELECT),
        )
        .bind(mac)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_grant).collect()
    }

    /// Whether a non-revoked grant exists for this device and identifier
    /// (case-insensitive on the identifier)
    pub async fn has_non_revoked(&self, mac: &str, identifier: &str) -> PortalResult<bool> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM access_grants
            WHERE mac = ?1
              AND status != 'revoked'
              AND (LOWER(COALESCE(booking_ref, '')) = LOWER(?2)
                   OR LOWER(COALESCE(voucher_code, '')) = LOWER(?2))
            "#,
        )
        .bind(mac)
        .bind(identifier)
        .fetch_one(&self.db)
        .await?;
        let n: i64 = row.get("n");
        Ok(n > 0)
    }

    /// All grants, newest first, for the admin listing
    pub async fn list(&self, limit: i64) -> PortalResult<Vec<AccessGrant>> {
        let rows = sqlx::query(&format!("{} ORDER BY created_utc DESC LIMIT ?1", GRANT_SELECT))
            .bind(limit)
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(row_to_grant).collect()
    }
}

const GRANT_SELECT: &str = r#"
    SELECT id, voucher_code, booking_ref, integration_id, user_input_code,
           mac, session_token, start_utc, end_utc, controller_grant_id,
           status, created_utc, updated_utc
    FROM access_grants
"#;

const GRANT_COLUMNS_WHERE_ID: &str = r#"
    SELECT id, voucher_code, booking_ref, integration_id, user_input_code,
           mac, session_token, start_utc, end_utc, controller_grant_id,
           status, created_utc, updated_utc
    FROM access_grants
    WHERE id = ?1
"#;

async fn fetch_grant(
    tx: &mut sqlx::SqliteConnection,
    grant_id: Uuid,
) -> PortalResult<Option<AccessGrant>> {
    let row = sqlx::query(GRANT_COLUMNS_WHERE_ID)
        .bind(grant_id.to_string())
        .fetch_optional(tx)
        .await?;
    row.as_ref().map(row_to_grant).transpose()
}

fn row_to_grant(row: &sqlx::sqlite::SqliteRow) -> PortalResult<AccessGrant> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let start: String = row.get("start_utc");
    let end: String = row.get("end_utc");
    let created: String = row.get("created_utc");
    let updated: String = row.get("updated_utc");

    Ok(AccessGrant {
        id: Uuid::parse_str(&id)
            .map_err(|e| PortalError::Internal(format!("Bad grant id: {}", e)))?,
        voucher_code: row.get("voucher_code"),
        booking_ref: row.get("booking_ref"),
        integration_id: row.get("integration_id"),
        user_input_code: row.get("user_input_code"),
        mac: row.get("mac"),
        session_token: row.get("session_token"),
        start_utc: parse_db(&start)?,
        end_utc: parse_db(&end)?,
        controller_grant_id: row.get("controller_grant_id"),
        status: GrantStatus::parse(&status)?,
        created_utc: parse_db(&created)?,
        updated_utc: parse_db(&updated)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use chrono::{TimeZone, Timelike};

    fn manager(pool: &SqlitePool) -> GrantManager {
        GrantManager::new(pool.clone())
    }

    fn params(mac: &str, code: &str) -> NewGrant {
        NewGrant {
            voucher_code: Some(code.to_string()),
            booking_ref: None,
            integration_id: None,
            user_input_code: Some(code.to_lowercase()),
            mac: Some(mac.to_string()),
            session_token: None,
            start_utc: Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 30).unwrap(),
            end_utc: Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 30).unwrap(),
            up_kbps: None,
            down_kbps: None,
        }
    }

    #[tokio::test]
    async fn test_create_rounds_to_minutes() {
        let pool = db::connect_memory().await.unwrap();
        let grant = manager(&pool)
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();

        assert_eq!(grant.start_utc.second(), 0);
        assert_eq!(grant.end_utc.second(), 0);
        assert_eq!(
            grant.start_utc,
            Utc.with_ymd_and_hms(2025, 3, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(
            grant.end_utc,
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 1, 0).unwrap()
        );
        assert_eq!(grant.status, GrantStatus::Pending);
        assert!(grant.end_utc >= grant.start_utc);
    }

    #[tokio::test]
    async fn test_create_enqueues_controller_authorize() {
        let pool = db::connect_memory().await.unwrap();
        manager(&pool)
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();

        let depth = crate::retry_queue::RetryQueue::new(pool).depth().await.unwrap();
        assert_eq!(depth, 1);
    }

    #[tokio::test]
    async fn test_duplicate_non_revoked_rejected() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        mgr.create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();

        let err = mgr
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap_err();
        assert!(matches!(err, PortalError::DuplicateGrant(_)));

        // Same code on another device is fine.
        mgr.create(params("11:22:33:44:55:66", "CODE123456"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_revoked_grant_frees_the_pair() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let grant = mgr
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();
        mgr.revoke(grant.id, Utc::now()).await.unwrap();

        // The pair is reusable once the old grant is revoked.
        mgr.create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_extend_moves_end_and_enqueues() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let grant = mgr
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 11, 0, 0).unwrap();
        let extended = mgr.extend(grant.id, 30, now).await.unwrap();
        assert_eq!(extended.end_utc, grant.end_utc + Duration::minutes(30));

        let depth = crate::retry_queue::RetryQueue::new(pool).depth().await.unwrap();
        assert_eq!(depth, 2); // authorize + update
    }

    #[tokio::test]
    async fn test_extend_zero_is_noop_on_end() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let grant = mgr
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();

        let extended = mgr.extend(grant.id, 0, Utc::now()).await.unwrap();
        assert_eq!(extended.end_utc, grant.end_utc);
    }

    #[tokio::test]
    async fn test_extend_reactivates_expired() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let grant = mgr
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();

        // Expire it.
        let after_end = grant.end_utc + Duration::minutes(5);
        mgr.mark_controller_ack(grant.id, "ctrl-1").await.unwrap();
        assert_eq!(mgr.expire_sweep(after_end).await.unwrap(), 1);

        // Extending from an expired state counts forward from now.
        let now = grant.end_utc + Duration::hours(1);
        let extended = mgr.extend(grant.id, 15, now).await.unwrap();
        assert_eq!(extended.status, GrantStatus::Active);
        assert_eq!(extended.end_utc, ceil_to_minute(now + Duration::minutes(15)));
    }

    #[tokio::test]
    async fn test_extend_revoked_fails() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let grant = mgr
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();
        mgr.revoke(grant.id, Utc::now()).await.unwrap();

        let err = mgr.extend(grant.id, 30, Utc::now()).await.unwrap_err();
        assert!(matches!(err, PortalError::GrantOperation(_)));
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent_and_terminal() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let grant = mgr
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();

        let first = mgr.revoke(grant.id, Utc::now()).await.unwrap();
        assert_eq!(first.status, GrantStatus::Revoked);
        let queue = crate::retry_queue::RetryQueue::new(pool.clone());
        let depth_after_first = queue.depth().await.unwrap();

        // Second revoke: success, no state change, no new controller op.
        let second = mgr.revoke(grant.id, Utc::now()).await.unwrap();
        assert_eq!(second.status, GrantStatus::Revoked);
        assert_eq!(queue.depth().await.unwrap(), depth_after_first);

        // Terminal: the sweep never resurrects it.
        mgr.expire_sweep(Utc::now() + Duration::days(30)).await.unwrap();
        let reloaded = mgr.get_by_id(grant.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, GrantStatus::Revoked);
    }

    #[tokio::test]
    async fn test_expire_sweep_only_touches_active() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let grant = mgr
            .create(params("AA:BB:CC:DD:EE:FF", "CODE123456"))
            .await
            .unwrap();

        // PENDING grants are not swept.
        assert_eq!(mgr.expire_sweep(grant.end_utc + Duration::hours(1)).await.unwrap(), 0);

        mgr.mark_controller_ack(grant.id, "ctrl-1").await.unwrap();
        assert_eq!(mgr.expire_sweep(grant.end_utc + Duration::hours(1)).await.unwrap(), 1);
        let reloaded = mgr.get_by_id(grant.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, GrantStatus::Expired);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_same_pair_creates_yield_one_grant() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let mgr = mgr.clone();
                tokio::spawn(async move {
                    mgr.create(NewGrant {
                        voucher_code: None,
                        booking_ref: Some("4821".to_string()),
                        integration_id: Some("sensor.unit".to_string()),
                        user_input_code: Some("4821".to_string()),
                        mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
                        session_token: None,
                        start_utc: Utc::now(),
                        end_utc: Utc::now() + Duration::hours(4),
                        up_kbps: None,
                        down_kbps: None,
                    })
                    .await
                })
            })
            .collect();

        let mut successes = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => successes += 1,
                Err(PortalError::DuplicateGrant(_)) => duplicates += 1,
                Err(other) => panic!("unexpected create error: {}", other),
            }
        }
        assert_eq!(successes, 1);
        assert_eq!(duplicates, 19);

        let row = sqlx::query("SELECT COUNT(*) AS n FROM access_grants")
            .fetch_one(&pool)
            .await
            .unwrap();
        let n: i64 = row.get("n");
        assert_eq!(n, 1);
    }

    #[tokio::test]
    async fn test_session_token_fallback_and_reconcile() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let queue = crate::retry_queue::RetryQueue::new(pool.clone());

        let mut p = params("unused", "CODE123456");
        p.mac = None;
        p.session_token = Some("tok-123".to_string());
        let grant = mgr.create(p).await.unwrap();

        // No controller op until the MAC arrives.
        assert_eq!(queue.depth().await.unwrap(), 0);

        let reconciled = mgr
            .reconcile_mac("tok-123", "AA:BB:CC:DD:EE:FF", Utc::now())
            .await
            .unwrap();
        assert_eq!(reconciled.id, grant.id);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_orphan_sweep_revokes_stale_token_grants() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);

        let mut p = params("unused", "CODE123456");
        p.mac = None;
        p.session_token = Some("tok-456".to_string());
        let grant = mgr.create(p).await.unwrap();

        // Inside the window: untouched.
        assert_eq!(mgr.orphan_sweep(Utc::now()).await.unwrap(), 0);

        // Past the window: revoked.
        let later = Utc::now() + Duration::seconds(MAC_RECONCILE_WINDOW_SECONDS + 1);
        assert_eq!(mgr.orphan_sweep(later).await.unwrap(), 1);
        let reloaded = mgr.get_by_id(grant.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, GrantStatus::Revoked);
    }
}
