/// Voucher lifecycle: generation, redemption, expiry
///
/// Codes are drawn from A-Z0-9 with a CSPRNG; the unique constraint on
/// `code` drives collision retry. Redemption is serialized per code so
/// concurrent submissions of the same (code, mac) produce exactly one
/// grant.
use crate::error::{PortalError, PortalResult};
use crate::grants::{AccessGrant, GrantManager, NewGrant};
use crate::timeutil::{fmt_db, parse_db};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const MIN_CODE_LENGTH: usize = 4;
pub const MAX_CODE_LENGTH: usize = 24;
pub const DEFAULT_CODE_LENGTH: usize = 10;

/// Collision retry schedule
const MAX_CREATE_ATTEMPTS: usize = 5;
const CREATE_BACKOFF_MS: [u64; 5] = [50, 100, 200, 400, 800];

/// Voucher lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoucherStatus {
    Unused,
    Active,
    Expired,
    Revoked,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoucherStatus::Unused => "unused",
            VoucherStatus::Active => "active",
            VoucherStatus::Expired => "expired",
            VoucherStatus::Revoked => "revoked",
        }
    }

    fn parse(s: &str) -> PortalResult<Self> {
        match s {
            "unused" => Ok(VoucherStatus::Unused),
            "active" => Ok(VoucherStatus::Active),
            "expired" => Ok(VoucherStatus::Expired),
            "revoked" => Ok(VoucherStatus::Revoked),
            other => Err(PortalError::Internal(format!("Invalid voucher status: {}", other))),
        }
    }
}

/// A staff-issued access code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voucher {
    pub code: String,
    pub created_utc: DateTime<Utc>,
    pub duration_minutes: i64,
    /// Always `created_utc + duration_minutes`
    pub expires_utc: DateTime<Utc>,
    pub up_kbps: Option<i64>,
    pub down_kbps: Option<i64>,
    pub status: VoucherStatus,
    pub booking_ref: Option<String>,
    pub redeemed_count: i64,
    pub last_redeemed_utc: Option<DateTime<Utc>>,
}

/// Parameters for voucher creation
#[derive(Debug, Clone)]
pub struct CreateVoucher {
    pub duration_minutes: i64,
    pub code_length: usize,
    pub booking_ref: Option<String>,
    pub up_kbps: Option<i64>,
    pub down_kbps: Option<i64>,
}

#[derive(Clone)]
pub struct VoucherManager {
    db: SqlitePool,
    grants: GrantManager,
    /// Per-code redemption locks
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl VoucherManager {
    pub fn new(db: SqlitePool, grants: GrantManager) -> Self {
        Self {
            db,
            grants,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn generate_code(length: usize) -> String {
        let mut rng = rand::thread_rng();
        (0..length)
            .map(|_| {
                let idx = rng.gen_range(0..CODE_CHARSET.len());
                CODE_CHARSET[idx] as char
            })
            .collect()
    }

    /// Create a voucher, retrying on code collision.
    pub async fn create(&self, params: CreateVoucher) -> PortalResult<Voucher> {
        let length = params.code_length;
        self.create_with_generator(params, move || Self::generate_code(length))
            .await
    }

    /// Creation with an injectable code source; the production path feeds
    /// the CSPRNG generator through here.
    pub async fn create_with_generator(
        &self,
        params: CreateVoucher,
        mut next_code: impl FnMut() -> String,
    ) -> PortalResult<Voucher> {
        if !(MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&params.code_length) {
            return Err(PortalError::InvalidInput(format!(
                "Voucher code length must be {}-{} characters",
                MIN_CODE_LENGTH, MAX_CODE_LENGTH
            )));
        }
        if params.duration_minutes <= 0 {
            return Err(PortalError::InvalidInput(
                "duration_minutes must be > 0".to_string(),
            ));
        }
        for kbps in [params.up_kbps, params.down_kbps].into_iter().flatten() {
            if kbps < 1 {
                return Err(PortalError::InvalidInput(
                    "Bandwidth limits must be >= 1 kbps when set".to_string(),
                ));
            }
        }

        let booking_ref = params
            .booking_ref
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        for attempt in 0..MAX_CREATE_ATTEMPTS {
            let code = next_code();
            let created = Utc::now();
            let expires = created + Duration::minutes(params.duration_minutes);

            let result = sqlx::query(
                r#"
                INSERT INTO vouchers
                    (code, created_utc, duration_minutes, expires_utc, up_kbps,
                     down_kbps, status, booking_ref, redeemed_count, last_redeemed_utc)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'unused', ?7, 0, NULL)
                "#,
            )
            .bind(&code)
            .bind(fmt_db(created))
            .bind(params.duration_minutes)
            .bind(fmt_db(expires))
            .bind(params.up_kbps)
            .bind(params.down_kbps)
            .bind(&booking_ref)
            .execute(&self.db)
            .await;

            match result {
                Ok(_) => {
                    return Ok(Voucher {
                        code,
                        created_utc: created,
                        duration_minutes: params.duration_minutes,
                        expires_utc: expires,
                        up_kbps: params.up_kbps,
                        down_kbps: params.down_kbps,
                        status: VoucherStatus::Unused,
                        booking_ref,
                        redeemed_count: 0,
                        last_redeemed_utc: None,
                    })
                }
                Err(sqlx::Error::Database(db_err))
                    if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
                {
                    if attempt < MAX_CREATE_ATTEMPTS - 1 {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            CREATE_BACKOFF_MS[attempt],
                        ))
                        .await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PortalError::VoucherCollision)
    }

    /// Case-insensitive voucher lookup
    pub async fn find_by_code_ci(&self, code: &str) -> PortalResult<Option<Voucher>> {
        let row = sqlx::query(
            r#"
            SELECT code, created_utc, duration_minutes, expires_utc, up_kbps,
                   down_kbps, status, booking_ref, redeemed_count, last_redeemed_utc
            FROM vouchers
            WHERE LOWER(code) = LOWER(?1)
            "#,
        )
        .bind(code.trim())
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(row_to_voucher).transpose()
    }

    /// Redeem a voucher for a device, producing a PENDING grant.
    ///
    /// Serialized per code: two concurrent redemptions of the same
    /// (code, mac) see each other's grant and at most one wins.
    pub async fn redeem(
        &self,
        code: &str,
        mac: &str,
        now: DateTime<Utc>,
    ) -> PortalResult<AccessGrant> {
        let key = code.trim().to_ascii_uppercase();
        let lock = {
            let mut locks = self.locks.lock().expect("voucher lock table poisoned");
            Arc::clone(locks.entry(key).or_default())
        };
        let _guard = lock.lock().await;

        let voucher = self
            .find_by_code_ci(code)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("Voucher '{}' not found", code.trim())))?;

        match voucher.status {
            VoucherStatus::Revoked => {
                return Err(PortalError::OutsideWindow(format!(
                    "Voucher '{}' has been revoked",
                    voucher.code
                )))
            }
            VoucherStatus::Expired => {
                return Err(PortalError::OutsideWindow(format!(
                    "Voucher '{}' has expired",
                    voucher.code
                )))
            }
            VoucherStatus::Unused | VoucherStatus::Active => {}
        }

        // Past expiry, the stored status is irrelevant.
        if now >= voucher.expires_utc {
            return Err(PortalError::OutsideWindow(format!(
                "Voucher '{}' expired at {}",
                voucher.code, voucher.expires_utc
            )));
        }

        if self.grants.has_non_revoked(mac, &voucher.code).await? {
            return Err(PortalError::DuplicateGrant(format!(
                "Voucher '{}' already redeemed for this device",
                voucher.code
            )));
        }

        let grant = self
            .grants
            .create(NewGrant {
                voucher_code: Some(voucher.code.clone()),
                booking_ref: voucher.booking_ref.clone(),
                integration_id: None,
                user_input_code: Some(code.trim().to_string()),
                mac: Some(mac.to_string()),
                session_token: None,
                start_utc: now,
                end_utc: now + Duration::minutes(voucher.duration_minutes),
                up_kbps: voucher.up_kbps,
                down_kbps: voucher.down_kbps,
            })
            .await?;

        sqlx::query(
            r#"
            UPDATE vouchers
            SET redeemed_count = redeemed_count + 1,
                last_redeemed_utc = ?1,
                status = CASE WHEN status = 'unused' THEN 'active' ELSE status END
            WHERE code = ?2
            "#,
        )
        .bind(fmt_db(now))
        .bind(&voucher.code)
        .execute(&self.db)
        .await?;

        Ok(grant)
    }

    /// Redeem for a device whose MAC has not been captured yet. The grant
    /// carries a session token instead and is revoked by the orphan sweep
    /// if no MAC arrives within the reconciliation window.
    pub async fn redeem_with_session_token(
        &self,
        code: &str,
        session_token: &str,
        now: DateTime<Utc>,
    ) -> PortalResult<AccessGrant> {
        let key = code.trim().to_ascii_uppercase();
        let lock = {
            let mut locks = self.locks.lock().expect("voucher lock table poisoned");
            Arc::clone(locks.entry(key).or_default())
        };
        let _guard = lock.lock().await;

        let voucher = self
            .find_by_code_ci(code)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("Voucher '{}' not found", code.trim())))?;

        match voucher.status {
            VoucherStatus::Revoked | VoucherStatus::Expired => {
                return Err(PortalError::OutsideWindow(format!(
                    "Voucher '{}' is no longer redeemable",
                    voucher.code
                )))
            }
            VoucherStatus::Unused | VoucherStatus::Active => {}
        }
        if now >= voucher.expires_utc {
            return Err(PortalError::OutsideWindow(format!(
                "Voucher '{}' expired at {}",
                voucher.code, voucher.expires_utc
            )));
        }

        let grant = self
            .grants
            .create(NewGrant {
                voucher_code: Some(voucher.code.clone()),
                booking_ref: voucher.booking_ref.clone(),
                integration_id: None,
                user_input_code: Some(code.trim().to_string()),
                mac: None,
                session_token: Some(session_token.to_string()),
                start_utc: now,
                end_utc: now + Duration::minutes(voucher.duration_minutes),
                up_kbps: voucher.up_kbps,
                down_kbps: voucher.down_kbps,
            })
            .await?;

        sqlx::query(
            r#"
            UPDATE vouchers
            SET redeemed_count = redeemed_count + 1,
                last_redeemed_utc = ?1,
                status = CASE WHEN status = 'unused' THEN 'active' ELSE status END
            WHERE code = ?2
            "#,
        )
        .bind(fmt_db(now))
        .bind(&voucher.code)
        .execute(&self.db)
        .await?;

        Ok(grant)
    }

    /// Revoke a voucher so it can no longer be redeemed. Idempotent.
    pub async fn revoke(&self, code: &str) -> PortalResult<Voucher> {
        let voucher = self
            .find_by_code_ci(code)
            .await?
            .ok_or_else(|| PortalError::NotFound(format!("Voucher '{}' not found", code.trim())))?;

        if voucher.status != VoucherStatus::Revoked {
            sqlx::query("UPDATE vouchers SET status = 'revoked' WHERE code = ?1")
                .bind(&voucher.code)
                .execute(&self.db)
                .await?;
        }

        self.find_by_code_ci(&voucher.code).await?.ok_or_else(|| {
            PortalError::Internal("Voucher vanished during revoke".to_string())
        })
    }

    /// Mark vouchers past their expiry. Expired vouchers never produce
    /// grants regardless of this sweep; it keeps admin listings truthful.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> PortalResult<u64> {
        let result = sqlx::query(
            "UPDATE vouchers SET status = 'expired'
             WHERE status IN ('unused', 'active') AND expires_utc <= ?1",
        )
        .bind(fmt_db(now))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list(&self, limit: i64) -> PortalResult<Vec<Voucher>> {
        let rows = sqlx::query(
            r#"
            SELECT code, created_utc, duration_minutes, expires_utc, up_kbps,
                   down_kbps, status, booking_ref, redeemed_count, last_redeemed_utc
            FROM vouchers
            ORDER BY created_utc DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_voucher).collect()
    }
}

fn row_to_voucher(row: &sqlx::sqlite::SqliteRow) -> PortalResult<Voucher> {
    let created: String = row.get("created_utc");
    let expires: String = row.get("expires_utc");
    let status: String = row.get("status");
    let last_redeemed: Option<String> = row.get("last_redeemed_utc");

    Ok(Voucher {
        code: row.get("code"),
        created_utc: parse_db(&created)?,
        duration_minutes: row.get("duration_minutes"),
        expires_utc: parse_db(&expires)?,
        up_kbps: row.get("up_kbps"),
        down_kbps: row.get("down_kbps"),
        status: VoucherStatus::parse(&status)?,
        booking_ref: row.get("booking_ref"),
        redeemed_count: row.get("redeemed_count"),
        last_redeemed_utc: last_redeemed.as_deref().map(parse_db).transpose()?,
    })
}
