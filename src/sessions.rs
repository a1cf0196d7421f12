/// Admin accounts and cookie sessions
///
/// Passwords are hashed with Argon2id. Sessions carry a server-side CSRF
/// token for the double-submit check and expire on idle timeout or the
/// absolute cap, whichever comes first.
use crate::error::{PortalError, PortalResult};
use crate::rbac::Role;
use crate::timeutil::{fmt_db, parse_db};
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "admin_session";

/// An administrative account
#[derive(Debug, Clone, Serialize)]
pub struct AdminAccount {
    pub id: Uuid,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub disabled: bool,
    pub created_utc: DateTime<Utc>,
}

/// A live admin session
#[derive(Debug, Clone)]
pub struct AdminSession {
    pub token: String,
    pub account_id: Uuid,
    pub csrf_token: String,
    pub created_utc: DateTime<Utc>,
    pub last_seen_utc: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AdminManager {
    db: SqlitePool,
    idle_timeout: Duration,
    max_lifetime: Duration,
}

impl AdminManager {
    pub fn new(db: SqlitePool, idle_minutes: i64, max_hours: i64) -> Self {
        Self {
            db,
            idle_timeout: Duration::minutes(idle_minutes),
            max_lifetime: Duration::hours(max_hours),
        }
    }

    fn hash_password(password: &str) -> PortalResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| PortalError::Internal(format!("Password hashing failed: {}", e)))
    }

    fn verify_password(password: &str, hash: &str) -> bool {
        PasswordHash::new(hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }

    pub async fn create_account(
        &self,
        username: &str,
        password: &str,
        role: Role,
    ) -> PortalResult<AdminAccount> {
        let username = username.trim();
        if username.is_empty() {
            return Err(PortalError::InvalidInput("Username required".to_string()));
        }
        if password.len() < 8 {
            return Err(PortalError::InvalidInput(
                "Password must be at least 8 characters".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        let password_hash = Self::hash_password(password)?;

        let result = sqlx::query(
            "INSERT INTO admin_accounts (id, username, password_hash, role, disabled, created_utc)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        )
        .bind(id.to_string())
        .bind(username)
        .bind(&password_hash)
        .bind(role.as_str())
        .bind(fmt_db(now))
        .execute(&self.db)
        .await;

        match result {
            Ok(_) => Ok(AdminAccount {
                id,
                username: username.to_string(),
                password_hash,
                role,
                disabled: false,
                created_utc: now,
            }),
            Err(sqlx::Error::Database(db_err))
                if db_err.kind() == sqlx::error::ErrorKind::UniqueViolation =>
            {
                Err(PortalError::Conflict(format!(
                    "Username {} already taken",
                    username
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Seed the first admin account from configuration. A no-op when any
    /// account already exists or no credentials are configured.
    pub async fn bootstrap(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> PortalResult<()> {
        let (Some(username), Some(password)) = (username, password) else {
            return Ok(());
        };

        let row = sqlx::query("SELECT COUNT(*) AS n FROM admin_accounts")
            .fetch_one(&self.db)
            .await?;
        let n: i64 = row.get("n");
        if n > 0 {
            return Ok(());
        }

        self.create_account(username, password, Role::Admin).await?;
        info!("Bootstrapped initial admin account '{}'", username);
        Ok(())
    }

    pub async fn authenticate(&self, username: &str, password: &str) -> PortalResult<AdminAccount> {
        let account = self
            .find_by_username(username.trim())
            .await?
            .filter(|a| !a.disabled)
            .ok_or_else(|| PortalError::Unauthorized("Invalid credentials".to_string()))?;

        if !Self::verify_password(password, &account.password_hash) {
            return Err(PortalError::Unauthorized("Invalid credentials".to_string()));
        }

        Ok(account)
    }

    pub async fn find_by_username(&self, username: &str) -> PortalResult<Option<AdminAccount>> {
        let row = sqlx::query(
            "SELECT id, username, password_hash, role, disabled, created_utc
             FROM admin_accounts WHERE username = ?1",
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await?;
        row.as_ref().map(row_to_account).transpose()
    }

    pub async fn create_session(&self, account_id: Uuid) -> PortalResult<AdminSession> {
        let now = Utc::now();
        let session = AdminSession {
            token: random_token(32),
            account_id,
            csrf_token: random_token(32),
            created_utc: now,
            last_seen_utc: now,
        };

        sqlx::query(
            "INSERT INTO admin_sessions (token, account_id, csrf_token, created_utc, last_seen_utc)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&session.token)
        .bind(account_id.to_string())
        .bind(&session.csrf_token)
        .bind(fmt_db(now))
        .bind(fmt_db(now))
        .execute(&self.db)
        .await?;

        Ok(session)
    }

    /// Validate a session token, enforcing idle and absolute timeouts, and
    /// touch its last-seen time.
    pub async fn validate_session(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> PortalResult<(AdminAccount, AdminSession)> {
        let row = sqlx::query(
            "SELECT token, account_id, csrf_token, created_utc, last_seen_utc
             FROM admin_sessions WHERE token = ?1",
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| PortalError::Unauthorized("Session not found".to_string()))?;

        let session = row_to_session(&row)?;

        if now - session.last_seen_utc > self.idle_timeout
            || now - session.created_utc > self.max_lifetime
        {
            self.delete_session(token).await?;
            return Err(PortalError::Unauthorized("Session expired".to_string()));
        }

        sqlx::query("UPDATE admin_sessions SET last_seen_utc = ?1 WHERE token = ?2")
            .bind(fmt_db(now))
            .bind(token)
            .execute(&self.db)
            .await?;

        let account_row = sqlx::query(
            "SELECT id, username, password_hash, role, disabled, created_utc
             FROM admin_accounts WHERE id = ?1",
        )
        .bind(session.account_id.to_string())
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| PortalError::Unauthorized("Account not found".to_string()))?;

        let account = row_to_account(&account_row)?;
        if account.disabled {
            return Err(PortalError::Unauthorized("Account disabled".to_string()));
        }

        Ok((account, session))
    }

    pub async fn delete_session(&self, token: &str) -> PortalResult<()> {
        sqlx::query("DELETE FROM admin_sessions WHERE token = ?1")
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Drop sessions past either timeout
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> PortalResult<u64> {
        let idle_cutoff = now - self.idle_timeout;
        let absolute_cutoff = now - self.max_lifetime;
        let result = sqlx::query(
            "DELETE FROM admin_sessions WHERE last_seen_utc < ?1 OR created_utc < ?2",
        )
        .bind(fmt_db(idle_cutoff))
        .bind(fmt_db(absolute_cutoff))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_accounts(&self) -> PortalResult<Vec<AdminAccount>> {
        let rows = sqlx::query(
            "SELECT id, username, password_hash, role, disabled, created_utc
             FROM admin_accounts ORDER BY username",
        )
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(row_to_account).collect()
    }
}

fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> PortalResult<AdminAccount> {
    let id: String = row.get("id");
    let role: String = row.get("role");
    let created: String = row.get("created_utc");

    Ok(AdminAccount {
        id: Uuid::parse_str(&id)
            .map_err(|e| PortalError::Internal(format!("Bad account id: {}", e)))?,
        username: row.get("username"),
        password_hash: row.get("password_hash"),
        role: Role::parse(&role)
            .ok_or_else(|| PortalError::Internal(format!("Bad role: {}", role)))?,
        disabled: row.get("disabled"),
        created_utc: parse_db(&created)?,
    })
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> PortalResult<AdminSession> {
    let account_id: String = row.get("account_id");
    let created: String = row.get("created_utc");
    let last_seen: String = row.get("last_seen_utc");

    Ok(AdminSession {
        token: row.get("token"),
        account_id: Uuid::parse_str(&account_id)
            .map_err(|e| PortalError::Internal(format!("Bad account id: {}", e)))?,
        csrf_token: row.get("csrf_token"),
        created_utc: parse_db(&created)?,
        last_seen_utc: parse_db(&last_seen)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn manager(pool: &SqlitePool) -> AdminManager {
        AdminManager::new(pool.clone(), 30, 8)
    }

    #[tokio::test]
    async fn test_create_and_authenticate() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);

        let account = mgr
            .create_account("alice", "correct horse", Role::Operator)
            .await
            .unwrap();
        assert_eq!(account.role, Role::Operator);
        assert_ne!(account.password_hash, "correct horse");

        let authed = mgr.authenticate("alice", "correct horse").await.unwrap();
        assert_eq!(authed.id, account.id);

        let wrong = mgr.authenticate("alice", "wrong").await;
        assert!(matches!(wrong, Err(PortalError::Unauthorized(_))));
        let unknown = mgr.authenticate("bob", "correct horse").await;
        assert!(matches!(unknown, Err(PortalError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_duplicate_username_conflicts() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        mgr.create_account("alice", "password1", Role::Admin).await.unwrap();
        let dup = mgr.create_account("alice", "password2", Role::Viewer).await;
        assert!(matches!(dup, Err(PortalError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_session_lifecycle_and_timeouts() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let account = mgr
            .create_account("alice", "password1", Role::Admin)
            .await
            .unwrap();

        let session = mgr.create_session(account.id).await.unwrap();
        assert_eq!(session.token.len(), 64);
        assert_ne!(session.token, session.csrf_token);

        let now = Utc::now();
        let (validated, _) = mgr.validate_session(&session.token, now).await.unwrap();
        assert_eq!(validated.username, "alice");

        // Idle timeout.
        let idle = now + Duration::minutes(31);
        let result = mgr.validate_session(&session.token, idle).await;
        assert!(matches!(result, Err(PortalError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_absolute_session_cap() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);
        let account = mgr
            .create_account("alice", "password1", Role::Admin)
            .await
            .unwrap();
        let session = mgr.create_session(account.id).await.unwrap();

        // Keep touching the session inside the idle window; the absolute
        // cap still wins.
        let mut now = Utc::now();
        for _ in 0..17 {
            now = now + Duration::minutes(29);
            if now - session.created_utc > Duration::hours(8) {
                break;
            }
            mgr.validate_session(&session.token, now).await.unwrap();
        }

        let past_cap = session.created_utc + Duration::hours(8) + Duration::minutes(1);
        let result = mgr.validate_session(&session.token, past_cap).await;
        assert!(matches!(result, Err(PortalError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_only_when_empty() {
        let pool = db::connect_memory().await.unwrap();
        let mgr = manager(&pool);

        mgr.bootstrap(Some("root"), Some("password1")).await.unwrap();
        let account = mgr.find_by_username("root").await.unwrap().unwrap();
        assert_eq!(account.role, Role::Admin);

        // Second bootstrap is a no-op.
        mgr.bootstrap(Some("other"), Some("password2")).await.unwrap();
        assert!(mgr.find_by_username("other").await.unwrap().is_none());

        // Missing credentials: no-op.
        mgr.bootstrap(None, None).await.unwrap();
    }
}
