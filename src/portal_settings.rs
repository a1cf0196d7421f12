/// Admin-editable portal settings (singleton row)
use crate::error::{PortalError, PortalResult};
use crate::vouchers::{MAX_CODE_LENGTH, MIN_CODE_LENGTH};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// Guest portal behavior knobs persisted in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalSettings {
    pub rate_limit_attempts: u32,
    pub rate_limit_window_seconds: u32,
    pub success_redirect_url: String,
    pub voucher_length_default: usize,
}

impl PortalSettings {
    pub fn validate(&self) -> PortalResult<()> {
        if !(1..=100).contains(&self.rate_limit_attempts) {
            return Err(PortalError::InvalidInput(
                "rate_limit_attempts must be between 1 and 100".to_string(),
            ));
        }
        if !(10..=3600).contains(&self.rate_limit_window_seconds) {
            return Err(PortalError::InvalidInput(
                "rate_limit_window_seconds must be between 10 and 3600".to_string(),
            ));
        }
        if !(MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&self.voucher_length_default) {
            return Err(PortalError::InvalidInput(format!(
                "voucher_length_default must be between {} and {}",
                MIN_CODE_LENGTH, MAX_CODE_LENGTH
            )));
        }
        if self.success_redirect_url.is_empty() {
            return Err(PortalError::InvalidInput(
                "success_redirect_url must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct PortalSettingsStore {
    db: SqlitePool,
}

impl PortalSettingsStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get(&self) -> PortalResult<PortalSettings> {
        let row = sqlx::query(
            "SELECT rate_limit_attempts, rate_limit_window_seconds,
                    success_redirect_url, voucher_length_default
             FROM portal_config WHERE id = 1",
        )
        .fetch_one(&self.db)
        .await?;

        let attempts: i64 = row.get("rate_limit_attempts");
        let window: i64 = row.get("rate_limit_window_seconds");
        let length: i64 = row.get("voucher_length_default");

        Ok(PortalSettings {
            rate_limit_attempts: attempts as u32,
            rate_limit_window_seconds: window as u32,
            success_redirect_url: row.get("success_redirect_url"),
            voucher_length_default: length as usize,
        })
    }

    pub async fn update(&self, settings: &PortalSettings) -> PortalResult<()> {
        settings.validate()?;
        sqlx::query(
            "UPDATE portal_config
             SET rate_limit_attempts = ?1, rate_limit_window_seconds = ?2,
                 success_redirect_url = ?3, voucher_length_default = ?4
             WHERE id = 1",
        )
        .bind(settings.rate_limit_attempts as i64)
        .bind(settings.rate_limit_window_seconds as i64)
        .bind(&settings.success_redirect_url)
        .bind(settings.voucher_length_default as i64)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn test_defaults_seeded_by_migration() {
        let pool = db::connect_memory().await.unwrap();
        let store = PortalSettingsStore::new(pool);
        let settings = store.get().await.unwrap();
        assert_eq!(settings.rate_limit_attempts, 5);
        assert_eq!(settings.rate_limit_window_seconds, 60);
        assert_eq!(settings.success_redirect_url, "/guest/welcome");
        assert_eq!(settings.voucher_length_default, 10);
    }

    #[tokio::test]
    async fn test_update_round_trip_and_validation() {
        let pool = db::connect_memory().await.unwrap();
        let store = PortalSettingsStore::new(pool);

        let mut settings = store.get().await.unwrap();
        settings.rate_limit_attempts = 10;
        settings.voucher_length_default = 12;
        store.update(&settings).await.unwrap();

        let reloaded = store.get().await.unwrap();
        assert_eq!(reloaded.rate_limit_attempts, 10);
        assert_eq!(reloaded.voucher_length_default, 12);

        settings.rate_limit_attempts = 0;
        assert!(store.update(&settings).await.is_err());
        settings.rate_limit_attempts = 101;
        assert!(store.update(&settings).await.is_err());
        settings.rate_limit_attempts = 5;
        settings.rate_limit_window_seconds = 9;
        assert!(store.update(&settings).await.is_err());
        settings.rate_limit_window_seconds = 60;
        settings.voucher_length_default = 25;
        assert!(store.update(&settings).await.is_err());
    }
}
