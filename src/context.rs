/// Application context and dependency wiring
use crate::{
    audit::AuditLogger,
    config::ServerConfig,
    controller::{omada::OmadaController, Controller},
    csrf::CsrfProtection,
    db,
    error::PortalResult,
    grants::GrantManager,
    portal_settings::PortalSettingsStore,
    rate_limit::RateLimiter,
    redirect::RedirectValidator,
    rental::{client::ReservationClient, validator::BookingValidator, EventStore, IntegrationManager},
    retry_queue::RetryQueue,
    sessions::AdminManager,
    vouchers::VoucherManager,
};
use sqlx::SqlitePool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub grants: GrantManager,
    pub vouchers: VoucherManager,
    pub integrations: IntegrationManager,
    pub events: EventStore,
    pub booking_validator: BookingValidator,
    pub admins: AdminManager,
    pub audit: AuditLogger,
    pub rate_limiter: Arc<RateLimiter>,
    pub csrf: CsrfProtection,
    pub redirect_validator: RedirectValidator,
    pub controller: Arc<dyn Controller>,
    pub retry_queue: RetryQueue,
    pub reservation_client: ReservationClient,
    pub settings: PortalSettingsStore,
}

impl AppContext {
    /// Create the production context from configuration
    pub async fn new(config: ServerConfig) -> PortalResult<Self> {
        config.validate()?;

        let pool = db::create_pool(&config.storage.portal_db, db::DatabaseOptions::default()).await?;
        db::run_migrations(&pool).await?;
        db::test_connection(&pool).await?;

        let controller: Arc<dyn Controller> = Arc::new(OmadaController::new(&config.controller)?);
        Self::assemble(config, pool, controller)
    }

    /// Wire managers over an existing pool and controller. Tests use this
    /// with an in-memory pool and a controller double.
    pub fn assemble(
        config: ServerConfig,
        pool: SqlitePool,
        controller: Arc<dyn Controller>,
    ) -> PortalResult<Self> {
        let grants = GrantManager::new(pool.clone());
        let vouchers = VoucherManager::new(pool.clone(), grants.clone());
        let integrations = IntegrationManager::new(pool.clone());
        let events = EventStore::new(pool.clone());
        let booking_validator = BookingValidator::new(events.clone(), grants.clone());
        let admins = AdminManager::new(
            pool.clone(),
            config.security.session_idle_minutes,
            config.security.session_max_hours,
        );
        let audit = AuditLogger::new(pool.clone());
        let rate_limiter = Arc::new(RateLimiter::new(
            config.portal.rate_limit_attempts,
            config.portal.rate_limit_window_seconds,
        ));
        let csrf = CsrfProtection::new(config.security.csrf_token_bytes, config.service.tls);
        let redirect_validator =
            RedirectValidator::new(config.portal.redirect_allowed_hosts.clone());
        let retry_queue = RetryQueue::new(pool.clone());
        let reservation_client = ReservationClient::new(&config.reservation)?;
        let settings = PortalSettingsStore::new(pool.clone());

        Ok(Self {
            config: Arc::new(config),
            db: pool,
            grants,
            vouchers,
            integrations,
            events,
            booking_validator,
            admins,
            audit,
            rate_limiter,
            csrf,
            redirect_validator,
            controller,
            retry_queue,
            reservation_client,
            settings,
        })
    }

    /// Seed the initial admin account when configured
    pub async fn bootstrap(&self) -> PortalResult<()> {
        self.admins
            .bootstrap(
                self.config.security.admin_username.as_deref(),
                self.config.security.admin_password.as_deref(),
            )
            .await
    }
}
