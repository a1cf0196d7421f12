use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{error, info};

pub mod tasks;

use crate::rental::poller::ReservationPoller;

/// Job scheduler for background tasks
///
/// Each loop is an independent cooperative task with explicit shutdown:
/// the watch channel flips on graceful stop and every loop exits at its
/// next await point. The retry queue is durable, so stopping between
/// items loses nothing.
pub struct JobScheduler {
    context: Arc<crate::context::AppContext>,
    shutdown: watch::Sender<bool>,
}

impl JobScheduler {
    pub fn new(context: Arc<crate::context::AppContext>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { context, shutdown }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        tokio::spawn(Self::reservation_poll_job(Arc::clone(&self)));
        tokio::spawn(Self::retry_queue_job(Arc::clone(&self)));
        tokio::spawn(Self::grant_expiry_job(Arc::clone(&self)));
        tokio::spawn(Self::voucher_expiry_job(Arc::clone(&self)));
        tokio::spawn(Self::orphan_grant_job(Arc::clone(&self)));
        tokio::spawn(Self::event_retention_job(Arc::clone(&self)));
        tokio::spawn(Self::session_cleanup_job(Arc::clone(&self)));
        tokio::spawn(Self::heartbeat_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Signal every job loop to stop
    pub fn shutdown(&self) {
        info!("Stopping background jobs");
        let _ = self.shutdown.send(true);
    }

    /// Poll the reservation source (every poll_interval_seconds)
    async fn reservation_poll_job(scheduler: Arc<Self>) {
        let poller = ReservationPoller::new(
            scheduler.context.reservation_client.clone(),
            scheduler.context.integrations.clone(),
            scheduler.context.events.clone(),
        );
        let mut ticker = interval(Duration::from_secs(
            scheduler.context.config.reservation.poll_interval_seconds,
        ));
        let mut stop = scheduler.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = poller.poll_once(chrono::Utc::now()).await {
                        error!("Reservation poll pass failed: {}", e);
                        crate::metrics::RESERVATION_POLLS.with_label_values(&["error"]).inc();
                    } else {
                        crate::metrics::RESERVATION_POLLS.with_label_values(&["ok"]).inc();
                    }
                }
                _ = stop.changed() => {
                    info!("Reservation poller stopped");
                    return;
                }
            }
        }
    }

    /// Drain the controller retry queue (every second)
    async fn retry_queue_job(scheduler: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(1));
        let mut stop = scheduler.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = tasks::drain_retry_queue(&scheduler.context).await {
                        error!("Retry queue drain failed: {}", e);
                    }
                }
                _ = stop.changed() => {
                    info!("Retry queue worker stopped");
                    return;
                }
            }
        }
    }

    /// Expire closed grants (every minute)
    async fn grant_expiry_job(scheduler: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(60));
        let mut stop = scheduler.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tasks::expire_grants(&scheduler.context).await {
                        Ok(count) if count > 0 => info!("Expired {} grants", count),
                        Ok(_) => {}
                        Err(e) => error!("Grant expiry sweep failed: {}", e),
                    }
                }
                _ = stop.changed() => {
                    info!("Grant expiry sweeper stopped");
                    return;
                }
            }
        }
    }

    /// Expire vouchers past their window (every 5 minutes)
    async fn voucher_expiry_job(scheduler: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(300));
        let mut stop = scheduler.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tasks::expire_vouchers(&scheduler.context).await {
                        Ok(count) if count > 0 => info!("Expired {} vouchers", count),
                        Ok(_) => {}
                        Err(e) => error!("Voucher expiry sweep failed: {}", e),
                    }
                }
                _ = stop.changed() => {
                    info!("Voucher expiry sweeper stopped");
                    return;
                }
            }
        }
    }

    /// Revoke unreconciled session-token grants (every 10 seconds, since
    /// the reconciliation window is 30 seconds)
    async fn orphan_grant_job(scheduler: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(10));
        let mut stop = scheduler.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tasks::sweep_orphan_grants(&scheduler.context).await {
                        Ok(count) if count > 0 => info!("Revoked {} unreconciled grants", count),
                        Ok(_) => {}
                        Err(e) => error!("Orphan grant sweep failed: {}", e),
                    }
                }
                _ = stop.changed() => {
                    info!("Orphan grant sweeper stopped");
                    return;
                }
            }
        }
    }

    /// Delete rental events past retention, daily at the configured local
    /// hour
    async fn event_retention_job(scheduler: Arc<Self>) {
        let mut stop = scheduler.shutdown.subscribe();

        loop {
            let wait = seconds_until_local_hour(scheduler.context.config.cleanup.cleanup_hour_local);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(wait)) => {
                    match tasks::cleanup_rental_events(&scheduler.context).await {
                        Ok(count) => info!("Event retention cleanup removed {} events", count),
                        Err(e) => error!("Event retention cleanup failed: {}", e),
                    }
                }
                _ = stop.changed() => {
                    info!("Event retention cleaner stopped");
                    return;
                }
            }
        }
    }

    /// Cleanup expired admin sessions (hourly)
    async fn session_cleanup_job(scheduler: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(3600));
        let mut stop = scheduler.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tasks::cleanup_admin_sessions(&scheduler.context).await {
                        Ok(count) if count > 0 => info!("Cleaned up {} expired admin sessions", count),
                        Ok(_) => {}
                        Err(e) => error!("Admin session cleanup failed: {}", e),
                    }
                }
                _ = stop.changed() => {
                    info!("Session cleaner stopped");
                    return;
                }
            }
        }
    }

    /// Heartbeat (every 5 minutes)
    async fn heartbeat_job(scheduler: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(300));
        let mut stop = scheduler.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match tasks::health_check(&scheduler.context).await {
                        Ok(()) => {
                            let depth = scheduler.context.retry_queue.depth().await.unwrap_or(-1);
                            match scheduler.context.controller.health().await {
                                crate::controller::ControllerHealth::Ok => {
                                    info!("Heartbeat ok, retry queue depth {}", depth);
                                }
                                crate::controller::ControllerHealth::Degraded(reason) => {
                                    error!("Controller degraded: {} (queue depth {})", reason, depth);
                                }
                            }
                        }
                        Err(e) => error!("Health check failed: {}", e),
                    }
                }
                _ = stop.changed() => {
                    info!("Heartbeat stopped");
                    return;
                }
            }
        }
    }
}

/// Seconds from now until the next occurrence of `hour`:00 local time
fn seconds_until_local_hour(hour: u32) -> u64 {
    use chrono::{Duration as ChronoDuration, Local, NaiveTime, Timelike};

    let now = Local::now();
    let target_time = NaiveTime::from_hms_opt(hour.min(23), 0, 0).unwrap_or_default();
    let mut target = now.date_naive().and_time(target_time);
    if now.time().hour() > hour || (now.time().hour() == hour && now.time().minute() > 0) {
        target += ChronoDuration::days(1);
    }

    let delta = target - now.naive_local();
    delta.num_seconds().max(60) as u64
}
