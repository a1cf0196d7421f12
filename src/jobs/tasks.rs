/// Background task implementations
use crate::audit::{AuditEvent, Outcome};
use crate::context::AppContext;
use crate::error::PortalResult;
use crate::metrics;
use crate::retry_queue::RetryWorker;
use chrono::{Duration, Utc};
use uuid::Uuid;

/// Drain the controller retry queue once
pub async fn drain_retry_queue(ctx: &AppContext) -> PortalResult<usize> {
    let worker = RetryWorker::new(
        ctx.retry_queue.clone(),
        ctx.controller.clone(),
        ctx.grants.clone(),
        ctx.audit.clone(),
    );
    let completed = worker.run_once(Utc::now()).await?;

    let depth = ctx.retry_queue.depth().await?;
    metrics::RETRY_QUEUE_DEPTH.set(depth);
    Ok(completed)
}

/// Move closed ACTIVE grants to EXPIRED
pub async fn expire_grants(ctx: &AppContext) -> PortalResult<u64> {
    let count = ctx.grants.expire_sweep(Utc::now()).await?;
    if count > 0 {
        metrics::SWEEP_TOTAL
            .with_label_values(&["grant_expiry"])
            .inc_by(count);
    }
    Ok(count)
}

/// Mark vouchers past their expiry
pub async fn expire_vouchers(ctx: &AppContext) -> PortalResult<u64> {
    let count = ctx.vouchers.expire_sweep(Utc::now()).await?;
    if count > 0 {
        metrics::SWEEP_TOTAL
            .with_label_values(&["voucher_expiry"])
            .inc_by(count);
    }
    Ok(count)
}

/// Revoke session-token grants that never received a MAC
pub async fn sweep_orphan_grants(ctx: &AppContext) -> PortalResult<u64> {
    let count = ctx.grants.orphan_sweep(Utc::now()).await?;
    if count > 0 {
        metrics::SWEEP_TOTAL
            .with_label_values(&["orphan_grants"])
            .inc_by(count);
    }
    Ok(count)
}

/// Delete rental events past the retention horizon; the count is audited.
pub async fn cleanup_rental_events(ctx: &AppContext) -> PortalResult<u64> {
    let cutoff = Utc::now() - Duration::days(ctx.config.cleanup.event_retention_days);
    let deleted = ctx.events.delete_where_end_before(cutoff).await?;

    ctx.audit
        .log(
            AuditEvent::new("system", "events.cleanup", Outcome::Success)
                .correlation(Uuid::new_v4().to_string())
                .meta(serde_json::json!({
                    "deleted_count": deleted,
                    "cutoff": cutoff.to_rfc3339(),
                })),
        )
        .await?;

    if deleted > 0 {
        metrics::SWEEP_TOTAL
            .with_label_values(&["event_retention"])
            .inc_by(deleted);
    }
    Ok(deleted)
}

/// Drop expired admin sessions
pub async fn cleanup_admin_sessions(ctx: &AppContext) -> PortalResult<u64> {
    ctx.admins.cleanup_expired(Utc::now()).await
}

/// Verify database connectivity
pub async fn health_check(ctx: &AppContext) -> PortalResult<()> {
    sqlx::query("SELECT 1").fetch_one(&ctx.db).await?;
    Ok(())
}
