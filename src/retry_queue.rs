/// Durable retry queue for controller operations
///
/// Grant mutations enqueue their controller call inside the same
/// transaction, so a committed grant always implies a queued operation.
/// A single worker drains the queue; items back off exponentially with
/// jitter and are dead-lettered (and audited) after five attempts.
use crate::audit::{AuditEvent, AuditLogger, Outcome};
use crate::controller::Controller;
use crate::error::{PortalError, PortalResult};
use crate::grants::GrantManager;
use crate::timeutil;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Maximum worker attempts before an item is marked dead
pub const MAX_ATTEMPTS: i64 = 5;
/// Base backoff between worker attempts
const BASE_DELAY_SECONDS: i64 = 2;
/// Backoff cap
const MAX_DELAY_SECONDS: i64 = 60;
/// Jitter added to each reschedule
const JITTER_MS: i64 = 500;

/// Controller operation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Authorize,
    Revoke,
    Update,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Authorize => "authorize",
            OpType::Revoke => "revoke",
            OpType::Update => "update",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "authorize" => Some(OpType::Authorize),
            "revoke" => Some(OpType::Revoke),
            "update" => Some(OpType::Update),
            _ => None,
        }
    }
}

/// Payload persisted with each queued operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpPayload {
    pub mac: String,
    pub end_utc: Option<DateTime<Utc>>,
    pub up_kbps: Option<i64>,
    pub down_kbps: Option<i64>,
}

/// One queued controller operation
#[derive(Debug, Clone)]
pub struct RetryOperation {
    pub id: Uuid,
    pub op_type: OpType,
    pub grant_id: Uuid,
    pub payload: OpPayload,
    pub attempts: i64,
    pub next_attempt_utc: DateTime<Utc>,
}

/// Enqueue an operation within an open transaction, due immediately.
pub async fn enqueue_tx(
    conn: &mut SqliteConnection,
    op_type: OpType,
    grant_id: Uuid,
    payload: &OpPayload,
) -> PortalResult<Uuid> {
    let id = Uuid::new_v4();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO retry_queue
            (id, op_type, grant_id, mac, payload, attempts, next_attempt_utc,
             status, created_utc, updated_utc)
        VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, 'pending', ?7, ?7)
        "#,
    )
    .bind(id.to_string())
    .bind(op_type.as_str())
    .bind(grant_id.to_string())
    .bind(&payload.mac)
    .bind(serde_json::to_string(payload).map_err(|e| PortalError::Internal(e.to_string()))?)
    .bind(timeutil::fmt_db(now))
    .bind(timeutil::fmt_db(now))
    .execute(conn)
    .await?;

    Ok(id)
}

/// Queue store and drain worker
#[derive(Clone)]
pub struct RetryQueue {
    db: SqlitePool,
}

impl RetryQueue {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Pending operations due at or before `now`, oldest first
    pub async fn due_operations(&self, now: DateTime<Utc>) -> PortalResult<Vec<RetryOperation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, op_type, grant_id, payload, attempts, next_attempt_utc
            FROM retry_queue
            WHERE status = 'pending' AND next_attempt_utc <= ?1
            ORDER BY next_attempt_utc ASC
            "#,
        )
        .bind(timeutil::fmt_db(now))
        .fetch_all(&self.db)
        .await?;

        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let op_type: String = row.get("op_type");
            let grant_id: String = row.get("grant_id");
            let payload: String = row.get("payload");
            let next_attempt: String = row.get("next_attempt_utc");

            ops.push(RetryOperation {
                id: Uuid::parse_str(&id)
                    .map_err(|e| PortalError::Internal(format!("Bad queue id: {}", e)))?,
                op_type: OpType::parse(&op_type)
                    .ok_or_else(|| PortalError::Internal(format!("Bad op type: {}", op_type)))?,
                grant_id: Uuid::parse_str(&grant_id)
                    .map_err(|e| PortalError::Internal(format!("Bad grant id: {}", e)))?,
                payload: serde_json::from_str(&payload)
                    .map_err(|e| PortalError::Internal(format!("Bad queue payload: {}", e)))?,
                attempts: row.get("attempts"),
                next_attempt_utc: timeutil::parse_db(&next_attempt)?,
            });
        }
        Ok(ops)
    }

    pub async fn complete(&self, id: Uuid) -> PortalResult<()> {
        sqlx::query("DELETE FROM retry_queue WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Record a failed attempt: reschedule with backoff, or mark dead once
    /// the attempt budget is spent. Returns true when the item died.
    pub async fn record_failure(&self, op: &RetryOperation, now: DateTime<Utc>) -> PortalResult<bool> {
        let attempts = op.attempts + 1;

        if attempts >= MAX_ATTEMPTS {
            self.mark_dead(op, now).await?;
            return Ok(true);
        }

        let next = now + backoff_with_jitter(attempts);
        sqlx::query(
            "UPDATE retry_queue SET attempts = ?1, next_attempt_utc = ?2, updated_utc = ?3 WHERE id = ?4",
        )
        .bind(attempts)
        .bind(timeutil::fmt_db(next))
        .bind(timeutil::fmt_db(now))
        .bind(op.id.to_string())
        .execute(&self.db)
        .await?;
        Ok(false)
    }

    /// Dead-letter an operation outright, keeping its attempt count
    pub async fn mark_dead(&self, op: &RetryOperation, now: DateTime<Utc>) -> PortalResult<()> {
        sqlx::query(
            "UPDATE retry_queue SET attempts = ?1, status = 'dead', updated_utc = ?2 WHERE id = ?3",
        )
        .bind(op.attempts + 1)
        .bind(timeutil::fmt_db(now))
        .bind(op.id.to_string())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Number of pending operations
    pub async fn depth(&self) -> PortalResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM retry_queue WHERE status = 'pending'")
            .fetch_one(&self.db)
            .await?;
        Ok(row.get("n"))
    }

    /// Dead operations surfaced to the admin view
    pub async fn dead_operations(&self) -> PortalResult<Vec<(Uuid, String, Uuid)>> {
        let rows = sqlx::query("SELECT id, op_type, grant_id FROM retry_queue WHERE status = 'dead'")
            .fetch_all(&self.db)
            .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let op_type: String = row.get("op_type");
                let grant_id: String = row.get("grant_id");
                Ok((
                    Uuid::parse_str(&id)
                        .map_err(|e| PortalError::Internal(format!("Bad queue id: {}", e)))?,
                    op_type,
                    Uuid::parse_str(&grant_id)
                        .map_err(|e| PortalError::Internal(format!("Bad grant id: {}", e)))?,
                ))
            })
            .collect()
    }
}

/// Exponential backoff with jitter for the given attempt count
fn backoff_with_jitter(attempts: i64) -> Duration {
    let exp = (attempts - 1).clamp(0, 30) as u32;
    let base = (BASE_DELAY_SECONDS * 2i64.saturating_pow(exp)).min(MAX_DELAY_SECONDS);
    let jitter_ms = rand::thread_rng().gen_range(0..JITTER_MS);
    Duration::seconds(base) + Duration::milliseconds(jitter_ms)
}

/// Drain worker: executes due operations against the controller and keeps
/// grant state in step with controller acknowledgements.
pub struct RetryWorker {
    queue: RetryQueue,
    controller: Arc<dyn Controller>,
    grants: GrantManager,
    audit: AuditLogger,
}

impl RetryWorker {
    pub fn new(
        queue: RetryQueue,
        controller: Arc<dyn Controller>,
        grants: GrantManager,
        audit: AuditLogger,
    ) -> Self {
        Self {
            queue,
            controller,
            grants,
            audit,
        }
    }

    /// One drain pass. Returns the number of operations executed
    /// successfully.
    pub async fn run_once(&self, now: DateTime<Utc>) -> PortalResult<usize> {
        let ops = self.queue.due_operations(now).await?;
        let mut completed = 0;

        for op in ops {
            match self.execute(&op).await {
                Ok(()) => {
                    self.queue.complete(op.id).await?;
                    completed += 1;
                    crate::metrics::CONTROLLER_OPS
                        .with_label_values(&[op.op_type.as_str(), "success"])
                        .inc();
                    info!(
                        "Controller {} for grant {} succeeded on attempt {}",
                        op.op_type.as_str(),
                        op.grant_id,
                        op.attempts + 1
                    );
                }
                Err(e) => {
                    crate::metrics::CONTROLLER_OPS
                        .with_label_values(&[op.op_type.as_str(), "failure"])
                        .inc();
                    warn!(
                        "Controller {} for grant {} failed (attempt {}): {}",
                        op.op_type.as_str(),
                        op.grant_id,
                        op.attempts + 1,
                        e
                    );
                    // Non-auth 4xx rejections are permanent; dead-letter
                    // without further retries.
                    let dead = if matches!(e, PortalError::ControllerRejected(_)) {
                        self.queue.mark_dead(&op, Utc::now()).await?;
                        true
                    } else {
                        self.queue.record_failure(&op, Utc::now()).await?
                    };
                    if dead {
                        error!(
                            "Controller {} for grant {} dead after {} attempts",
                            op.op_type.as_str(),
                            op.grant_id,
                            MAX_ATTEMPTS
                        );
                        // The owning grant stays in its current state and is
                        // surfaced through the dead-letter view.
                        self.audit
                            .log(
                                AuditEvent::new("system", "retry.dead", Outcome::Error)
                                    .target("grant", op.grant_id.to_string())
                                    .correlation(op.id.to_string())
                                    .meta(serde_json::json!({
                                        "op_type": op.op_type.as_str(),
                                        "mac": op.payload.mac,
                                        "attempts": MAX_ATTEMPTS,
                                        "error": e.to_string(),
                                    })),
                            )
                            .await?;
                    }
                }
            }
        }

        Ok(completed)
    }

    async fn execute(&self, op: &RetryOperation) -> PortalResult<()> {
        match op.op_type {
            OpType::Authorize => {
                let end = op.payload.end_utc.ok_or_else(|| {
                    PortalError::Internal("Authorize operation without end time".to_string())
                })?;
                let controller_grant_id = self
                    .controller
                    .authorize(&op.payload.mac, end, op.payload.up_kbps, op.payload.down_kbps)
                    .await?;
                self.grants
                    .mark_controller_ack(op.grant_id, &controller_grant_id)
                    .await?;
                Ok(())
            }
            OpType::Update => {
                let end = op.payload.end_utc.ok_or_else(|| {
                    PortalError::Internal("Update operation without end time".to_string())
                })?;
                self.controller.extend(&op.payload.mac, end).await
            }
            OpType::Revoke => self.controller.revoke(&op.payload.mac).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerHealth;
    use crate::db;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Controller double that fails a configurable number of times before
    /// succeeding.
    struct FlakyController {
        failures_remaining: AtomicUsize,
        calls: AtomicUsize,
    }

    impl FlakyController {
        fn failing(n: usize) -> Self {
            Self {
                failures_remaining: AtomicUsize::new(n),
                calls: AtomicUsize::new(0),
            }
        }

        fn check(&self) -> PortalResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                Err(PortalError::ControllerUnavailable("503".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Controller for FlakyController {
        async fn authorize(
            &self,
            mac: &str,
            _end_utc: DateTime<Utc>,
            _up: Option<i64>,
            _down: Option<i64>,
        ) -> PortalResult<String> {
            self.check()?;
            Ok(mac.to_string())
        }

        async fn revoke(&self, _mac: &str) -> PortalResult<()> {
            self.check()
        }

        async fn extend(&self, _mac: &str, _end: DateTime<Utc>) -> PortalResult<()> {
            self.check()
        }

        async fn health(&self) -> ControllerHealth {
            ControllerHealth::Ok
        }
    }

    async fn enqueue_authorize(pool: &SqlitePool, grant_id: Uuid) -> Uuid {
        let payload = OpPayload {
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            end_utc: Some(Utc::now() + Duration::hours(2)),
            up_kbps: None,
            down_kbps: None,
        };
        let mut tx = pool.begin().await.unwrap();
        let id = enqueue_tx(&mut tx, OpType::Authorize, grant_id, &payload)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    async fn insert_pending_grant(pool: &SqlitePool) -> Uuid {
        let grants = GrantManager::new(pool.clone());
        let grant = grants
            .create(crate::grants::NewGrant {
                voucher_code: Some("TESTCODE12".to_string()),
                booking_ref: None,
                integration_id: None,
                user_input_code: None,
                mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
                session_token: None,
                start_utc: Utc::now(),
                end_utc: Utc::now() + Duration::hours(2),
                up_kbps: None,
                down_kbps: None,
            })
            .await
            .unwrap();
        grant.id
    }

    #[tokio::test]
    async fn test_success_completes_and_activates_grant() {
        let pool = db::connect_memory().await.unwrap();
        let grant_id = insert_pending_grant(&pool).await;
        // The grant's own enqueue is already in the queue.
        let queue = RetryQueue::new(pool.clone());
        let worker = RetryWorker::new(
            queue.clone(),
            Arc::new(FlakyController::failing(0)),
            GrantManager::new(pool.clone()),
            AuditLogger::new(pool.clone()),
        );

        let completed = worker.run_once(Utc::now()).await.unwrap();
        assert_eq!(completed, 1);
        assert_eq!(queue.depth().await.unwrap(), 0);

        let grant = GrantManager::new(pool.clone())
            .get_by_id(grant_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.status, crate::grants::GrantStatus::Active);
        assert!(grant.controller_grant_id.is_some());
    }

    #[tokio::test]
    async fn test_failure_reschedules_with_backoff() {
        let pool = db::connect_memory().await.unwrap();
        let grant_id = insert_pending_grant(&pool).await;
        let queue = RetryQueue::new(pool.clone());
        let worker = RetryWorker::new(
            queue.clone(),
            Arc::new(FlakyController::failing(100)),
            GrantManager::new(pool.clone()),
            AuditLogger::new(pool.clone()),
        );

        let now = Utc::now();
        let completed = worker.run_once(now).await.unwrap();
        assert_eq!(completed, 0);
        assert_eq!(queue.depth().await.unwrap(), 1);

        // Not due again immediately.
        let due = queue.due_operations(Utc::now()).await.unwrap();
        assert!(due.is_empty());
        let due_later = queue
            .due_operations(Utc::now() + Duration::seconds(70))
            .await
            .unwrap();
        assert_eq!(due_later.len(), 1);
        assert_eq!(due_later[0].attempts, 1);

        // Grant stays PENDING while retries continue.
        let grant = GrantManager::new(pool.clone())
            .get_by_id(grant_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.status, crate::grants::GrantStatus::Pending);
    }

    #[tokio::test]
    async fn test_exhaustion_marks_dead_and_audits() {
        let pool = db::connect_memory().await.unwrap();
        let grant_id = insert_pending_grant(&pool).await;
        let queue = RetryQueue::new(pool.clone());
        let audit = AuditLogger::new(pool.clone());
        let worker = RetryWorker::new(
            queue.clone(),
            Arc::new(FlakyController::failing(100)),
            GrantManager::new(pool.clone()),
            audit.clone(),
        );

        // Drive all five attempts by advancing the due horizon.
        for i in 0..MAX_ATTEMPTS {
            let horizon = Utc::now() + Duration::seconds(120 * (i + 1));
            let ops = queue.due_operations(horizon).await.unwrap();
            if ops.is_empty() {
                break;
            }
            for op in &ops {
                let err = worker.execute(op).await.unwrap_err();
                assert!(matches!(err, PortalError::ControllerUnavailable(_)));
                let dead = queue.record_failure(op, Utc::now()).await.unwrap();
                assert_eq!(dead, op.attempts + 1 >= MAX_ATTEMPTS);
            }
        }

        assert_eq!(queue.depth().await.unwrap(), 0);
        let dead = queue.dead_operations().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].2, grant_id);

        // Grant left PENDING for the admin to see.
        let grant = GrantManager::new(pool.clone())
            .get_by_id(grant_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.status, crate::grants::GrantStatus::Pending);
    }

    /// Controller double that rejects every call permanently.
    struct RejectingController;

    #[async_trait]
    impl Controller for RejectingController {
        async fn authorize(
            &self,
            _mac: &str,
            _end_utc: DateTime<Utc>,
            _up: Option<i64>,
            _down: Option<i64>,
        ) -> PortalResult<String> {
            Err(PortalError::ControllerRejected("HTTP 400".to_string()))
        }

        async fn revoke(&self, _mac: &str) -> PortalResult<()> {
            Err(PortalError::ControllerRejected("HTTP 400".to_string()))
        }

        async fn extend(&self, _mac: &str, _end: DateTime<Utc>) -> PortalResult<()> {
            Err(PortalError::ControllerRejected("HTTP 400".to_string()))
        }

        async fn health(&self) -> ControllerHealth {
            ControllerHealth::Ok
        }
    }

    #[tokio::test]
    async fn test_permanent_rejection_dead_letters_immediately() {
        let pool = db::connect_memory().await.unwrap();
        let grant_id = insert_pending_grant(&pool).await;
        let queue = RetryQueue::new(pool.clone());
        let worker = RetryWorker::new(
            queue.clone(),
            Arc::new(RejectingController),
            GrantManager::new(pool.clone()),
            AuditLogger::new(pool.clone()),
        );

        let completed = worker.run_once(Utc::now()).await.unwrap();
        assert_eq!(completed, 0);

        // No reschedule: the item went straight to the dead letter list.
        assert_eq!(queue.depth().await.unwrap(), 0);
        let dead = queue.dead_operations().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].2, grant_id);

        let audit = AuditLogger::new(pool);
        let entries = audit.list_recent(5).await.unwrap();
        assert!(entries.iter().any(|e| e.action == "retry.dead"));
    }

    #[tokio::test]
    async fn test_flaky_controller_eventually_succeeds() {
        let pool = db::connect_memory().await.unwrap();
        let grant_id = insert_pending_grant(&pool).await;
        let queue = RetryQueue::new(pool.clone());
        let worker = RetryWorker::new(
            queue.clone(),
            Arc::new(FlakyController::failing(2)),
            GrantManager::new(pool.clone()),
            AuditLogger::new(pool.clone()),
        );

        // First two passes fail, third succeeds; stay within the 5-attempt
        // budget.
        for _ in 0..3 {
            let ops = queue
                .due_operations(Utc::now() + Duration::seconds(600))
                .await
                .unwrap();
            for op in &ops {
                match worker.execute(op).await {
                    Ok(()) => queue.complete(op.id).await.unwrap(),
                    Err(_) => {
                        queue.record_failure(op, Utc::now()).await.unwrap();
                    }
                }
            }
        }

        assert_eq!(queue.depth().await.unwrap(), 0);
        let grant = GrantManager::new(pool.clone())
            .get_by_id(grant_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.status, crate::grants::GrantStatus::Active);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let b1 = backoff_with_jitter(1).num_seconds();
        let b2 = backoff_with_jitter(2).num_seconds();
        let b3 = backoff_with_jitter(3).num_seconds();
        let huge = backoff_with_jitter(20).num_seconds();
        assert!((2..4).contains(&b1));
        assert!((4..6).contains(&b2));
        assert!((8..10).contains(&b3));
        assert!(huge <= 61);
    }

    #[tokio::test]
    async fn test_enqueue_creates_immediately_due_row() {
        let pool = db::connect_memory().await.unwrap();
        let id = enqueue_authorize(&pool, Uuid::new_v4()).await;
        let queue = RetryQueue::new(pool);
        let due = queue.due_operations(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
        assert_eq!(due[0].op_type, OpType::Authorize);
    }
}
