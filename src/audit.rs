/// Append-only audit log
///
/// Every state-changing operation writes exactly one entry, after the
/// outcome is decided and before the response is returned. Application
/// code can only insert and read; there is no update or delete path.
use crate::error::PortalResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Audit entry outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Denied,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Denied => "denied",
            Outcome::Error => "error",
        }
    }
}

/// One immutable audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp_utc: DateTime<Utc>,
    pub actor: String,
    pub role_snapshot: Option<String>,
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub outcome: Outcome,
    pub correlation_id: String,
    pub meta: serde_json::Value,
}

/// Builder-style parameters for a new entry
pub struct AuditEvent {
    pub actor: String,
    pub role_snapshot: Option<String>,
    pub action: String,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub outcome: Outcome,
    pub correlation_id: String,
    pub meta: serde_json::Value,
}

impl AuditEvent {
    pub fn new(actor: impl Into<String>, action: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            actor: actor.into(),
            role_snapshot: None,
            action: action.into(),
            target_type: None,
            target_id: None,
            outcome,
            correlation_id: String::new(),
            meta: serde_json::json!({}),
        }
    }

    pub fn role(mut self, role: &str) -> Self {
        self.role_snapshot = Some(role.to_string());
        self
    }

    pub fn target(mut self, target_type: &str, target_id: impl Into<String>) -> Self {
        self.target_type = Some(target_type.to_string());
        self.target_id = Some(target_id.into());
        self
    }

    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    db: SqlitePool,
}

impl AuditLogger {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Write one entry. Failures are surfaced; callers on hot guest paths
    /// log-and-continue instead of failing the request.
    pub async fn log(&self, event: AuditEvent) -> PortalResult<AuditEntry> {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            timestamp_utc: Utc::now(),
            actor: event.actor,
            role_snapshot: event.role_snapshot,
            action: event.action,
            target_type: event.target_type,
            target_id: event.target_id,
            outcome: event.outcome,
            correlation_id: event.correlation_id,
            meta: event.meta,
        };

        sqlx::query(
            r#"
            INSERT INTO audit_log
                (id, timestamp_utc, actor, role_snapshot, action, target_type,
                 target_id, outcome, correlation_id, meta)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.timestamp_utc.to_rfc3339())
        .bind(&entry.actor)
        .bind(&entry.role_snapshot)
        .bind(&entry.action)
        .bind(&entry.target_type)
        .bind(&entry.target_id)
        .bind(entry.outcome.as_str())
        .bind(&entry.correlation_id)
        .bind(entry.meta.to_string())
        .execute(&self.db)
        .await?;

        Ok(entry)
    }

    /// Recent entries, newest first
    pub async fn list_recent(&self, limit: i64) -> PortalResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp_utc, actor, role_snapshot, action, target_type,
                   target_id, outcome, correlation_id, meta
            FROM audit_log
            ORDER BY timestamp_utc DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }

    /// Entries that belong to one request, oldest first
    pub async fn find_by_correlation(&self, correlation_id: &str) -> PortalResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, timestamp_utc, actor, role_snapshot, action, target_type,
                   target_id, outcome, correlation_id, meta
            FROM audit_log
            WHERE correlation_id = ?1
            ORDER BY timestamp_utc ASC
            "#,
        )
        .bind(correlation_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_entry).collect()
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> PortalResult<AuditEntry> {
    let id: String = row.get("id");
    let timestamp: String = row.get("timestamp_utc");
    let outcome: String = row.get("outcome");
    let meta: String = row.get("meta");

    Ok(AuditEntry {
        id: Uuid::parse_str(&id)
            .map_err(|e| crate::error::PortalError::Internal(format!("Bad audit id: {}", e)))?,
        timestamp_utc: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| crate::error::PortalError::Internal(format!("Bad audit timestamp: {}", e)))?
            .with_timezone(&Utc),
        actor: row.get("actor"),
        role_snapshot: row.get("role_snapshot"),
        action: row.get("action"),
        target_type: row.get("target_type"),
        target_id: row.get("target_id"),
        outcome: match outcome.as_str() {
            "denied" => Outcome::Denied,
            "error" => Outcome::Error,
            _ => Outcome::Success,
        },
        correlation_id: row.get("correlation_id"),
        meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
    })
}
