/// Health and metrics endpoints
use crate::{context::AppContext, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;

/// Build health routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
}

/// Health check handler
async fn health_check(State(ctx): State<AppContext>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1").fetch_one(&ctx.db).await.is_ok();
    let queue_depth = ctx.retry_queue.depth().await.unwrap_or(-1);

    let status = if db_ok { "ok" } else { "degraded" };
    let http_status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "retry_queue_depth": queue_depth,
        })),
    )
}

/// Prometheus text exposition
async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather(),
    )
}
