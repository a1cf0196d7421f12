/// HTTP server setup and routing
use crate::{
    api::middleware::correlation_middleware,
    context::AppContext,
    error::{PortalError, PortalResult},
};
use axum::{http::StatusCode, middleware, response::Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

/// Build the main application router
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .merge(crate::api::routes())
        .with_state(ctx)
        .layer(middleware::from_fn(correlation_middleware))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .fallback(not_found)
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Endpoint not found",
            "code": "NOT_FOUND",
            "correlation_id": "",
        })),
    )
}

/// Start the HTTP server; resolves once a shutdown signal arrives
pub async fn serve(ctx: AppContext, shutdown: impl std::future::Future<Output = ()> + Send + 'static) -> PortalResult<()> {
    let addr = format!("{}:{}", ctx.config.service.hostname, ctx.config.service.port);

    info!("guestgate listening on {}", addr);

    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| PortalError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| PortalError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
