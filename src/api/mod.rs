/// API routes and handlers
pub mod admin;
pub mod detect;
pub mod guest;
pub mod health;
pub mod middleware;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(admin::routes())
        .merge(
            Router::new()
                .merge(guest::routes())
                .merge(detect::routes())
                .layer(axum::middleware::from_fn(
                    middleware::security_headers_middleware,
                )),
        )
}
