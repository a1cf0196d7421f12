/// Request middleware and admin authentication extractors
use crate::{
    audit::{AuditEvent, Outcome},
    context::AppContext,
    csrf::constant_time_eq,
    error::{PortalError, PortalResult, CORRELATION_ID},
    rbac::{self, Role},
    sessions::{AdminAccount, AdminSession, SESSION_COOKIE},
};
use axum::{
    async_trait,
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::Utc;
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "X-Correlation-Id";
pub const ADMIN_CSRF_HEADER: &str = "X-CSRF-Token";

/// Propagate or mint a correlation id for the request. The id is
/// available to handlers and error rendering through the task local, and
/// echoed back in the response header.
pub async fn correlation_middleware(request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = CORRELATION_ID.scope(id.clone(), next.run(request)).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

/// Security headers for every guest-facing response
pub async fn security_headers_middleware(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(
            "default-src 'self'; style-src 'self' 'unsafe-inline'; script-src 'self'; \
             img-src 'self' data:; object-src 'none'; base-uri 'self'; form-action 'self'",
        ),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    response
}

/// The correlation id of the current request
pub fn current_correlation_id() -> String {
    CORRELATION_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Authenticated admin context, extracted from the session cookie
#[derive(Debug, Clone)]
pub struct AdminContext {
    pub account: AdminAccount,
    pub session: AdminSession,
}

impl AdminContext {
    pub fn role(&self) -> Role {
        self.account.role
    }
}

#[async_trait]
impl FromRequestParts<AppContext> for AdminContext {
    type Rejection = PortalError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(SESSION_COOKIE)
            .map(|c| c.value().to_string())
            .ok_or_else(|| PortalError::Unauthorized("Missing session cookie".to_string()))?;

        let (account, session) = state.admins.validate_session(&token, Utc::now()).await?;
        Ok(AdminContext { account, session })
    }
}

/// Double-submit CSRF check for state-changing admin requests: the header
/// token must match the session's server-side token. Compared in constant
/// time like the guest cookie pair.
pub fn require_admin_csrf(headers: &HeaderMap, session: &AdminSession) -> PortalResult<()> {
    let submitted = headers
        .get(ADMIN_CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(PortalError::CsrfRejected)?;

    if !constant_time_eq(submitted.as_bytes(), session.csrf_token.as_bytes()) {
        return Err(PortalError::CsrfRejected);
    }
    Ok(())
}

/// Deny-by-default RBAC gate. Denials are audited before the 403 is
/// returned.
pub async fn authorize_action(
    ctx: &AppContext,
    admin: &AdminContext,
    action: &str,
) -> PortalResult<()> {
    if rbac::is_allowed(admin.role(), action) {
        return Ok(());
    }

    let _ = ctx
        .audit
        .log(
            AuditEvent::new(
                format!("admin:{}", admin.account.username),
                action,
                Outcome::Denied,
            )
            .role(admin.role().as_str())
            .correlation(current_correlation_id())
            .meta(serde_json::json!({"reason": "rbac_denied"})),
        )
        .await;

    Err(PortalError::RbacDenied(format!(
        "Role {} may not perform {}",
        admin.role().as_str(),
        action
    )))
}
