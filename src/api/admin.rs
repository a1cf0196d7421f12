/// Admin API endpoints
///
/// Session-cookie authenticated, CSRF-checked on every mutation, and
/// RBAC-gated per action. Each state change writes one audit entry.
use crate::{
    api::middleware::{authorize_action, current_correlation_id, require_admin_csrf, AdminContext},
    audit::{AuditEvent, Outcome},
    context::AppContext,
    error::{PortalError, PortalResult},
    grants::AccessGrant,
    portal_settings::PortalSettings,
    rental::{IdentifierAttr, IntegrationConfig},
    sessions::SESSION_COOKIE,
    vouchers::{CreateVoucher, Voucher},
};
use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Build admin routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/admin/login", post(login))
        .route("/admin/logout", post(logout))
        .route("/admin/portal-config", get(get_portal_config).put(put_portal_config))
        .route("/admin/integrations", get(list_integrations).post(create_integration))
        .route(
            "/admin/integrations/:integration_id",
            put(update_integration).delete(delete_integration),
        )
        .route("/admin/grants", get(list_grants))
        .route("/admin/grants/:id/extend", post(extend_grant))
        .route("/admin/grants/:id/revoke", post(revoke_grant))
        .route("/admin/vouchers", get(list_vouchers).post(create_voucher))
        .route("/admin/audit", get(list_audit))
}

// ============================================================================
// Session endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    username: String,
    role: String,
    csrf_token: String,
}

async fn login(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, PortalError> {
    let account = match ctx.admins.authenticate(&req.username, &req.password).await {
        Ok(account) => account,
        Err(e) => {
            let _ = ctx
                .audit
                .log(
                    AuditEvent::new(format!("admin:{}", req.username), "admin.login", Outcome::Denied)
                        .correlation(current_correlation_id())
                        .meta(serde_json::json!({"reason": "invalid_credentials"})),
                )
                .await;
            return Err(e);
        }
    };

    let session = ctx.admins.create_session(account.id).await?;

    let _ = ctx
        .audit
        .log(
            AuditEvent::new(format!("admin:{}", account.username), "admin.login", Outcome::Success)
                .role(account.role.as_str())
                .correlation(current_correlation_id()),
        )
        .await;

    let mut cookie = Cookie::new(SESSION_COOKIE, session.token.clone());
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Strict);
    cookie.set_secure(ctx.config.service.tls);
    cookie.set_path("/admin");
    let jar = jar.add(cookie);

    Ok((
        jar,
        Json(LoginResponse {
            username: account.username,
            role: account.role.as_str().to_string(),
            csrf_token: session.csrf_token,
        }),
    ))
}

async fn logout(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    jar: CookieJar,
) -> Result<impl IntoResponse, PortalError> {
    ctx.admins.delete_session(&admin.session.token).await?;

    let _ = ctx
        .audit
        .log(
            AuditEvent::new(
                format!("admin:{}", admin.account.username),
                "admin.logout",
                Outcome::Success,
            )
            .role(admin.role().as_str())
            .correlation(current_correlation_id()),
        )
        .await;

    let jar = jar.remove(Cookie::from(SESSION_COOKIE));
    Ok((jar, Json(serde_json::json!({"ok": true}))))
}

// ============================================================================
// Portal configuration
// ============================================================================

async fn get_portal_config(
    State(ctx): State<AppContext>,
    admin: AdminContext,
) -> Result<Json<PortalSettings>, PortalError> {
    authorize_action(&ctx, &admin, "portal_config.read").await?;
    Ok(Json(ctx.settings.get().await?))
}

async fn put_portal_config(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    headers: HeaderMap,
    Json(settings): Json<PortalSettings>,
) -> Result<Json<PortalSettings>, PortalError> {
    authorize_action(&ctx, &admin, "portal_config.write").await?;
    require_admin_csrf(&headers, &admin.session)?;

    ctx.settings.update(&settings).await?;
    audit_admin(&ctx, &admin, "portal_config.update", "portal_config", "1", None).await;
    Ok(Json(ctx.settings.get().await?))
}

// ============================================================================
// Integrations
// ============================================================================

#[derive(Debug, Deserialize)]
struct IntegrationRequest {
    integration_id: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    auth_attribute: Option<String>,
    checkout_grace_minutes: Option<i64>,
}

fn default_enabled() -> bool {
    true
}

fn parse_attr(raw: Option<&str>) -> PortalResult<IdentifierAttr> {
    match raw {
        Some(s) => IdentifierAttr::parse(s).map_err(|_| {
            PortalError::InvalidInput(format!("Invalid auth_attribute: {}", s))
        }),
        None => Ok(IdentifierAttr::SlotCode),
    }
}

async fn list_integrations(
    State(ctx): State<AppContext>,
    admin: AdminContext,
) -> Result<Json<Vec<IntegrationConfig>>, PortalError> {
    authorize_action(&ctx, &admin, "integrations.read").await?;
    Ok(Json(ctx.integrations.list().await?))
}

async fn create_integration(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    headers: HeaderMap,
    Json(req): Json<IntegrationRequest>,
) -> Result<Json<IntegrationConfig>, PortalError> {
    authorize_action(&ctx, &admin, "integrations.write").await?;
    require_admin_csrf(&headers, &admin.session)?;

    let attr = parse_attr(req.auth_attribute.as_deref())?;
    let grace = req.checkout_grace_minutes.unwrap_or(15);
    let config = ctx.integrations.create(&req.integration_id, attr, grace).await?;

    audit_admin(
        &ctx,
        &admin,
        "integrations.create",
        "integration",
        &config.integration_id,
        None,
    )
    .await;
    Ok(Json(config))
}

async fn update_integration(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    Path(integration_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<IntegrationRequest>,
) -> Result<Json<IntegrationConfig>, PortalError> {
    authorize_action(&ctx, &admin, "integrations.write").await?;
    require_admin_csrf(&headers, &admin.session)?;

    let attr = parse_attr(req.auth_attribute.as_deref())?;
    let grace = req.checkout_grace_minutes.unwrap_or(15);
    let config = ctx
        .integrations
        .update(&integration_id, req.enabled, attr, grace)
        .await?;

    audit_admin(
        &ctx,
        &admin,
        "integrations.update",
        "integration",
        &integration_id,
        None,
    )
    .await;
    Ok(Json(config))
}

async fn delete_integration(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    Path(integration_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, PortalError> {
    authorize_action(&ctx, &admin, "integrations.write").await?;
    require_admin_csrf(&headers, &admin.session)?;

    ctx.integrations.delete(&integration_id).await?;
    audit_admin(
        &ctx,
        &admin,
        "integrations.delete",
        "integration",
        &integration_id,
        None,
    )
    .await;
    Ok(Json(serde_json::json!({"ok": true})))
}

// ============================================================================
// Grants
// ============================================================================

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<i64>,
}

async fn list_grants(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<AccessGrant>>, PortalError> {
    authorize_action(&ctx, &admin, "grants.list").await?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(ctx.grants.list(limit).await?))
}

#[derive(Debug, Deserialize)]
struct ExtendRequest {
    minutes: i64,
}

async fn extend_grant(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<ExtendRequest>,
) -> Result<Json<AccessGrant>, PortalError> {
    authorize_action(&ctx, &admin, "grants.extend").await?;
    require_admin_csrf(&headers, &admin.session)?;

    let grant = ctx.grants.extend(id, req.minutes, Utc::now()).await?;
    audit_admin(
        &ctx,
        &admin,
        "grants.extend",
        "grant",
        &id.to_string(),
        Some(serde_json::json!({
            "additional_minutes": req.minutes,
            "new_end_utc": grant.end_utc.to_rfc3339(),
        })),
    )
    .await;
    Ok(Json(grant))
}

#[derive(Debug, Deserialize, Default)]
struct RevokeRequest {
    reason: Option<String>,
}

async fn revoke_grant(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Option<Json<RevokeRequest>>,
) -> Result<Json<AccessGrant>, PortalError> {
    authorize_action(&ctx, &admin, "grants.revoke").await?;
    require_admin_csrf(&headers, &admin.session)?;

    let reason = body.and_then(|Json(r)| r.reason);
    let grant = ctx.grants.revoke(id, Utc::now()).await?;
    audit_admin(
        &ctx,
        &admin,
        "grants.revoke",
        "grant",
        &id.to_string(),
        Some(serde_json::json!({"reason": reason})),
    )
    .await;
    Ok(Json(grant))
}

// ============================================================================
// Vouchers
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateVoucherRequest {
    duration_minutes: i64,
    code_length: Option<usize>,
    booking_ref: Option<String>,
    up_kbps: Option<i64>,
    down_kbps: Option<i64>,
}

async fn list_vouchers(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Voucher>>, PortalError> {
    authorize_action(&ctx, &admin, "vouchers.create").await?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(ctx.vouchers.list(limit).await?))
}

async fn create_voucher(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    headers: HeaderMap,
    Json(req): Json<CreateVoucherRequest>,
) -> Result<Json<Voucher>, PortalError> {
    authorize_action(&ctx, &admin, "vouchers.create").await?;
    require_admin_csrf(&headers, &admin.session)?;

    let default_length = ctx.settings.get().await?.voucher_length_default;
    let voucher = ctx
        .vouchers
        .create(CreateVoucher {
            duration_minutes: req.duration_minutes,
            code_length: req.code_length.unwrap_or(default_length),
            booking_ref: req.booking_ref.clone(),
            up_kbps: req.up_kbps,
            down_kbps: req.down_kbps,
        })
        .await?;

    audit_admin(
        &ctx,
        &admin,
        "vouchers.create",
        "voucher",
        &voucher.code,
        Some(serde_json::json!({
            "duration_minutes": req.duration_minutes,
            "booking_ref": req.booking_ref,
        })),
    )
    .await;
    Ok(Json(voucher))
}

// ============================================================================
// Audit trail
// ============================================================================

async fn list_audit(
    State(ctx): State<AppContext>,
    admin: AdminContext,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<crate::audit::AuditEntry>>, PortalError> {
    authorize_action(&ctx, &admin, "audit.read").await?;
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(ctx.audit.list_recent(limit).await?))
}

async fn audit_admin(
    ctx: &AppContext,
    admin: &AdminContext,
    action: &str,
    target_type: &str,
    target_id: &str,
    meta: Option<serde_json::Value>,
) {
    let mut event = AuditEvent::new(
        format!("admin:{}", admin.account.username),
        action,
        Outcome::Success,
    )
    .role(admin.role().as_str())
    .target(target_type, target_id)
    .correlation(current_correlation_id());
    if let Some(meta) = meta {
        event = event.meta(meta);
    }
    let _ = ctx.audit.log(event).await;
}
