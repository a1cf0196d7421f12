/// Guest authorization routes
///
/// The POST handler composes the pipeline stages in order: IP derivation,
/// rate limit, CSRF, unified code dispatch, MAC capture, grant creation
/// with controller enqueue, redirect validation, response. Any failed
/// stage short-circuits with a generic guest-visible error; specifics go
/// to the audit trail.
use crate::{
    api::middleware::current_correlation_id,
    audit::{AuditEvent, Outcome},
    codes::{classify, CodeKind},
    context::AppContext,
    csrf::{CSRF_FORM_FIELD, GUEST_CSRF_COOKIE},
    error::{PortalError, PortalResult},
    grants::{AccessGrant, NewGrant},
    metrics, netutil,
    rate_limit::RateDecision,
    rental::{IntegrationConfig, RentalEvent},
};
use axum::{
    extract::{ConnectInfo, Query, State},
    http::HeaderMap,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::info;
use uuid::Uuid;

pub const GRANT_COOKIE: &str = "grant_id";
pub const GUEST_SESSION_COOKIE: &str = "guest_session";

/// Build guest routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/guest/authorize", get(show_authorize_form))
        .route("/guest/authorize", post(handle_authorization))
        .route("/guest/welcome", get(show_welcome))
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    #[serde(rename = "continue")]
    pub continue_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AuthorizeForm {
    pub code: String,
    pub csrf_token: String,
    #[serde(rename = "continue")]
    pub continue_url: Option<String>,
}

/// How the submitting device is identified
enum DeviceRef {
    Mac(String),
    SessionToken(String),
}

/// Display the authorization form and issue the CSRF cookie
async fn show_authorize_form(
    State(ctx): State<AppContext>,
    jar: CookieJar,
    Query(query): Query<AuthorizeQuery>,
) -> Response {
    let token = ctx.csrf.generate_token();
    let jar = jar.add(ctx.csrf.guest_cookie(token.clone()));

    let continue_value = query
        .continue_url
        .as_deref()
        .map(html_escape)
        .unwrap_or_default();

    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Guest Wi-Fi Access</title></head>
<body>
<h1>Connect to guest Wi-Fi</h1>
<p>Enter your voucher or booking code to get online.</p>
<form method="post" action="/guest/authorize">
  <input type="text" name="code" autocomplete="off" autofocus>
  <input type="hidden" name="{csrf_field}" value="{token}">
  <input type="hidden" name="continue" value="{continue_value}">
  <button type="submit">Connect</button>
</form>
</body>
</html>"#,
        csrf_field = CSRF_FORM_FIELD,
        token = token,
        continue_value = continue_value,
    );

    (jar, Html(body)).into_response()
}

/// Process a guest authorization submission
async fn handle_authorization(
    State(ctx): State<AppContext>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Form(form): Form<AuthorizeForm>,
) -> Result<Response, PortalError> {
    let now = Utc::now();
    let settings = ctx.settings.get().await?;
    let client_ip = netutil::derive_client_ip(
        peer.ip(),
        &headers,
        &ctx.config.portal.trusted_proxy_cidrs,
    );
    let actor = format!("guest@{}", client_ip);

    // Rate limit. Refusals are counted, not audited.
    if let RateDecision::Limited { retry_after_seconds } = ctx.rate_limiter.check_with(
        client_ip,
        now,
        settings.rate_limit_attempts,
        settings.rate_limit_window_seconds,
    ) {
        metrics::RATE_LIMITED_TOTAL.with_label_values(&["guest"]).inc();
        return Err(PortalError::RateLimited {
            retry_after_seconds,
        });
    }

    // CSRF double-submit.
    let cookie_token = jar.get(GUEST_CSRF_COOKIE).map(|c| c.value().to_string());
    let csrf_ok = cookie_token
        .as_deref()
        .map(|t| ctx.csrf.tokens_match(t, &form.csrf_token))
        .unwrap_or(false);
    if !csrf_ok {
        audit_guest(&ctx, &actor, Outcome::Denied, None, "csrf_rejected", None).await;
        return Err(PortalError::CsrfRejected);
    }

    // MAC capture, with session-token fallback when no header is present.
    let device = match netutil::extract_mac(&headers) {
        Some(Ok(mac)) => DeviceRef::Mac(mac),
        Some(Err(e)) => {
            audit_guest(&ctx, &actor, Outcome::Denied, None, "invalid_mac", None).await;
            return Err(e);
        }
        None => DeviceRef::SessionToken(Uuid::new_v4().simple().to_string()),
    };

    // Unified code dispatch.
    let (grant, code_type) = match dispatch_code(&ctx, &form.code, &device, now).await {
        Ok(result) => result,
        Err(e) => {
            let outcome = match &e {
                PortalError::IntegrationUnavailable(_)
                | PortalError::Internal(_)
                | PortalError::Database(_) => Outcome::Error,
                _ => Outcome::Denied,
            };
            metrics::GUEST_AUTH_ATTEMPTS
                .with_label_values(&["unknown", e.code().as_str()])
                .inc();
            audit_guest(
                &ctx,
                &actor,
                outcome,
                device_mac(&device),
                &e.to_string(),
                Some(form.code.trim()),
            )
            .await;
            return Err(e);
        }
    };

    // A successful authorization forgives earlier typos from this IP.
    ctx.rate_limiter.clear(client_ip);
    metrics::GUEST_AUTH_ATTEMPTS
        .with_label_values(&[code_type, "success"])
        .inc();

    // Redirect validation, with fallback to the configured success page.
    let (destination, accepted) = ctx
        .redirect_validator
        .resolve(form.continue_url.as_deref(), &settings.success_redirect_url);

    let mut meta = serde_json::json!({
        "code_type": code_type,
        "grant_start": grant.start_utc.to_rfc3339(),
        "grant_end": grant.end_utc.to_rfc3339(),
        "client_ip": client_ip.to_string(),
        "user_agent": headers
            .get("User-Agent")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown"),
    });
    if let Some(mac) = device_mac(&device) {
        meta["mac"] = serde_json::json!(mac);
    }
    if !accepted {
        meta["redirect_rejected"] = serde_json::json!(form.continue_url);
    }

    let _ = ctx
        .audit
        .log(
            AuditEvent::new(&actor, "guest.authorize", Outcome::Success)
                .target(code_type, grant.id.to_string())
                .correlation(current_correlation_id())
                .meta(meta),
        )
        .await;

    // Success cookies: the grant id, plus the session token when the MAC
    // is still pending reconciliation.
    let mut grant_cookie = Cookie::new(GRANT_COOKIE, grant.id.to_string());
    grant_cookie.set_http_only(true);
    grant_cookie.set_same_site(SameSite::Strict);
    grant_cookie.set_path("/");
    grant_cookie.set_max_age(Some(time_max_age(3600)));
    let mut jar = jar.add(grant_cookie);

    if let DeviceRef::SessionToken(token) = &device {
        let mut session_cookie = Cookie::new(GUEST_SESSION_COOKIE, token.clone());
        session_cookie.set_http_only(true);
        session_cookie.set_same_site(SameSite::Lax);
        session_cookie.set_path("/");
        session_cookie.set_max_age(Some(time_max_age(60)));
        jar = jar.add(session_cookie);
    }

    Ok((jar, Redirect::to(destination)).into_response())
}

/// Welcome page. Also the reconciliation point: a session-token grant
/// whose device reaches this page with a MAC header gets its MAC attached
/// here.
async fn show_welcome(
    State(ctx): State<AppContext>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    let mut jar = jar;

    if let Some(token) = jar.get(GUEST_SESSION_COOKIE).map(|c| c.value().to_string()) {
        if let Some(Ok(mac)) = netutil::extract_mac(&headers) {
            match ctx.grants.reconcile_mac(&token, &mac, Utc::now()).await {
                Ok(grant) => info!("Reconciled MAC for grant {}", grant.id),
                Err(PortalError::NotFound(_)) => {}
                Err(e) => info!("MAC reconciliation failed: {}", e),
            }
        }
        jar = jar.remove(Cookie::from(GUEST_SESSION_COOKIE));
    }

    let body = r#"<!DOCTYPE html>
<html>
<head><title>You're connected</title></head>
<body>
<h1>You're connected</h1>
<p>Enjoy your stay. Your device now has internet access.</p>
</body>
</html>"#;

    (jar, Html(body)).into_response()
}

/// Route a guest code to the voucher or booking path.
///
/// The booking paths of every enabled integration are consulted first;
/// when both a booking and a voucher match the same input, booking wins.
async fn dispatch_code(
    ctx: &AppContext,
    raw_code: &str,
    device: &DeviceRef,
    now: chrono::DateTime<Utc>,
) -> PortalResult<(AccessGrant, &'static str)> {
    let kind = classify(raw_code);
    if kind == CodeKind::Invalid {
        return Err(PortalError::InvalidInput(
            "Invalid authorization code".to_string(),
        ));
    }
    let code = raw_code.trim();

    // Booking attempt across enabled integrations. NotFound means "try
    // the next integration"; any other failure proves the code matched
    // and the refusal stands.
    let mut booking_refusal: Option<PortalError> = None;
    let mut booking_match: Option<(RentalEvent, IntegrationConfig)> = None;

    for integration in ctx.integrations.list_enabled().await? {
        match ctx
            .booking_validator
            .validate(code, &integration, device_mac(device), now)
            .await
        {
            Ok(event) => {
                booking_match = Some((event, integration));
                break;
            }
            Err(PortalError::NotFound(_)) => continue,
            Err(e) => {
                booking_refusal = Some(e);
                break;
            }
        }
    }

    if let Some((event, integration)) = booking_match {
        if kind == CodeKind::VoucherCandidate
            && ctx.vouchers.find_by_code_ci(code).await?.is_some()
        {
            info!(
                "Code '{}' matches both a voucher and a booking; booking wins",
                code
            );
        }

        let identifier = event
            .identifier_for(integration.auth_attribute)
            .unwrap_or(code)
            .to_string();
        let start = now.max(event.start_utc);
        let end = event.end_utc + Duration::minutes(integration.checkout_grace_minutes);

        let (mac, session_token) = match device {
            DeviceRef::Mac(mac) => (Some(mac.clone()), None),
            DeviceRef::SessionToken(token) => (None, Some(token.clone())),
        };

        let grant = ctx
            .grants
            .create(NewGrant {
                voucher_code: None,
                booking_ref: Some(identifier),
                integration_id: Some(integration.integration_id.clone()),
                user_input_code: Some(code.to_string()),
                mac,
                session_token,
                start_utc: start,
                end_utc: end,
                up_kbps: None,
                down_kbps: None,
            })
            .await?;
        return Ok((grant, "booking"));
    }

    if kind == CodeKind::VoucherCandidate {
        let redeemed = match device {
            DeviceRef::Mac(mac) => ctx.vouchers.redeem(code, mac, now).await,
            DeviceRef::SessionToken(token) => {
                ctx.vouchers.redeem_with_session_token(code, token, now).await
            }
        };

        match redeemed {
            Ok(grant) => return Ok((grant, "voucher")),
            Err(PortalError::NotFound(_)) if booking_refusal.is_some() => {}
            Err(e) => return Err(e),
        }
    }

    if let Some(refusal) = booking_refusal {
        return Err(refusal);
    }
    Err(PortalError::NotFound(
        "Invalid authorization code".to_string(),
    ))
}

fn device_mac(device: &DeviceRef) -> Option<&str> {
    match device {
        DeviceRef::Mac(mac) => Some(mac.as_str()),
        DeviceRef::SessionToken(_) => None,
    }
}

async fn audit_guest(
    ctx: &AppContext,
    actor: &str,
    outcome: Outcome,
    mac: Option<&str>,
    detail: &str,
    code: Option<&str>,
) {
    let mut event = AuditEvent::new(actor, "guest.authorize", outcome)
        .correlation(current_correlation_id())
        .meta(serde_json::json!({
            "detail": detail,
            "mac": mac,
            "code": code,
        }));
    if let Some(code) = code {
        event = event.target("code", code);
    }
    let _ = ctx.audit.log(event).await;
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

fn time_max_age(seconds: i64) -> time::Duration {
    time::Duration::seconds(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_escape_neutralizes_injection() {
        assert_eq!(
            html_escape(r#""><script>alert(1)</script>"#),
            "&quot;&gt;&lt;script&gt;alert(1)&lt;/script&gt;"
        );
    }
}
