/// Shared test harness: in-memory context, a recording controller double,
/// and request helpers for driving the router.
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::http::{header, Request, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use guestgate::config::{
    CleanupConfig, ControllerConfig, LoggingConfig, PortalOptions, ReservationConfig,
    SecurityConfig, ServerConfig, ServiceConfig, StorageConfig,
};
use guestgate::context::AppContext;
use guestgate::controller::{Controller, ControllerHealth};
use guestgate::db;
use guestgate::error::PortalResult;
use guestgate::server::build_router;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

/// Controller double that records calls and always succeeds
#[derive(Default)]
pub struct RecordingController {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Controller for RecordingController {
    async fn authorize(
        &self,
        mac: &str,
        end_utc: DateTime<Utc>,
        _up_kbps: Option<i64>,
        _down_kbps: Option<i64>,
    ) -> PortalResult<String> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("authorize {} {}", mac, end_utc.to_rfc3339()));
        Ok(format!("ctrl-{}", mac))
    }

    async fn revoke(&self, mac: &str) -> PortalResult<()> {
        self.calls.lock().unwrap().push(format!("revoke {}", mac));
        Ok(())
    }

    async fn extend(&self, mac: &str, new_end_utc: DateTime<Utc>) -> PortalResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("extend {} {}", mac, new_end_utc.to_rfc3339()));
        Ok(())
    }

    async fn health(&self) -> ControllerHealth {
        ControllerHealth::Ok
    }
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        service: ServiceConfig {
            hostname: "127.0.0.1".into(),
            port: 0,
            tls: false,
        },
        storage: StorageConfig {
            data_directory: "./data".into(),
            portal_db: "./data/portal.sqlite".into(),
        },
        controller: ControllerConfig {
            base_url: "https://controller.test:8043".into(),
            controller_id: "abcd1234".into(),
            operator_username: "operator".into(),
            operator_password: "secret".into(),
            site: "Default".into(),
            allow_self_signed: true,
            request_timeout_seconds: 10,
        },
        reservation: ReservationConfig {
            base_url: "http://reservation.test/api".into(),
            token: "test-token".into(),
            poll_interval_seconds: 60,
        },
        portal: PortalOptions {
            rate_limit_attempts: 5,
            rate_limit_window_seconds: 60,
            success_redirect_url: "/guest/welcome".into(),
            trusted_proxy_cidrs: guestgate::netutil::parse_cidrs("10.0.0.0/8").unwrap(),
            redirect_allowed_hosts: vec!["portal.example.com".into()],
        },
        security: SecurityConfig {
            session_idle_minutes: 30,
            session_max_hours: 8,
            csrf_token_bytes: 32,
            admin_username: None,
            admin_password: None,
        },
        cleanup: CleanupConfig {
            event_retention_days: 7,
            cleanup_hour_local: 3,
        },
        logging: LoggingConfig { level: "info".into() },
    }
}

pub async fn test_context() -> (AppContext, Arc<RecordingController>) {
    let pool = db::connect_memory().await.unwrap();
    let controller = Arc::new(RecordingController::default());
    let ctx = AppContext::assemble(test_config(), pool, controller.clone()).unwrap();
    (ctx, controller)
}

pub async fn send(router: &Router, mut request: Request<Body>) -> Response<Body> {
    request
        .extensions_mut()
        .insert(ConnectInfo::<SocketAddr>("203.0.113.9:45000".parse().unwrap()));
    router.clone().oneshot(request).await.unwrap()
}

pub async fn send_from(
    router: &Router,
    mut request: Request<Body>,
    peer: &str,
) -> Response<Body> {
    request
        .extensions_mut()
        .insert(ConnectInfo::<SocketAddr>(peer.parse().unwrap()));
    router.clone().oneshot(request).await.unwrap()
}

pub fn router_for(ctx: &AppContext) -> Router {
    build_router(ctx.clone())
}

/// Form-encoded guest authorization POST with a matching CSRF pair
pub fn guest_post(code: &str, continue_url: Option<&str>, mac: Option<&str>) -> Request<Body> {
    let token = "test-csrf-token";
    let mut body = format!(
        "code={}&csrf_token={}",
        urlencode(code),
        urlencode(token)
    );
    if let Some(url) = continue_url {
        body.push_str(&format!("&continue={}", urlencode(url)));
    }

    let mut builder = Request::builder()
        .method("POST")
        .uri("/guest/authorize")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .header(header::COOKIE, format!("guest_csrftoken={}", token));
    if let Some(mac) = mac {
        builder = builder.header("X-MAC-Address", mac);
    }
    builder.body(Body::from(body)).unwrap()
}

pub fn urlencode(input: &str) -> String {
    url::form_urlencoded::byte_serialize(input.as_bytes()).collect()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// First Set-Cookie value for `name`, if present
pub fn cookie_value(response: &Response<Body>, name: &str) -> Option<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|raw| {
            let (pair, _) = raw.split_once(';').unwrap_or((raw, ""));
            let (key, value) = pair.split_once('=')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
}
