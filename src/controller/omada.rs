/// TP-Omada external-portal client
///
/// Speaks the hotspot operator API: session login yields a cookie plus a
/// token echoed in the `Csrf-Token` header, then `extPortal/auth` and
/// `extPortal/revoke` manage client authorizations. The session is
/// re-established on 401 or Omada session-expiry error codes.
use crate::config::ControllerConfig;
use crate::controller::{Controller, ControllerHealth};
use crate::error::{PortalError, PortalResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::cookie::Jar;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// External portal auth type used by Omada for hotspot clients
const EXT_PORTAL_AUTH_TYPE: i64 = 4;

/// Per-call retry delays
const RETRY_DELAYS_MS: [u64; 4] = [1000, 2000, 4000, 8000];
const MAX_ATTEMPTS: usize = 4;

/// Omada error codes signalling an expired or missing session
const SESSION_ERROR_CODES: [i64; 2] = [-1200, -1005];

#[derive(Debug, Deserialize)]
struct OmadaResponse {
    #[serde(rename = "errorCode", default)]
    error_code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

pub struct OmadaController {
    http: reqwest::Client,
    base_url: Url,
    controller_id: String,
    site: String,
    username: String,
    password: String,
    /// CSRF token from the last successful login
    csrf: tokio::sync::Mutex<Option<String>>,
    /// Last acked (mac -> end) pairs, so identical re-authorizations
    /// short-circuit without a network call
    acked: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl OmadaController {
    pub fn new(config: &ControllerConfig) -> PortalResult<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| PortalError::Validation(format!("Invalid controller URL: {}", e)))?;

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .cookie_provider(Arc::new(Jar::default()));

        if config.allow_self_signed {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let http = builder
            .build()
            .map_err(|e| PortalError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            controller_id: config.controller_id.clone(),
            site: config.site.clone(),
            username: config.operator_username.clone(),
            password: config.operator_password.clone(),
            csrf: tokio::sync::Mutex::new(None),
            acked: Mutex::new(HashMap::new()),
        })
    }

    fn hotspot_url(&self, path: &str) -> PortalResult<Url> {
        let full = format!(
            "{}/{}/api/v2/hotspot/{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.controller_id,
            path
        );
        Url::parse(&full).map_err(|e| PortalError::Internal(format!("Bad controller URL: {}", e)))
    }

    /// Log in as the hotspot operator and cache the CSRF token. The
    /// session cookie lands in the client's cookie jar.
    async fn login(&self) -> PortalResult<String> {
        let url = self.hotspot_url("login")?;
        let payload = serde_json::json!({
            "name": self.username,
            "password": self.password,
        });

        debug!("Omada operator login at {}", url);
        let response = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(classify_send_error)?;

        if !response.status().is_success() {
            return Err(PortalError::ControllerUnavailable(format!(
                "Login failed with HTTP {}",
                response.status()
            )));
        }

        let body: OmadaResponse = response
            .json()
            .await
            .map_err(|e| PortalError::ControllerUnavailable(format!("Bad login response: {}", e)))?;

        if body.error_code != 0 {
            return Err(PortalError::ControllerUnavailable(format!(
                "Omada login failed: {}",
                body.msg.unwrap_or_else(|| "unknown error".to_string())
            )));
        }

        let token = body
            .result
            .as_ref()
            .and_then(|r| r.get("token"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                PortalError::ControllerUnavailable("CSRF token missing from login response".to_string())
            })?;

        let mut csrf = self.csrf.lock().await;
        *csrf = Some(token.clone());
        info!("Omada operator session established");
        Ok(token)
    }

    async fn current_token(&self) -> PortalResult<String> {
        {
            let csrf = self.csrf.lock().await;
            if let Some(token) = csrf.as_ref() {
                return Ok(token.clone());
            }
        }
        self.login().await
    }

    /// POST to a hotspot endpoint with per-call exponential backoff.
    ///
    /// Transient failures (connect errors, timeouts, HTTP 5xx, Omada error
    /// codes >= 5000) are retried. A 401 or session error code forces one
    /// re-login for the call. Other 4xx are permanent.
    async fn post_with_retry(
        &self,
        path: &str,
        payload: &serde_json::Value,
    ) -> PortalResult<OmadaResponse> {
        let url = self.hotspot_url(path)?;
        let mut relogged_in = false;
        let mut attempts = 0usize;

        loop {
            let token = self.current_token().await?;

            let result = self
                .http
                .post(url.clone())
                .header("Csrf-Token", &token)
                .json(payload)
                .send()
                .await;

            // Transient failure for this iteration, if any.
            let failure: PortalError = match result {
                Err(e) => classify_send_error(e),
                Ok(response) => {
                    let status = response.status();

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        if !relogged_in {
                            // A stale session does not consume a retry slot.
                            relogged_in = true;
                            self.clear_session().await;
                            continue;
                        }
                        return Err(PortalError::ControllerUnavailable(
                            "Controller session rejected after re-login".to_string(),
                        ));
                    }

                    if status.is_client_error() {
                        return Err(PortalError::ControllerRejected(format!(
                            "Controller returned HTTP {}",
                            status
                        )));
                    }

                    if status.is_server_error() {
                        PortalError::ControllerUnavailable(format!(
                            "Controller returned HTTP {}",
                            status
                        ))
                    } else {
                        let body: OmadaResponse = response.json().await.map_err(|e| {
                            PortalError::ControllerUnavailable(format!(
                                "Bad controller response: {}",
                                e
                            ))
                        })?;

                        if body.error_code == 0 {
                            return Ok(body);
                        }

                        if SESSION_ERROR_CODES.contains(&body.error_code) {
                            if !relogged_in {
                                relogged_in = true;
                                self.clear_session().await;
                                continue;
                            }
                            return Err(PortalError::ControllerUnavailable(
                                "Controller session rejected after re-login".to_string(),
                            ));
                        }

                        if body.error_code >= 5000 {
                            PortalError::ControllerUnavailable(format!(
                                "Omada error {}: {}",
                                body.error_code,
                                body.msg.as_deref().unwrap_or("unknown")
                            ))
                        } else {
                            return Err(PortalError::ControllerRejected(format!(
                                "Omada error {}: {}",
                                body.error_code,
                                body.msg.as_deref().unwrap_or("unknown")
                            )));
                        }
                    }
                }
            };

            attempts += 1;
            if attempts >= MAX_ATTEMPTS {
                return Err(failure);
            }
            let delay = RETRY_DELAYS_MS[attempts - 1];
            warn!(
                "Controller call to {} failed ({}), retrying in {}ms",
                path, failure, delay
            );
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    async fn clear_session(&self) {
        let mut csrf = self.csrf.lock().await;
        *csrf = None;
    }
}

/// Build the extPortal/auth payload. `time` is the absolute expiration in
/// microseconds since epoch.
pub fn auth_payload(
    mac: &str,
    site: &str,
    end_utc: DateTime<Utc>,
    up_kbps: Option<i64>,
    down_kbps: Option<i64>,
) -> serde_json::Value {
    let mut payload = serde_json::json!({
        "clientMac": mac,
        "site": site,
        "time": end_micros(end_utc),
        "authType": EXT_PORTAL_AUTH_TYPE,
    });
    if let Some(up) = up_kbps {
        payload["upKbps"] = serde_json::json!(up);
    }
    if let Some(down) = down_kbps {
        payload["downKbps"] = serde_json::json!(down);
    }
    payload
}

fn end_micros(end_utc: DateTime<Utc>) -> i64 {
    end_utc.timestamp_micros()
}

fn classify_send_error(e: reqwest::Error) -> PortalError {
    if e.is_timeout() {
        PortalError::ControllerTimeout(e.to_string())
    } else {
        PortalError::ControllerUnavailable(e.to_string())
    }
}

#[async_trait]
impl Controller for OmadaController {
    async fn authorize(
        &self,
        mac: &str,
        end_utc: DateTime<Utc>,
        up_kbps: Option<i64>,
        down_kbps: Option<i64>,
    ) -> PortalResult<String> {
        {
            let acked = self.acked.lock().expect("ack cache lock poisoned");
            if acked.get(mac) == Some(&end_utc) {
                debug!("Authorize for {} already acked until {}", mac, end_utc);
                return Ok(mac.to_string());
            }
        }

        let payload = auth_payload(mac, &self.site, end_utc, up_kbps, down_kbps);
        let response = self.post_with_retry("extPortal/auth", &payload).await?;

        let grant_id = response
            .result
            .as_ref()
            .and_then(|r| r.get("clientId"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| mac.to_string());

        let mut acked = self.acked.lock().expect("ack cache lock poisoned");
        acked.insert(mac.to_string(), end_utc);
        Ok(grant_id)
    }

    async fn revoke(&self, mac: &str) -> PortalResult<()> {
        let payload = serde_json::json!({
            "clientMac": mac,
            "site": self.site,
        });

        match self.post_with_retry("extPortal/revoke", &payload).await {
            Ok(_) => {}
            // An unknown client is already in the state we want.
            Err(PortalError::ControllerRejected(msg)) if msg.contains("404") => {
                debug!("Revoke for {}: not found on controller, treating as done", mac);
            }
            Err(e) => return Err(e),
        }

        let mut acked = self.acked.lock().expect("ack cache lock poisoned");
        acked.remove(mac);
        Ok(())
    }

    async fn extend(&self, mac: &str, new_end_utc: DateTime<Utc>) -> PortalResult<()> {
        // Omada has no separate update call; re-authorization moves the
        // expiration.
        self.authorize(mac, new_end_utc, None, None).await?;
        Ok(())
    }

    async fn health(&self) -> ControllerHealth {
        match self.login().await {
            Ok(_) => ControllerHealth::Ok,
            Err(e) => ControllerHealth::Degraded(e.to_string()),
        }
    }
}
