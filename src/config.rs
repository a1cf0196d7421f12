/// Configuration management for the portal
use crate::error::{PortalError, PortalResult};
use crate::netutil;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub controller: ControllerConfig,
    pub reservation: ReservationConfig,
    pub portal: PortalOptions,
    pub security: SecurityConfig,
    pub cleanup: CleanupConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Whether the portal itself is served behind TLS; flips `Secure` on
    /// guest cookies.
    pub tls: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub portal_db: PathBuf,
}

/// Wi-Fi controller connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub base_url: String,
    pub controller_id: String,
    pub operator_username: String,
    pub operator_password: String,
    pub site: String,
    pub allow_self_signed: bool,
    pub request_timeout_seconds: u64,
}

/// Reservation source connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationConfig {
    pub base_url: String,
    pub token: String,
    pub poll_interval_seconds: u64,
}

/// Guest portal behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalOptions {
    pub rate_limit_attempts: u32,
    pub rate_limit_window_seconds: u32,
    pub success_redirect_url: String,
    pub trusted_proxy_cidrs: Vec<IpNet>,
    pub redirect_allowed_hosts: Vec<String>,
}

/// Admin session and CSRF settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub session_idle_minutes: i64,
    pub session_max_hours: i64,
    pub csrf_token_bytes: usize,
    /// Bootstrap credentials for the first admin account
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
}

/// Background cleanup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub event_retention_days: i64,
    pub cleanup_hour_local: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> PortalResult<Self> {
        dotenv::dotenv().ok();

        let hostname = var_or("GUESTGATE_HOSTNAME", "0.0.0.0");
        let port = env::var("GUESTGATE_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| PortalError::Validation("Invalid port number".to_string()))?;
        let tls = parse_or("GUESTGATE_TLS", false);

        let data_directory: PathBuf = var_or("GUESTGATE_DATA_DIRECTORY", "./data").into();
        let portal_db = env::var("GUESTGATE_DB_LOCATION")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("portal.sqlite"));

        let controller = ControllerConfig {
            base_url: env::var("GUESTGATE_CONTROLLER_URL")
                .map_err(|_| PortalError::Validation("Controller URL required".to_string()))?,
            controller_id: env::var("GUESTGATE_CONTROLLER_ID")
                .map_err(|_| PortalError::Validation("Controller id required".to_string()))?,
            operator_username: env::var("GUESTGATE_CONTROLLER_OPERATOR_USERNAME")
                .map_err(|_| PortalError::Validation("Controller operator username required".to_string()))?,
            operator_password: env::var("GUESTGATE_CONTROLLER_OPERATOR_PASSWORD")
                .map_err(|_| PortalError::Validation("Controller operator password required".to_string()))?,
            site: var_or("GUESTGATE_CONTROLLER_SITE", "Default"),
            allow_self_signed: parse_or("GUESTGATE_CONTROLLER_ALLOW_SELF_SIGNED", false),
            request_timeout_seconds: parse_or("GUESTGATE_CONTROLLER_TIMEOUT_SECONDS", 10u64),
        };

        let reservation = ReservationConfig {
            base_url: env::var("GUESTGATE_RESERVATION_URL")
                .map_err(|_| PortalError::Validation("Reservation source URL required".to_string()))?,
            token: env::var("GUESTGATE_RESERVATION_TOKEN")
                .map_err(|_| PortalError::Validation("Reservation source token required".to_string()))?,
            poll_interval_seconds: parse_or("GUESTGATE_RESERVATION_POLL_INTERVAL", 60u64),
        };

        // Default proxy trust: private ranges only.
        let cidrs_raw = var_or(
            "GUESTGATE_TRUSTED_PROXY_CIDRS",
            "10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,fc00::/7",
        );
        let trusted_proxy_cidrs = netutil::parse_cidrs(&cidrs_raw)?;

        let redirect_allowed_hosts = var_or("GUESTGATE_REDIRECT_ALLOWED_HOSTS", "")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let portal = PortalOptions {
            rate_limit_attempts: parse_or("GUESTGATE_RATE_LIMIT_ATTEMPTS", 5u32),
            rate_limit_window_seconds: parse_or("GUESTGATE_RATE_LIMIT_WINDOW_SECONDS", 60u32),
            success_redirect_url: var_or("GUESTGATE_SUCCESS_REDIRECT_URL", "/guest/welcome"),
            trusted_proxy_cidrs,
            redirect_allowed_hosts,
        };

        let security = SecurityConfig {
            session_idle_minutes: parse_or("GUESTGATE_SESSION_IDLE_MINUTES", 30i64),
            session_max_hours: parse_or("GUESTGATE_SESSION_MAX_HOURS", 8i64),
            csrf_token_bytes: parse_or("GUESTGATE_CSRF_TOKEN_BYTES", 32usize),
            admin_username: env::var("GUESTGATE_ADMIN_USERNAME").ok(),
            admin_password: env::var("GUESTGATE_ADMIN_PASSWORD").ok(),
        };

        let cleanup = CleanupConfig {
            event_retention_days: parse_or("GUESTGATE_EVENT_RETENTION_DAYS", 7i64),
            cleanup_hour_local: parse_or("GUESTGATE_CLEANUP_HOUR_LOCAL", 3u32),
        };

        let logging = LoggingConfig {
            level: var_or("RUST_LOG", "info"),
        };

        Ok(ServerConfig {
            service: ServiceConfig { hostname, port, tls },
            storage: StorageConfig {
                data_directory,
                portal_db,
            },
            controller,
            reservation,
            portal,
            security,
            cleanup,
            logging,
        })
    }

    /// Validate configuration ranges
    pub fn validate(&self) -> PortalResult<()> {
        if self.service.hostname.is_empty() {
            return Err(PortalError::Validation("Hostname cannot be empty".to_string()));
        }

        if !(1..=100).contains(&self.portal.rate_limit_attempts) {
            return Err(PortalError::Validation(
                "rate_limit_attempts must be between 1 and 100".to_string(),
            ));
        }

        if !(10..=3600).contains(&self.portal.rate_limit_window_seconds) {
            return Err(PortalError::Validation(
                "rate_limit_window_seconds must be between 10 and 3600".to_string(),
            ));
        }

        if self.security.csrf_token_bytes < 16 {
            return Err(PortalError::Validation(
                "csrf_token_bytes must be at least 16".to_string(),
            ));
        }

        if self.cleanup.cleanup_hour_local > 23 {
            return Err(PortalError::Validation(
                "cleanup_hour_local must be between 0 and 23".to_string(),
            ));
        }

        if !self.controller.base_url.starts_with("http") {
            return Err(PortalError::Validation(
                "Controller URL must be http(s)".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ServerConfig {
        ServerConfig {
            service: ServiceConfig {
                hostname: "0.0.0.0".into(),
                port: 8080,
                tls: false,
            },
            storage: StorageConfig {
                data_directory: "./data".into(),
                portal_db: "./data/portal.sqlite".into(),
            },
            controller: ControllerConfig {
                base_url: "https://controller:8043".into(),
                controller_id: "abc123".into(),
                operator_username: "operator".into(),
                operator_password: "secret".into(),
                site: "Default".into(),
                allow_self_signed: true,
                request_timeout_seconds: 10,
            },
            reservation: ReservationConfig {
                base_url: "http://supervisor/core/api".into(),
                token: "token".into(),
                poll_interval_seconds: 60,
            },
            portal: PortalOptions {
                rate_limit_attempts: 5,
                rate_limit_window_seconds: 60,
                success_redirect_url: "/guest/welcome".into(),
                trusted_proxy_cidrs: vec![],
                redirect_allowed_hosts: vec![],
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

    #[test]
    fn test_valid_config_passes() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn test_rate_limit_ranges_enforced() {
        let mut cfg = minimal();
        cfg.portal.rate_limit_attempts = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = minimal();
        cfg.portal.rate_limit_attempts = 101;
        assert!(cfg.validate().is_err());

        let mut cfg = minimal();
        cfg.portal.rate_limit_window_seconds = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_cleanup_hour_range() {
        let mut cfg = minimal();
        cfg.cleanup.cleanup_hour_local = 24;
        assert!(cfg.validate().is_err());
    }
}
