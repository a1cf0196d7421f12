/// Unified error types for the portal
///
/// Internal code paths propagate typed errors; only this module's
/// `IntoResponse` materializes the HTTP envelope
/// `{error, code, correlation_id}`.
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

tokio::task_local! {
    /// Correlation id for the request being served, set by the
    /// correlation middleware and read when an error is rendered.
    pub static CORRELATION_ID: String;
}

/// Fixed error codes exposed in the envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    Conflict,
    Unauthorized,
    RbacForbidden,
    ControllerUnavailable,
    ControllerTimeout,
    RateLimited,
    InternalError,
    DuplicateRedemption,
    RetryExhausted,
    OutsideWindow,
    IntegrationUnavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::RbacForbidden => "RBAC_FORBIDDEN",
            ErrorCode::ControllerUnavailable => "CONTROLLER_UNAVAILABLE",
            ErrorCode::ControllerTimeout => "CONTROLLER_TIMEOUT",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::DuplicateRedemption => "DUPLICATE_REDEMPTION",
            ErrorCode::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorCode::OutsideWindow => "OUTSIDE_WINDOW",
            ErrorCode::IntegrationUnavailable => "INTEGRATION_UNAVAILABLE",
        }
    }
}

/// Main error type for the portal
#[derive(Error, Debug)]
pub enum PortalError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Input validation errors from guests or admins
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration or internal-consistency validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing voucher, booking, grant, or resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic conflicts (duplicate config rows etc.)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A non-revoked grant already exists for this device and code
    #[error("Duplicate grant: {0}")]
    DuplicateGrant(String),

    /// Voucher or booking window is over
    #[error("Outside authorization window: {0}")]
    OutsideWindow(String),

    /// Admin authentication failures
    #[error("Authentication failed: {0}")]
    Unauthorized(String),

    /// CSRF double-submit mismatch
    #[error("CSRF validation failed")]
    CsrfRejected,

    /// RBAC denial for a known admin
    #[error("Forbidden: {0}")]
    RbacDenied(String),

    /// Per-IP rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimited { retry_after_seconds: i64 },

    /// Grant state machine violations (extend on revoked, etc.)
    #[error("Grant operation error: {0}")]
    GrantOperation(String),

    /// Voucher code generation exhausted its collision retries
    #[error("Voucher code collision retries exhausted")]
    VoucherCollision,

    /// Reservation integration stale beyond tolerance
    #[error("Integration unavailable: {0}")]
    IntegrationUnavailable(String),

    /// Controller unreachable after per-call retries
    #[error("Controller unavailable: {0}")]
    ControllerUnavailable(String),

    /// Controller call timed out
    #[error("Controller timeout: {0}")]
    ControllerTimeout(String),

    /// Controller rejected the request permanently (non-auth 4xx)
    #[error("Controller rejected request: {0}")]
    ControllerRejected(String),

    /// Durable retry queue gave up on an operation
    #[error("Retry attempts exhausted for {0}")]
    RetryExhausted(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PortalError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PortalError::InvalidInput(_) | PortalError::Validation(_) | PortalError::CsrfRejected => {
                ErrorCode::InvalidInput
            }
            PortalError::NotFound(_) => ErrorCode::NotFound,
            PortalError::Conflict(_) | PortalError::GrantOperation(_) => ErrorCode::Conflict,
            PortalError::DuplicateGrant(_) => ErrorCode::DuplicateRedemption,
            PortalError::OutsideWindow(_) => ErrorCode::OutsideWindow,
            PortalError::Unauthorized(_) => ErrorCode::Unauthorized,
            PortalError::RbacDenied(_) => ErrorCode::RbacForbidden,
            PortalError::RateLimited { .. } => ErrorCode::RateLimited,
            PortalError::VoucherCollision | PortalError::RetryExhausted(_) => {
                ErrorCode::RetryExhausted
            }
            PortalError::IntegrationUnavailable(_) => ErrorCode::IntegrationUnavailable,
            PortalError::ControllerUnavailable(_) | PortalError::ControllerRejected(_) => {
                ErrorCode::ControllerUnavailable
            }
            PortalError::ControllerTimeout(_) => ErrorCode::ControllerTimeout,
            PortalError::Database(_) | PortalError::Io(_) | PortalError::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PortalError::InvalidInput(_) | PortalError::Validation(_) => StatusCode::BAD_REQUEST,
            PortalError::CsrfRejected => StatusCode::FORBIDDEN,
            PortalError::NotFound(_) => StatusCode::NOT_FOUND,
            PortalError::Conflict(_)
            | PortalError::GrantOperation(_)
            | PortalError::DuplicateGrant(_) => StatusCode::CONFLICT,
            PortalError::OutsideWindow(_) => StatusCode::GONE,
            PortalError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PortalError::RbacDenied(_) => StatusCode::FORBIDDEN,
            PortalError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            PortalError::IntegrationUnavailable(_) | PortalError::ControllerUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            PortalError::ControllerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            PortalError::ControllerRejected(_) => StatusCode::BAD_GATEWAY,
            PortalError::VoucherCollision
            | PortalError::RetryExhausted(_)
            | PortalError::Database(_)
            | PortalError::Io(_)
            | PortalError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Guest-visible message. Deliberately generic for anything a guest
    /// could probe with; specifics live in the audit trail.
    fn public_message(&self) -> String {
        match self {
            PortalError::Database(_) | PortalError::Io(_) | PortalError::Internal(_) => {
                "Internal server error".to_string()
            }
            PortalError::NotFound(_) | PortalError::OutsideWindow(_) => {
                "Invalid authorization code".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Wire format of the error envelope
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub code: String,
    pub correlation_id: String,
}

impl IntoResponse for PortalError {
    fn into_response(self) -> Response {
        let correlation_id = CORRELATION_ID
            .try_with(|id| id.clone())
            .unwrap_or_default();

        if matches!(self, PortalError::Database(_) | PortalError::Internal(_) | PortalError::Io(_)) {
            tracing::error!(correlation_id = %correlation_id, error = %self, "internal error");
        }

        let status = self.status();
        let retry_after = match &self {
            PortalError::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            _ => None,
        };

        let body = Json(ErrorEnvelope {
            error: self.public_message(),
            code: self.code().as_str().to_string(),
            correlation_id,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type alias for portal operations
pub type PortalResult<T> = Result<T, PortalError>;
