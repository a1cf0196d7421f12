/// Metrics and telemetry
///
/// Prometheus counters and gauges for the guest pipeline, controller
/// traffic, and background tasks. Rate-limited requests are counted here
/// rather than audited.
use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Guest authorization attempts by code type and outcome
    pub static ref GUEST_AUTH_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "guest_auth_attempts_total",
        "Guest authorization attempts",
        &["code_type", "outcome"]
    )
    .unwrap();

    /// Requests refused by the per-IP rate limiter
    pub static ref RATE_LIMITED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rate_limited_total",
        "Requests rejected by the rate limiter",
        &["route"]
    )
    .unwrap();

    /// Controller operations by type and outcome
    pub static ref CONTROLLER_OPS: IntCounterVec = register_int_counter_vec!(
        "controller_ops_total",
        "Controller operations executed",
        &["op", "outcome"]
    )
    .unwrap();

    /// Reservation poll results
    pub static ref RESERVATION_POLLS: IntCounterVec = register_int_counter_vec!(
        "reservation_polls_total",
        "Reservation source polls",
        &["outcome"]
    )
    .unwrap();

    /// Pending operations in the durable retry queue
    pub static ref RETRY_QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "retry_queue_depth",
        "Pending controller operations awaiting retry"
    )
    .unwrap();

    /// Background sweep results
    pub static ref SWEEP_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sweep_total",
        "Rows affected by background sweeps",
        &["sweep"]
    )
    .unwrap();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
