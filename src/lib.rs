/// guestgate - captive-portal authorization service for short-term-rental
/// networks
///
/// Guests authenticate through a web portal with a staff-issued voucher
/// or a reservation-derived booking code; authorized devices are admitted
/// on the Wi-Fi controller for the stay plus a grace window.
pub mod api;
pub mod audit;
pub mod codes;
pub mod config;
pub mod context;
pub mod controller;
pub mod csrf;
pub mod db;
pub mod error;
pub mod grants;
pub mod jobs;
pub mod metrics;
pub mod netutil;
pub mod portal_settings;
pub mod rate_limit;
pub mod rbac;
pub mod redirect;
pub mod rental;
pub mod retry_queue;
pub mod server;
pub mod sessions;
pub mod timeutil;
pub mod vouchers;
