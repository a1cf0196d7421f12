/// Client IP derivation and MAC address normalization
use crate::error::{PortalError, PortalResult};
use axum::http::HeaderMap;
use ipnet::IpNet;
use std::net::IpAddr;

/// Request headers checked for the client MAC, in order. Different
/// controllers inject different names when redirecting to the portal.
pub const MAC_HEADERS: [&str; 3] = ["X-MAC-Address", "X-Client-Mac", "Client-MAC"];

/// Derive the apparent client IP.
///
/// `X-Forwarded-For` is honored (leftmost entry) only when the direct peer
/// is inside one of the trusted proxy networks. Headers from untrusted
/// peers are ignored and the direct peer address is returned.
pub fn derive_client_ip(
    peer: IpAddr,
    headers: &HeaderMap,
    trusted_proxies: &[IpNet],
) -> IpAddr {
    if !trusted_proxies.iter().any(|net| net.contains(&peer)) {
        return peer;
    }

    if let Some(xff) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            if let Ok(ip) = first.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    if let Some(real) = headers.get("X-Real-IP").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = real.trim().parse::<IpAddr>() {
            return ip;
        }
    }

    peer
}

/// Extract the device MAC from the configured header set, normalized.
/// Returns None when no MAC header is present at all.
pub fn extract_mac(headers: &HeaderMap) -> Option<PortalResult<String>> {
    for name in MAC_HEADERS {
        if let Some(raw) = headers.get(name).and_then(|v| v.to_str().ok()) {
            return Some(normalize_mac(raw));
        }
    }
    None
}

/// Normalize a MAC address to uppercase colon-separated form
/// (`AA:BB:CC:DD:EE:FF`).
///
/// Accepts colon-, hyphen-, and dot-separated forms as well as bare
/// 12-hex-digit strings. Anything else is rejected.
pub fn normalize_mac(raw: &str) -> PortalResult<String> {
    let stripped: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();

    if stripped.len() != 12 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PortalError::InvalidInput(format!(
            "Invalid MAC address format: {}",
            raw.trim()
        )));
    }

    let upper = stripped.to_ascii_uppercase();
    let octets: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
    Ok(octets.join(":"))
}

/// Parse a comma-separated CIDR list. Invalid entries are rejected rather
/// than silently dropped.
pub fn parse_cidrs(raw: &str) -> PortalResult<Vec<IpNet>> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>()
                .map_err(|_| PortalError::Validation(format!("Invalid CIDR: {}", s)))
        })
        .collect()
}
