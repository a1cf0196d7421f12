/// CSRF protection using the double-submit cookie pattern
///
/// Stateless for guests: a random token is set as a cookie and embedded in
/// the form; the POST handler compares the two in constant time. Admin
/// sessions carry their CSRF token server-side instead.
use axum_extra::extract::cookie::{Cookie, SameSite};
use rand::RngCore;

pub const GUEST_CSRF_COOKIE: &str = "guest_csrftoken";
pub const CSRF_FORM_FIELD: &str = "csrf_token";

#[derive(Clone)]
pub struct CsrfProtection {
    token_bytes: usize,
    cookie_secure: bool,
}

impl CsrfProtection {
    pub fn new(token_bytes: usize, cookie_secure: bool) -> Self {
        Self {
            token_bytes,
            cookie_secure,
        }
    }

    /// Generate a fresh token (hex-encoded random bytes).
    pub fn generate_token(&self) -> String {
        let mut buf = vec![0u8; self.token_bytes];
        rand::thread_rng().fill_bytes(&mut buf);
        buf.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Build the guest CSRF cookie. HttpOnly and SameSite=Lax always;
    /// Secure only when the portal itself is served over TLS, since captive
    /// clients are frequently forced through plain HTTP.
    pub fn guest_cookie(&self, token: String) -> Cookie<'static> {
        let mut cookie = Cookie::new(GUEST_CSRF_COOKIE, token);
        cookie.set_http_only(true);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_secure(self.cookie_secure);
        cookie.set_path("/");
        cookie
    }

    /// Compare cookie and submitted tokens without early exit.
    pub fn tokens_match(&self, cookie_token: &str, submitted: &str) -> bool {
        constant_time_eq(cookie_token.as_bytes(), submitted.as_bytes())
    }
}

/// Token comparison without early exit, shared by the guest double-submit
/// check and the admin session CSRF check.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
