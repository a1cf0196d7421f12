/// Post-authorization redirect validation
///
/// Guards the `continue` parameter preserved from the captive-portal
/// redirect against open-redirect abuse. Only bare relative paths and
/// whitelisted http(s) hosts survive.
use url::Url;

#[derive(Clone)]
pub struct RedirectValidator {
    allowed_hosts: Vec<String>,
}

impl RedirectValidator {
    pub fn new(allowed_hosts: Vec<String>) -> Self {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Whether `url` is a safe redirect destination.
    ///
    /// Rejected outright: empty values, anything containing a backslash,
    /// protocol-relative (`//...`) and triple-slash forms, and every scheme
    /// other than http/https. Absolute URLs must name a whitelisted host.
    pub fn is_safe(&self, url: &str) -> bool {
        if url.is_empty() || url.contains('\\') {
            return false;
        }

        // Protocol-relative and triple-slash forms resolve against an
        // attacker-chosen authority in browsers.
        if url.starts_with("//") {
            return false;
        }

        if let Some(rest) = url.strip_prefix('/') {
            // Single leading slash, relative path: safe.
            return !rest.starts_with('/');
        }

        match Url::parse(url) {
            Ok(parsed) => {
                if !matches!(parsed.scheme(), "http" | "https") {
                    return false;
                }
                match parsed.host_str() {
                    Some(host) => self.allowed_hosts.contains(&host.to_ascii_lowercase()),
                    None => false,
                }
            }
            // Neither an absolute URL nor a rooted path.
            Err(_) => false,
        }
    }

    /// Resolve the final redirect destination: the candidate when safe,
    /// otherwise the configured fallback.
    pub fn resolve<'a>(&self, candidate: Option<&'a str>, fallback: &'a str) -> (&'a str, bool) {
        match candidate {
            Some(c) if self.is_safe(c) => (c, true),
            Some(_) => (fallback, false),
            None => (fallback, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> RedirectValidator {
        RedirectValidator::new(vec!["portal.example.com".to_string()])
    }

    #[test]
    fn test_relative_paths_allowed() {
        let v = validator();
        assert!(v.is_safe("/guest/welcome"));
        assert!(v.is_safe("/some/deep/path?x=1"));
    }

    #[test]
    fn test_protocol_relative_rejected() {
        let v = validator();
        assert!(!v.is_safe("//evil.example/x"));
        assert!(!v.is_safe("///x"));
    }

    #[test]
    fn test_backslash_tricks_rejected() {
        let v = validator();
        assert!(!v.is_safe("\\\\evil.example\\x"));
        assert!(!v.is_safe("/\\evil.example"));
        assert!(!v.is_safe("https://portal.example.com\\@evil.example"));
    }

    #[test]
    fn test_dangerous_schemes_rejected() {
        let v = validator();
        assert!(!v.is_safe("javascript:alert(1)"));
        assert!(!v.is_safe("file:///etc/passwd"));
        assert!(!v.is_safe("data:text/html,hi"));
        assert!(!v.is_safe("vbscript:x"));
    }

    #[test]
    fn test_absolute_urls_need_whitelist() {
        let v = validator();
        assert!(v.is_safe("https://portal.example.com/welcome"));
        assert!(v.is_safe("http://PORTAL.EXAMPLE.COM/welcome"));
        assert!(!v.is_safe("https://evil.example/welcome"));
    }

    #[test]
    fn test_empty_whitelist_blocks_all_absolute() {
        let v = RedirectValidator::new(vec![]);
        assert!(!v.is_safe("https://anything.example/"));
        assert!(v.is_safe("/still/fine"));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let v = validator();
        let (first, _) = v.resolve(Some("//evil.example/x"), "/guest/welcome");
        let (second, ok) = v.resolve(Some(first), "/guest/welcome");
        assert_eq!(first, second);
        assert!(ok);
    }
}
