use axum::http::HeaderValue;
use subtle::ConstantTimeEq;

const EXTENSION_SCHEMES: &[&str] = &["chrome-extension://", "moz-extension://"];
const LOOPBACK_NAMES: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// Who may talk to the daemon: loopback hosts, loopback or extension
/// origins, and, when a key is configured, only callers presenting it.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    api_key: Option<String>,
    extension_id: Option<String>,
}

impl AccessPolicy {
    pub fn new(api_key: Option<String>, extension_id: Option<String>) -> Self {
        Self {
            api_key: api_key.filter(|key| !key.is_empty()),
            extension_id: extension_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty()),
        }
    }

    pub fn requires_key(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn authorized(&self, provided: Option<&HeaderValue>) -> bool {
        let Some(expected) = &self.api_key else {
            return true;
        };
        let Some(provided) = provided else {
            return false;
        };
        provided.as_bytes().ct_eq(expected.as_bytes()).into()
    }

    /// A missing Host header is tolerated; anything else must name loopback.
    pub fn host_allowed(&self, host: Option<&str>) -> bool {
        match host.map(str::trim) {
            None | Some("") => true,
            Some(host) => is_loopback_name(strip_port(host)),
        }
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        for scheme in EXTENSION_SCHEMES {
            if let Some(id) = origin.strip_prefix(scheme) {
                let id = id.trim_end_matches('/');
                if !valid_extension_id(id) {
                    return false;
                }
                return self
                    .extension_id
                    .as_deref()
                    .map_or(true, |expected| expected == id);
            }
        }
        match reqwest::Url::parse(origin) {
            Ok(url) => url.host_str().map_or(false, |host| {
                is_loopback_name(host.trim_start_matches('[').trim_end_matches(']'))
            }),
            Err(_) => false,
        }
    }
}

fn valid_extension_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn is_loopback_name(name: &str) -> bool {
    LOOPBACK_NAMES
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(name))
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_disables_auth() {
        let open = AccessPolicy::new(Some(String::new()), None);
        assert!(!open.requires_key());
        assert!(open.authorized(None));
    }

    #[test]
    fn key_must_match_exactly() {
        let policy = AccessPolicy::new(Some("s3cret".into()), None);
        assert!(policy.authorized(Some(&HeaderValue::from_static("s3cret"))));
        assert!(!policy.authorized(Some(&HeaderValue::from_static("s3cre"))));
        assert!(!policy.authorized(Some(&HeaderValue::from_static("s3cret!"))));
        assert!(!policy.authorized(None));
    }

    #[test]
    fn host_must_be_loopback() {
        let policy = AccessPolicy::default();
        for host in ["127.0.0.1:7890", "localhost", "LOCALHOST:1", "[::1]:7890", "::1"] {
            assert!(policy.host_allowed(Some(host)), "{host}");
        }
        for host in ["evil.test", "evil.test:7890", "127.0.0.1.evil.test", "10.0.0.2:7890"] {
            assert!(!policy.host_allowed(Some(host)), "{host}");
        }
        assert!(policy.host_allowed(None));
    }

    #[test]
    fn origins_are_loopback_or_extension() {
        let policy = AccessPolicy::default();
        assert!(policy.origin_allowed("http://localhost:3000"));
        assert!(policy.origin_allowed("http://127.0.0.1:8080"));
        assert!(policy.origin_allowed("http://[::1]:5173"));
        assert!(policy.origin_allowed("chrome-extension://abcdefghijklmnop"));
        assert!(policy.origin_allowed("moz-extension://4b1e6a2c-1111-2222-3333-444455556666"));
        assert!(!policy.origin_allowed("https://evil.test"));
        assert!(!policy.origin_allowed("chrome-extension://Bad.ID"));
        assert!(!policy.origin_allowed("null"));
    }

    #[test]
    fn pinned_extension_id_is_enforced() {
        let policy = AccessPolicy::new(None, Some("abcdefghijklmnop".into()));
        assert!(policy.origin_allowed("chrome-extension://abcdefghijklmnop"));
        assert!(!policy.origin_allowed("chrome-extension://ponmlkjihgfedcba"));
    }
}
