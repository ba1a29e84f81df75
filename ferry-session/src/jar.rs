//! Per-session cookie jar for mangled upstream cookies.

use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<SystemTime>,
    pub secure: bool,
}

/// Cookies are keyed by (name, domain, path); stale entries are
/// evicted on access.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: Vec<Cookie>,
}

/// Does the request host match the cookie domain (exact or parent
/// domain)?
fn domain_matches(host: &str, domain: &str) -> bool {
    // strip a port from the request host
    let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
    let domain = domain.strip_prefix('.').unwrap_or(domain);
    host.eq_ignore_ascii_case(domain)
        || (host.len() > domain.len()
            && host[..host.len() - domain.len()].ends_with('.')
            && host[host.len() - domain.len()..].eq_ignore_ascii_case(domain))
}

fn path_matches(uri: &str, cookie_path: &str) -> bool {
    uri.starts_with(cookie_path)
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    fn purge_expired(&mut self) {
        let now = SystemTime::now();
        self.cookies
            .retain(|c| c.expires.map(|e| e > now).unwrap_or(true));
    }

    /// Store a cookie from a Set-Cookie(2) header value.  `host` and
    /// `request_path` supply the defaults for missing attributes.
    pub fn set_cookie(&mut self, header: &str, host: &str, request_path: &str) {
        self.purge_expired();

        let mut parts = header.split(';');
        let Some(nv) = parts.next() else { return };
        let Some(eq) = nv.find('=') else { return };
        let name = nv[..eq].trim().to_string();
        let mut value = nv[eq + 1..].trim();
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            value = &value[1..value.len() - 1];
        }
        if name.is_empty() {
            return;
        }

        let mut domain = host.to_string();
        let mut path = default_path(request_path);
        let mut expires = None;
        let mut secure = false;
        let mut max_age: Option<i64> = None;

        for attr in parts {
            let attr = attr.trim();
            let (key, val) = match attr.find('=') {
                Some(i) => (&attr[..i], attr[i + 1..].trim_matches('"')),
                None => (attr, ""),
            };
            if key.eq_ignore_ascii_case("domain") && !val.is_empty() {
                // only accept domains the host belongs to
                if domain_matches(host, val) {
                    domain = val.to_string();
                }
            } else if key.eq_ignore_ascii_case("path") && !val.is_empty() {
                path = val.to_string();
            } else if key.eq_ignore_ascii_case("max-age") {
                max_age = val.parse().ok();
            } else if key.eq_ignore_ascii_case("secure") {
                secure = true;
            }
        }

        if let Some(seconds) = max_age {
            if seconds <= 0 {
                // immediate deletion
                self.cookies
                    .retain(|c| !(c.name == name && c.domain == domain && c.path == path));
                return;
            }
            expires = Some(SystemTime::now() + Duration::from_secs(seconds as u64));
        }

        let cookie = Cookie {
            name,
            value: value.to_string(),
            domain,
            path,
            expires,
            secure,
        };

        // replace an existing (name, domain, path) entry
        self.cookies.retain(|c| {
            !(c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path)
        });
        self.cookies.push(cookie);
    }

    /// The Cookie header value for a request, or `None` when no cookie
    /// matches (host, uri).
    pub fn http_header_value(&mut self, host: &str, uri: &str) -> Option<String> {
        self.purge_expired();
        let mut matched: Vec<&Cookie> = self
            .cookies
            .iter()
            .filter(|c| domain_matches(host, &c.domain) && path_matches(uri, &c.path))
            .collect();
        if matched.is_empty() {
            return None;
        }
        // longest path first, like browsers do
        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matched
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Remove all cookies with the given name.
    pub fn exclude(&mut self, name: &str) {
        self.cookies.retain(|c| c.name != name);
    }
}

/// The default cookie path for a request path (RFC 6265 §5.1.4).
fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => request_path[..i].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_match() {
        let mut jar = CookieJar::new();
        jar.set_cookie("sid=abc; Path=/", "app.example.com", "/");
        assert_eq!(jar.len(), 1);
        assert_eq!(
            jar.http_header_value("app.example.com", "/page").as_deref(),
            Some("sid=abc")
        );
        // other hosts do not match
        assert_eq!(jar.http_header_value("other.com", "/page"), None);
    }

    #[test]
    fn domain_attribute_matching() {
        let mut jar = CookieJar::new();
        jar.set_cookie("sid=abc; Domain=example.com; Path=/", "app.example.com", "/");
        // subdomains of the cookie domain match
        assert!(jar.http_header_value("app.example.com", "/").is_some());
        assert!(jar.http_header_value("example.com", "/").is_some());
        assert!(jar.http_header_value("evil-example.com", "/").is_none());
    }

    #[test]
    fn foreign_domain_attribute_is_ignored() {
        let mut jar = CookieJar::new();
        jar.set_cookie("sid=abc; Domain=evil.com", "app.example.com", "/");
        // the cookie is stored for the request host instead
        assert!(jar.http_header_value("app.example.com", "/").is_some());
        assert!(jar.http_header_value("evil.com", "/").is_none());
    }

    #[test]
    fn path_prefix_matching() {
        let mut jar = CookieJar::new();
        jar.set_cookie("a=1; Path=/app", "h", "/app/x");
        assert!(jar.http_header_value("h", "/app/page").is_some());
        assert!(jar.http_header_value("h", "/other").is_none());
    }

    #[test]
    fn longest_path_first() {
        let mut jar = CookieJar::new();
        jar.set_cookie("outer=1; Path=/", "h", "/");
        jar.set_cookie("inner=2; Path=/app", "h", "/app/x");
        let value = jar.http_header_value("h", "/app/page").unwrap();
        assert_eq!(value, "inner=2; outer=1");
    }

    #[test]
    fn replace_same_key() {
        let mut jar = CookieJar::new();
        jar.set_cookie("sid=old; Path=/", "h", "/");
        jar.set_cookie("sid=new; Path=/", "h", "/");
        assert_eq!(jar.len(), 1);
        assert_eq!(jar.http_header_value("h", "/").as_deref(), Some("sid=new"));
    }

    #[test]
    fn max_age_zero_deletes() {
        let mut jar = CookieJar::new();
        jar.set_cookie("sid=abc; Path=/", "h", "/");
        jar.set_cookie("sid=abc; Path=/; Max-Age=0", "h", "/");
        assert!(jar.is_empty());
    }

    #[test]
    fn expired_cookie_is_purged_on_access() {
        let mut jar = CookieJar::new();
        jar.set_cookie("sid=abc; Path=/; Max-Age=1", "h", "/");
        // manually expire it
        jar.cookies[0].expires = Some(SystemTime::now() - Duration::from_secs(1));
        assert_eq!(jar.http_header_value("h", "/"), None);
        assert!(jar.is_empty());
    }

    #[test]
    fn exclude_by_name() {
        let mut jar = CookieJar::new();
        jar.set_cookie("keep=1; Path=/", "h", "/");
        jar.set_cookie("drop=2; Path=/", "h", "/");
        jar.exclude("drop");
        assert_eq!(jar.http_header_value("h", "/").as_deref(), Some("keep=1"));
    }

    #[test]
    fn default_path_from_request() {
        assert_eq!(default_path("/a/b/c"), "/a/b");
        assert_eq!(default_path("/x"), "/");
        assert_eq!(default_path("/"), "/");
    }
}
