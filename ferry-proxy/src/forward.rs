//! Which headers are forwarded to and from upstream servers.

use ferry_http::util::is_hop_by_hop;
use ferry_session::cookie_exclude;
use ferry_translation::{ForwardMode, HeaderForwardSettings, HeaderGroup};
use http::{HeaderMap, HeaderName, HeaderValue};

const BASIC_REQUEST_HEADERS: &[&str] = &["accept", "from", "cache-control"];

const LANGUAGE_REQUEST_HEADERS: &[&str] = &["accept-language"];

const BODY_REQUEST_HEADERS: &[&str] = &[
    "content-encoding",
    "content-language",
    "content-md5",
    "content-range",
    "content-type",
    "content-disposition",
];

const COOKIE_REQUEST_HEADERS: &[&str] = &["cookie", "cookie2"];

const CACHE_REQUEST_HEADERS: &[&str] = &[
    "if-modified-since",
    "if-unmodified-since",
    "if-match",
    "if-none-match",
    "if-range",
];

const CORS_REQUEST_HEADERS: &[&str] = &[
    "origin",
    "access-control-request-method",
    "access-control-request-headers",
];

const SSL_HEADERS: &[&str] = &[
    "x-ferry-peer-subject",
    "x-ferry-peer-issuer-subject",
];

const EXCLUDE_REQUEST_HEADERS: &[&str] = &[
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "user-agent",
    "via",
    "x-forwarded-for",
    "host",
];

const BASIC_RESPONSE_HEADERS: &[&str] = &[
    "age",
    "allow",
    "etag",
    "cache-control",
    "expires",
    "content-encoding",
    "content-language",
    "content-md5",
    "content-range",
    "accept-ranges",
    "content-type",
    "content-disposition",
    "last-modified",
    "retry-after",
    "vary",
];

const COOKIE_RESPONSE_HEADERS: &[&str] = &["set-cookie", "set-cookie2"];

const CORS_RESPONSE_HEADERS: &[&str] = &[
    "access-control-allow-origin",
    "access-control-allow-credentials",
    "access-control-expose-headers",
    "access-control-max-age",
    "access-control-allow-methods",
    "access-control-allow-headers",
];

const EXCLUDE_RESPONSE_HEADERS: &[&str] = &["server", "via", "date"];

const UPGRADE_HEADERS: &[&str] = &[
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-protocol",
    "sec-websocket-extensions",
    "sec-websocket-accept",
];

fn in_list(list: &[&str], name: &str) -> bool {
    list.contains(&name)
}

fn is_ssl_header(name: &str) -> bool {
    in_list(SSL_HEADERS, name)
}

fn is_secure_header(name: &str) -> bool {
    name.starts_with("x-ferry-") && !is_ssl_header(name)
}

fn is_secure_or_ssl_header(name: &str) -> bool {
    name.starts_with("x-ferry-")
}

fn is_transformation_header(name: &str) -> bool {
    name.starts_with("x-ferry-view")
}

fn copy_one(src: &HeaderMap, dest: &mut HeaderMap, name: &str) {
    let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
        return;
    };
    for value in src.get_all(&header) {
        dest.append(header.clone(), value.clone());
    }
}

fn copy_list(src: &HeaderMap, dest: &mut HeaderMap, names: &[&str]) {
    for name in names {
        copy_one(src, dest, name);
    }
}

fn add(dest: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        dest.append(name, value);
    }
}

/// Session state relevant to header forwarding, extracted under the
/// session lease before the (async) forwarding call.
#[derive(Debug, Default, Clone)]
pub struct SessionForward {
    pub language: Option<String>,
    pub user: Option<String>,
    /// Pre-rendered cookie jar header for (host, uri), used by
    /// COOKIE=MANGLE.
    pub jar_cookie_header: Option<String>,
}

/// Context for one request-forwarding pass.
pub struct RequestForwardContext<'a> {
    /// Our own host:port, appended to Via on MANGLE.
    pub local_host: Option<&'a str>,
    /// The client address, appended to X-Forwarded-For on MANGLE.
    pub remote_host: Option<&'a str>,
    /// Drop the Host header (CGI-style backends synthesise their own).
    pub exclude_host: bool,
    pub with_body: bool,
    pub is_upgrade: bool,
    pub forward_charset: bool,
    pub forward_encoding: bool,
    pub forward_range: bool,
    /// The session cookie name to strip from forwarded Cookie headers.
    pub session_cookie: Option<&'a str>,
    pub session: Option<&'a SessionForward>,
    /// Our product token, substituted for User-Agent on MANGLE.
    pub product_token: &'a str,
}

/// Compose the outbound request header set.
pub fn forward_request_headers(
    src: &HeaderMap,
    settings: &HeaderForwardSettings,
    ctx: &RequestForwardContext<'_>,
) -> HeaderMap {
    let mut dest = HeaderMap::new();

    copy_list(src, &mut dest, BASIC_REQUEST_HEADERS);
    if ctx.with_body {
        copy_list(src, &mut dest, BODY_REQUEST_HEADERS);
    }
    if ctx.is_upgrade {
        copy_list(src, &mut dest, UPGRADE_HEADERS);
    }

    if !ctx.exclude_host {
        copy_one(src, &mut dest, "host");
    }

    if settings.get(HeaderGroup::Cors) == ForwardMode::Yes {
        copy_list(src, &mut dest, CORS_REQUEST_HEADERS);
    }

    if settings.get(HeaderGroup::Secure) == ForwardMode::Yes {
        for (name, value) in src.iter() {
            if is_secure_header(name.as_str()) {
                dest.append(name.clone(), value.clone());
            }
        }
    }

    if settings.get(HeaderGroup::Ssl) == ForwardMode::Yes {
        for (name, value) in src.iter() {
            if is_ssl_header(name.as_str()) {
                dest.append(name.clone(), value.clone());
            }
        }
    }

    if settings.get(HeaderGroup::Link) == ForwardMode::Yes {
        copy_one(src, &mut dest, "referer");
    }

    if settings.get(HeaderGroup::Other) == ForwardMode::Yes {
        for (name, value) in src.iter() {
            let n = name.as_str();
            if !in_list(BASIC_REQUEST_HEADERS, n)
                && !in_list(BODY_REQUEST_HEADERS, n)
                && !in_list(LANGUAGE_REQUEST_HEADERS, n)
                && !in_list(COOKIE_REQUEST_HEADERS, n)
                && !in_list(CORS_REQUEST_HEADERS, n)
                && !in_list(CACHE_REQUEST_HEADERS, n)
                && !in_list(EXCLUDE_REQUEST_HEADERS, n)
                && !is_secure_or_ssl_header(n)
                && n != "referer"
                && n != "range"
                && n != "expect"
                && !is_hop_by_hop(n)
            {
                dest.append(name.clone(), value.clone());
            }
        }
    }

    let charset = if ctx.forward_charset {
        src.get("accept-charset").and_then(|v| v.to_str().ok())
    } else {
        None
    };
    add(&mut dest, "accept-charset", charset.unwrap_or("utf-8"));

    if ctx.forward_encoding {
        copy_one(src, &mut dest, "accept-encoding");
    }

    if ctx.forward_range {
        copy_one(src, &mut dest, "range");
        copy_list(src, &mut dest, CACHE_REQUEST_HEADERS);
    }

    // cookies
    match settings.get(HeaderGroup::Cookie) {
        ForwardMode::Yes => copy_list(src, &mut dest, COOKIE_REQUEST_HEADERS),
        ForwardMode::Both => match ctx.session_cookie {
            None => copy_list(src, &mut dest, COOKIE_REQUEST_HEADERS),
            Some(session_cookie) => {
                copy_one(src, &mut dest, "cookie2");
                for value in src.get_all("cookie") {
                    if let Ok(v) = value.to_str() {
                        if let Some(rest) = cookie_exclude(v, session_cookie) {
                            add(&mut dest, "cookie", &rest);
                        }
                    }
                }
            }
        },
        ForwardMode::Mangle => {
            if let Some(session) = ctx.session {
                if let Some(jar) = &session.jar_cookie_header {
                    add(&mut dest, "cookie", jar);
                }
            }
        }
        ForwardMode::No => {}
    }

    // language: the session override wins
    match ctx.session.and_then(|s| s.language.as_deref()) {
        Some(language) => add(&mut dest, "accept-language", language),
        None => copy_list(src, &mut dest, LANGUAGE_REQUEST_HEADERS),
    }

    if let Some(user) = ctx.session.and_then(|s| s.user.as_deref()) {
        add(&mut dest, "x-ferry-user", user);
    }

    if settings.get(HeaderGroup::Capabilities) != ForwardMode::No {
        let mangle = settings.get(HeaderGroup::Capabilities) == ForwardMode::Mangle;
        let ua = if mangle {
            None
        } else {
            src.get("user-agent").and_then(|v| v.to_str().ok())
        };
        add(&mut dest, "user-agent", ua.unwrap_or(ctx.product_token));
    }

    if settings.get(HeaderGroup::Identity) != ForwardMode::No {
        let mangle = settings.get(HeaderGroup::Identity) == ForwardMode::Mangle;
        forward_via(src, &mut dest, ctx.local_host, mangle);
        forward_xff(src, &mut dest, ctx.remote_host, mangle);
    }

    dest
}

fn forward_via(src: &HeaderMap, dest: &mut HeaderMap, local_host: Option<&str>, mangle: bool) {
    let existing = src.get("via").and_then(|v| v.to_str().ok());
    match (existing, local_host, mangle) {
        (None, Some(local), true) => add(dest, "via", &format!("1.1 {}", local)),
        (None, _, _) => {}
        (Some(via), Some(local), true) => add(dest, "via", &format!("{}, 1.1 {}", via, local)),
        (Some(via), _, _) => add(dest, "via", via),
    }
}

fn forward_xff(src: &HeaderMap, dest: &mut HeaderMap, remote_host: Option<&str>, mangle: bool) {
    let existing = src.get("x-forwarded-for").and_then(|v| v.to_str().ok());
    match (existing, remote_host, mangle) {
        (None, Some(remote), true) => add(dest, "x-forwarded-for", remote),
        (None, _, _) => {}
        (Some(xff), Some(remote), true) => {
            add(dest, "x-forwarded-for", &format!("{}, {}", xff, remote))
        }
        (Some(xff), _, _) => add(dest, "x-forwarded-for", xff),
    }
}

fn set_cookie_names_match(set_cookie: &str, name: &str) -> bool {
    match set_cookie.strip_prefix(name) {
        Some(rest) => !rest
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false),
        None => false,
    }
}

/// Compose the inbound (to-client) response header set.
/// `relocate` rewrites Location values under LINK=MANGLE.
pub fn forward_response_headers(
    status: http::StatusCode,
    src: &HeaderMap,
    settings: &HeaderForwardSettings,
    local_host: Option<&str>,
    session_cookie: Option<&str>,
    relocate: impl Fn(&str) -> Option<String>,
) -> HeaderMap {
    let mut dest = HeaderMap::new();

    copy_list(src, &mut dest, BASIC_RESPONSE_HEADERS);
    // the server engine recomputes body framing, but HEAD responses
    // must pass the upstream Content-Length (RFC 2616 14.13)
    copy_one(src, &mut dest, "content-length");

    // Location
    match settings.get(HeaderGroup::Link) {
        ForwardMode::Yes => copy_one(src, &mut dest, "location"),
        ForwardMode::Mangle => {
            if let Some(location) = src.get("location").and_then(|v| v.to_str().ok()) {
                let rewritten = relocate(location);
                add(
                    &mut dest,
                    "location",
                    rewritten.as_deref().unwrap_or(location),
                );
            }
        }
        _ => {}
    }

    if status == http::StatusCode::SWITCHING_PROTOCOLS {
        copy_list(src, &mut dest, UPGRADE_HEADERS);
    }

    if settings.get(HeaderGroup::Other) == ForwardMode::Yes {
        for (name, value) in src.iter() {
            let n = name.as_str();
            if !in_list(BASIC_RESPONSE_HEADERS, n)
                && !in_list(COOKIE_RESPONSE_HEADERS, n)
                && !in_list(CORS_RESPONSE_HEADERS, n)
                && !in_list(EXCLUDE_RESPONSE_HEADERS, n)
                && n != "location"
                && !is_secure_or_ssl_header(n)
                && !is_transformation_header(n)
                && !is_hop_by_hop(n)
            {
                dest.append(name.clone(), value.clone());
            }
        }
    }

    match settings.get(HeaderGroup::Cookie) {
        ForwardMode::Yes => copy_list(src, &mut dest, COOKIE_RESPONSE_HEADERS),
        // MANGLE has already stored the cookies into the session jar;
        // in both modes, only cookies with a different name than the
        // session cookie reach the client
        ForwardMode::Both | ForwardMode::Mangle => match session_cookie {
            None => copy_list(src, &mut dest, COOKIE_RESPONSE_HEADERS),
            Some(session_cookie) => {
                for header in COOKIE_RESPONSE_HEADERS {
                    for value in src.get_all(*header) {
                        if let Ok(v) = value.to_str() {
                            if !set_cookie_names_match(v, session_cookie) {
                                add(&mut dest, header, v);
                            }
                        }
                    }
                }
            }
        },
        ForwardMode::No => {}
    }

    if settings.get(HeaderGroup::Cors) == ForwardMode::Yes {
        copy_list(src, &mut dest, CORS_RESPONSE_HEADERS);
    }

    if settings.get(HeaderGroup::Secure) == ForwardMode::Yes {
        for (name, value) in src.iter() {
            if is_secure_header(name.as_str()) {
                dest.append(name.clone(), value.clone());
            }
        }
    }

    // RFC 2616 3.8: only pass the upstream product token when allowed
    if settings.get(HeaderGroup::Capabilities) == ForwardMode::Yes {
        copy_one(src, &mut dest, "server");
    }

    if settings.get(HeaderGroup::Identity) != ForwardMode::No {
        forward_via(
            src,
            &mut dest,
            local_host,
            settings.get(HeaderGroup::Identity) == ForwardMode::Mangle,
        );
    }

    if settings.get(HeaderGroup::Transformation) == ForwardMode::Yes {
        copy_one(src, &mut dest, "x-ferry-view");
    }

    dest
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    fn ctx<'a>() -> RequestForwardContext<'a> {
        RequestForwardContext {
            local_host: Some("proxy.internal:80"),
            remote_host: Some("192.0.2.7"),
            exclude_host: false,
            with_body: false,
            is_upgrade: false,
            forward_charset: false,
            forward_encoding: false,
            forward_range: false,
            session_cookie: None,
            session: None,
            product_token: "ferry/0.1",
        }
    }

    // ── request direction ────────────────────────────────────────

    #[test]
    fn hop_by_hop_never_forwarded() {
        let src = headers(&[
            ("connection", "keep-alive"),
            ("transfer-encoding", "chunked"),
            ("te", "trailers"),
            ("x-app", "1"),
        ]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Other, ForwardMode::Yes);
        let out = forward_request_headers(&src, &settings, &ctx());
        assert!(!out.contains_key("connection"));
        assert!(!out.contains_key("transfer-encoding"));
        assert!(!out.contains_key("te"));
        assert!(out.contains_key("x-app"));
    }

    #[test]
    fn identity_mangle_appends_via_and_xff() {
        let src = headers(&[
            ("via", "1.0 edge"),
            ("x-forwarded-for", "10.0.0.1"),
        ]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Identity, ForwardMode::Mangle);
        let out = forward_request_headers(&src, &settings, &ctx());
        assert_eq!(
            out.get("via").unwrap().to_str().unwrap(),
            "1.0 edge, 1.1 proxy.internal:80"
        );
        assert_eq!(
            out.get("x-forwarded-for").unwrap().to_str().unwrap(),
            "10.0.0.1, 192.0.2.7"
        );
    }

    #[test]
    fn identity_mangle_creates_missing_headers() {
        let src = headers(&[]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Identity, ForwardMode::Mangle);
        let out = forward_request_headers(&src, &settings, &ctx());
        assert_eq!(
            out.get("via").unwrap().to_str().unwrap(),
            "1.1 proxy.internal:80"
        );
        assert_eq!(
            out.get("x-forwarded-for").unwrap().to_str().unwrap(),
            "192.0.2.7"
        );
    }

    #[test]
    fn identity_yes_passes_existing_only() {
        let src = headers(&[("via", "1.0 edge")]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Identity, ForwardMode::Yes);
        let out = forward_request_headers(&src, &settings, &ctx());
        assert_eq!(out.get("via").unwrap().to_str().unwrap(), "1.0 edge");
        assert!(!out.contains_key("x-forwarded-for"));
    }

    #[test]
    fn capabilities_mangle_replaces_user_agent() {
        let src = headers(&[("user-agent", "curl/8")]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Capabilities, ForwardMode::Mangle);
        let out = forward_request_headers(&src, &settings, &ctx());
        assert_eq!(out.get("user-agent").unwrap().to_str().unwrap(), "ferry/0.1");

        settings.set(HeaderGroup::Capabilities, ForwardMode::Yes);
        let out = forward_request_headers(&src, &settings, &ctx());
        assert_eq!(out.get("user-agent").unwrap().to_str().unwrap(), "curl/8");
    }

    #[test]
    fn cookie_both_strips_session_cookie() {
        let src = headers(&[("cookie", "a=1; ferry_session=deadbeef; b=2")]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Cookie, ForwardMode::Both);
        let mut c = ctx();
        c.session_cookie = Some("ferry_session");
        let out = forward_request_headers(&src, &settings, &c);
        assert_eq!(
            out.get("cookie").unwrap().to_str().unwrap(),
            "a=1; b=2"
        );
    }

    #[test]
    fn cookie_mangle_uses_jar() {
        let src = headers(&[("cookie", "client=1")]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Cookie, ForwardMode::Mangle);
        let session = SessionForward {
            jar_cookie_header: Some("upstream=xyz".into()),
            ..Default::default()
        };
        let mut c = ctx();
        c.session = Some(&session);
        let out = forward_request_headers(&src, &settings, &c);
        // the client's own cookies are not forwarded; the jar's are
        assert_eq!(out.get("cookie").unwrap().to_str().unwrap(), "upstream=xyz");
    }

    #[test]
    fn session_language_overrides_accept_language() {
        let src = headers(&[("accept-language", "en")]);
        let settings = HeaderForwardSettings::default();
        let session = SessionForward {
            language: Some("de".into()),
            ..Default::default()
        };
        let mut c = ctx();
        c.session = Some(&session);
        let out = forward_request_headers(&src, &settings, &c);
        assert_eq!(out.get("accept-language").unwrap().to_str().unwrap(), "de");
    }

    #[test]
    fn session_user_adds_secure_header() {
        let src = headers(&[]);
        let settings = HeaderForwardSettings::default();
        let session = SessionForward {
            user: Some("alice".into()),
            ..Default::default()
        };
        let mut c = ctx();
        c.session = Some(&session);
        let out = forward_request_headers(&src, &settings, &c);
        assert_eq!(out.get("x-ferry-user").unwrap().to_str().unwrap(), "alice");
    }

    #[test]
    fn secure_group_forwards_only_internal_headers() {
        let src = headers(&[
            ("x-ferry-widget", "w"),
            ("x-ferry-peer-subject", "CN=x"),
            ("x-other", "1"),
        ]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Secure, ForwardMode::Yes);
        let out = forward_request_headers(&src, &settings, &ctx());
        assert!(out.contains_key("x-ferry-widget"));
        // SSL peer headers are a separate group
        assert!(!out.contains_key("x-ferry-peer-subject"));
        assert!(!out.contains_key("x-other"));
    }

    #[test]
    fn accept_charset_defaults_to_utf8() {
        let src = headers(&[("accept-charset", "latin1")]);
        let settings = HeaderForwardSettings::default();
        let out = forward_request_headers(&src, &settings, &ctx());
        assert_eq!(out.get("accept-charset").unwrap().to_str().unwrap(), "utf-8");

        let mut c = ctx();
        c.forward_charset = true;
        let out = forward_request_headers(&src, &settings, &c);
        assert_eq!(out.get("accept-charset").unwrap().to_str().unwrap(), "latin1");
    }

    #[test]
    fn exclude_host_drops_host() {
        let src = headers(&[("host", "example.com")]);
        let settings = HeaderForwardSettings::default();
        let out = forward_request_headers(&src, &settings, &ctx());
        assert!(out.contains_key("host"));

        let mut c = ctx();
        c.exclude_host = true;
        let out = forward_request_headers(&src, &settings, &c);
        assert!(!out.contains_key("host"));
    }

    // ── response direction ───────────────────────────────────────

    #[test]
    fn response_basics_always_forwarded() {
        let src = headers(&[
            ("content-type", "text/html"),
            ("etag", "\"x\""),
            ("connection", "close"),
        ]);
        let settings = HeaderForwardSettings::default();
        let out = forward_response_headers(
            StatusCode::OK,
            &src,
            &settings,
            None,
            None,
            |_| None,
        );
        assert!(out.contains_key("content-type"));
        assert!(out.contains_key("etag"));
        assert!(!out.contains_key("connection"));
    }

    #[test]
    fn location_mangle_relocates() {
        let src = headers(&[("location", "http://internal/int/x")]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Link, ForwardMode::Mangle);
        let out = forward_response_headers(
            StatusCode::FOUND,
            &src,
            &settings,
            None,
            None,
            |loc| Some(format!("https://external/ext/x?was={}", loc.len())),
        );
        assert!(
            out.get("location")
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("https://external/ext/x")
        );
    }

    #[test]
    fn location_mangle_keeps_unrelocatable() {
        let src = headers(&[("location", "http://other/x")]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Link, ForwardMode::Mangle);
        let out =
            forward_response_headers(StatusCode::FOUND, &src, &settings, None, None, |_| None);
        assert_eq!(
            out.get("location").unwrap().to_str().unwrap(),
            "http://other/x"
        );
    }

    #[test]
    fn set_cookie_both_excludes_session_cookie() {
        let src = headers(&[
            ("set-cookie", "ferry_session=abc; Path=/"),
            ("set-cookie", "app=1; Path=/"),
        ]);
        let mut settings = HeaderForwardSettings::default();
        settings.set(HeaderGroup::Cookie, ForwardMode::Both);
        let out = forward_response_headers(
            StatusCode::OK,
            &src,
            &settings,
            None,
            Some("ferry_session"),
            |_| None,
        );
        let values: Vec<_> = out
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values, vec!["app=1; Path=/".to_string()]);
    }

    #[test]
    fn server_header_passes_only_with_capabilities_yes() {
        let src = headers(&[("server", "nginx")]);
        let mut settings = HeaderForwardSettings::default();
        let out =
            forward_response_headers(StatusCode::OK, &src, &settings, None, None, |_| None);
        assert!(!out.contains_key("server"));

        settings.set(HeaderGroup::Capabilities, ForwardMode::Yes);
        let out =
            forward_response_headers(StatusCode::OK, &src, &settings, None, None, |_| None);
        assert_eq!(out.get("server").unwrap().to_str().unwrap(), "nginx");
    }

    #[test]
    fn transformation_header_gated() {
        let src = headers(&[("x-ferry-view", "raw")]);
        let mut settings = HeaderForwardSettings::default();
        let out =
            forward_response_headers(StatusCode::OK, &src, &settings, None, None, |_| None);
        assert!(!out.contains_key("x-ferry-view"));

        settings.set(HeaderGroup::Transformation, ForwardMode::Yes);
        let out =
            forward_response_headers(StatusCode::OK, &src, &settings, None, None, |_| None);
        assert!(out.contains_key("x-ferry-view"));
    }

    #[test]
    fn set_cookie_name_prefix_comparison() {
        assert!(set_cookie_names_match("sid=1", "sid"));
        assert!(set_cookie_names_match("sid =1", "sid"));
        // "sid2" is a different cookie
        assert!(!set_cookie_names_match("sid2=1", "sid"));
        assert!(!set_cookie_names_match("other=1", "sid"));
    }
}
