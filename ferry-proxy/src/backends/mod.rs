//! Backend protocol adapters.
//!
//! Each adapter drives its wire protocol through a leased connection
//! (or a child process) and surfaces exactly one of response/error.

pub mod ajp;
pub mod cgi;
pub mod fcgi;
pub mod http;
pub mod lhttp;
pub mod was;

use ferry_http::server::Tunnel;
use ferry_http::ResponseBody;
use http_crate::{HeaderMap, StatusCode};

use ::http as http_crate;

/// What a backend adapter hands back to the orchestrator.
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// The concrete upstream address used, for failure bookkeeping.
    pub addr: Option<String>,
    /// A freshly generated sticky node cookie to set on the response.
    pub new_lb_cookie: Option<u32>,
    /// Present when the upstream accepted a protocol upgrade.
    pub tunnel: Option<Box<dyn Tunnel>>,
}

impl BackendResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        BackendResponse {
            status,
            headers,
            body,
            addr: None,
            new_lb_cookie: None,
            tunnel: None,
        }
    }
}

/// Parse a CGI-style response head (used by CGI, FastCGI, and WAS
/// adapters): headers terminated by a blank line, with an optional
/// `Status:` pseudo-header.
pub(crate) fn parse_cgi_response(
    raw: bytes::Bytes,
) -> Result<(StatusCode, HeaderMap, bytes::Bytes), ferry_core::FerryError> {
    use ferry_core::FerryError;
    use ferry_core::error::UpstreamErrorKind;

    let header_end = raw
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|i| (i, 2))
        .into_iter()
        .chain(
            raw.windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|i| (i, 4)),
        )
        .min_by_key(|(i, _)| *i);

    let Some((end, sep_len)) = header_end else {
        return Err(FerryError::upstream(
            UpstreamErrorKind::Garbage,
            "missing header terminator in script response",
        ));
    };

    let head = &raw[..end];
    let body = raw.slice(end + sep_len..);

    let mut status = StatusCode::OK;
    let mut headers = HeaderMap::new();

    for line in head.split(|&b| b == b'\n') {
        let line = if line.ends_with(b"\r") {
            &line[..line.len() - 1]
        } else {
            line
        };
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(FerryError::upstream(
                UpstreamErrorKind::Garbage,
                "malformed script response header",
            ));
        };
        let name = std::str::from_utf8(&line[..colon])
            .map_err(|_| {
                FerryError::upstream(UpstreamErrorKind::Garbage, "invalid header name")
            })?
            .trim()
            .to_ascii_lowercase();
        let value = &line[colon + 1..];
        let value = std::str::from_utf8(value)
            .map_err(|_| {
                FerryError::upstream(UpstreamErrorKind::Garbage, "invalid header value")
            })?
            .trim();

        if name == "status" {
            let code = value
                .split(' ')
                .next()
                .and_then(|s| s.parse::<u16>().ok())
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| {
                    FerryError::upstream(UpstreamErrorKind::Garbage, "invalid Status header")
                })?;
            status = code;
            continue;
        }

        let (Ok(name), Ok(value)) = (
            http_crate::HeaderName::from_bytes(name.as_bytes()),
            http_crate::HeaderValue::from_str(value),
        ) else {
            return Err(FerryError::upstream(
                UpstreamErrorKind::Garbage,
                "invalid script response header",
            ));
        };
        headers.append(name, value);
    }

    Ok((status, headers, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn parse_cgi_response_basic() {
        let raw = Bytes::from_static(b"Content-Type: text/html\r\nX-Extra: 1\r\n\r\n<html/>");
        let (status, headers, body) = parse_cgi_response(raw).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get("content-type").unwrap().to_str().unwrap(),
            "text/html"
        );
        assert_eq!(&body[..], b"<html/>");
    }

    #[test]
    fn parse_cgi_response_status_header() {
        let raw = Bytes::from_static(b"Status: 404 Not Found\nContent-Type: text/plain\n\ngone");
        let (status, headers, body) = parse_cgi_response(raw).unwrap();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(!headers.contains_key("status"));
        assert_eq!(&body[..], b"gone");
    }

    #[test]
    fn parse_cgi_response_lf_only() {
        let raw = Bytes::from_static(b"Content-Type: text/plain\n\nbody");
        let (_, headers, body) = parse_cgi_response(raw).unwrap();
        assert!(headers.contains_key("content-type"));
        assert_eq!(&body[..], b"body");
    }

    #[test]
    fn parse_cgi_response_missing_terminator() {
        let raw = Bytes::from_static(b"Content-Type: text/plain");
        assert!(parse_cgi_response(raw).is_err());
    }

    #[test]
    fn parse_cgi_response_malformed_header() {
        let raw = Bytes::from_static(b"not a header\n\nbody");
        assert!(parse_cgi_response(raw).is_err());
    }
}
