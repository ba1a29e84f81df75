//! The response dispatch funnel: transformations, error documents,
//! auto-compression, session cookies, and the final header polish.

use crate::errdoc;
use crate::instance::Instance;
use crate::request::RequestContext;
use crate::resource_loader;
use crate::transform::{
    ProcessOptions, css_processable, html_processable, text_processable,
};
use bytes::Bytes;
use ferry_core::FerryError;
use ferry_core::relocate::relocate_uri;
use ferry_http::body::ResponseBody;
use ferry_http::server::HandlerResponse;
use ferry_http::util::accepts_encoding;
use ferry_pool::balancer::format_lb_cookie;
use ferry_translation::protocol::Command;
use ferry_translation::{Transformation, TranslateResponse};
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use http_crate::{HeaderMap, HeaderValue, StatusCode};
use std::io::Write;

use ::http as http_crate;

/// An in-flight response travelling down the funnel.
pub struct PendingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
}

impl PendingResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: ResponseBody) -> Self {
        PendingResponse {
            status,
            headers,
            body,
        }
    }

    pub fn message(status: StatusCode, msg: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            http_crate::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        PendingResponse {
            status,
            headers,
            body: ResponseBody::text(msg),
        }
    }

    pub fn redirect(status: StatusCode, location: &str, msg: Option<&str>) -> Self {
        let mut response = PendingResponse::message(status, msg.unwrap_or("redirection"));
        if let Ok(value) = HeaderValue::from_str(location) {
            response
                .headers
                .insert(http_crate::header::LOCATION, value);
        }
        response
    }

    fn content_type(&self) -> Option<String> {
        self.headers
            .get(http_crate::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

/// A status-derived compact message; the log detail is included only
/// with `verbose_response`.
pub fn error_message(instance: &Instance, status: StatusCode, log_msg: &str) -> PendingResponse {
    let msg = if instance.config.proxy.verbose_response {
        log_msg.to_string()
    } else {
        status
            .canonical_reason()
            .unwrap_or("Internal server error")
            .to_string()
    };
    PendingResponse::message(status, msg)
}

/// Convert an orchestration error into a response.
pub fn error_response(instance: &Instance, ctx: &RequestContext, e: &FerryError) -> PendingResponse {
    tracing::info!(uri = %ctx.raw_uri, error = %e, "request failed");
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_message(instance, status, &e.to_string())
}

/// Is a transformation applied at this status?
pub fn filter_enabled(tr: &TranslateResponse, filter_4xx: bool, status: StatusCode) -> bool {
    status.is_success() || (status.is_client_error() && (tr.filter_4xx || filter_4xx))
}

/// Apply the remaining transformation chain.
pub async fn apply_transformations(
    instance: &Instance,
    ctx: &mut RequestContext,
    mut response: PendingResponse,
) -> Result<PendingResponse, FerryError> {
    let cap = instance.config.proxy.filter_buffer_size;

    loop {
        let Some(tr) = ctx.translate_response.clone() else {
            return Ok(response);
        };
        if !filter_enabled(&tr, false, response.status) {
            return Ok(response);
        }
        let Some(transformation) = ctx.pop_transformation() else {
            return Ok(response);
        };
        ctx.transformed = true;

        match transformation {
            Transformation::Process { container } => {
                if !html_processable(response.content_type().as_deref()) {
                    response.body.discard().await;
                    return Ok(PendingResponse::message(
                        StatusCode::BAD_GATEWAY,
                        "Invalid template content type",
                    ));
                }
                let body = response.body.collect(cap).await?;
                let options = ProcessOptions { container };
                let processed = (instance.processors.html)(body, &options);
                response.headers.remove(http_crate::header::CONTENT_LENGTH);
                ctx.resource_tag = None;
                response.body = ResponseBody::from(processed);
            }
            Transformation::ProcessCss => {
                if !css_processable(response.content_type().as_deref()) {
                    response.body.discard().await;
                    return Ok(PendingResponse::message(
                        StatusCode::BAD_GATEWAY,
                        "Invalid template content type",
                    ));
                }
                let body = response.body.collect(cap).await?;
                let processed = (instance.processors.css)(body);
                response.headers.remove(http_crate::header::CONTENT_LENGTH);
                ctx.resource_tag = None;
                response.body = ResponseBody::from(processed);
            }
            Transformation::ProcessText => {
                if !text_processable(response.content_type().as_deref()) {
                    response.body.discard().await;
                    return Ok(PendingResponse::message(
                        StatusCode::BAD_GATEWAY,
                        "Invalid template content type",
                    ));
                }
                let body = response.body.collect(cap).await?;
                let processed = (instance.processors.text)(body);
                response.headers.remove(http_crate::header::CONTENT_LENGTH);
                ctx.resource_tag = None;
                response.body = ResponseBody::from(processed);
            }
            Transformation::Filter {
                address,
                reveal_user,
            } => {
                let content_type = response.content_type();
                let body = response.body.collect(cap).await?;

                let reveal = if reveal_user {
                    ctx.session_id.and_then(|id| {
                        instance
                            .sessions
                            .with_session(id, |s| s.valid_user().map(str::to_string))
                            .flatten()
                    })
                } else {
                    None
                };

                let sticky = ctx.session_id.map(|id| id.cluster_hash()).unwrap_or(0);
                let filtered = resource_loader::send_filter(
                    instance,
                    &address,
                    content_type.as_deref(),
                    body,
                    reveal.as_deref(),
                    sticky,
                )
                .await?;

                response = PendingResponse {
                    status: filtered.status,
                    headers: filtered.headers,
                    body: filtered.body,
                };
            }
        }
    }
}

/// Substitute the error document when one is declared.
pub async fn maybe_error_document(
    instance: &Instance,
    ctx: &mut RequestContext,
    response: PendingResponse,
) -> PendingResponse {
    if !errdoc::is_error_status(response.status) || ctx.transformed {
        return response;
    }
    let Some(error_document) = ctx
        .translate_response
        .as_ref()
        .and_then(|tr| tr.error_document.clone())
    else {
        return response;
    };
    ctx.transformed = true;
    errdoc::dispatch_response(instance, ctx, response, error_document).await
}

/// Compress a buffered body when the translation enabled it and the
/// client accepts the coding.
fn auto_compress(
    ctx: &RequestContext,
    tr: &TranslateResponse,
    response: &mut PendingResponse,
) {
    if !tr.auto_gzip && !tr.auto_deflate {
        return;
    }
    if response
        .headers
        .contains_key(http_crate::header::CONTENT_ENCODING)
    {
        return;
    }
    let ResponseBody::Bytes(body) = &response.body else {
        return;
    };
    if body.len() < 512 {
        return;
    }

    let accept = ctx.header("accept-encoding");
    let use_gzip = tr.auto_gzip && accepts_encoding(accept, "gzip");
    let use_deflate = !use_gzip && tr.auto_deflate && accepts_encoding(accept, "deflate");

    let compressed = if use_gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        if encoder.write_all(body).is_err() {
            return;
        }
        match encoder.finish() {
            Ok(out) => out,
            Err(_) => return,
        }
    } else if use_deflate {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
        if encoder.write_all(body).is_err() {
            return;
        }
        match encoder.finish() {
            Ok(out) => out,
            Err(_) => return,
        }
    } else {
        return;
    };

    response.headers.insert(
        http_crate::header::CONTENT_ENCODING,
        HeaderValue::from_static(if use_gzip { "gzip" } else { "deflate" }),
    );
    response.headers.remove(http_crate::header::CONTENT_LENGTH);
    response
        .headers
        .append(http_crate::header::VARY, HeaderValue::from_static("accept-encoding"));
    response.body = ResponseBody::from(Bytes::from(compressed));
}

fn translation_vary_name(cmd: u16) -> Option<&'static str> {
    match Command::from_u16(cmd)? {
        Command::Session => Some("cookie2"),
        Command::Language => Some("accept-language"),
        Command::Authorization => Some("authorization"),
        Command::UserAgent => Some("user-agent"),
        _ => None,
    }
}

/// Append the Vary names derived from the translation `vary[]` list.
fn add_translation_vary_header(headers: &mut HeaderMap, tr: &TranslateResponse) {
    let mut names: Vec<&str> = Vec::new();
    for &cmd in &tr.vary {
        if let Some(name) = translation_vary_name(cmd) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    if names.is_empty() {
        return;
    }
    let value = names.join(",");
    match headers.get(http_crate::header::VARY).and_then(|v| v.to_str().ok()) {
        Some(old) => {
            let joined = format!("{},{}", old, value);
            if let Ok(v) = HeaderValue::from_str(&joined) {
                headers.insert(http_crate::header::VARY, v);
            }
        }
        None => {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(http_crate::header::VARY, v);
            }
        }
    }
}

/// Generate the session Set-Cookie (and the P3P compatibility header).
fn generate_set_cookie(
    instance: &Instance,
    ctx: &mut RequestContext,
    tr: &TranslateResponse,
    headers: &mut HeaderMap,
) {
    if ctx.stateless {
        return;
    }

    if ctx.send_session_cookie {
        let Some(id) = ctx.make_session(&instance.sessions) else {
            return;
        };
        let cookie_path = tr.cookie_path.as_deref().unwrap_or("/");
        let mut value = format!(
            "{}={}; HttpOnly; Path={}; Version=1",
            ctx.session_cookie, id, cookie_path
        );
        if tr.secure_cookie {
            value.push_str("; Secure");
        }
        if let Some(domain) = &tr.cookie_domain {
            value.push_str("; Domain=\"");
            value.push_str(domain);
            value.push('"');
        }
        // "Discard" must be last, to work around an Android bug
        value.push_str("; Discard");

        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.append(http_crate::header::SET_COOKIE, v);
        }
        headers.insert("p3p", HeaderValue::from_static("CP=\"CAO PSA OUR\""));

        instance
            .sessions
            .with_session(id, |session| session.cookie_sent = true);
    } else if tr.discard_session && ctx.session_id.is_none() {
        // delete the cookie for the discarded session
        let cookie_path = tr.cookie_path.as_deref().unwrap_or("/");
        let mut value = format!(
            "{}=; HttpOnly; Path={}; Version=1; Max-Age=0",
            ctx.session_cookie, cookie_path
        );
        if let Some(domain) = &tr.cookie_domain {
            value.push_str("; Domain=\"");
            value.push_str(domain);
            value.push('"');
        }
        value.push_str("; Discard");
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.append(http_crate::header::SET_COOKIE, v);
        }
    }
}

/// The Location relocation callback for LINK=MANGLE forwarding.
pub fn relocate_location(
    tr: &TranslateResponse,
    uri_base: &str,
    request_host: Option<&str>,
    location: &str,
) -> Option<String> {
    let base = tr.base.as_deref()?;
    let address = match &tr.address {
        ferry_core::ResourceAddress::Http(a) => a,
        _ => return None,
    };

    let external_scheme = tr.scheme.as_deref().unwrap_or("http");
    let external_host = tr.host.as_deref().or(request_host).unwrap_or("localhost");

    // the internal path without its query string
    let internal_path = match address.path.find('?') {
        Some(i) => &address.path[..i],
        None => address.path.as_str(),
    };

    relocate_uri(
        location,
        &address.host_and_port,
        internal_path,
        external_scheme,
        external_host,
        uri_base,
        base,
    )
}

/// The final polish: auto-compression, translation headers, session
/// cookie, Vary, Server token, sticky node cookie.
pub fn finish_response(
    instance: &Instance,
    ctx: &mut RequestContext,
    mut response: PendingResponse,
    new_lb_cookie: Option<u32>,
) -> HandlerResponse {
    let tr = ctx.translate_response.clone();

    if let Some(tr) = &tr {
        // an authentication demand turns success into 401
        if response.status.is_success() && tr.www_authenticate.is_some() {
            response.status = StatusCode::UNAUTHORIZED;
        }

        auto_compress(ctx, tr, &mut response);

        if let Some(www_authenticate) = &tr.www_authenticate {
            if let Ok(v) = HeaderValue::from_str(www_authenticate) {
                response
                    .headers
                    .insert(http_crate::header::WWW_AUTHENTICATE, v);
            }
        }
        if let Some(authentication_info) = &tr.authentication_info {
            if let Ok(v) = HeaderValue::from_str(authentication_info) {
                response.headers.insert("authentication-info", v);
            }
        }
        for (name, value) in &tr.response_headers {
            if let (Ok(name), Ok(value)) = (
                http_crate::HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers.append(name, value);
            }
        }

        generate_set_cookie(instance, ctx, tr, &mut response.headers);
        add_translation_vary_header(&mut response.headers, tr);
    }

    if let Some(value) = new_lb_cookie {
        let cookie = format!(
            "ferry_lb_node={}; HttpOnly; Path=/; Version=1; Discard",
            format_lb_cookie(value)
        );
        if let Ok(v) = HeaderValue::from_str(&cookie) {
            response.headers.append(http_crate::header::SET_COOKIE, v);
        }
        response
            .headers
            .insert("cookie2", HeaderValue::from_static("$Version=\"1\""));
    }

    // RFC 2616 3.8: Product Tokens
    if !response.headers.contains_key(http_crate::header::SERVER) {
        if let Ok(v) = HeaderValue::from_str(&instance.config.proxy.product_token) {
            response.headers.insert(http_crate::header::SERVER, v);
        }
    }

    HandlerResponse {
        status: response.status,
        headers: response.headers,
        body: response.body,
        tunnel: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vary_names() {
        assert_eq!(
            translation_vary_name(Command::Session as u16),
            Some("cookie2")
        );
        assert_eq!(
            translation_vary_name(Command::Language as u16),
            Some("accept-language")
        );
        assert_eq!(
            translation_vary_name(Command::UserAgent as u16),
            Some("user-agent")
        );
        assert_eq!(translation_vary_name(Command::Host as u16), None);
        assert_eq!(translation_vary_name(9999), None);
    }

    #[test]
    fn vary_header_appends() {
        let mut tr = TranslateResponse::empty();
        tr.vary = vec![Command::Session as u16, Command::Language as u16];

        let mut headers = HeaderMap::new();
        add_translation_vary_header(&mut headers, &tr);
        assert_eq!(
            headers.get("vary").unwrap().to_str().unwrap(),
            "cookie2,accept-language"
        );

        // existing Vary is extended
        let mut headers = HeaderMap::new();
        headers.insert("vary", "accept-encoding".parse().unwrap());
        add_translation_vary_header(&mut headers, &tr);
        assert_eq!(
            headers.get("vary").unwrap().to_str().unwrap(),
            "accept-encoding,cookie2,accept-language"
        );
    }

    #[test]
    fn filter_enabled_rules() {
        let mut tr = TranslateResponse::empty();
        assert!(filter_enabled(&tr, false, StatusCode::OK));
        assert!(!filter_enabled(&tr, false, StatusCode::NOT_FOUND));
        assert!(!filter_enabled(&tr, false, StatusCode::BAD_GATEWAY));

        tr.filter_4xx = true;
        assert!(filter_enabled(&tr, false, StatusCode::NOT_FOUND));
        assert!(!filter_enabled(&tr, false, StatusCode::BAD_GATEWAY));

        // per-view flag
        let tr = TranslateResponse::empty();
        assert!(filter_enabled(&tr, true, StatusCode::NOT_FOUND));
    }

    #[test]
    fn redirect_response_shape() {
        let r = PendingResponse::redirect(StatusCode::FOUND, "https://x/", None);
        assert_eq!(r.status, StatusCode::FOUND);
        assert_eq!(
            r.headers.get("location").unwrap().to_str().unwrap(),
            "https://x/"
        );
        assert_eq!(
            r.headers.get("content-type").unwrap().to_str().unwrap(),
            "text/plain"
        );
    }
}
