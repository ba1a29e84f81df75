//! The request lifecycle orchestrator: one parsed HTTP request in, one
//! dispatched response out, possibly after several translate turns.

use crate::file::{self, FileOutcome, FileRequest};
use crate::forward::{self, RequestForwardContext, SessionForward};
use crate::instance::Instance;
use crate::request::{
    MAX_CHECKS, MAX_DIRECTORY_INDEX, MAX_FILE_NOT_FOUND, MAX_INTERNAL_REDIRECTS,
    MAX_PROBE_PATH_SUFFIXES, MAX_READ_FILE, RequestContext,
};
use crate::resource_loader::{self, OutgoingRequest};
use crate::response::{
    PendingResponse, apply_transformations, error_response, finish_response,
    maybe_error_document, relocate_location,
};
use bytes::Bytes;
use ferry_core::FerryError;
use ferry_core::ResourceAddress;
use ferry_http::server::{HandlerResponse, RequestHandler, ServerRequest};
use ferry_observability::access_log::{AccessLogEntry, timestamp_now};
use ferry_translation::{ForwardMode, HeaderGroup, TranslateResponse};
use http_crate::{HeaderValue, Method, StatusCode};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use ::http as http_crate;

const MAX_READ_FILE_SIZE: usize = 64 * 1024;

pub struct ProxyHandler {
    pub instance: Rc<Instance>,
}

impl ProxyHandler {
    pub fn new(instance: Rc<Instance>) -> Self {
        ProxyHandler { instance }
    }
}

impl RequestHandler for ProxyHandler {
    async fn handle_request(&self, request: ServerRequest) -> HandlerResponse {
        let instance = &self.instance;
        let mut ctx = RequestContext::new(
            request,
            &instance.config.session.cookie,
            instance.config.session.dynamic_session_cookie,
        );
        ctx.determine_session(&instance.sessions);
        fill_translate_request(instance, &mut ctx);

        match translate_loop(instance, &mut ctx).await {
            Ok(response) => response,
            Err(e) => {
                if let Some(kind) = e.upstream_kind() {
                    instance
                        .metrics
                        .upstream_failures
                        .with_label_values(&[&format!("{:?}", kind)])
                        .inc();
                }
                let pending = error_response(instance, &ctx, &e);
                let pending = maybe_error_document(instance, &mut ctx, pending).await;
                finish_response(instance, &mut ctx, pending, None)
            }
        }
    }

    fn log_request(
        &self,
        peer: std::net::SocketAddr,
        method: &Method,
        uri: &str,
        status: StatusCode,
        bytes_in: u64,
        bytes_out: u64,
        duration: Duration,
    ) {
        self.instance.metrics.record_request(
            method.as_str(),
            status.as_u16(),
            duration.as_secs_f64(),
        );
        AccessLogEntry {
            timestamp: timestamp_now(),
            client_ip: peer.ip().to_string(),
            method: method.as_str().to_string(),
            uri: uri.to_string(),
            status: status.as_u16(),
            bytes_in,
            bytes_out,
            duration_ms: duration.as_secs_f64() * 1000.0,
            site: None,
        }
        .emit();
    }
}

/// Fill the outgoing translate request from the current request state.
fn fill_translate_request(instance: &Instance, ctx: &mut RequestContext) {
    let uri = if ctx.uri.path_info.is_empty() {
        ctx.uri.base.clone()
    } else {
        format!("{}{}", ctx.uri.base, ctx.uri.path_info)
    };
    let args = if ctx.uri.args.is_empty() {
        None
    } else {
        Some(ctx.uri.args_string())
    };

    let treq = &mut ctx.translate_request;
    treq.uri = Some(uri);
    treq.host = ctx.headers
        .get(http_crate::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    treq.remote_host = Some(ctx.peer_addr.ip().to_string());
    treq.local_address = Some(ctx.local_addr.to_string());
    treq.user_agent = ctx.headers
        .get(http_crate::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    treq.accept_language = ctx.headers
        .get(http_crate::header::ACCEPT_LANGUAGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    treq.query_string = ctx.uri.query.clone();
    treq.listener_tag = instance.config.listener.tag.clone();
    treq.args = args;
}

/// The translate loop, re-entered by the file-probe outcomes.
async fn translate_loop(
    instance: &Rc<Instance>,
    ctx: &mut RequestContext,
) -> Result<HandlerResponse, FerryError> {
    loop {
        let response = instance.translate(&ctx.translate_request).await?;

        // PREVIOUS: reuse the response from the last turn
        let response = if response.previous {
            match &ctx.translate_response {
                Some(previous) => previous.as_ref().clone(),
                None => {
                    return Err(FerryError::Translation(
                        "PREVIOUS without a previous response".into(),
                    ));
                }
            }
        } else {
            response
        };

        ctx.apply_translate_realm(&response);
        ctx.apply_translate_session(&instance.sessions, &response);
        maybe_external_session(instance, ctx, &response);
        if response.discard_session {
            ctx.discard_session(&instance.sessions);
        }

        // CHECK: the server wants a follow-up turn
        if let Some(check) = &response.check {
            if ctx.translate_request.check.as_ref() != Some(check) {
                ctx.n_checks += 1;
                if ctx.n_checks > MAX_CHECKS {
                    return Err(FerryError::Loop("CHECK"));
                }
                ctx.translate_request.check = Some(check.clone());
                ctx.translate_response = Some(Rc::new(response));
                continue;
            }
        }

        // READ_FILE: feed file contents into the next turn
        if let Some(path) = &response.read_file {
            if ctx.translate_request.read_file.is_none() {
                ctx.n_read_file += 1;
                if ctx.n_read_file > MAX_READ_FILE {
                    return Err(FerryError::Loop("READ_FILE"));
                }
                let path = String::from_utf8_lossy(path).into_owned();
                let contents = std::fs::read(&path).unwrap_or_default();
                if contents.len() > MAX_READ_FILE_SIZE {
                    return Err(FerryError::Internal(format!(
                        "READ_FILE target too large: {}",
                        path
                    )));
                }
                ctx.translate_request.read_file = Some(Bytes::from(contents));
                continue;
            }
        }

        // PROBE_PATH_SUFFIXES: stat the candidates, echo the winner
        if let Some(payload) = &response.probe_path_suffixes {
            if ctx.translate_request.probe_path_suffixes.is_none() {
                ctx.n_probe_path_suffixes += 1;
                if ctx.n_probe_path_suffixes > MAX_PROBE_PATH_SUFFIXES {
                    return Err(FerryError::Loop("PROBE_PATH_SUFFIXES"));
                }
                let test_path = response.test_path.as_deref().ok_or_else(|| {
                    FerryError::Translation("PROBE_PATH_SUFFIXES without TEST_PATH".into())
                })?;
                let Some(found) = file::probe_suffixes(test_path, &response.probe_suffixes)
                else {
                    return Err(FerryError::NotFound);
                };
                ctx.translate_request.probe_path_suffixes = Some(payload.clone());
                ctx.translate_request.probe_suffix = Some(found);
                continue;
            }
        }

        // REDIRECT / BOUNCE: decided before AUTH is ever considered
        if response.redirect.is_some() || response.bounce.is_some() {
            let status = if response.status != 0 {
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::SEE_OTHER)
            } else {
                StatusCode::SEE_OTHER
            };
            let location = match (&response.redirect, &response.bounce) {
                (Some(redirect), _) => redirect.clone(),
                (None, Some(bounce)) => format!("{}{}", bounce, ctx.absolute_uri()),
                (None, None) => unreachable!(),
            };
            ctx.translate_response = Some(Rc::new(response));
            let pending = PendingResponse::redirect(status, &location, None);
            return Ok(finish_response(instance, ctx, pending, None));
        }

        // bare STATUS without an address
        if !response.address.is_defined() && response.status != 0 {
            let status = StatusCode::from_u16(response.status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            ctx.translate_response = Some(Rc::new(response));
            let pending =
                PendingResponse::message(status, status.canonical_reason().unwrap_or(""));
            let pending = maybe_error_document(instance, ctx, pending).await;
            return Ok(finish_response(instance, ctx, pending, None));
        }

        // AUTH: require a logged-in user
        if response.has_auth() {
            handle_auth(instance, ctx, &response).await?;
        }

        // WANT: inject requested fields into a follow-up turn
        if response.wants(ferry_translation::protocol::Command::User)
            && ctx.translate_request.user.is_none()
        {
            if let Some(user) = session_user(instance, ctx) {
                ctx.translate_request.user = Some(user);
                ctx.translate_response = Some(Rc::new(response));
                continue;
            }
        }

        // WANT_FULL_URI: repeat with the unparsed URI
        if let Some(token) = &response.want_full_uri {
            if ctx.translate_request.want_full_uri.is_none() {
                ctx.n_internal_redirects += 1;
                if ctx.n_internal_redirects > MAX_INTERNAL_REDIRECTS {
                    return Err(FerryError::Loop("WANT_FULL_URI"));
                }
                ctx.translate_request.want_full_uri = Some(token.clone());
                ctx.translate_request.uri = Some(ctx.raw_uri.clone());
                continue;
            }
        }

        // INTERNAL_REDIRECT: restart translation at a new URI
        if let Some(token) = &response.internal_redirect {
            if ctx.translate_request.internal_redirect.is_none() {
                ctx.n_internal_redirects += 1;
                if ctx.n_internal_redirects > MAX_INTERNAL_REDIRECTS {
                    return Err(FerryError::Loop("INTERNAL_REDIRECT"));
                }
                let uri = response.uri.clone().ok_or_else(|| {
                    FerryError::Translation("INTERNAL_REDIRECT without URI".into())
                })?;
                ctx.translate_request.internal_redirect = Some(token.clone());
                ctx.translate_request.uri = Some(uri);
                continue;
            }
        }

        // empty address with no terminal action
        if !response.address.is_defined() {
            return Err(FerryError::NotFound);
        }

        // untrusted-host policy
        check_untrusted(ctx, &response)?;

        // terminal: dispatch to the address
        let tr = Rc::new(response);
        ctx.translate_response = Some(Rc::clone(&tr));
        ctx.transformations = VecDeque::from(tr.default_view().transformations.clone());

        match &tr.address {
            ResourceAddress::Local(_) | ResourceAddress::Nfs(_) => {
                match dispatch_file(instance, ctx, &tr).await? {
                    FileDispatch::Done(response) => return Ok(response),
                    FileDispatch::Retranslate => continue,
                }
            }
            _ => return dispatch_backend(instance, ctx, &tr).await,
        }
    }
}

/// Verify the untrusted-host policy (widgets confined to separate
/// host names).
fn check_untrusted(ctx: &RequestContext, response: &TranslateResponse) -> Result<(), FerryError> {
    if !response.has_untrusted() {
        return Ok(());
    }
    let host = ctx.header("host").unwrap_or("");
    let host = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);

    let allowed = if let Some(untrusted) = &response.untrusted {
        host == untrusted
    } else if let Some(prefix) = &response.untrusted_prefix {
        host.strip_prefix(prefix.as_str())
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false)
    } else if let Some(suffix) = &response.untrusted_site_suffix {
        host.strip_suffix(suffix.as_str())
            .map(|rest| rest.ends_with('.'))
            .unwrap_or(false)
    } else {
        false
    };

    if allowed {
        Ok(())
    } else {
        Err(FerryError::Forbidden(format!(
            "untrusted host mismatch: {}",
            host
        )))
    }
}

/// AUTH continuation: short-circuit on a valid session user, otherwise
/// run a subordinate translation that must grant USER.
async fn handle_auth(
    instance: &Rc<Instance>,
    ctx: &mut RequestContext,
    response: &TranslateResponse,
) -> Result<(), FerryError> {
    let user = session_user(instance, ctx);
    if user.is_some() {
        return Ok(());
    }

    let mut token = match (&response.auth, &response.auth_file) {
        (Some(auth), _) => auth.to_vec(),
        (None, Some(path)) => std::fs::read(path).map_err(|e| {
            FerryError::Translation(format!("failed to read AUTH_FILE {}: {}", path, e))
        })?,
        (None, None) => return Err(FerryError::Forbidden("no auth token".into())),
    };
    if let Some(append) = &response.append_auth {
        token.extend_from_slice(append);
    }

    ctx.n_checks += 1;
    if ctx.n_checks > MAX_CHECKS {
        return Err(FerryError::Loop("AUTH"));
    }

    let mut auth_request = ctx.translate_request.clone();
    auth_request.auth = Some(Bytes::from(token));
    let auth_response = instance.translate(&auth_request).await?;

    ctx.apply_translate_realm(&auth_response);
    ctx.apply_translate_session(&instance.sessions, &auth_response);

    if session_user(instance, ctx).is_none() {
        return Err(FerryError::Forbidden("authentication required".into()));
    }
    Ok(())
}

fn session_user(instance: &Instance, ctx: &RequestContext) -> Option<String> {
    ctx.session_id.and_then(|id| {
        instance
            .sessions
            .with_session(id, |s| s.valid_user().map(str::to_string))
            .flatten()
    })
}

/// Schedule the external session manager keepalive GET.
fn maybe_external_session(
    instance: &Rc<Instance>,
    ctx: &RequestContext,
    response: &TranslateResponse,
) {
    let Some(manager) = &response.external_session_manager else {
        return;
    };
    if response.external_session_keepalive == 0 {
        return;
    }
    let Some(id) = ctx.session_id else { return };

    let keepalive = Duration::from_secs(response.external_session_keepalive as u64);
    let manager = manager.clone();
    let manager_for_session = manager.clone();
    let due = instance.sessions.with_session(id, move |session| {
        session.external_manager = Some(manager_for_session);
        session.external_keepalive = keepalive;
        let now = std::time::Instant::now();
        if now >= session.next_external_keepalive {
            session.next_external_keepalive = now + keepalive;
            true
        } else {
            false
        }
    });
    if due != Some(true) {
        return;
    }

    let Some(address) = ferry_core::address::HttpAddress::parse(&manager) else {
        tracing::info!(manager = %manager, "malformed external session manager URL");
        return;
    };

    // fire and forget; failures are logged only
    let instance = Rc::clone(instance);
    let sticky = id.cluster_hash();
    monoio::spawn(async move {
        let result = resource_loader::send_request(
            &instance,
            &ResourceAddress::Http(address),
            OutgoingRequest {
                method: Method::GET,
                headers: http_crate::HeaderMap::new(),
                body: Bytes::new(),
                sticky_hash: sticky,
                remote_addr: "127.0.0.1".into(),
                is_upgrade: false,
            },
        )
        .await;
        match result {
            Ok(response) => {
                if !response.status.is_success() {
                    tracing::info!(
                        status = response.status.as_u16(),
                        manager = %manager,
                        "external session manager refresh failed"
                    );
                }
                response.body.discard().await;
            }
            Err(e) => {
                tracing::info!(error = %e, manager = %manager, "external session refresh error");
            }
        }
    });
}

enum FileDispatch {
    Done(HandlerResponse),
    /// A probe asked for another translate turn.
    Retranslate,
}

async fn dispatch_file(
    instance: &Rc<Instance>,
    ctx: &mut RequestContext,
    tr: &Rc<TranslateResponse>,
) -> Result<FileDispatch, FerryError> {
    let file_address = match &tr.address {
        ResourceAddress::Local(file) => file.clone(),
        ResourceAddress::Nfs(nfs) => {
            let key = format!("{}:{}", nfs.server, nfs.export);
            let mount = instance.config.nfs_mounts.get(&key).ok_or_else(|| {
                FerryError::Internal(format!("no NFS mount configured for {}", key))
            })?;
            ferry_core::address::FileAddress::new(format!("{}{}", mount, nfs.path))
        }
        _ => unreachable!("dispatch_file on non-file address"),
    };

    let file_request = FileRequest {
        method: &ctx.method,
        headers: &ctx.headers,
        translated_status: tr.status,
        transformation_enabled: ctx.transformation_enabled(),
        expires_relative: tr.expires_relative,
        have_directory_index: tr.directory_index.is_some(),
        have_file_not_found: tr.file_not_found.is_some(),
        have_enotdir: tr.enotdir.is_some(),
    };

    match file::serve_file(&file_address, &file_request).await? {
        FileOutcome::Response {
            status,
            headers,
            body,
        } => {
            let status = if status == StatusCode::OK && tr.status != 0 {
                StatusCode::from_u16(tr.status).unwrap_or(status)
            } else {
                status
            };
            let pending = apply_transformations(
                instance,
                ctx,
                PendingResponse::new(status, headers, body),
            )
            .await?;
            let pending = maybe_error_document(instance, ctx, pending).await;
            Ok(FileDispatch::Done(finish_response(instance, ctx, pending, None)))
        }
        FileOutcome::DirectoryIndex => {
            ctx.n_directory_index += 1;
            if ctx.n_directory_index > MAX_DIRECTORY_INDEX {
                return Err(FerryError::Loop("DIRECTORY_INDEX"));
            }
            ctx.translate_request.directory_index = tr.directory_index.clone();
            Ok(FileDispatch::Retranslate)
        }
        FileOutcome::FileNotFound => {
            ctx.n_file_not_found += 1;
            if ctx.n_file_not_found > MAX_FILE_NOT_FOUND {
                return Err(FerryError::Loop("FILE_NOT_FOUND"));
            }
            ctx.translate_request.file_not_found = tr.file_not_found.clone();
            Ok(FileDispatch::Retranslate)
        }
        FileOutcome::Enotdir => {
            ctx.n_file_not_found += 1;
            if ctx.n_file_not_found > MAX_FILE_NOT_FOUND {
                return Err(FerryError::Loop("ENOTDIR"));
            }
            ctx.translate_request.enotdir = tr.enotdir.clone();
            Ok(FileDispatch::Retranslate)
        }
    }
}

async fn dispatch_backend(
    instance: &Rc<Instance>,
    ctx: &mut RequestContext,
    tr: &Rc<TranslateResponse>,
) -> Result<HandlerResponse, FerryError> {
    let view = tr.default_view().clone();

    // apply args and the client's query string to the address
    let mut address = tr.address.clone();
    if !ctx.uri.args.is_empty() {
        let args = ctx.uri.args_string();
        address = address.insert_args(&args, &ctx.uri.path_info);
    }
    if let Some(query) = &ctx.uri.query {
        address = address.insert_query_string_from(&format!("?{}", query));
    }

    let local_host = ctx.local_addr.to_string();
    let remote_host = ctx.peer_addr.ip().to_string();

    // outbound header set
    let session_forward = build_session_forward(instance, ctx, &address);
    let forward_ctx = RequestForwardContext {
        local_host: Some(&local_host),
        remote_host: Some(&remote_host),
        exclude_host: address.is_cgi_alike(),
        with_body: !ctx.body.is_empty(),
        is_upgrade: ctx.is_upgrade,
        forward_charset: address.is_cgi_alike(),
        forward_encoding: true,
        forward_range: !ctx.transformation_enabled(),
        session_cookie: Some(&ctx.session_cookie),
        session: session_forward.as_ref(),
        product_token: &instance.config.proxy.product_token,
    };
    let mut headers =
        forward::forward_request_headers(&ctx.headers, &view.request_header_forward, &forward_ctx);

    // the translation server may override the Host header
    if let Some(host) = &tr.host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(http_crate::header::HOST, value);
        }
    }
    for (name, value) in &tr.request_headers {
        if let (Ok(name), Ok(value)) = (
            http_crate::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.append(name, value);
        }
    }

    let sticky_hash = ctx.session_id.map(|id| id.cluster_hash()).unwrap_or(0);
    let backend_response = resource_loader::send_request(
        instance,
        &address,
        OutgoingRequest {
            method: ctx.method.clone(),
            headers,
            body: ctx.body.clone(),
            sticky_hash,
            remote_addr: remote_host.clone(),
            is_upgrade: ctx.is_upgrade,
        },
    )
    .await?;

    // 101 short-circuits everything else
    if let Some(tunnel) = backend_response.tunnel {
        let mut response = HandlerResponse::new(backend_response.status);
        response.headers = backend_response.headers;
        response.tunnel = Some(tunnel);
        return Ok(response);
    }

    let mut status = backend_response.status;
    let mut raw_headers = backend_response.headers;
    let mut body = backend_response.body;
    let new_lb_cookie = backend_response.new_lb_cookie;

    // response view switching via the transformation header
    if status.is_success()
        && !ctx.transformed
        && view.response_header_forward.get(HeaderGroup::Transformation) == ForwardMode::Mangle
    {
        if let Some(view_name) = raw_headers
            .get("x-ferry-view")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
        {
            match tr.find_view(Some(&view_name)) {
                Some(selected) => {
                    ctx.transformations = VecDeque::from(selected.transformations.clone());
                }
                None => {
                    body.discard().await;
                    tracing::info!(view = %view_name, "no such view");
                    let pending = PendingResponse::message(StatusCode::NOT_FOUND, "No such view");
                    return Ok(finish_response(instance, ctx, pending, new_lb_cookie));
                }
            }
        }
    }

    // MANGLE mode: collect upstream cookies into the session jar
    if view.response_header_forward.get(HeaderGroup::Cookie) == ForwardMode::Mangle {
        collect_cookies(instance, ctx, &address, &raw_headers);
    }

    // transformations act on the unforwarded headers
    let transformed = apply_transformations(
        instance,
        ctx,
        PendingResponse::new(status, raw_headers, body),
    )
    .await?;
    status = transformed.status;
    raw_headers = transformed.headers;
    body = transformed.body;

    let tr_for_relocate = Rc::clone(tr);
    let ctx_uri_base = ctx.uri.base.clone();
    let ctx_host = ctx.header("host").map(str::to_string);
    let forwarded = forward::forward_response_headers(
        status,
        &raw_headers,
        &view.response_header_forward,
        Some(&local_host),
        Some(&ctx.session_cookie),
        |location| {
            relocate_location(&tr_for_relocate, &ctx_uri_base, ctx_host.as_deref(), location)
        },
    );

    let pending = PendingResponse::new(status, forwarded, body);
    let pending = maybe_error_document(instance, ctx, pending).await;
    Ok(finish_response(instance, ctx, pending, new_lb_cookie))
}

/// Extract the session values header forwarding needs, under a short
/// lease.
fn build_session_forward(
    instance: &Instance,
    ctx: &RequestContext,
    address: &ResourceAddress,
) -> Option<SessionForward> {
    let id = ctx.session_id?;
    let scope = address_cookie_scope(address);
    instance.sessions.with_session(id, move |session| SessionForward {
        language: session.language.clone(),
        user: session.valid_user().map(str::to_string),
        jar_cookie_header: scope.as_ref().and_then(|(host, path)| {
            session.cookies.http_header_value(host, path)
        }),
    })
}

/// Store upstream Set-Cookie headers into the realm session's jar.
fn collect_cookies(
    instance: &Instance,
    ctx: &RequestContext,
    address: &ResourceAddress,
    headers: &http_crate::HeaderMap,
) {
    let Some(id) = ctx.session_id else { return };
    let Some((host_and_port, uri_path)) = address_cookie_scope(address) else {
        return;
    };
    let values: Vec<String> = headers
        .get_all(http_crate::header::SET_COOKIE)
        .iter()
        .chain(headers.get_all("set-cookie2").iter())
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    if values.is_empty() {
        return;
    }
    instance.sessions.with_session(id, move |session| {
        for value in &values {
            session.cookies.set_cookie(value, &host_and_port, &uri_path);
        }
    });
}

fn address_cookie_scope(address: &ResourceAddress) -> Option<(String, String)> {
    match address {
        ResourceAddress::Http(a) | ResourceAddress::Ajp(a) => {
            let path = match a.path.find('?') {
                Some(i) => a.path[..i].to_string(),
                None => a.path.clone(),
            };
            Some((a.host_and_port.clone(), path))
        }
        _ => None,
    }
}
