//! Local CGI and PIPE execution.
//!
//! The child runs with the standard CGI environment; its stdout is a
//! CGI response (CGI) or the raw response body (PIPE).

use super::{BackendResponse, parse_cgi_response};
use crate::instance::Instance;
use bytes::Bytes;
use ferry_core::FerryError;
use ferry_core::address::CgiAddress;
use ferry_core::error::UpstreamErrorKind;
use ferry_http::ResponseBody;
use http_crate::{HeaderMap, Method, StatusCode};
use std::io::{Read, Write};
use std::process::{Command, Stdio};

use ::http as http_crate;

/// The CGI/1.1 environment for one request.
pub(crate) fn cgi_environment(
    address: &CgiAddress,
    method: &Method,
    headers: &HeaderMap,
    remote_addr: &str,
    body_len: usize,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_PROTOCOL".to_string(), "HTTP/1.1".to_string()),
        ("REQUEST_METHOD".to_string(), method.as_str().to_string()),
        ("REQUEST_URI".to_string(), address.cgi_uri()),
        ("SCRIPT_FILENAME".to_string(), address.path.clone()),
        ("REMOTE_ADDR".to_string(), remote_addr.to_string()),
    ];
    if let Some(script_name) = &address.script_name {
        env.push(("SCRIPT_NAME".to_string(), script_name.clone()));
    }
    if let Some(path_info) = &address.path_info {
        env.push(("PATH_INFO".to_string(), path_info.clone()));
    }
    if let Some(query) = &address.query_string {
        env.push(("QUERY_STRING".to_string(), query.clone()));
    }
    if let Some(document_root) = &address.document_root {
        env.push(("DOCUMENT_ROOT".to_string(), document_root.clone()));
    }
    if body_len > 0 {
        env.push(("CONTENT_LENGTH".to_string(), body_len.to_string()));
    }
    if let Some(ct) = headers
        .get(http_crate::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        env.push(("CONTENT_TYPE".to_string(), ct.to_string()));
    }
    if let Some(host) = headers
        .get(http_crate::header::HOST)
        .and_then(|v| v.to_str().ok())
    {
        env.push(("SERVER_NAME".to_string(), host.to_string()));
    }

    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        let mut env_name = String::with_capacity(name.as_str().len() + 5);
        env_name.push_str("HTTP_");
        for c in name.as_str().chars() {
            env_name.push(match c {
                'a'..='z' => c.to_ascii_uppercase(),
                '-' => '_',
                other => other,
            });
        }
        env.push((env_name, value.to_string()));
    }

    env
}

/// Run the child and capture its stdout.  CGI children are local and
/// short-lived; the call blocks the worker for the child's lifetime.
fn run_child(
    address: &CgiAddress,
    env: &[(String, String)],
    body: &[u8],
    cap: usize,
) -> Result<Bytes, FerryError> {
    // ACTION names the executable; PATH is what the script sees as
    // SCRIPT_FILENAME.  INTERPRETER wraps both.
    let (program, mut args): (&str, Vec<&str>) = match (&address.interpreter, &address.action) {
        (Some(interpreter), _) => (interpreter.as_str(), vec![address.path.as_str()]),
        (None, Some(action)) => (action.as_str(), vec![]),
        (None, None) => (address.path.as_str(), vec![]),
    };
    for arg in &address.args {
        args.push(arg);
    }

    let mut child = Command::new(program)
        .args(&args)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(if body.is_empty() {
            Stdio::null()
        } else {
            Stdio::piped()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            FerryError::upstream(
                UpstreamErrorKind::Refused,
                format!("failed to execute {}: {}", program, e),
            )
        })?;

    if !body.is_empty() {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(body);
        }
    }

    let mut stdout = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match out.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdout.len() + n > cap {
                        let _ = child.kill();
                        return Err(FerryError::upstream(
                            UpstreamErrorKind::Unspecified,
                            "script response too large",
                        ));
                    }
                    stdout.extend_from_slice(&buf[..n]);
                }
                Err(e) => {
                    let _ = child.kill();
                    return Err(FerryError::upstream(
                        UpstreamErrorKind::Io,
                        format!("read from script failed: {}", e),
                    ));
                }
            }
        }
    }

    let status = child.wait().map_err(|e| {
        FerryError::upstream(UpstreamErrorKind::Io, format!("wait for script failed: {}", e))
    })?;

    if let Some(mut err) = child.stderr.take() {
        let mut text = String::new();
        if err.read_to_string(&mut text).is_ok() && !text.is_empty() {
            tracing::warn!(program, stderr = %text.trim_end(), "script stderr");
        }
    }

    if !status.success() && stdout.is_empty() {
        return Err(FerryError::upstream(
            UpstreamErrorKind::Premature,
            format!("script exited with {}", status),
        ));
    }

    Ok(Bytes::from(stdout))
}

/// Execute a CGI script: stdout is a CGI response.
pub async fn send_cgi_request(
    instance: &Instance,
    address: &CgiAddress,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    remote_addr: &str,
) -> Result<BackendResponse, FerryError> {
    let env = cgi_environment(address, method, headers, remote_addr, body.len());
    let stdout = run_child(
        address,
        &env,
        &body,
        instance.config.proxy.filter_buffer_size,
    )?;
    let (status, headers, body) = parse_cgi_response(stdout)?;
    Ok(BackendResponse::new(status, headers, ResponseBody::from(body)))
}

/// Execute a PIPE command: stdout is the raw response body.
pub async fn send_pipe_request(
    instance: &Instance,
    address: &CgiAddress,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    remote_addr: &str,
) -> Result<BackendResponse, FerryError> {
    let env = cgi_environment(address, method, headers, remote_addr, body.len());
    let stdout = run_child(
        address,
        &env,
        &body,
        instance.config.proxy.filter_buffer_size,
    )?;
    Ok(BackendResponse::new(
        StatusCode::OK,
        HeaderMap::new(),
        ResponseBody::from(stdout),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> CgiAddress {
        let mut a = CgiAddress::new("/usr/lib/cgi-bin/test.pl");
        a.script_name = Some("/cgi/test".into());
        a.path_info = Some("/extra".into());
        a.query_string = Some("a=b".into());
        a
    }

    #[test]
    fn environment_contains_cgi_variables() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "example.com".parse().unwrap());
        headers.insert("x-token", "t".parse().unwrap());

        let env = cgi_environment(&address(), &Method::POST, &headers, "198.51.100.4", 5);
        let get = |name: &str| {
            env.iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(get("REQUEST_METHOD"), Some("POST"));
        assert_eq!(get("SCRIPT_NAME"), Some("/cgi/test"));
        assert_eq!(get("PATH_INFO"), Some("/extra"));
        assert_eq!(get("QUERY_STRING"), Some("a=b"));
        assert_eq!(get("CONTENT_LENGTH"), Some("5"));
        assert_eq!(get("REMOTE_ADDR"), Some("198.51.100.4"));
        assert_eq!(get("SERVER_NAME"), Some("example.com"));
        assert_eq!(get("HTTP_X_TOKEN"), Some("t"));
    }

    #[test]
    fn environment_skips_content_length_without_body() {
        let env = cgi_environment(&address(), &Method::GET, &HeaderMap::new(), "::1", 0);
        assert!(!env.iter().any(|(n, _)| n == "CONTENT_LENGTH"));
    }
}
