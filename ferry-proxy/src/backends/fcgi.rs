//! FastCGI responder-role client for remote FastCGI daemons.

use super::{BackendResponse, parse_cgi_response};
use crate::instance::Instance;
use bytes::{BufMut, Bytes, BytesMut};
use ferry_core::FerryError;
use ferry_core::address::CgiAddress;
use ferry_core::error::UpstreamErrorKind;
use ferry_http::ResponseBody;
use ferry_pool::balancer::AddressList;
use http_crate::{HeaderMap, Method};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};

use ::http as http_crate;

const FCGI_VERSION: u8 = 1;
const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;
const FCGI_STDERR: u8 = 7;

const FCGI_RESPONDER: u16 = 1;
const REQUEST_ID: u16 = 1;

fn put_record(out: &mut BytesMut, record_type: u8, content: &[u8]) {
    debug_assert!(content.len() <= u16::MAX as usize);
    out.put_u8(FCGI_VERSION);
    out.put_u8(record_type);
    out.put_u16(REQUEST_ID);
    out.put_u16(content.len() as u16);
    out.put_u8(0); // padding
    out.put_u8(0); // reserved
    out.put_slice(content);
}

fn put_param_length(out: &mut BytesMut, len: usize) {
    if len < 128 {
        out.put_u8(len as u8);
    } else {
        out.put_u32(len as u32 | 0x8000_0000);
    }
}

fn put_param(out: &mut BytesMut, name: &str, value: &str) {
    put_param_length(out, name.len());
    put_param_length(out, value.len());
    out.put_slice(name.as_bytes());
    out.put_slice(value.as_bytes());
}

/// The CGI parameter block for one request.
pub(crate) fn build_params(
    address: &CgiAddress,
    method: &Method,
    uri: &str,
    headers: &HeaderMap,
    content_length: usize,
) -> BytesMut {
    let mut out = BytesMut::with_capacity(512);
    put_param(&mut out, "GATEWAY_INTERFACE", "CGI/1.1");
    put_param(&mut out, "SERVER_PROTOCOL", "HTTP/1.1");
    put_param(&mut out, "REQUEST_METHOD", method.as_str());
    put_param(&mut out, "REQUEST_URI", uri);
    put_param(&mut out, "SCRIPT_FILENAME", &address.path);
    if let Some(script_name) = &address.script_name {
        put_param(&mut out, "SCRIPT_NAME", script_name);
    }
    if let Some(path_info) = &address.path_info {
        put_param(&mut out, "PATH_INFO", path_info);
    }
    if let Some(query) = &address.query_string {
        put_param(&mut out, "QUERY_STRING", query);
    }
    if let Some(document_root) = &address.document_root {
        put_param(&mut out, "DOCUMENT_ROOT", document_root);
    }
    if content_length > 0 {
        put_param(&mut out, "CONTENT_LENGTH", &content_length.to_string());
    }
    if let Some(ct) = headers
        .get(http_crate::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        put_param(&mut out, "CONTENT_TYPE", ct);
    }
    if let Some(host) = headers.get(http_crate::header::HOST).and_then(|v| v.to_str().ok()) {
        put_param(&mut out, "SERVER_NAME", host);
    }

    for (name, value) in headers {
        if name == http_crate::header::CONTENT_TYPE || name == http_crate::header::CONTENT_LENGTH
        {
            continue;
        }
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
        put_param(&mut out, &env_name, value);
    }

    // translation-supplied environment pairs
    for pair in &address.args {
        if let Some(eq) = pair.find('=') {
            put_param(&mut out, &pair[..eq], &pair[eq + 1..]);
        }
    }

    out
}

/// Serialize the whole request into one write.
fn build_request(
    address: &CgiAddress,
    method: &Method,
    uri: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> BytesMut {
    let mut out = BytesMut::with_capacity(1024 + body.len());

    let mut begin = BytesMut::with_capacity(8);
    begin.put_u16(FCGI_RESPONDER);
    begin.put_u8(0); // flags: no keep-conn
    begin.put_slice(&[0u8; 5]);
    put_record(&mut out, FCGI_BEGIN_REQUEST, &begin);

    let params = build_params(address, method, uri, headers, body.len());
    for chunk in params.chunks(0xffff) {
        put_record(&mut out, FCGI_PARAMS, chunk);
    }
    put_record(&mut out, FCGI_PARAMS, b"");

    for chunk in body.chunks(0xffff) {
        put_record(&mut out, FCGI_STDIN, chunk);
    }
    put_record(&mut out, FCGI_STDIN, b"");

    out
}

struct Record {
    record_type: u8,
    content: Bytes,
}

/// Parse one record off the front of `input`.
fn try_parse_record(input: &mut Bytes) -> Result<Option<Record>, FerryError> {
    use bytes::Buf;
    if input.len() < 8 {
        return Ok(None);
    }
    let version = input[0];
    if version != FCGI_VERSION {
        return Err(FerryError::upstream(
            UpstreamErrorKind::Garbage,
            "bad FastCGI protocol version",
        ));
    }
    let record_type = input[1];
    let content_length = u16::from_be_bytes([input[4], input[5]]) as usize;
    let padding_length = input[6] as usize;
    if input.len() < 8 + content_length + padding_length {
        return Ok(None);
    }
    input.advance(8);
    let content = input.split_to(content_length);
    input.advance(padding_length);
    Ok(Some(Record {
        record_type,
        content,
    }))
}

/// Send one request to a remote FastCGI daemon named by the address
/// list and collect its response.
pub async fn send_fcgi_request(
    instance: &Instance,
    address: &CgiAddress,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    sticky_hash: u32,
) -> Result<BackendResponse, FerryError> {
    if address.address_list.is_empty() {
        return Err(FerryError::Internal(format!(
            "no FastCGI server configured for {}",
            address.path
        )));
    }
    let list = AddressList {
        addresses: address.address_list.clone(),
        ..Default::default()
    };

    let balanced = instance
        .balancer
        .get(&instance.tcp_stock, &list, sticky_hash)
        .await?;
    let addr = balanced.addr;
    let mut stream = balanced.stream;

    let uri = address.cgi_uri();
    let request = build_request(address, method, &uri, headers, &body);

    let result = drive(
        instance,
        &mut stream,
        request.freeze().to_vec(),
    )
    .await;

    // no keep-conn: the daemon closes after END_REQUEST
    instance.tcp_stock.put(&addr, stream, false);

    let stdout = match result {
        Ok(stdout) => stdout,
        Err(e) => {
            if e.upstream_kind().map(|k| k.is_server_failure()).unwrap_or(false) {
                instance.balancer.on_response_failure(&addr);
            }
            return Err(e);
        }
    };
    instance.balancer.on_response_success(&addr);

    let (status, headers, body) = parse_cgi_response(stdout)?;
    let mut response = BackendResponse::new(status, headers, ResponseBody::from(body));
    response.addr = Some(addr);
    Ok(response)
}

async fn drive(
    instance: &Instance,
    stream: &mut monoio::net::TcpStream,
    request: Vec<u8>,
) -> Result<Bytes, FerryError> {
    let write = stream.write_all(request);
    let (res, _) = monoio::time::timeout(instance.upstream_write_timeout(), write)
        .await
        .map_err(|_| FerryError::upstream(UpstreamErrorKind::Timeout, "FastCGI write timeout"))?;
    res.map_err(|e| {
        FerryError::upstream(UpstreamErrorKind::Io, format!("FastCGI write error: {}", e))
    })?;

    let cap = instance.config.proxy.filter_buffer_size;
    let mut stdout = BytesMut::new();
    let mut pending = Bytes::new();
    let mut got_any = false;

    loop {
        // drain complete records
        loop {
            match try_parse_record(&mut pending)? {
                Some(record) => match record.record_type {
                    FCGI_STDOUT => {
                        if stdout.len() + record.content.len() > cap {
                            return Err(FerryError::upstream(
                                UpstreamErrorKind::Unspecified,
                                "FastCGI response too large",
                            ));
                        }
                        stdout.extend_from_slice(&record.content);
                    }
                    FCGI_STDERR => {
                        if !record.content.is_empty() {
                            tracing::warn!(
                                stderr = %String::from_utf8_lossy(&record.content),
                                "FastCGI stderr"
                            );
                        }
                    }
                    FCGI_END_REQUEST => return Ok(stdout.freeze()),
                    other => {
                        tracing::debug!(record_type = other, "ignoring FastCGI record");
                    }
                },
                None => break,
            }
        }

        let buf = vec![0u8; 16 * 1024];
        let read = stream.read(buf);
        let (res, buf) = monoio::time::timeout(instance.upstream_read_timeout(), read)
            .await
            .map_err(|_| {
                FerryError::upstream(UpstreamErrorKind::Timeout, "FastCGI read timeout")
            })?;
        let n = res.map_err(|e| {
            FerryError::upstream(UpstreamErrorKind::Io, format!("FastCGI read error: {}", e))
        })?;
        if n == 0 {
            return Err(FerryError::upstream(
                if got_any {
                    UpstreamErrorKind::Premature
                } else {
                    UpstreamErrorKind::Refused
                },
                "FastCGI daemon closed the connection",
            ));
        }
        got_any = true;
        let mut joined = BytesMut::with_capacity(pending.len() + n);
        joined.extend_from_slice(&pending);
        joined.extend_from_slice(&buf[..n]);
        pending = joined.freeze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_params(mut raw: Bytes) -> Vec<(String, String)> {
        use bytes::Buf;
        let mut out = Vec::new();
        while raw.has_remaining() {
            let name_len = read_len(&mut raw);
            let value_len = read_len(&mut raw);
            let name = String::from_utf8(raw.split_to(name_len).to_vec()).unwrap();
            let value = String::from_utf8(raw.split_to(value_len).to_vec()).unwrap();
            out.push((name, value));
        }
        out
    }

    fn read_len(raw: &mut Bytes) -> usize {
        use bytes::Buf;
        let first = raw.get_u8();
        if first < 128 {
            first as usize
        } else {
            let rest = [first & 0x7f, raw.get_u8(), raw.get_u8(), raw.get_u8()];
            u32::from_be_bytes(rest) as usize
        }
    }

    fn test_address() -> CgiAddress {
        let mut a = CgiAddress::new("/srv/app/index.fcgi");
        a.script_name = Some("/app".into());
        a.path_info = Some("/page".into());
        a.query_string = Some("q=1".into());
        a.document_root = Some("/srv/app".into());
        a.args = vec!["APP_ENV=prod".into()];
        a
    }

    #[test]
    fn params_include_cgi_environment() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "example.com".parse().unwrap());
        headers.insert("x-custom", "1".parse().unwrap());

        let params = build_params(&test_address(), &Method::GET, "/app/page?q=1", &headers, 0);
        let pairs = collect_params(params.freeze());
        let get = |name: &str| {
            pairs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("REQUEST_METHOD"), Some("GET"));
        assert_eq!(get("REQUEST_URI"), Some("/app/page?q=1"));
        assert_eq!(get("SCRIPT_FILENAME"), Some("/srv/app/index.fcgi"));
        assert_eq!(get("SCRIPT_NAME"), Some("/app"));
        assert_eq!(get("PATH_INFO"), Some("/page"));
        assert_eq!(get("QUERY_STRING"), Some("q=1"));
        assert_eq!(get("DOCUMENT_ROOT"), Some("/srv/app"));
        assert_eq!(get("SERVER_NAME"), Some("example.com"));
        assert_eq!(get("HTTP_X_CUSTOM"), Some("1"));
        assert_eq!(get("APP_ENV"), Some("prod"));
        // no body: no CONTENT_LENGTH
        assert_eq!(get("CONTENT_LENGTH"), None);
    }

    #[test]
    fn long_param_uses_four_byte_length() {
        let mut out = BytesMut::new();
        let long_value = "v".repeat(300);
        put_param(&mut out, "NAME", &long_value);
        let pairs = collect_params(out.freeze());
        assert_eq!(pairs[0].1.len(), 300);
    }

    #[test]
    fn record_round_trip() {
        let mut out = BytesMut::new();
        put_record(&mut out, FCGI_STDOUT, b"hello");
        put_record(&mut out, FCGI_END_REQUEST, &[0u8; 8]);
        let mut raw = out.freeze();

        let r1 = try_parse_record(&mut raw).unwrap().unwrap();
        assert_eq!(r1.record_type, FCGI_STDOUT);
        assert_eq!(&r1.content[..], b"hello");

        let r2 = try_parse_record(&mut raw).unwrap().unwrap();
        assert_eq!(r2.record_type, FCGI_END_REQUEST);
        assert!(raw.is_empty());
    }

    #[test]
    fn partial_record_needs_more() {
        let mut out = BytesMut::new();
        put_record(&mut out, FCGI_STDOUT, b"hello");
        let full = out.freeze();
        let mut partial = full.slice(..7);
        assert!(try_parse_record(&mut partial).unwrap().is_none());
        let mut partial = full.slice(..10);
        assert!(try_parse_record(&mut partial).unwrap().is_none());
    }

    #[test]
    fn bad_version_is_garbage() {
        let mut raw = Bytes::from_static(&[9, 6, 0, 1, 0, 0, 0, 0]);
        assert!(try_parse_record(&mut raw).is_err());
    }

    #[test]
    fn request_stream_shape() {
        let headers = HeaderMap::new();
        let raw = build_request(&test_address(), &Method::POST, "/app", &headers, b"body");
        let mut raw = raw.freeze();

        let mut types = Vec::new();
        while let Some(r) = try_parse_record(&mut raw).unwrap() {
            types.push((r.record_type, r.content.len()));
        }
        // BEGIN, PARAMS, empty PARAMS, STDIN, empty STDIN
        assert_eq!(types[0].0, FCGI_BEGIN_REQUEST);
        assert_eq!(types[1].0, FCGI_PARAMS);
        assert_eq!(types[2], (FCGI_PARAMS, 0));
        assert_eq!(types[3], (FCGI_STDIN, 4));
        assert_eq!(types[4], (FCGI_STDIN, 0));
    }
}
