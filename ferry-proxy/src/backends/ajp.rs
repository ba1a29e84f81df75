//! AJP/1.3 backend adapter.

use super::BackendResponse;
use crate::instance::Instance;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ferry_core::FerryError;
use ferry_core::address::HttpAddress;
use ferry_core::error::UpstreamErrorKind;
use ferry_http::ResponseBody;
use ferry_pool::balancer::AddressList;
use http_crate::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};

use ::http as http_crate;

const PREFIX_FORWARD_REQUEST: u8 = 2;
const PREFIX_SEND_BODY_CHUNK: u8 = 3;
const PREFIX_SEND_HEADERS: u8 = 4;
const PREFIX_END_RESPONSE: u8 = 5;
const PREFIX_GET_BODY_CHUNK: u8 = 6;

/// Maximum payload of one AJP packet.
const MAX_PACKET: usize = 8186;

fn method_code(method: &Method) -> Option<u8> {
    Some(match method.as_str() {
        "OPTIONS" => 1,
        "GET" => 2,
        "HEAD" => 3,
        "POST" => 4,
        "PUT" => 5,
        "DELETE" => 6,
        "TRACE" => 7,
        "PROPFIND" => 8,
        "PROPPATCH" => 9,
        "MKCOL" => 10,
        "COPY" => 11,
        "MOVE" => 12,
        "LOCK" => 13,
        "UNLOCK" => 14,
        "REPORT" => 16,
        _ => return None,
    })
}

fn request_header_code(name: &str) -> Option<u16> {
    Some(match name {
        "accept" => 0xa001,
        "accept-charset" => 0xa002,
        "accept-encoding" => 0xa003,
        "accept-language" => 0xa004,
        "authorization" => 0xa005,
        "connection" => 0xa006,
        "content-type" => 0xa007,
        "content-length" => 0xa008,
        "cookie" => 0xa009,
        "cookie2" => 0xa00a,
        "host" => 0xa00b,
        "pragma" => 0xa00c,
        "referer" => 0xa00d,
        "user-agent" => 0xa00e,
        _ => return None,
    })
}

fn response_header_name(code: u16) -> Option<&'static str> {
    Some(match code {
        0xa001 => "content-type",
        0xa002 => "content-language",
        0xa003 => "content-length",
        0xa004 => "date",
        0xa005 => "last-modified",
        0xa006 => "location",
        0xa007 => "set-cookie",
        0xa008 => "set-cookie2",
        0xa009 => "servlet-engine",
        0xa00a => "status",
        0xa00b => "www-authenticate",
        _ => return None,
    })
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn wrap_packet(payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(payload.len() + 4);
    out.put_slice(&[0x12, 0x34]);
    out.put_u16(payload.len() as u16);
    out.put_slice(payload);
    out
}

/// Serialize the FORWARD_REQUEST packet.
fn build_forward_request(
    method: &Method,
    address: &HttpAddress,
    headers: &HeaderMap,
    remote_addr: &str,
    body_len: usize,
) -> Result<BytesMut, FerryError> {
    let code = method_code(method).ok_or_else(|| {
        FerryError::upstream(
            UpstreamErrorKind::Unspecified,
            format!("method {} not supported by AJP", method),
        )
    })?;

    let (uri, query) = match address.path.find('?') {
        Some(i) => (&address.path[..i], Some(&address.path[i + 1..])),
        None => (address.path.as_str(), None),
    };
    let (server_name, server_port) = match address.host_and_port.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().unwrap_or(80)),
        None => (address.host_and_port.as_str(), 80),
    };

    let mut p = BytesMut::with_capacity(512);
    p.put_u8(PREFIX_FORWARD_REQUEST);
    p.put_u8(code);
    put_string(&mut p, "HTTP/1.1");
    put_string(&mut p, uri);
    put_string(&mut p, remote_addr);
    put_string(&mut p, remote_addr);
    put_string(&mut p, server_name);
    p.put_u16(server_port);
    p.put_u8(0); // is_ssl

    let mut header_count = 0u16;
    let mut header_block = BytesMut::with_capacity(256);
    for (name, value) in headers {
        let Ok(value) = value.to_str() else { continue };
        match request_header_code(name.as_str()) {
            Some(code) => header_block.put_u16(code),
            None => put_string(&mut header_block, name.as_str()),
        }
        put_string(&mut header_block, value);
        header_count += 1;
    }
    if body_len > 0 && !headers.contains_key(http_crate::header::CONTENT_LENGTH) {
        header_block.put_u16(0xa008);
        put_string(&mut header_block, &body_len.to_string());
        header_count += 1;
    }
    p.put_u16(header_count);
    p.put_slice(&header_block);

    if let Some(query) = query {
        p.put_u8(0x05); // query_string attribute
        put_string(&mut p, query);
    }
    p.put_u8(0xff); // attribute terminator

    Ok(p)
}

fn body_chunk_packet(chunk: &[u8]) -> BytesMut {
    let mut payload = BytesMut::with_capacity(chunk.len() + 2);
    payload.put_u16(chunk.len() as u16);
    payload.put_slice(chunk);
    wrap_packet(&payload)
}

struct AjpPacket {
    payload: Bytes,
}

fn try_parse_server_packet(input: &mut Bytes) -> Result<Option<AjpPacket>, FerryError> {
    if input.len() < 4 {
        return Ok(None);
    }
    if &input[..2] != b"AB" {
        return Err(FerryError::upstream(
            UpstreamErrorKind::Garbage,
            "bad AJP packet signature",
        ));
    }
    let len = u16::from_be_bytes([input[2], input[3]]) as usize;
    if input.len() < 4 + len {
        return Ok(None);
    }
    input.advance(4);
    let payload = input.split_to(len);
    Ok(Some(AjpPacket { payload }))
}

fn get_string(payload: &mut Bytes) -> Result<Option<String>, FerryError> {
    if payload.len() < 2 {
        return Err(garbage("truncated AJP string"));
    }
    let len = payload.get_u16();
    if len == 0xffff {
        return Ok(None);
    }
    let len = len as usize;
    if payload.len() < len + 1 {
        return Err(garbage("truncated AJP string"));
    }
    let s = payload.split_to(len);
    payload.advance(1); // trailing NUL
    String::from_utf8(s.to_vec())
        .map(Some)
        .map_err(|_| garbage("non-UTF8 AJP string"))
}

fn garbage(msg: &str) -> FerryError {
    FerryError::upstream(UpstreamErrorKind::Garbage, msg.to_string())
}

fn parse_send_headers(mut payload: Bytes) -> Result<(StatusCode, HeaderMap), FerryError> {
    let status = payload.get_u16();
    let status =
        StatusCode::from_u16(status).map_err(|_| garbage("invalid AJP status code"))?;
    let _message = get_string(&mut payload)?;
    let count = payload.get_u16();

    let mut headers = HeaderMap::with_capacity(count as usize);
    for _ in 0..count {
        if payload.len() < 2 {
            return Err(garbage("truncated AJP header block"));
        }
        let name = if payload[0] == 0xa0 {
            let code = payload.get_u16();
            response_header_name(code)
                .ok_or_else(|| garbage("unknown AJP response header code"))?
                .to_string()
        } else {
            get_string(&mut payload)?.ok_or_else(|| garbage("null AJP header name"))?
        };
        let value = get_string(&mut payload)?.unwrap_or_default();
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.append(name, value);
        }
    }
    Ok((status, headers))
}

/// Send one request over AJP/1.3 and collect the response.
pub async fn send_ajp_request(
    instance: &Instance,
    address: &HttpAddress,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    remote_addr: &str,
    sticky_hash: u32,
) -> Result<BackendResponse, FerryError> {
    let addresses = if address.addresses.is_empty() {
        vec![address.host_and_port.clone()]
    } else {
        address.addresses.clone()
    };
    let list = AddressList {
        addresses,
        ..Default::default()
    };

    let balanced = instance
        .balancer
        .get(&instance.tcp_stock, &list, sticky_hash)
        .await?;
    let addr = balanced.addr;
    let mut stream = balanced.stream;

    let result = drive(instance, &mut stream, address, method, headers, body, remote_addr).await;

    match result {
        Ok((status, resp_headers, resp_body, reuse)) => {
            instance.tcp_stock.put(&addr, stream, reuse);
            if status.is_server_error() {
                instance.balancer.on_response_failure(&addr);
            } else {
                instance.balancer.on_response_success(&addr);
            }
            let mut response =
                BackendResponse::new(status, resp_headers, ResponseBody::from(resp_body));
            response.addr = Some(addr);
            Ok(response)
        }
        Err(e) => {
            instance.tcp_stock.put(&addr, stream, false);
            if e.upstream_kind().map(|k| k.is_server_failure()).unwrap_or(false) {
                instance.balancer.on_response_failure(&addr);
            }
            Err(e)
        }
    }
}

async fn drive(
    instance: &Instance,
    stream: &mut monoio::net::TcpStream,
    address: &HttpAddress,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    remote_addr: &str,
) -> Result<(StatusCode, HeaderMap, Bytes, bool), FerryError> {
    let forward = build_forward_request(method, address, headers, remote_addr, body.len())?;
    let mut first_write = wrap_packet(&forward);
    let mut body_offset = 0usize;

    // the first body chunk travels unsolicited with the request
    if !body.is_empty() {
        let take = body.len().min(MAX_PACKET);
        first_write.extend_from_slice(&body_chunk_packet(&body[..take]));
        body_offset = take;
    }

    write_with_timeout(instance, stream, first_write.to_vec()).await?;

    let cap = instance.config.proxy.filter_buffer_size;
    let mut pending = Bytes::new();
    let mut got_any = false;

    let mut status = None;
    let mut resp_headers = HeaderMap::new();
    let mut resp_body = BytesMut::new();

    loop {
        while let Some(packet) = try_parse_server_packet(&mut pending)? {
            let mut payload = packet.payload;
            if payload.is_empty() {
                return Err(garbage("empty AJP packet"));
            }
            let prefix = payload.get_u8();
            match prefix {
                PREFIX_SEND_HEADERS => {
                    let (s, h) = parse_send_headers(payload)?;
                    status = Some(s);
                    resp_headers = h;
                }
                PREFIX_SEND_BODY_CHUNK => {
                    if payload.len() < 2 {
                        return Err(garbage("truncated AJP body chunk"));
                    }
                    let len = payload.get_u16() as usize;
                    if payload.len() < len {
                        return Err(garbage("truncated AJP body chunk"));
                    }
                    if resp_body.len() + len > cap {
                        return Err(FerryError::upstream(
                            UpstreamErrorKind::Unspecified,
                            "AJP response too large",
                        ));
                    }
                    resp_body.extend_from_slice(&payload[..len]);
                }
                PREFIX_END_RESPONSE => {
                    let reuse = payload.first().copied().unwrap_or(0) != 0;
                    let status = status.ok_or_else(|| {
                        garbage("AJP END_RESPONSE without SEND_HEADERS")
                    })?;
                    return Ok((status, resp_headers, resp_body.freeze(), reuse));
                }
                PREFIX_GET_BODY_CHUNK => {
                    let take = (body.len() - body_offset).min(MAX_PACKET);
                    let chunk = body_chunk_packet(&body[body_offset..body_offset + take]);
                    body_offset += take;
                    write_with_timeout(instance, stream, chunk.to_vec()).await?;
                }
                other => {
                    return Err(garbage(&format!("unknown AJP prefix {}", other)));
                }
            }
        }

        let buf = vec![0u8; 16 * 1024];
        let read = stream.read(buf);
        let (res, buf) = monoio::time::timeout(instance.upstream_read_timeout(), read)
            .await
            .map_err(|_| FerryError::upstream(UpstreamErrorKind::Timeout, "AJP read timeout"))?;
        let n = res.map_err(|e| {
            FerryError::upstream(UpstreamErrorKind::Io, format!("AJP read error: {}", e))
        })?;
        if n == 0 {
            return Err(FerryError::upstream(
                if got_any {
                    UpstreamErrorKind::Premature
                } else {
                    UpstreamErrorKind::Refused
                },
                "AJP peer closed the connection",
            ));
        }
        got_any = true;
        let mut joined = BytesMut::with_capacity(pending.len() + n);
        joined.extend_from_slice(&pending);
        joined.extend_from_slice(&buf[..n]);
        pending = joined.freeze();
    }
}

async fn write_with_timeout(
    instance: &Instance,
    stream: &mut monoio::net::TcpStream,
    data: Vec<u8>,
) -> Result<(), FerryError> {
    let write = stream.write_all(data);
    let (res, _) = monoio::time::timeout(instance.upstream_write_timeout(), write)
        .await
        .map_err(|_| FerryError::upstream(UpstreamErrorKind::Timeout, "AJP write timeout"))?;
    res.map_err(|e| {
        FerryError::upstream(UpstreamErrorKind::Io, format!("AJP write error: {}", e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_codes_cover_webdav() {
        assert_eq!(method_code(&Method::GET), Some(2));
        assert_eq!(method_code(&Method::HEAD), Some(3));
        assert_eq!(method_code(&Method::POST), Some(4));
        assert_eq!(
            method_code(&Method::from_bytes(b"PROPFIND").unwrap()),
            Some(8)
        );
        assert_eq!(method_code(&Method::from_bytes(b"LOCK").unwrap()), Some(13));
        assert_eq!(method_code(&Method::from_bytes(b"BREW").unwrap()), None);
    }

    #[test]
    fn forward_request_layout() {
        let address = HttpAddress::parse("http://tomcat:8009/app/page?x=1").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("host", "tomcat".parse().unwrap());
        headers.insert("x-custom", "v".parse().unwrap());

        let p = build_forward_request(&Method::GET, &address, &headers, "10.0.0.9", 0).unwrap();
        assert_eq!(p[0], PREFIX_FORWARD_REQUEST);
        assert_eq!(p[1], 2); // GET
        // protocol string follows: length 8, "HTTP/1.1", NUL
        assert_eq!(&p[2..4], &8u16.to_be_bytes());
        assert_eq!(&p[4..12], b"HTTP/1.1");
        assert_eq!(p[12], 0);
    }

    #[test]
    fn send_headers_round_trip() {
        // build a SEND_HEADERS payload by hand
        let mut p = BytesMut::new();
        p.put_u16(200);
        put_string(&mut p, "OK");
        p.put_u16(2);
        p.put_u16(0xa001); // content-type
        put_string(&mut p, "text/plain");
        put_string(&mut p, "x-app");
        put_string(&mut p, "1");

        let (status, headers) = parse_send_headers(p.freeze()).unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get("content-type").unwrap().to_str().unwrap(),
            "text/plain"
        );
        assert_eq!(headers.get("x-app").unwrap().to_str().unwrap(), "1");
    }

    #[test]
    fn server_packet_framing() {
        let mut raw = BytesMut::new();
        raw.put_slice(b"AB");
        raw.put_u16(3);
        raw.put_slice(&[PREFIX_END_RESPONSE, 1, 0]);
        let mut input = raw.freeze();

        let packet = try_parse_server_packet(&mut input).unwrap().unwrap();
        assert_eq!(packet.payload[0], PREFIX_END_RESPONSE);
        assert!(input.is_empty());
    }

    #[test]
    fn bad_signature_is_garbage() {
        let mut input = Bytes::from_static(b"XY\x00\x01\x05");
        assert!(try_parse_server_packet(&mut input).is_err());
    }

    #[test]
    fn body_chunk_packet_layout() {
        let packet = body_chunk_packet(b"data");
        assert_eq!(&packet[..2], &[0x12, 0x34]);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), 6);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 4);
        assert_eq!(&packet[6..], b"data");
    }
}
