//! Web Application Socket client.
//!
//! The WAS control protocol uses the same `{u16 length, u16 command}`
//! framing as the translation protocol.  The original transport
//! multiplexes three file descriptors (control, input, output); this
//! client carries the body inline in DATA packets over the single
//! control stream instead.

use super::BackendResponse;
use crate::instance::Instance;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ferry_core::FerryError;
use ferry_core::address::CgiAddress;
use ferry_core::error::UpstreamErrorKind;
use ferry_http::ResponseBody;
use http_crate::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::UnixStream;

use ::http as http_crate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
enum WasCommand {
    Nop = 0,
    Request = 1,
    Method = 2,
    Uri = 3,
    ScriptName = 4,
    PathInfo = 5,
    QueryString = 6,
    Header = 7,
    Parameter = 8,
    Status = 9,
    NoData = 10,
    Data = 11,
    Length = 12,
    Stop = 13,
    Premature = 14,
}

impl WasCommand {
    fn from_u16(v: u16) -> Option<WasCommand> {
        use WasCommand::*;
        Some(match v {
            0 => Nop,
            1 => Request,
            2 => Method,
            3 => Uri,
            4 => ScriptName,
            5 => PathInfo,
            6 => QueryString,
            7 => Header,
            8 => Parameter,
            9 => Status,
            10 => NoData,
            11 => Data,
            12 => Length,
            13 => Stop,
            14 => Premature,
            _ => return None,
        })
    }
}

fn put_packet(out: &mut BytesMut, command: WasCommand, payload: &[u8]) {
    out.put_u16_le(payload.len() as u16);
    out.put_u16_le(command as u16);
    out.put_slice(payload);
}

fn garbage(msg: &str) -> FerryError {
    FerryError::upstream(UpstreamErrorKind::Garbage, msg.to_string())
}

fn build_request(address: &CgiAddress, method: &Method, headers: &HeaderMap, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(512 + body.len());
    put_packet(&mut out, WasCommand::Request, b"");
    put_packet(&mut out, WasCommand::Method, method.as_str().as_bytes());
    put_packet(&mut out, WasCommand::Uri, address.cgi_uri().as_bytes());
    if let Some(script_name) = &address.script_name {
        put_packet(&mut out, WasCommand::ScriptName, script_name.as_bytes());
    }
    if let Some(path_info) = &address.path_info {
        put_packet(&mut out, WasCommand::PathInfo, path_info.as_bytes());
    }
    if let Some(query) = &address.query_string {
        put_packet(&mut out, WasCommand::QueryString, query.as_bytes());
    }
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            let line = format!("{}:{}", name.as_str(), value);
            put_packet(&mut out, WasCommand::Header, line.as_bytes());
        }
    }
    for pair in &address.args {
        put_packet(&mut out, WasCommand::Parameter, pair.as_bytes());
    }

    if body.is_empty() {
        put_packet(&mut out, WasCommand::NoData, b"");
    } else {
        put_packet(&mut out, WasCommand::Length, &(body.len() as u64).to_le_bytes());
        for chunk in body.chunks(u16::MAX as usize) {
            put_packet(&mut out, WasCommand::Data, chunk);
        }
    }
    out
}

struct Packet {
    command: WasCommand,
    payload: Bytes,
}

fn try_parse_packet(input: &mut Bytes) -> Result<Option<Packet>, FerryError> {
    if input.len() < 4 {
        return Ok(None);
    }
    let length = u16::from_le_bytes([input[0], input[1]]) as usize;
    let command = u16::from_le_bytes([input[2], input[3]]);
    if input.len() < 4 + length {
        return Ok(None);
    }
    input.advance(4);
    let payload = input.split_to(length);
    let command = WasCommand::from_u16(command)
        .ok_or_else(|| garbage(&format!("unknown WAS command {}", command)))?;
    Ok(Some(Packet { command, payload }))
}

/// Send one request to a WAS daemon listening on the unix socket named
/// by the address list.
pub async fn send_was_request(
    instance: &Instance,
    address: &CgiAddress,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<BackendResponse, FerryError> {
    let Some(socket_path) = address.address_list.first() else {
        return Err(FerryError::Internal(format!(
            "no WAS server configured for {}",
            address.path
        )));
    };

    let mut stream = UnixStream::connect(socket_path.as_str()).await.map_err(|e| {
        FerryError::upstream(
            UpstreamErrorKind::Refused,
            format!("connect to WAS socket {} failed: {}", socket_path, e),
        )
    })?;

    let request = build_request(address, method, headers, &body);
    let write = stream.write_all(request.to_vec());
    let (res, _) = monoio::time::timeout(instance.upstream_write_timeout(), write)
        .await
        .map_err(|_| FerryError::upstream(UpstreamErrorKind::Timeout, "WAS write timeout"))?;
    res.map_err(|e| {
        FerryError::upstream(UpstreamErrorKind::Io, format!("WAS write error: {}", e))
    })?;

    read_response(instance, &mut stream).await
}

async fn read_response(
    instance: &Instance,
    stream: &mut UnixStream,
) -> Result<BackendResponse, FerryError> {
    let cap = instance.config.proxy.filter_buffer_size;
    let mut pending = Bytes::new();
    let mut got_any = false;

    let mut status = None;
    let mut headers = HeaderMap::new();
    let mut declared_length: Option<u64> = None;
    let mut body = BytesMut::new();
    let mut no_data = false;

    loop {
        while let Some(packet) = try_parse_packet(&mut pending)? {
            match packet.command {
                WasCommand::Nop => {}
                WasCommand::Status => {
                    if packet.payload.len() != 2 {
                        return Err(garbage("malformed WAS STATUS packet"));
                    }
                    let code = u16::from_le_bytes([packet.payload[0], packet.payload[1]]);
                    status = Some(
                        StatusCode::from_u16(code)
                            .map_err(|_| garbage("invalid WAS status code"))?,
                    );
                }
                WasCommand::Header => {
                    let line = String::from_utf8(packet.payload.to_vec())
                        .map_err(|_| garbage("non-UTF8 WAS header"))?;
                    let Some(colon) = line.find(':') else {
                        return Err(garbage("malformed WAS header"));
                    };
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(line[..colon].trim().as_bytes()),
                        HeaderValue::from_str(line[colon + 1..].trim()),
                    ) {
                        headers.append(name, value);
                    }
                }
                WasCommand::Length => {
                    if packet.payload.len() != 8 {
                        return Err(garbage("malformed WAS LENGTH packet"));
                    }
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(&packet.payload);
                    declared_length = Some(u64::from_le_bytes(raw));
                }
                WasCommand::Data => {
                    if body.len() + packet.payload.len() > cap {
                        return Err(FerryError::upstream(
                            UpstreamErrorKind::Unspecified,
                            "WAS response too large",
                        ));
                    }
                    body.extend_from_slice(&packet.payload);
                }
                WasCommand::NoData => no_data = true,
                WasCommand::Premature => {
                    return Err(FerryError::upstream(
                        UpstreamErrorKind::Premature,
                        "WAS daemon aborted the response",
                    ));
                }
                WasCommand::Stop
                | WasCommand::Request
                | WasCommand::Method
                | WasCommand::Uri
                | WasCommand::ScriptName
                | WasCommand::PathInfo
                | WasCommand::QueryString
                | WasCommand::Parameter => {
                    return Err(garbage("misplaced WAS request packet in response"));
                }
            }

            let complete = status.is_some()
                && (no_data
                    || declared_length
                        .map(|n| body.len() as u64 >= n)
                        .unwrap_or(false));
            if complete {
                let status = status.unwrap();
                return Ok(BackendResponse::new(
                    status,
                    headers,
                    ResponseBody::from(body.freeze()),
                ));
            }
        }

        let buf = vec![0u8; 16 * 1024];
        let read = stream.read(buf);
        let (res, buf) = monoio::time::timeout(instance.upstream_read_timeout(), read)
            .await
            .map_err(|_| FerryError::upstream(UpstreamErrorKind::Timeout, "WAS read timeout"))?;
        let n = res.map_err(|e| {
            FerryError::upstream(UpstreamErrorKind::Io, format!("WAS read error: {}", e))
        })?;
        if n == 0 {
            return Err(FerryError::upstream(
                if got_any {
                    UpstreamErrorKind::Premature
                } else {
                    UpstreamErrorKind::Refused
                },
                "WAS daemon closed the connection",
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

    #[test]
    fn request_packet_sequence() {
        let mut address = CgiAddress::new("/srv/app/was");
        address.script_name = Some("/app".into());
        address.args = vec!["KEY=value".into()];
        let mut headers = HeaderMap::new();
        headers.insert("accept", "*/*".parse().unwrap());

        let raw = build_request(&address, &Method::GET, &headers, b"");
        let mut raw = raw.freeze();

        let mut commands = Vec::new();
        while let Some(p) = try_parse_packet(&mut raw).unwrap() {
            commands.push(p.command);
        }
        assert_eq!(commands[0], WasCommand::Request);
        assert_eq!(commands[1], WasCommand::Method);
        assert_eq!(commands[2], WasCommand::Uri);
        assert!(commands.contains(&WasCommand::ScriptName));
        assert!(commands.contains(&WasCommand::Header));
        assert!(commands.contains(&WasCommand::Parameter));
        assert_eq!(*commands.last().unwrap(), WasCommand::NoData);
    }

    #[test]
    fn request_with_body_sends_length_and_data() {
        let address = CgiAddress::new("/srv/app/was");
        let raw = build_request(&address, &Method::POST, &HeaderMap::new(), b"hello");
        let mut raw = raw.freeze();

        let mut saw_length = None;
        let mut data = Vec::new();
        while let Some(p) = try_parse_packet(&mut raw).unwrap() {
            match p.command {
                WasCommand::Length => {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&p.payload);
                    saw_length = Some(u64::from_le_bytes(b));
                }
                WasCommand::Data => data.extend_from_slice(&p.payload),
                _ => {}
            }
        }
        assert_eq!(saw_length, Some(5));
        assert_eq!(data, b"hello");
    }

    #[test]
    fn unknown_command_is_garbage() {
        let mut raw = BytesMut::new();
        raw.put_u16_le(0);
        raw.put_u16_le(999);
        let mut input = raw.freeze();
        assert!(try_parse_packet(&mut input).is_err());
    }
}
