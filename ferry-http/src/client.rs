//! HTTP/1.1 upstream client, generic over monoio stream types so the
//! same code drives TCP backends and local-HTTP unix sockets.

use crate::chunk::{ChunkEvent, ChunkedDecoder};
use bytes::{Bytes, BytesMut};
use ferry_core::FerryError;
use ferry_core::error::UpstreamErrorKind;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt};
use std::time::Duration;

const READ_CHUNK: usize = 64 * 1024;
const MAX_RESPONSE_HEADER: usize = 64 * 1024;

/// How the response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Empty,
    ContentLength(u64),
    Chunked,
    UntilEof,
}

/// Parsed response status line and headers.
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub framing: Framing,
    /// Whether the upstream connection may be pooled after the body
    /// has been drained.
    pub reusable: bool,
}

/// One leased upstream connection with read-ahead buffering.
pub struct ClientConnection<S> {
    stream: S,
    leftover: Bytes,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S: AsyncReadRent + AsyncWriteRent> ClientConnection<S> {
    pub fn new(stream: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        ClientConnection {
            stream,
            leftover: Bytes::new(),
            read_timeout,
            write_timeout,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Split into the stream and any read-ahead bytes (upgrade
    /// tunnels must not lose them).
    pub fn into_parts(self) -> (S, Bytes) {
        (self.stream, self.leftover)
    }

    /// Serialize and send a request.  `body` is sent with a
    /// Content-Length header when non-empty.
    pub async fn send_request(
        &mut self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(), FerryError> {
        let mut buf = Vec::with_capacity(512 + body.len());
        buf.extend_from_slice(method.as_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(path.as_bytes());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in headers {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if !body.is_empty() || matches!(*method, Method::POST | Method::PUT) {
            let mut itoa_buf = itoa::Buffer::new();
            buf.extend_from_slice(b"content-length: ");
            buf.extend_from_slice(itoa_buf.format(body.len()).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        if headers.contains_key(http::header::UPGRADE) {
            buf.extend_from_slice(b"connection: upgrade\r\n\r\n");
        } else {
            buf.extend_from_slice(b"connection: keep-alive\r\n\r\n");
        }
        buf.extend_from_slice(body);

        let write = self.stream.write_all(buf);
        let (res, _) = monoio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| FerryError::upstream(UpstreamErrorKind::Timeout, "write timeout"))?;
        res.map_err(|e| {
            FerryError::upstream(UpstreamErrorKind::Io, format!("write error: {}", e))
        })?;
        Ok(())
    }

    async fn fill(&mut self) -> Result<usize, FerryError> {
        let buf = vec![0u8; READ_CHUNK];
        let read = self.stream.read(buf);
        let (res, buf) = monoio::time::timeout(self.read_timeout, read)
            .await
            .map_err(|_| FerryError::upstream(UpstreamErrorKind::Timeout, "read timeout"))?;
        let n = res.map_err(|e| {
            FerryError::upstream(UpstreamErrorKind::Io, format!("read error: {}", e))
        })?;
        if n > 0 {
            let mut joined = BytesMut::with_capacity(self.leftover.len() + n);
            joined.extend_from_slice(&self.leftover);
            joined.extend_from_slice(&buf[..n]);
            self.leftover = joined.freeze();
        }
        Ok(n)
    }

    /// Read and parse the response head.  `head_request` marks HEAD
    /// requests, whose responses never carry a body.
    pub async fn read_response_head(
        &mut self,
        head_request: bool,
    ) -> Result<ResponseHead, FerryError> {
        let mut got_any = !self.leftover.is_empty();
        loop {
            if !self.leftover.is_empty() {
                let mut headers_raw = [httparse::EMPTY_HEADER; 64];
                let mut resp = httparse::Response::new(&mut headers_raw);
                match resp.parse(&self.leftover) {
                    Ok(httparse::Status::Complete(header_len)) => {
                        let head = self.build_head(&resp, head_request)?;
                        self.leftover = self.leftover.slice(header_len..);
                        return Ok(head);
                    }
                    Ok(httparse::Status::Partial) => {
                        if self.leftover.len() > MAX_RESPONSE_HEADER {
                            return Err(FerryError::upstream(
                                UpstreamErrorKind::Garbage,
                                "response headers too large",
                            ));
                        }
                    }
                    Err(e) => {
                        return Err(FerryError::upstream(
                            UpstreamErrorKind::Garbage,
                            format!("malformed response: {}", e),
                        ));
                    }
                }
            }

            let n = self.fill().await?;
            if n == 0 {
                return Err(if got_any {
                    FerryError::upstream(
                        UpstreamErrorKind::Premature,
                        "connection closed during response headers",
                    )
                } else {
                    FerryError::upstream(
                        UpstreamErrorKind::Refused,
                        "connection closed before response",
                    )
                });
            }
            got_any = true;
        }
    }

    fn build_head(
        &self,
        resp: &httparse::Response<'_, '_>,
        head_request: bool,
    ) -> Result<ResponseHead, FerryError> {
        let code = resp.code.ok_or_else(|| {
            FerryError::upstream(UpstreamErrorKind::Garbage, "response without status")
        })?;
        let status = StatusCode::from_u16(code).map_err(|_| {
            FerryError::upstream(
                UpstreamErrorKind::Garbage,
                format!("invalid status code {}", code),
            )
        })?;

        let mut headers = HeaderMap::with_capacity(resp.headers.len());
        let mut content_length: Option<u64> = None;
        let mut chunked = false;
        let mut close = resp.version == Some(0);

        for h in resp.headers.iter() {
            if h.name.is_empty() {
                break;
            }
            let name = HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| {
                FerryError::upstream(UpstreamErrorKind::Garbage, "invalid header name")
            })?;
            let value = HeaderValue::from_bytes(h.value).map_err(|_| {
                FerryError::upstream(UpstreamErrorKind::Garbage, "invalid header value")
            })?;

            if name == http::header::TRANSFER_ENCODING {
                chunked = value
                    .to_str()
                    .map(|v| v.eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false);
            } else if name == http::header::CONTENT_LENGTH {
                content_length = value.to_str().ok().and_then(|v| v.parse().ok());
                if content_length.is_none() {
                    return Err(FerryError::upstream(
                        UpstreamErrorKind::Garbage,
                        "invalid Content-Length in response",
                    ));
                }
            } else if name == http::header::CONNECTION {
                if let Ok(v) = value.to_str() {
                    if crate::util::http_list_contains(v, "close") {
                        close = true;
                    }
                }
            }
            headers.append(name, value);
        }

        let empty_body = head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        let framing = if empty_body {
            Framing::Empty
        } else if chunked {
            Framing::Chunked
        } else if let Some(n) = content_length {
            if n == 0 { Framing::Empty } else { Framing::ContentLength(n) }
        } else {
            close = true;
            Framing::UntilEof
        };

        Ok(ResponseHead {
            status,
            headers,
            framing,
            reusable: !close,
        })
    }

    /// Read the next chunk of the response body.  Returns `None` when
    /// the body is complete; the connection is then reusable (subject
    /// to the head's `reusable` flag).
    pub async fn next_body_chunk(
        &mut self,
        state: &mut BodyState,
    ) -> Result<Option<Bytes>, FerryError> {
        loop {
            match state {
                BodyState::Done => return Ok(None),
                BodyState::Remaining(remaining) => {
                    if self.leftover.is_empty() {
                        let n = self.fill().await?;
                        if n == 0 {
                            return Err(FerryError::upstream(
                                UpstreamErrorKind::Premature,
                                "connection closed mid-body",
                            ));
                        }
                    }
                    let take = (self.leftover.len() as u64).min(*remaining) as usize;
                    let chunk = self.leftover.split_to(take);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        *state = BodyState::Done;
                    }
                    return Ok(Some(chunk));
                }
                BodyState::Chunked(decoder) => {
                    if self.leftover.is_empty() {
                        let n = self.fill().await?;
                        if n == 0 {
                            return Err(FerryError::upstream(
                                UpstreamErrorKind::Premature,
                                "connection closed mid-chunked-body",
                            ));
                        }
                    }
                    match decoder.feed(&mut self.leftover) {
                        ChunkEvent::Data(d) => return Ok(Some(d)),
                        ChunkEvent::End => {
                            *state = BodyState::Done;
                            return Ok(None);
                        }
                        ChunkEvent::NeedMore => continue,
                        ChunkEvent::Malformed => {
                            return Err(FerryError::upstream(
                                UpstreamErrorKind::Garbage,
                                "malformed chunked body",
                            ));
                        }
                    }
                }
                BodyState::UntilEof => {
                    if !self.leftover.is_empty() {
                        return Ok(Some(std::mem::take(&mut self.leftover)));
                    }
                    let n = self.fill().await?;
                    if n == 0 {
                        *state = BodyState::Done;
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// Progress of reading one response body.
pub enum BodyState {
    Remaining(u64),
    Chunked(ChunkedDecoder),
    UntilEof,
    Done,
}

impl BodyState {
    pub fn for_framing(framing: Framing) -> Self {
        match framing {
            Framing::Empty => BodyState::Done,
            Framing::ContentLength(n) => BodyState::Remaining(n),
            Framing::Chunked => BodyState::Chunked(ChunkedDecoder::new()),
            Framing::UntilEof => BodyState::UntilEof,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, BodyState::Done)
    }
}
