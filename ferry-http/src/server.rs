//! HTTP/1.1 server engine.
//!
//! One `HttpConnection` per accepted socket.  The engine parses
//! requests off the stream, hands them to the request handler, and
//! streams the response back, maintaining keep-alive, the connection
//! score, and the per-phase timeouts.

use crate::body::ResponseBody;
use crate::chunk::{self, ChunkEvent, ChunkedDecoder};
use crate::date::format_http_date;
use bytes::{Bytes, BytesMut};
use ferry_core::FerryError;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use std::cell::Cell;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

const MAX_HEADER_TOTAL: usize = 64 * 1024;
const MAX_HEADER_LINE: usize = 8 * 1024;
const READ_CHUNK: usize = 16 * 1024;

const HTTP09_NOTICE: &[u8] = b"This server requires HTTP 1.1.";
const RESP_400: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const RESP_413: &[u8] =
    b"HTTP/1.1 413 Payload Too Large\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
const RESP_417: &[u8] = b"HTTP/1.1 417 Expectation Failed\r\ncontent-length: 24\r\nconnection: close\r\n\r\nUnrecognized expectation";
const RESP_100: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// The score of a connection, used under overload to decide which
/// connections to drop first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Score {
    /// Accepted, but not a byte received yet.
    New,
    /// First request in flight.
    First,
    /// At least one request completed with a non-2xx status, none 2xx.
    Error,
    /// At least one request completed with a 2xx status.
    Success,
}

/// Per-connection state shared with the worker's connection registry,
/// so the drop policy can rank and mark connections without owning
/// them.
pub struct ConnState {
    pub score: Cell<Score>,
    pub closing: Cell<bool>,
}

impl ConnState {
    pub fn new() -> Rc<Self> {
        Rc::new(ConnState {
            score: Cell::new(Score::New),
            closing: Cell::new(false),
        })
    }
}

/// Engine tunables with the documented defaults.
#[derive(Debug, Clone)]
pub struct ServerTunables {
    pub idle_timeout: Duration,
    pub header_timeout: Duration,
    pub body_timeout: Duration,
    pub write_timeout: Duration,
    pub max_body_size: usize,
    pub generate_date_header: bool,
}

impl Default for ServerTunables {
    fn default() -> Self {
        ServerTunables {
            idle_timeout: Duration::from_secs(30),
            header_timeout: Duration::from_secs(20),
            body_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            max_body_size: 1 << 20,
            generate_date_header: true,
        }
    }
}

/// A fully parsed request, body included.
pub struct ServerRequest {
    pub method: Method,
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub http_1_0: bool,
    pub upgrade: bool,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

impl ServerRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// A bidirectional relay installed by a 101 response.
#[async_trait::async_trait(?Send)]
pub trait Tunnel {
    async fn run(self: Box<Self>, client: TcpStream, client_leftover: Bytes);
}

/// What the handler wants sent back.
pub struct HandlerResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    /// Present on 101 responses: the engine hands the client socket
    /// over after writing the response head.
    pub tunnel: Option<Box<dyn Tunnel>>,
}

impl HandlerResponse {
    pub fn new(status: StatusCode) -> Self {
        HandlerResponse {
            status,
            headers: HeaderMap::new(),
            body: ResponseBody::Empty,
            tunnel: None,
        }
    }

    pub fn message(status: StatusCode, msg: impl Into<String>) -> Self {
        let mut resp = HandlerResponse::new(status);
        resp.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );
        resp.body = ResponseBody::text(msg);
        resp
    }
}

/// The upstream side of the engine.
pub trait RequestHandler {
    fn handle_request(
        &self,
        request: ServerRequest,
    ) -> impl Future<Output = HandlerResponse>;

    #[allow(clippy::too_many_arguments)]
    fn log_request(
        &self,
        _peer: SocketAddr,
        _method: &Method,
        _uri: &str,
        _status: StatusCode,
        _bytes_in: u64,
        _bytes_out: u64,
        _duration: Duration,
    ) {
    }
}

enum HeadOutcome {
    /// (request line + headers, bytes consumed)
    Complete(ParsedHead, usize),
    Partial,
    /// The client speaks HTTP/0.9 or earlier.
    AncientProtocol,
    Malformed(&'static str),
}

struct ParsedHead {
    method: Method,
    uri: String,
    headers: HeaderMap,
    http_1_0: bool,
}

/// The accepted request verbs: RFC 7231 plus WebDAV.
fn method_allowed(m: &Method) -> bool {
    if matches!(
        *m,
        Method::GET
            | Method::HEAD
            | Method::POST
            | Method::PUT
            | Method::DELETE
            | Method::OPTIONS
            | Method::TRACE
            | Method::PATCH
    ) {
        return true;
    }
    matches!(
        m.as_str(),
        "PROPFIND" | "PROPPATCH" | "MKCOL" | "MOVE" | "COPY" | "LOCK" | "UNLOCK" | "REPORT"
    )
}

fn parse_request_head(acc: &[u8]) -> HeadOutcome {
    // refuse HTTP/0.9 before handing the line to httparse
    if let Some(eol) = acc.iter().position(|&b| b == b'\n') {
        let line = &acc[..eol];
        if !line.windows(6).any(|w| w == b" HTTP/") {
            return HeadOutcome::AncientProtocol;
        }
    }

    let mut headers_raw = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers_raw);
    match req.parse(acc) {
        Ok(httparse::Status::Complete(consumed)) => {
            let Some(method) = req.method.and_then(|m| Method::from_bytes(m.as_bytes()).ok())
            else {
                return HeadOutcome::Malformed("unrecognized request method");
            };
            if !method_allowed(&method) {
                return HeadOutcome::Malformed("unrecognized request method");
            }
            let Some(path) = req.path else {
                return HeadOutcome::Malformed("missing request URI");
            };
            let http_1_0 = req.version == Some(0);

            let mut headers = HeaderMap::with_capacity(req.headers.len());
            for h in req.headers.iter() {
                if h.name.is_empty() {
                    break;
                }
                let Ok(name) = HeaderName::from_bytes(h.name.as_bytes()) else {
                    return HeadOutcome::Malformed("invalid header name");
                };
                // strip trailing whitespace from the value
                let mut value = h.value;
                while let [rest @ .., last] = value {
                    if *last == b' ' || *last == b'\t' {
                        value = rest;
                    } else {
                        break;
                    }
                }
                let Ok(value) = HeaderValue::from_bytes(value) else {
                    return HeadOutcome::Malformed("invalid header value");
                };
                headers.append(name, value);
            }

            HeadOutcome::Complete(
                ParsedHead {
                    method,
                    uri: path.to_string(),
                    headers,
                    http_1_0,
                },
                consumed,
            )
        }
        Ok(httparse::Status::Partial) => {
            // enforce the per-line limit on the unfinished tail
            let tail_start = acc
                .iter()
                .rposition(|&b| b == b'\n')
                .map(|i| i + 1)
                .unwrap_or(0);
            if acc.len() - tail_start > MAX_HEADER_LINE {
                return HeadOutcome::Malformed("request header line too large");
            }
            HeadOutcome::Partial
        }
        Err(_) => HeadOutcome::Malformed("malformed request"),
    }
}

enum BodyPlan {
    None,
    ContentLength(u64),
    Chunked,
}

/// Reason serve() ended; only used for logging.
#[derive(Debug)]
pub enum ConnectionEnd {
    /// Clean end of stream or keep-alive exhausted.
    Closed,
    /// A protocol violation from the client.
    ProtocolError(&'static str),
    /// Socket error (reset, broken pipe) — treated as a normal cancel.
    Io(std::io::Error),
    /// The drop policy marked this connection.
    Dropped,
    /// The connection was upgraded and the tunnel has completed.
    Upgraded,
}

pub struct HttpConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    state: Rc<ConnState>,
    tunables: ServerTunables,
    leftover: BytesMut,
    graceful: bool,
    bytes_in: u64,
    bytes_out: u64,
}

impl HttpConnection {
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        state: Rc<ConnState>,
        tunables: ServerTunables,
    ) -> Self {
        HttpConnection {
            stream,
            peer_addr,
            local_addr,
            state,
            tunables,
            leftover: BytesMut::new(),
            graceful: false,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Disable keep-alive; the current request finishes, then the
    /// connection drains and closes.
    pub fn close_graceful(&mut self) {
        self.graceful = true;
    }

    /// Drive the connection until it ends.
    pub async fn serve<H: RequestHandler>(mut self, handler: &H) -> ConnectionEnd {
        loop {
            if self.state.closing.get() {
                return ConnectionEnd::Dropped;
            }

            let head = match self.read_head().await {
                Ok(Some(head)) => head,
                Ok(None) => return ConnectionEnd::Closed,
                Err(end) => return end,
            };

            // new request boundary: reset the score
            match self.state.score.get() {
                Score::New | Score::Success => self.state.score.set(Score::First),
                _ => {}
            }

            let started = Instant::now();

            // Expect handling
            let expect = head
                .headers
                .get(http::header::EXPECT)
                .and_then(|v| v.to_str().ok());
            let expect_100 = matches!(expect, Some("100-continue"));
            if expect.is_some() && !expect_100 {
                let _ = self.write_raw(RESP_417).await;
                return ConnectionEnd::Closed;
            }

            let upgrade = head
                .headers
                .get(http::header::CONNECTION)
                .and_then(|v| v.to_str().ok())
                .map(|v| crate::util::http_list_contains(v, "upgrade"))
                .unwrap_or(false)
                && head.headers.contains_key(http::header::UPGRADE);

            let mut keep_alive = !head.http_1_0 && !self.graceful;
            if let Some(conn) = head
                .headers
                .get(http::header::CONNECTION)
                .and_then(|v| v.to_str().ok())
            {
                if crate::util::http_list_contains(conn, "close") {
                    keep_alive = false;
                }
            }

            let plan = match self.body_plan(&head, upgrade) {
                Ok(plan) => plan,
                Err(msg) => {
                    let _ = self.write_raw(RESP_400).await;
                    return ConnectionEnd::ProtocolError(msg);
                }
            };

            let body = if upgrade {
                keep_alive = false;
                Bytes::new()
            } else {
                if expect_100 && !matches!(plan, BodyPlan::None) {
                    if self.write_raw(RESP_100).await.is_err() {
                        return ConnectionEnd::Closed;
                    }
                }
                match self.read_body(&plan).await {
                    Ok(body) => body,
                    Err(end) => return end,
                }
            };

            let request = ServerRequest {
                method: head.method.clone(),
                uri: head.uri.clone(),
                headers: head.headers,
                body,
                http_1_0: head.http_1_0,
                upgrade,
                peer_addr: self.peer_addr,
                local_addr: self.local_addr,
            };
            let bytes_in_before = self.bytes_in;
            let bytes_out_before = self.bytes_out;

            let mut response = handler.handle_request(request).await;
            let status = response.status;

            if status == StatusCode::SWITCHING_PROTOCOLS {
                if let Some(tunnel) = response.tunnel.take() {
                    if self
                        .write_response_head(status, &response.headers, None, false, false)
                        .await
                        .is_err()
                    {
                        return ConnectionEnd::Closed;
                    }
                    let leftover = self.leftover.split().freeze();
                    tunnel.run(self.stream, leftover).await;
                    return ConnectionEnd::Upgraded;
                }
            }

            let keep_alive = keep_alive && !self.graceful;
            match self
                .write_full_response(&head.method, head.http_1_0, keep_alive, response)
                .await
            {
                Ok(()) => {}
                Err(ConnectionEnd::Io(e)) => return ConnectionEnd::Io(e),
                Err(end) => return end,
            }

            // score accounting
            if status.is_success() {
                self.state.score.set(Score::Success);
            } else if self.state.score.get() != Score::Success {
                self.state.score.set(Score::Error);
            }

            handler.log_request(
                self.peer_addr,
                &head.method,
                &head.uri,
                status,
                self.bytes_in - bytes_in_before,
                self.bytes_out - bytes_out_before,
                started.elapsed(),
            );

            if !keep_alive {
                return ConnectionEnd::Closed;
            }
        }
    }

    fn body_plan(&self, head: &ParsedHead, upgrade: bool) -> Result<BodyPlan, &'static str> {
        let chunked = head
            .headers
            .get(http::header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false);

        if upgrade {
            if head.headers.contains_key(http::header::CONTENT_LENGTH) {
                return Err("cannot upgrade with Content-Length request header");
            }
            if chunked {
                return Err("cannot upgrade chunked request");
            }
            return Ok(BodyPlan::None);
        }

        if chunked {
            return Ok(BodyPlan::Chunked);
        }

        match head.headers.get(http::header::CONTENT_LENGTH) {
            Some(v) => {
                let n: u64 = v
                    .to_str()
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or("invalid Content-Length header in HTTP request")?;
                if n == 0 {
                    Ok(BodyPlan::None)
                } else {
                    Ok(BodyPlan::ContentLength(n))
                }
            }
            None => Ok(BodyPlan::None),
        }
    }

    /// Read until a complete request head is buffered.  `Ok(None)` is
    /// a clean EOF between requests.
    async fn read_head(&mut self) -> Result<Option<ParsedHead>, ConnectionEnd> {
        let mut first_byte_at: Option<Instant> = if self.leftover.is_empty() {
            None
        } else {
            Some(Instant::now())
        };

        loop {
            if !self.leftover.is_empty() {
                if self.leftover.len() > MAX_HEADER_TOTAL {
                    let _ = self.write_raw(RESP_400).await;
                    return Err(ConnectionEnd::ProtocolError("too many request headers"));
                }
                match parse_request_head(&self.leftover) {
                    HeadOutcome::Complete(head, consumed) => {
                        let _ = self.leftover.split_to(consumed);
                        return Ok(Some(head));
                    }
                    HeadOutcome::Partial => {}
                    HeadOutcome::AncientProtocol => {
                        let _ = self.write_raw(HTTP09_NOTICE).await;
                        return Err(ConnectionEnd::ProtocolError("HTTP/0.9 rejected"));
                    }
                    HeadOutcome::Malformed(msg) => {
                        let _ = self.write_raw(RESP_400).await;
                        return Err(ConnectionEnd::ProtocolError(msg));
                    }
                }
            }

            let timeout = match first_byte_at {
                None => self.tunables.idle_timeout,
                Some(start) => {
                    let elapsed = start.elapsed();
                    if elapsed >= self.tunables.header_timeout {
                        return Err(ConnectionEnd::ProtocolError("request header timeout"));
                    }
                    self.tunables.header_timeout - elapsed
                }
            };

            let n = match self.fill(timeout).await {
                Ok(n) => n,
                Err(FillError::Timeout) => {
                    return if first_byte_at.is_none() {
                        Ok(None)
                    } else {
                        Err(ConnectionEnd::ProtocolError("request header timeout"))
                    };
                }
                Err(FillError::Io(e)) => return Err(ConnectionEnd::Io(e)),
            };
            if n == 0 {
                return if self.leftover.is_empty() {
                    Ok(None)
                } else {
                    Err(ConnectionEnd::ProtocolError("eof during request headers"))
                };
            }
            if first_byte_at.is_none() {
                first_byte_at = Some(Instant::now());
            }
        }
    }

    async fn read_body(&mut self, plan: &BodyPlan) -> Result<Bytes, ConnectionEnd> {
        match plan {
            BodyPlan::None => Ok(Bytes::new()),
            BodyPlan::ContentLength(n) => {
                let n = *n;
                if n > self.tunables.max_body_size as u64 {
                    let _ = self.write_raw(RESP_413).await;
                    return Err(ConnectionEnd::ProtocolError("request body too large"));
                }
                let mut body = BytesMut::with_capacity(n as usize);
                loop {
                    let take = (self.leftover.len() as u64).min(n - body.len() as u64) as usize;
                    body.extend_from_slice(&self.leftover.split_to(take));
                    if body.len() as u64 == n {
                        return Ok(body.freeze());
                    }
                    match self.fill(self.tunables.body_timeout).await {
                        Ok(0) => {
                            return Err(ConnectionEnd::ProtocolError("eof during request body"));
                        }
                        Ok(_) => {}
                        Err(FillError::Timeout) => {
                            return Err(ConnectionEnd::ProtocolError("request body timeout"));
                        }
                        Err(FillError::Io(e)) => return Err(ConnectionEnd::Io(e)),
                    }
                }
            }
            BodyPlan::Chunked => {
                let mut decoder = ChunkedDecoder::new();
                let mut body = BytesMut::new();
                loop {
                    let mut input = self.leftover.split().freeze();
                    let mut ended = false;
                    loop {
                        match decoder.feed(&mut input) {
                            ChunkEvent::Data(d) => {
                                if body.len() + d.len() > self.tunables.max_body_size {
                                    let _ = self.write_raw(RESP_413).await;
                                    return Err(ConnectionEnd::ProtocolError(
                                        "request body too large",
                                    ));
                                }
                                body.extend_from_slice(&d);
                            }
                            ChunkEvent::End => {
                                ended = true;
                                break;
                            }
                            ChunkEvent::NeedMore => break,
                            ChunkEvent::Malformed => {
                                let _ = self.write_raw(RESP_400).await;
                                return Err(ConnectionEnd::ProtocolError(
                                    "malformed chunked request body",
                                ));
                            }
                        }
                    }
                    // retain pipelined bytes after the final chunk
                    self.leftover.extend_from_slice(&input);
                    if ended {
                        return Ok(body.freeze());
                    }
                    match self.fill(self.tunables.body_timeout).await {
                        Ok(0) => {
                            return Err(ConnectionEnd::ProtocolError(
                                "eof during chunked request body",
                            ));
                        }
                        Ok(_) => {}
                        Err(FillError::Timeout) => {
                            return Err(ConnectionEnd::ProtocolError("request body timeout"));
                        }
                        Err(FillError::Io(e)) => return Err(ConnectionEnd::Io(e)),
                    }
                }
            }
        }
    }

    async fn fill(&mut self, timeout: Duration) -> Result<usize, FillError> {
        let buf = vec![0u8; READ_CHUNK];
        let read = self.stream.read(buf);
        let (res, buf) = monoio::time::timeout(timeout, read)
            .await
            .map_err(|_| FillError::Timeout)?;
        let n = res.map_err(FillError::Io)?;
        if n > 0 {
            self.leftover.extend_from_slice(&buf[..n]);
            self.bytes_in += n as u64;
        }
        Ok(n)
    }

    async fn write_raw(&mut self, data: &[u8]) -> Result<(), std::io::Error> {
        let write = self.stream.write_all(data.to_vec());
        let (res, _) = monoio::time::timeout(self.tunables.write_timeout, write)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))?;
        let n = res?;
        self.bytes_out += n as u64;
        Ok(())
    }

    async fn write_response_head(
        &mut self,
        status: StatusCode,
        headers: &HeaderMap,
        content_length: Option<u64>,
        chunked: bool,
        close: bool,
    ) -> Result<(), std::io::Error> {
        let mut buf = Vec::with_capacity(512);
        buf.extend_from_slice(b"HTTP/1.1 ");
        let mut itoa_buf = itoa::Buffer::new();
        buf.extend_from_slice(itoa_buf.format(status.as_u16()).as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        buf.extend_from_slice(b"\r\n");

        for (name, value) in headers {
            // framing headers are decided here, not by the handler
            if name == http::header::CONTENT_LENGTH || name == http::header::TRANSFER_ENCODING {
                continue;
            }
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        if self.tunables.generate_date_header && !headers.contains_key(http::header::DATE) {
            buf.extend_from_slice(b"date: ");
            buf.extend_from_slice(format_http_date(SystemTime::now()).as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        if let Some(n) = content_length {
            buf.extend_from_slice(b"content-length: ");
            buf.extend_from_slice(itoa_buf.format(n).as_bytes());
            buf.extend_from_slice(b"\r\n");
        } else if chunked {
            buf.extend_from_slice(b"transfer-encoding: chunked\r\n");
        }

        if close {
            buf.extend_from_slice(b"connection: close\r\n");
        }

        buf.extend_from_slice(b"\r\n");
        let write = self.stream.write_all(buf);
        let (res, _) = monoio::time::timeout(self.tunables.write_timeout, write)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "write timeout"))?;
        let n = res?;
        self.bytes_out += n as u64;
        Ok(())
    }

    async fn write_full_response(
        &mut self,
        method: &Method,
        http_1_0: bool,
        keep_alive: bool,
        response: HandlerResponse,
    ) -> Result<(), ConnectionEnd> {
        let status = response.status;
        let is_head = *method == Method::HEAD;
        let empty_status = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        let body_len = response.body.len();
        let mut keep_alive = keep_alive;

        let (content_length, chunked) = if empty_status {
            (None, false)
        } else if is_head {
            // pass Content-Length even though there is no response
            // body (RFC 2616 14.13)
            let explicit = response
                .headers
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            (explicit.or(body_len), false)
        } else if let Some(n) = body_len {
            (Some(n), false)
        } else if keep_alive {
            (None, true)
        } else {
            (None, false)
        };

        if !is_head && !empty_status && content_length.is_none() && !chunked {
            // close-delimited body
            keep_alive = false;
        }

        let close = !keep_alive && !http_1_0;
        self.write_response_head(status, &response.headers, content_length, chunked, close)
            .await
            .map_err(ConnectionEnd::Io)?;

        if is_head || empty_status {
            response.body.discard().await;
            return Ok(());
        }

        match response.body {
            ResponseBody::Empty => {}
            ResponseBody::Bytes(data) => {
                self.write_body_piece(data, false).await?;
            }
            ResponseBody::Stream { mut stream, .. } => {
                loop {
                    match stream.next_chunk().await {
                        Ok(Some(piece)) => {
                            if piece.is_empty() {
                                continue;
                            }
                            self.write_body_piece(piece, chunked).await?;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            // response already started; nothing to
                            // salvage but the connection
                            tracing::debug!(error = %e, "response body failed mid-stream");
                            return Err(ConnectionEnd::Closed);
                        }
                    }
                }
                if chunked {
                    let data = chunk::final_chunk();
                    let write = self.stream.write_all(data.to_vec());
                    let (res, _) = monoio::time::timeout(self.tunables.write_timeout, write)
                        .await
                        .map_err(|_| {
                            ConnectionEnd::ProtocolError("response write timeout")
                        })?;
                    let n = res.map_err(ConnectionEnd::Io)?;
                    self.bytes_out += n as u64;
                }
            }
        }

        Ok(())
    }

    async fn write_body_piece(&mut self, piece: Bytes, chunked: bool) -> Result<(), ConnectionEnd> {
        let data = if chunked {
            chunk::encode_chunk(&piece).to_vec()
        } else {
            piece.to_vec()
        };
        let write = self.stream.write_all(data);
        let (res, _) = monoio::time::timeout(self.tunables.write_timeout, write)
            .await
            .map_err(|_| ConnectionEnd::ProtocolError("response write timeout"))?;
        let n = res.map_err(ConnectionEnd::Io)?;
        self.bytes_out += n as u64;
        Ok(())
    }
}

enum FillError {
    Timeout,
    Io(std::io::Error),
}

impl From<FerryError> for ConnectionEnd {
    fn from(e: FerryError) -> Self {
        match e {
            FerryError::Io(e) => ConnectionEnd::Io(e),
            _ => ConnectionEnd::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── score ordering ───────────────────────────────────────────

    #[test]
    fn score_ordering_for_drop_policy() {
        assert!(Score::New < Score::First);
        assert!(Score::First < Score::Error);
        assert!(Score::Error < Score::Success);
    }

    // ── head parsing ─────────────────────────────────────────────

    #[test]
    fn parse_simple_get() {
        let head = b"GET /index.html HTTP/1.1\r\nhost: example.com\r\n\r\n";
        match parse_request_head(head) {
            HeadOutcome::Complete(h, consumed) => {
                assert_eq!(h.method, Method::GET);
                assert_eq!(h.uri, "/index.html");
                assert!(!h.http_1_0);
                assert_eq!(consumed, head.len());
                assert_eq!(
                    h.headers.get("host").unwrap().to_str().unwrap(),
                    "example.com"
                );
            }
            _ => panic!("expected complete parse"),
        }
    }

    #[test]
    fn parse_http_1_0_flag() {
        let head = b"GET / HTTP/1.0\r\n\r\n";
        match parse_request_head(head) {
            HeadOutcome::Complete(h, _) => assert!(h.http_1_0),
            _ => panic!("expected complete parse"),
        }
    }

    #[test]
    fn parse_webdav_verbs() {
        for verb in [
            "PROPFIND", "PROPPATCH", "MKCOL", "MOVE", "COPY", "LOCK", "UNLOCK", "REPORT",
            "PATCH",
        ] {
            let head = format!("{} / HTTP/1.1\r\n\r\n", verb);
            match parse_request_head(head.as_bytes()) {
                HeadOutcome::Complete(h, _) => assert_eq!(h.method.as_str(), verb),
                _ => panic!("verb {} must parse", verb),
            }
        }
    }

    #[test]
    fn parse_rejects_unknown_verb() {
        let head = b"FROBNICATE / HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_request_head(head),
            HeadOutcome::Malformed("unrecognized request method")
        ));
    }

    #[test]
    fn parse_rejects_http09() {
        let head = b"GET /index.html\r\n";
        assert!(matches!(
            parse_request_head(head),
            HeadOutcome::AncientProtocol
        ));
    }

    #[test]
    fn parse_partial_returns_partial() {
        assert!(matches!(
            parse_request_head(b"GET / HTTP/1.1\r\nhost: exa"),
            HeadOutcome::Partial
        ));
        assert!(matches!(parse_request_head(b"GE"), HeadOutcome::Partial));
    }

    #[test]
    fn parse_rejects_oversized_line() {
        let mut head = b"GET / HTTP/1.1\r\nx-big: ".to_vec();
        head.extend(std::iter::repeat_n(b'a', MAX_HEADER_LINE + 1));
        assert!(matches!(
            parse_request_head(&head),
            HeadOutcome::Malformed("request header line too large")
        ));
    }

    #[test]
    fn parse_strips_trailing_whitespace() {
        let head = b"GET / HTTP/1.1\r\nx-pad: value   \r\n\r\n";
        match parse_request_head(head) {
            HeadOutcome::Complete(h, _) => {
                assert_eq!(h.headers.get("x-pad").unwrap().to_str().unwrap(), "value");
            }
            _ => panic!("expected complete parse"),
        }
    }

    #[test]
    fn parse_lowercases_header_names() {
        let head = b"GET / HTTP/1.1\r\nX-Mixed-Case: 1\r\n\r\n";
        match parse_request_head(head) {
            HeadOutcome::Complete(h, _) => {
                assert!(h.headers.contains_key("x-mixed-case"));
            }
            _ => panic!("expected complete parse"),
        }
    }
}
