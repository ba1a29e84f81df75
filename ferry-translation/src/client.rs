//! Async translation protocol client.
//!
//! Connections to the translation server are pooled per worker; a
//! transaction writes the marshalled request (10 s timeout) and reads
//! directive packets (60 s between packets) until END.

use crate::protocol::{Packet, try_parse_packet};
use crate::request::TranslateRequest;
use crate::response::{ResponseParser, TranslateResponse};
use bytes::{Bytes, BytesMut};
use ferry_core::FerryError;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpStream, UnixStream};
use std::cell::RefCell;
use std::time::Duration;

const READ_CHUNK: usize = 16 * 1024;
const MAX_IDLE: usize = 4;

/// A translation server connection: TCP for "host:port" targets, unix
/// socket for absolute paths.
pub enum TranslateConn {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl TranslateConn {
    async fn connect(addr: &str) -> std::io::Result<TranslateConn> {
        if addr.starts_with('/') {
            Ok(TranslateConn::Unix(UnixStream::connect(addr).await?))
        } else {
            let stream = TcpStream::connect(addr).await?;
            let _ = stream.set_nodelay(true);
            Ok(TranslateConn::Tcp(stream))
        }
    }

    async fn write_all(&mut self, data: Vec<u8>) -> std::io::Result<()> {
        let (res, _) = match self {
            TranslateConn::Tcp(s) => s.write_all(data).await,
            TranslateConn::Unix(s) => s.write_all(data).await,
        };
        res.map(|_| ())
    }

    async fn read(&mut self, buf: Vec<u8>) -> (std::io::Result<usize>, Vec<u8>) {
        match self {
            TranslateConn::Tcp(s) => s.read(buf).await,
            TranslateConn::Unix(s) => s.read(buf).await,
        }
    }
}

/// Drives one request/response transaction on a connection.
pub struct TranslateClient {
    conn: TranslateConn,
    leftover: Bytes,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl TranslateClient {
    pub fn new(conn: TranslateConn, write_timeout: Duration, read_timeout: Duration) -> Self {
        TranslateClient {
            conn,
            leftover: Bytes::new(),
            write_timeout,
            read_timeout,
        }
    }

    /// Run one transaction.  On success the connection is handed back
    /// for reuse.
    pub async fn translate(
        mut self,
        request: &TranslateRequest,
    ) -> Result<(TranslateResponse, TranslateConn), FerryError> {
        let payload = request.marshal();

        monoio::time::timeout(self.write_timeout, self.conn.write_all(payload.to_vec()))
            .await
            .map_err(|_| FerryError::Translation("translation write timeout".into()))?
            .map_err(|e| {
                FerryError::Translation(format!("write error to translation server: {}", e))
            })?;

        let mut parser = ResponseParser::new();
        loop {
            while let Some(packet) = self.try_next_packet() {
                if let Some(response) = parser.feed(&packet)? {
                    if !self.leftover.is_empty() {
                        return Err(FerryError::Translation(
                            "trailing data after END from translation server".into(),
                        ));
                    }
                    return Ok((response, self.conn));
                }
            }

            let buf = vec![0u8; READ_CHUNK];
            let (res, buf) = monoio::time::timeout(self.read_timeout, self.conn.read(buf))
                .await
                .map_err(|_| FerryError::Translation("translation read timeout".into()))?;
            let n = res.map_err(|e| {
                FerryError::Translation(format!("read error from translation server: {}", e))
            })?;
            if n == 0 {
                return Err(FerryError::Translation(
                    "translation server aborted the connection".into(),
                ));
            }
            let mut joined = BytesMut::with_capacity(self.leftover.len() + n);
            joined.extend_from_slice(&self.leftover);
            joined.extend_from_slice(&buf[..n]);
            self.leftover = joined.freeze();
        }
    }

    fn try_next_packet(&mut self) -> Option<Packet> {
        try_parse_packet(&mut self.leftover)
    }
}

/// Per-worker pool of translation server connections.
pub struct TranslateStock {
    addr: String,
    idle: RefCell<Vec<TranslateConn>>,
    write_timeout: Duration,
    read_timeout: Duration,
}

impl TranslateStock {
    pub fn new(addr: impl Into<String>, write_timeout: Duration, read_timeout: Duration) -> Self {
        TranslateStock {
            addr: addr.into(),
            idle: RefCell::new(Vec::new()),
            write_timeout,
            read_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Run one translate transaction, reusing a pooled connection when
    /// available.  A failure on a pooled connection is retried once on
    /// a fresh one, since the pooled socket may have gone stale.
    pub async fn translate(
        &self,
        request: &TranslateRequest,
    ) -> Result<TranslateResponse, FerryError> {
        let pooled = self.idle.borrow_mut().pop();
        let was_pooled = pooled.is_some();

        let conn = match pooled {
            Some(conn) => conn,
            None => self.connect().await?,
        };

        let client = TranslateClient::new(conn, self.write_timeout, self.read_timeout);
        match client.translate(request).await {
            Ok((response, conn)) => {
                self.put(conn);
                Ok(response)
            }
            Err(e) if was_pooled => {
                tracing::debug!(error = %e, "pooled translation connection failed, retrying");
                let conn = self.connect().await?;
                let client = TranslateClient::new(conn, self.write_timeout, self.read_timeout);
                let (response, conn) = client.translate(request).await?;
                self.put(conn);
                Ok(response)
            }
            Err(e) => Err(e),
        }
    }

    async fn connect(&self) -> Result<TranslateConn, FerryError> {
        TranslateConn::connect(&self.addr).await.map_err(|e| {
            FerryError::Translation(format!(
                "failed to connect to translation server {}: {}",
                self.addr, e
            ))
        })
    }

    fn put(&self, conn: TranslateConn) {
        let mut idle = self.idle.borrow_mut();
        if idle.len() < MAX_IDLE {
            idle.push(conn);
        }
    }
}
