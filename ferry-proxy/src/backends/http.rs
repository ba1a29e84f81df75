//! HTTP/1.1 backend adapter: leases a connection through the
//! balancer/stock, drives the wire protocol, and streams the response
//! body back with the lease returned on completion.

use super::BackendResponse;
use crate::instance::Instance;
use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::FerryError;
use ferry_core::address::HttpAddress;
use ferry_core::error::UpstreamErrorKind;
use ferry_http::body::{BodyStream, ResponseBody};
use ferry_http::client::{BodyState, ClientConnection, Framing};
use ferry_http::server::Tunnel;
use ferry_pool::balancer::{AddressList, StickyMode};
use ferry_pool::TcpStock;
use http_crate::{HeaderMap, HeaderValue, Method};
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, Splitable};
use monoio::net::TcpStream;
use std::rc::Rc;

use ::http as http_crate;

pub struct HttpBackendRequest<'a> {
    pub method: &'a Method,
    pub address: &'a HttpAddress,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Session cluster hash for SESSION_MODULO stickiness.
    pub sticky_hash: u32,
    pub is_upgrade: bool,
}

fn address_list(address: &HttpAddress) -> AddressList {
    let addresses = if address.addresses.is_empty() {
        vec![address.host_and_port.clone()]
    } else {
        address.addresses.clone()
    };
    let sticky_mode = if addresses.len() > 1 {
        StickyMode::SessionModulo
    } else {
        StickyMode::None
    };
    AddressList {
        addresses,
        sticky_mode,
        jvm_routes: Vec::new(),
    }
}

/// Send one request.  A REFUSED failure (no response byte seen) is
/// retried once with fresh address selection when the request has no
/// body to replay.
pub async fn send_http_request(
    instance: &Instance,
    mut request: HttpBackendRequest<'_>,
) -> Result<BackendResponse, FerryError> {
    let list = address_list(request.address);

    if !request.headers.contains_key(http_crate::header::HOST) {
        if let Ok(host) = HeaderValue::from_str(&request.address.host_and_port) {
            request.headers.insert(http_crate::header::HOST, host);
        }
    }

    let retries = if request.body.is_empty() { 1 } else { 0 };
    let mut attempt = 0;
    let mut new_lb_cookie = None;

    loop {
        let balanced = instance
            .balancer
            .get(&instance.tcp_stock, &list, request.sticky_hash)
            .await?;
        if balanced.new_cookie.is_some() {
            new_lb_cookie = balanced.new_cookie;
        }
        let addr = balanced.addr;

        match attempt_request(instance, &request, balanced.stream, &addr).await {
            Ok(mut response) => {
                if response.status.is_server_error() {
                    instance.balancer.on_response_failure(&addr);
                } else {
                    instance.balancer.on_response_success(&addr);
                }
                response.addr = Some(addr);
                response.new_lb_cookie = new_lb_cookie;
                return Ok(response);
            }
            Err(e) => {
                instance.tcp_stock.release(&addr);
                let retryable = matches!(
                    e.upstream_kind(),
                    Some(UpstreamErrorKind::Refused)
                ) && attempt < retries;
                if !retryable {
                    if let Some(kind) = e.upstream_kind() {
                        if kind.is_server_failure() {
                            instance.balancer.on_response_failure(&addr);
                        }
                    }
                    return Err(e);
                }
                tracing::debug!(addr = %addr, error = %e, "retrying after refused upstream");
                attempt += 1;
            }
        }
    }
}

async fn attempt_request(
    instance: &Instance,
    request: &HttpBackendRequest<'_>,
    stream: TcpStream,
    addr: &str,
) -> Result<BackendResponse, FerryError> {
    let mut conn = ClientConnection::new(
        stream,
        instance.upstream_read_timeout(),
        instance.upstream_write_timeout(),
    );

    conn.send_request(
        request.method,
        &request.address.path,
        &request.headers,
        &request.body,
    )
    .await?;

    let head = conn
        .read_response_head(*request.method == Method::HEAD)
        .await?;

    // 101: hand the socket over to a bidirectional tunnel
    if head.status == http_crate::StatusCode::SWITCHING_PROTOCOLS && request.is_upgrade {
        let (upstream, leftover) = conn.into_parts();
        // the lease is consumed by the tunnel
        instance.tcp_stock.release(addr);
        let mut response = BackendResponse::new(head.status, head.headers, ResponseBody::Empty);
        response.tunnel = Some(Box::new(UpstreamTunnel {
            upstream,
            upstream_leftover: leftover,
        }));
        return Ok(response);
    }

    let body = match head.framing {
        Framing::Empty => {
            // lease complete; pool it right away
            instance
                .tcp_stock
                .put(addr, conn.into_inner(), head.reusable);
            ResponseBody::Empty
        }
        framing => {
            let len = match framing {
                Framing::ContentLength(n) => Some(n),
                _ => None,
            };
            ResponseBody::Stream {
                len,
                stream: Box::new(UpstreamBody {
                    conn: Some(conn),
                    state: BodyState::for_framing(framing),
                    reusable: head.reusable,
                    stock: Rc::clone(&instance.tcp_stock),
                    addr: addr.to_string(),
                }),
            }
        }
    };

    Ok(BackendResponse::new(head.status, head.headers, body))
}

/// Streams the upstream response body; returns the connection to the
/// stock after the terminal event.
struct UpstreamBody {
    conn: Option<ClientConnection<TcpStream>>,
    state: BodyState,
    reusable: bool,
    stock: Rc<TcpStock>,
    addr: String,
}

#[async_trait(?Send)]
impl BodyStream for UpstreamBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, FerryError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };
        match conn.next_body_chunk(&mut self.state).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                let conn = self.conn.take().unwrap();
                self.stock
                    .put(&self.addr, conn.into_inner(), self.reusable);
                Ok(None)
            }
            Err(e) => {
                let conn = self.conn.take().unwrap();
                self.stock.put(&self.addr, conn.into_inner(), false);
                Err(e)
            }
        }
    }
}

impl Drop for UpstreamBody {
    fn drop(&mut self) {
        // abandoned mid-body: the connection cannot be reused
        if let Some(conn) = self.conn.take() {
            self.stock.put(&self.addr, conn.into_inner(), false);
        }
    }
}

/// Bidirectional relay after a 101 Switching Protocols.
struct UpstreamTunnel {
    upstream: TcpStream,
    upstream_leftover: Bytes,
}

async fn relay(mut from: impl AsyncReadRent, mut to: impl AsyncWriteRent, initial: Bytes) {
    if !initial.is_empty() {
        let (res, _) = to.write_all(initial.to_vec()).await;
        if res.is_err() {
            return;
        }
    }
    loop {
        let buf = vec![0u8; 16 * 1024];
        let (res, buf) = from.read(buf).await;
        match res {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                let (res, _) = to.write_all(buf[..n].to_vec()).await;
                if res.is_err() {
                    return;
                }
            }
        }
    }
}

#[async_trait(?Send)]
impl Tunnel for UpstreamTunnel {
    async fn run(self: Box<Self>, client: TcpStream, client_leftover: Bytes) {
        let (upstream_read, upstream_write) = self.upstream.into_split();
        let (client_read, client_write) = client.into_split();

        let downstream = monoio::spawn(relay(
            upstream_read,
            client_write,
            self.upstream_leftover,
        ));
        relay(client_read, upstream_write, client_leftover).await;
        downstream.await;
    }
}
