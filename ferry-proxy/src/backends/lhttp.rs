//! Local-HTTP backend: a child process speaking HTTP/1.1 over a
//! private unix socket, spawned on demand and keyed by its command
//! line.

use super::BackendResponse;
use crate::instance::Instance;
use bytes::Bytes;
use ferry_core::FerryError;
use ferry_core::address::LhttpAddress;
use ferry_core::error::UpstreamErrorKind;
use ferry_http::client::{BodyState, ClientConnection};
use ferry_http::ResponseBody;
use http_crate::{HeaderMap, HeaderValue, Method};
use monoio::net::UnixStream;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use ::http as http_crate;

struct LhttpChild {
    process: std::process::Child,
    socket_path: PathBuf,
}

impl Drop for LhttpChild {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Child processes keyed by their command line.
#[derive(Default)]
pub struct LhttpStock {
    children: RefCell<HashMap<String, LhttpChild>>,
}

impl LhttpStock {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(address: &LhttpAddress) -> String {
        let mut key = address.path.clone();
        for arg in &address.args {
            key.push('\0');
            key.push_str(arg);
        }
        key
    }

    /// The unix socket of a running child for this address, spawning
    /// one when needed.
    async fn socket_for(&self, address: &LhttpAddress) -> Result<PathBuf, FerryError> {
        let key = Self::key(address);

        // reap a child that has exited
        {
            let mut children = self.children.borrow_mut();
            if let Some(child) = children.get_mut(&key) {
                match child.process.try_wait() {
                    Ok(None) => return Ok(child.socket_path.clone()),
                    _ => {
                        children.remove(&key);
                    }
                }
            }
        }

        let socket_path =
            std::env::temp_dir().join(format!("ferry-lhttp-{}.sock", uuid::Uuid::new_v4()));

        let process = std::process::Command::new(&address.path)
            .args(&address.args)
            .env("FERRY_LHTTP_SOCKET", &socket_path)
            .spawn()
            .map_err(|e| {
                FerryError::upstream(
                    UpstreamErrorKind::Refused,
                    format!("failed to spawn {}: {}", address.path, e),
                )
            })?;

        self.children.borrow_mut().insert(
            key,
            LhttpChild {
                process,
                socket_path: socket_path.clone(),
            },
        );

        // wait for the child to create its listener socket
        for _ in 0..100 {
            if socket_path.exists() {
                return Ok(socket_path);
            }
            monoio::time::sleep(Duration::from_millis(20)).await;
        }

        Err(FerryError::upstream(
            UpstreamErrorKind::Refused,
            format!("{} did not create its socket", address.path),
        ))
    }
}

/// Send one request to the local-HTTP child for this address.
pub async fn send_lhttp_request(
    instance: &Instance,
    address: &LhttpAddress,
    method: &Method,
    mut headers: HeaderMap,
    body: Bytes,
) -> Result<BackendResponse, FerryError> {
    let socket_path = instance.lhttp.socket_for(address).await?;

    let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
        FerryError::upstream(
            UpstreamErrorKind::Refused,
            format!("connect to {} failed: {}", socket_path.display(), e),
        )
    })?;

    if let Some(host) = &address.host {
        if let Ok(value) = HeaderValue::from_str(host) {
            headers.insert(http_crate::header::HOST, value);
        }
    }

    let mut conn = ClientConnection::new(
        stream,
        instance.upstream_read_timeout(),
        instance.upstream_write_timeout(),
    );
    let uri = if address.uri.is_empty() { "/" } else { &address.uri };
    conn.send_request(method, uri, &headers, &body).await?;

    let head = conn.read_response_head(*method == Method::HEAD).await?;

    // child connections are not pooled; collect the body here
    let mut state = BodyState::for_framing(head.framing);
    let cap = instance.config.proxy.filter_buffer_size;
    let mut collected = bytes::BytesMut::new();
    while let Some(chunk) = conn.next_body_chunk(&mut state).await? {
        if collected.len() + chunk.len() > cap {
            return Err(FerryError::upstream(
                UpstreamErrorKind::Unspecified,
                "local-HTTP response too large",
            ));
        }
        collected.extend_from_slice(&chunk);
    }

    Ok(BackendResponse::new(
        head.status,
        head.headers,
        ResponseBody::from(collected.freeze()),
    ))
}
