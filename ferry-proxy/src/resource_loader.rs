//! Dispatch one request to the backend named by a resource address.

use crate::backends::{BackendResponse, ajp, cgi, fcgi, http as http_backend, lhttp, was};
use crate::file::{FileOutcome, FileRequest, serve_file};
use crate::instance::Instance;
use bytes::Bytes;
use ferry_core::FerryError;
use ferry_core::address::{FileAddress, NfsAddress, ResourceAddress};
use http_crate::{HeaderMap, HeaderValue, Method, StatusCode};

use ::http as http_crate;

/// A fully prepared outgoing request.
pub struct OutgoingRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub sticky_hash: u32,
    pub remote_addr: String,
    pub is_upgrade: bool,
}

/// Resolve an NFS address through the configured kernel mounts.
fn nfs_local_path(instance: &Instance, address: &NfsAddress) -> Result<FileAddress, FerryError> {
    let key = format!("{}:{}", address.server, address.export);
    let mount = instance.config.nfs_mounts.get(&key).ok_or_else(|| {
        FerryError::Internal(format!("no NFS mount configured for {}", key))
    })?;
    Ok(FileAddress::new(format!("{}{}", mount, address.path)))
}

async fn serve_file_address(
    address: &FileAddress,
    request: &OutgoingRequest,
) -> Result<BackendResponse, FerryError> {
    let file_request = FileRequest {
        method: &request.method,
        headers: &request.headers,
        translated_status: 0,
        transformation_enabled: false,
        expires_relative: None,
        have_directory_index: false,
        have_file_not_found: false,
        have_enotdir: false,
    };
    match serve_file(address, &file_request).await? {
        FileOutcome::Response {
            status,
            headers,
            body,
        } => Ok(BackendResponse::new(status, headers, body)),
        // no translate loop down here; probes degrade to 404
        _ => Ok(BackendResponse::new(
            StatusCode::NOT_FOUND,
            HeaderMap::new(),
            ferry_http::ResponseBody::Empty,
        )),
    }
}

/// The direct resource loader: one request to the named address, one
/// response or error back.
pub async fn send_request(
    instance: &Instance,
    address: &ResourceAddress,
    request: OutgoingRequest,
) -> Result<BackendResponse, FerryError> {
    match address {
        ResourceAddress::None => Err(FerryError::NotFound),
        ResourceAddress::Local(file) => serve_file_address(file, &request).await,
        ResourceAddress::Nfs(nfs) => {
            let file = nfs_local_path(instance, nfs)?;
            serve_file_address(&file, &request).await
        }
        ResourceAddress::Http(addr) => {
            http_backend::send_http_request(
                instance,
                http_backend::HttpBackendRequest {
                    method: &request.method,
                    address: addr,
                    headers: request.headers,
                    body: request.body,
                    sticky_hash: request.sticky_hash,
                    is_upgrade: request.is_upgrade,
                },
            )
            .await
        }
        ResourceAddress::Ajp(addr) => {
            ajp::send_ajp_request(
                instance,
                addr,
                &request.method,
                &request.headers,
                request.body,
                &request.remote_addr,
                request.sticky_hash,
            )
            .await
        }
        ResourceAddress::Fastcgi(addr) => {
            fcgi::send_fcgi_request(
                instance,
                addr,
                &request.method,
                &request.headers,
                request.body,
                request.sticky_hash,
            )
            .await
        }
        ResourceAddress::Was(addr) => {
            was::send_was_request(
                instance,
                addr,
                &request.method,
                &request.headers,
                request.body,
            )
            .await
        }
        ResourceAddress::Cgi(addr) => {
            cgi::send_cgi_request(
                instance,
                addr,
                &request.method,
                &request.headers,
                request.body,
                &request.remote_addr,
            )
            .await
        }
        ResourceAddress::Pipe(addr) => {
            cgi::send_pipe_request(
                instance,
                addr,
                &request.method,
                &request.headers,
                request.body,
                &request.remote_addr,
            )
            .await
        }
        ResourceAddress::Lhttp(addr) => {
            lhttp::send_lhttp_request(
                instance,
                addr,
                &request.method,
                request.headers,
                request.body,
            )
            .await
        }
    }
}

/// The filter resource loader: pipe a response entity through the
/// FILTER address.  The filter sees the entity as a POST body; its
/// response replaces status, headers, and body.
pub async fn send_filter(
    instance: &Instance,
    address: &ResourceAddress,
    content_type: Option<&str>,
    body: Bytes,
    reveal_user: Option<&str>,
    sticky_hash: u32,
) -> Result<BackendResponse, FerryError> {
    let mut headers = HeaderMap::new();
    if let Some(ct) = content_type {
        if let Ok(value) = HeaderValue::from_str(ct) {
            headers.insert(http_crate::header::CONTENT_TYPE, value);
        }
    }
    if let Some(user) = reveal_user {
        if let Ok(value) = HeaderValue::from_str(user) {
            headers.insert("x-ferry-user", value);
        }
    }

    send_request(
        instance,
        address,
        OutgoingRequest {
            method: Method::POST,
            headers,
            body,
            sticky_hash,
            remote_addr: "127.0.0.1".to_string(),
            is_upgrade: false,
        },
    )
    .await
}
