//! Error document substitution: when the translation server declared
//! ERROR_DOCUMENT, an error response is replaced by a separately
//! translated document, falling back to the original body on any
//! failure.

use crate::instance::Instance;
use crate::request::RequestContext;
use crate::resource_loader::{self, OutgoingRequest};
use crate::response::PendingResponse;
use bytes::Bytes;
use http_crate::{HeaderMap, Method, StatusCode};

use ::http as http_crate;

pub async fn dispatch_response(
    instance: &Instance,
    ctx: &RequestContext,
    original: PendingResponse,
    error_document: Bytes,
) -> PendingResponse {
    let mut request = ctx.translate_request.clone();
    request.error_document = Some(error_document);
    request.error_document_status = original.status.as_u16();

    let response = match instance.translate(&request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::info!(error = %e, uri = %ctx.raw_uri, "error document translation failed");
            return original;
        }
    };

    let usable = (response.status == 0 || (200..300).contains(&response.status))
        && response.address.is_defined();
    if !usable {
        return original;
    }

    let fetched = resource_loader::send_request(
        instance,
        &response.address,
        OutgoingRequest {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            sticky_hash: 0,
            remote_addr: ctx.peer_addr.ip().to_string(),
            is_upgrade: false,
        },
    )
    .await;

    match fetched {
        Ok(replacement) if replacement.status.is_success() => {
            // keep the original error status, substitute the entity
            PendingResponse {
                status: original.status,
                headers: replacement.headers,
                body: replacement.body,
            }
        }
        Ok(replacement) => {
            replacement.body.discard().await;
            original
        }
        Err(e) => {
            tracing::info!(error = %e, uri = %ctx.raw_uri, "error document fetch failed");
            original
        }
    }
}

/// Whether a status qualifies for error-document substitution.
pub fn is_error_status(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error()
}
