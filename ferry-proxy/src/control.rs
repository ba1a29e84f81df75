//! Control-channel datagram parsing.
//!
//! The control channel reuses the translation wire framing.  The only
//! operations the core consumes are translation-cache invalidation and
//! a pool-statistics dump trigger.

use bytes::Bytes;
use ferry_core::FerryError;
use ferry_translation::protocol::{Command, parse_packets, payload_string};
use ferry_translation::request::TranslateRequest;

/// A parsed control operation, fanned out to every worker.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    TcacheInvalidate {
        request: TranslateRequest,
        dims: Vec<u16>,
        site: Option<String>,
    },
    DumpPools,
}

/// Parse one control datagram into its operations.  Unknown commands
/// are skipped with a log line; malformed framing is an error.
pub fn parse_control_datagram(data: Bytes) -> Result<Vec<ControlCommand>, FerryError> {
    let packets = parse_packets(data)?;
    let mut out = Vec::new();

    for packet in packets {
        match packet.known_command() {
            Some(Command::TcacheInvalidate) => {
                out.push(parse_invalidate(packet.payload)?);
            }
            Some(Command::DumpPools) => out.push(ControlCommand::DumpPools),
            other => {
                tracing::debug!(command = packet.command, known = ?other, "ignoring control packet");
            }
        }
    }

    Ok(out)
}

/// The TCACHE_INVALIDATE payload is itself a packet sequence naming
/// the dimensions (with values) entries must match to be dropped.
fn parse_invalidate(payload: Bytes) -> Result<ControlCommand, FerryError> {
    let mut request = TranslateRequest::default();
    let mut dims = Vec::new();
    let mut site = None;

    for packet in parse_packets(payload)? {
        let command = packet.known_command().ok_or_else(|| {
            FerryError::Translation(format!(
                "unknown translation packet {} in TCACHE_INVALIDATE",
                packet.command
            ))
        })?;
        match command {
            Command::Uri => {
                request.uri = Some(payload_string(&packet.payload)?);
                dims.push(command as u16);
            }
            Command::Session => {
                request.session = Some(packet.payload.clone());
                dims.push(command as u16);
            }
            Command::Host => {
                request.host = Some(payload_string(&packet.payload)?);
                dims.push(command as u16);
            }
            Command::Language => {
                request.accept_language = Some(payload_string(&packet.payload)?);
                dims.push(command as u16);
            }
            Command::UserAgent => {
                request.user_agent = Some(payload_string(&packet.payload)?);
                dims.push(command as u16);
            }
            Command::QueryString => {
                request.query_string = Some(payload_string(&packet.payload)?);
                dims.push(command as u16);
            }
            Command::RemoteHost => {
                request.remote_host = Some(payload_string(&packet.payload)?);
                dims.push(command as u16);
            }
            Command::ListenerTag => {
                request.listener_tag = Some(payload_string(&packet.payload)?);
                dims.push(command as u16);
            }
            Command::Site => {
                site = Some(payload_string(&packet.payload)?);
            }
            other => {
                return Err(FerryError::Translation(format!(
                    "misplaced {:?} packet in TCACHE_INVALIDATE",
                    other
                )));
            }
        }
    }

    Ok(ControlCommand::TcacheInvalidate {
        request,
        dims,
        site,
    })
}
