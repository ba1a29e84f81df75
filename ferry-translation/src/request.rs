//! The outgoing translate request and its wire marshalling.

use crate::protocol::{Command, write_optional_packet, write_packet};
use bytes::{Bytes, BytesMut};

/// One translate request.  Immutable once built; each follow-up turn
/// of the translate loop constructs a fresh request.
#[derive(Debug, Clone, Default)]
pub struct TranslateRequest {
    pub local_address: Option<String>,
    pub remote_host: Option<String>,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub accept_language: Option<String>,
    /// The value of the "Authorization" HTTP request header.
    pub authorization: Option<String>,
    pub uri: Option<String>,
    pub args: Option<String>,
    pub query_string: Option<String>,
    pub widget_type: Option<String>,
    pub session: Option<Bytes>,
    pub param: Option<String>,
    pub listener_tag: Option<String>,
    /// The session user, sent only when the server asked for it via
    /// WANT.
    pub user: Option<String>,

    /// CHECK continuation token from the previous response.
    pub check: Option<Bytes>,
    /// AUTH token.
    pub auth: Option<Bytes>,
    /// INTERNAL_REDIRECT continuation token.
    pub internal_redirect: Option<Bytes>,
    /// WANT_FULL_URI token.
    pub want_full_uri: Option<Bytes>,

    pub error_document: Option<Bytes>,
    pub error_document_status: u16,

    /// Payload echoes for the re-translate loops.
    pub directory_index: Option<Bytes>,
    pub file_not_found: Option<Bytes>,
    pub enotdir: Option<Bytes>,
    pub read_file: Option<Bytes>,
    pub probe_path_suffixes: Option<Bytes>,
    pub probe_suffix: Option<String>,
    pub content_type_lookup: Option<Bytes>,
    pub suffix: Option<String>,
}

impl TranslateRequest {
    /// The key under which this request may be cached, or `None` when
    /// it is not cacheable at all.
    pub fn is_cacheable(&self) -> bool {
        (self.uri.is_some() || self.widget_type.is_some())
            && self.authorization.is_none()
            && self.param.is_none()
    }

    /// Serialize into a packet stream (BEGIN ... END).
    pub fn marshal(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        write_packet(&mut buf, Command::Begin, b"");

        if self.error_document_status != 0 {
            write_packet(
                &mut buf,
                Command::ErrorDocument,
                self.error_document.as_deref().unwrap_or(b""),
            );
            write_packet(
                &mut buf,
                Command::Status,
                &self.error_document_status.to_le_bytes(),
            );
        }

        write_optional_packet(
            &mut buf,
            Command::LocalAddressString,
            self.local_address.as_deref().map(str::as_bytes),
        );
        write_optional_packet(
            &mut buf,
            Command::RemoteHost,
            self.remote_host.as_deref().map(str::as_bytes),
        );
        write_optional_packet(&mut buf, Command::Host, self.host.as_deref().map(str::as_bytes));
        write_optional_packet(
            &mut buf,
            Command::UserAgent,
            self.user_agent.as_deref().map(str::as_bytes),
        );
        write_optional_packet(
            &mut buf,
            Command::Language,
            self.accept_language.as_deref().map(str::as_bytes),
        );
        write_optional_packet(
            &mut buf,
            Command::Authorization,
            self.authorization.as_deref().map(str::as_bytes),
        );
        write_optional_packet(&mut buf, Command::Uri, self.uri.as_deref().map(str::as_bytes));
        write_optional_packet(&mut buf, Command::Args, self.args.as_deref().map(str::as_bytes));
        write_optional_packet(
            &mut buf,
            Command::QueryString,
            self.query_string.as_deref().map(str::as_bytes),
        );
        write_optional_packet(
            &mut buf,
            Command::WidgetType,
            self.widget_type.as_deref().map(str::as_bytes),
        );
        write_optional_packet(&mut buf, Command::Session, self.session.as_deref());
        write_optional_packet(&mut buf, Command::User, self.user.as_deref().map(str::as_bytes));
        write_optional_packet(&mut buf, Command::Param, self.param.as_deref().map(str::as_bytes));
        write_optional_packet(
            &mut buf,
            Command::ListenerTag,
            self.listener_tag.as_deref().map(str::as_bytes),
        );
        write_optional_packet(&mut buf, Command::Check, self.check.as_deref());
        write_optional_packet(&mut buf, Command::Auth, self.auth.as_deref());
        write_optional_packet(
            &mut buf,
            Command::InternalRedirect,
            self.internal_redirect.as_deref(),
        );
        write_optional_packet(&mut buf, Command::WantFullUri, self.want_full_uri.as_deref());
        write_optional_packet(
            &mut buf,
            Command::DirectoryIndex,
            self.directory_index.as_deref(),
        );
        write_optional_packet(&mut buf, Command::FileNotFound, self.file_not_found.as_deref());
        write_optional_packet(&mut buf, Command::Enotdir, self.enotdir.as_deref());
        write_optional_packet(&mut buf, Command::ReadFile, self.read_file.as_deref());
        write_optional_packet(
            &mut buf,
            Command::ProbePathSuffixes,
            self.probe_path_suffixes.as_deref(),
        );
        write_optional_packet(
            &mut buf,
            Command::ProbeSuffix,
            self.probe_suffix.as_deref().map(str::as_bytes),
        );
        write_optional_packet(
            &mut buf,
            Command::ContentTypeLookup,
            self.content_type_lookup.as_deref(),
        );
        write_optional_packet(
            &mut buf,
            Command::Suffix,
            self.suffix.as_deref().map(str::as_bytes),
        );

        write_packet(&mut buf, Command::End, b"");
        buf.freeze()
    }
}
