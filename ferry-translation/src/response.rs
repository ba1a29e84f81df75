//! The translate response and the directive state machine that builds
//! it from a packet stream.
//!
//! Stateful packets (PATH, PROXY, CGI, ...) start a new address
//! record; modifiers apply to "the current address" and fail on
//! misplacement.  VIEW opens a new named view which subsequent address
//! and transformation packets attach to.

use crate::protocol::{Command, Packet, payload_string, payload_u16_list};
use bytes::Bytes;
use ferry_core::address::{
    CgiAddress, FileAddress, HttpAddress, LhttpAddress, NfsAddress, ResourceAddress,
};
use ferry_core::FerryError;

// ── header forwarding settings ────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HeaderGroup {
    Identity = 0,
    Capabilities = 1,
    Cookie = 2,
    Other = 3,
    Link = 4,
    Secure = 5,
    Ssl = 6,
    Transformation = 7,
    Cors = 8,
}

pub const NUM_HEADER_GROUPS: usize = 9;

impl HeaderGroup {
    pub fn from_u16(v: u16) -> Option<HeaderGroup> {
        use HeaderGroup::*;
        Some(match v {
            0 => Identity,
            1 => Capabilities,
            2 => Cookie,
            3 => Other,
            4 => Link,
            5 => Secure,
            6 => Ssl,
            7 => Transformation,
            8 => Cors,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardMode {
    #[default]
    No,
    Yes,
    Mangle,
    Both,
}

impl ForwardMode {
    fn from_u16(v: u16) -> Option<ForwardMode> {
        Some(match v {
            0 => ForwardMode::No,
            1 => ForwardMode::Yes,
            2 => ForwardMode::Mangle,
            3 => ForwardMode::Both,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderForwardSettings {
    pub modes: [ForwardMode; NUM_HEADER_GROUPS],
}

impl HeaderForwardSettings {
    pub fn get(&self, group: HeaderGroup) -> ForwardMode {
        self.modes[group as usize]
    }

    pub fn set(&mut self, group: HeaderGroup, mode: ForwardMode) {
        self.modes[group as usize] = mode;
    }

    /// Defaults for the request direction.
    pub fn request_defaults() -> Self {
        let mut s = HeaderForwardSettings::default();
        s.set(HeaderGroup::Identity, ForwardMode::Mangle);
        s.set(HeaderGroup::Capabilities, ForwardMode::Yes);
        s.set(HeaderGroup::Cookie, ForwardMode::Mangle);
        s
    }

    /// Defaults for the response direction.
    pub fn response_defaults() -> Self {
        let mut s = HeaderForwardSettings::default();
        s.set(HeaderGroup::Capabilities, ForwardMode::Yes);
        s.set(HeaderGroup::Cookie, ForwardMode::Mangle);
        s.set(HeaderGroup::Link, ForwardMode::Yes);
        s
    }

    /// Apply a REQUEST_HEADER_FORWARD / RESPONSE_HEADER_FORWARD
    /// payload: a sequence of little-endian (group, mode) pairs, where
    /// group 0xffff addresses every group.
    fn apply_packet(&mut self, payload: &Bytes) -> Result<(), FerryError> {
        if payload.is_empty() || payload.len() % 4 != 0 {
            return Err(FerryError::Translation(
                "malformed header forward packet".into(),
            ));
        }
        for pair in payload.chunks_exact(4) {
            let group = u16::from_le_bytes([pair[0], pair[1]]);
            let mode = u16::from_le_bytes([pair[2], pair[3]]);
            let mode = ForwardMode::from_u16(mode).ok_or_else(|| {
                FerryError::Translation("invalid header forward mode".into())
            })?;
            if group == 0xffff {
                for m in self.modes.iter_mut() {
                    *m = mode;
                }
            } else {
                let group = HeaderGroup::from_u16(group).ok_or_else(|| {
                    FerryError::Translation("invalid header forward group".into())
                })?;
                self.set(group, mode);
            }
        }
        Ok(())
    }
}

// ── transformations and views ─────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformation {
    Process { container: bool },
    ProcessCss,
    ProcessText,
    Filter {
        address: ResourceAddress,
        reveal_user: bool,
    },
}

/// A named bundle of address, forward settings, and transformation
/// chain.  The first view is the unnamed default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct View {
    pub name: Option<String>,
    pub address: ResourceAddress,
    pub request_header_forward: HeaderForwardSettings,
    pub response_header_forward: HeaderForwardSettings,
    pub filter_4xx: bool,
    pub transformations: Vec<Transformation>,
}

impl View {
    fn new(name: Option<String>) -> Self {
        View {
            name,
            address: ResourceAddress::None,
            request_header_forward: HeaderForwardSettings::request_defaults(),
            response_header_forward: HeaderForwardSettings::response_defaults(),
            filter_4xx: false,
            transformations: Vec::new(),
        }
    }
}

fn valid_view_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ── the response record ───────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct TranslateResponse {
    pub max_age: Option<u32>,
    pub expires_relative: Option<u32>,
    pub status: u16,

    pub address: ResourceAddress,

    pub request_header_forward: HeaderForwardSettings,
    pub response_header_forward: HeaderForwardSettings,

    pub base: Option<String>,
    pub regex: Option<String>,
    pub inverse_regex: Option<String>,

    pub site: Option<String>,
    pub document_root: Option<String>,
    pub redirect: Option<String>,
    pub bounce: Option<String>,
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub uri: Option<String>,
    pub test_path: Option<String>,

    pub untrusted: Option<String>,
    pub untrusted_prefix: Option<String>,
    pub untrusted_site_suffix: Option<String>,

    pub stateful: bool,
    pub discard_session: bool,
    pub secure_cookie: bool,
    pub filter_4xx: bool,
    pub previous: bool,
    pub transparent: bool,
    pub auto_gzip: bool,
    pub auto_deflate: bool,
    pub realm_from_auth_base: bool,

    pub session: Option<Bytes>,
    pub internal_redirect: Option<Bytes>,
    pub check: Option<Bytes>,
    pub auth: Option<Bytes>,
    pub auth_file: Option<String>,
    pub append_auth: Option<Bytes>,
    pub want_full_uri: Option<Bytes>,

    pub user: Option<String>,
    pub user_max_age: Option<u32>,
    pub session_site: Option<String>,
    pub language: Option<String>,
    pub realm: Option<String>,

    pub external_session_manager: Option<String>,
    pub external_session_keepalive: u16,

    pub www_authenticate: Option<String>,
    pub authentication_info: Option<String>,
    pub cookie_domain: Option<String>,
    pub cookie_host: Option<String>,
    pub cookie_path: Option<String>,

    pub request_headers: Vec<(String, String)>,
    pub response_headers: Vec<(String, String)>,

    pub views: Vec<View>,

    pub vary: Vec<u16>,
    pub invalidate: Vec<u16>,
    pub want: Vec<u16>,

    pub error_document: Option<Bytes>,
    pub file_not_found: Option<Bytes>,
    pub enotdir: Option<Bytes>,
    pub directory_index: Option<Bytes>,
    pub read_file: Option<Bytes>,
    pub probe_path_suffixes: Option<Bytes>,
    pub probe_suffixes: Vec<String>,

    pub content_type: Option<String>,
}

impl TranslateResponse {
    /// An empty response with the default view, usable without running
    /// the parser (tests, synthesized responses).
    pub fn empty() -> Self {
        let mut r = TranslateResponse {
            request_header_forward: HeaderForwardSettings::request_defaults(),
            response_header_forward: HeaderForwardSettings::response_defaults(),
            ..Default::default()
        };
        r.views.push(View::new(None));
        r
    }

    pub fn vary_contains(&self, cmd: Command) -> bool {
        self.vary.contains(&(cmd as u16))
    }

    pub fn wants(&self, cmd: Command) -> bool {
        self.want.contains(&(cmd as u16))
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_some() || self.auth_file.is_some()
    }

    pub fn has_untrusted(&self) -> bool {
        self.untrusted.is_some()
            || self.untrusted_prefix.is_some()
            || self.untrusted_site_suffix.is_some()
    }

    /// The default view.
    pub fn default_view(&self) -> &View {
        &self.views[0]
    }

    /// Look up a view by name; `None`/empty selects the default view.
    pub fn find_view(&self, name: Option<&str>) -> Option<&View> {
        match name {
            None | Some("") => self.views.first(),
            Some(n) => self.views.iter().find(|v| v.name.as_deref() == Some(n)),
        }
    }

    /// The effective cache TTL in seconds.
    pub fn effective_max_age(&self) -> u32 {
        self.max_age.unwrap_or(u32::MAX).min(300)
    }

    /// Cacheable iff `max_age != 0`, no authentication headers, and
    /// not an error-document answer.
    pub fn is_cacheable(&self) -> bool {
        self.max_age != Some(0)
            && self.www_authenticate.is_none()
            && self.authentication_info.is_none()
            && self.status == 0
    }
}

// ── the parser ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrCursor {
    /// Address packets apply to the top-level address (or the current
    /// named view's address).
    Base,
    /// Address packets apply to the latest FILTER transformation.
    Filter,
}

/// Applies packets in order to build a `TranslateResponse`.
pub struct ResponseParser {
    response: TranslateResponse,
    begun: bool,
    previous_command: Option<Command>,
    cursor: AddrCursor,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn err(msg: impl Into<String>) -> FerryError {
    FerryError::Translation(msg.into())
}

impl ResponseParser {
    pub fn new() -> Self {
        ResponseParser {
            response: TranslateResponse::default(),
            begun: false,
            previous_command: None,
            cursor: AddrCursor::Base,
        }
    }

    /// Feed one packet.  Returns `Some(response)` when END has been
    /// applied.
    pub fn feed(&mut self, packet: &Packet) -> Result<Option<TranslateResponse>, FerryError> {
        let command = packet
            .known_command()
            .ok_or_else(|| err(format!("unknown translation packet {}", packet.command)))?;

        if command == Command::Begin {
            if self.begun {
                return Err(err("double BEGIN from translation server"));
            }
        } else if !self.begun {
            return Err(err("no BEGIN from translation server"));
        }

        let payload = &packet.payload;
        match command {
            Command::Begin => {
                self.begun = true;
                self.previous_command = None;
                self.cursor = AddrCursor::Base;
                self.response = TranslateResponse::empty();
            }
            Command::End => {
                self.finish()?;
                return Ok(Some(std::mem::take(&mut self.response)));
            }

            // request-only packets: tolerated with a log line
            Command::Param
            | Command::RemoteHost
            | Command::WidgetType
            | Command::UserAgent
            | Command::Args
            | Command::QueryString
            | Command::LocalAddress
            | Command::LocalAddressString
            | Command::Authorization
            | Command::ListenerTag
            | Command::ContentTypeLookup
            | Command::Suffix
            | Command::TcacheInvalidate
            | Command::DumpPools => {
                tracing::debug!(command = ?command, "misplaced translate request packet");
            }

            Command::Status => {
                if payload.len() != 2 {
                    return Err(err("size mismatch in STATUS packet from translation server"));
                }
                let status = u16::from_le_bytes([payload[0], payload[1]]);
                if !(100..=599).contains(&status) {
                    return Err(err(format!("invalid HTTP status code {}", status)));
                }
                self.response.status = status;
            }

            // ── address records ──────────────────────────────
            Command::Path => {
                let path = payload_string(payload)?;
                self.start_address(ResourceAddress::Local(FileAddress::new(path)), "PATH")?;
            }
            Command::Proxy => {
                let url = payload_string(payload)?;
                let addr = HttpAddress::parse(&url)
                    .ok_or_else(|| err("malformed TRANSLATE_PROXY packet"))?;
                self.start_address(ResourceAddress::Http(addr), "PROXY")?;
            }
            Command::Ajp => {
                let url = payload_string(payload)?;
                let addr = HttpAddress::parse(&url)
                    .ok_or_else(|| err("malformed TRANSLATE_AJP packet"))?;
                self.start_address(ResourceAddress::Ajp(addr), "AJP")?;
            }
            Command::Lhttp => {
                let path = payload_string(payload)?;
                self.start_address(
                    ResourceAddress::Lhttp(LhttpAddress {
                        path,
                        ..Default::default()
                    }),
                    "LHTTP",
                )?;
            }
            Command::Pipe => {
                let path = payload_string(payload)?;
                self.start_address(ResourceAddress::Pipe(CgiAddress::new(path)), "PIPE")?;
            }
            Command::Cgi => {
                let path = payload_string(payload)?;
                let mut addr = CgiAddress::new(path);
                addr.document_root = self.response.document_root.clone();
                self.start_address(ResourceAddress::Cgi(addr), "CGI")?;
            }
            Command::Fastcgi => {
                let path = payload_string(payload)?;
                self.start_address(ResourceAddress::Fastcgi(CgiAddress::new(path)), "FASTCGI")?;
            }
            Command::Was => {
                let path = payload_string(payload)?;
                self.start_address(ResourceAddress::Was(CgiAddress::new(path)), "WAS")?;
            }
            Command::Nfs => {
                let server = payload_string(payload)?;
                self.start_address(
                    ResourceAddress::Nfs(NfsAddress {
                        server,
                        ..Default::default()
                    }),
                    "NFS",
                )?;
            }

            // ── address modifiers ────────────────────────────
            Command::PathInfo => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Cgi(a) | ResourceAddress::Fastcgi(a)
                    | ResourceAddress::Was(a) => a.path_info = Some(value),
                    // tolerated on local paths, currently unused
                    ResourceAddress::Local(_) => {}
                    _ => return Err(err("misplaced TRANSLATE_PATH_INFO packet")),
                }
            }
            Command::ScriptName => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Cgi(a) | ResourceAddress::Fastcgi(a)
                    | ResourceAddress::Was(a) => {
                        if a.script_name.is_some() {
                            return Err(err("misplaced TRANSLATE_SCRIPT_NAME packet"));
                        }
                        a.script_name = Some(value);
                    }
                    _ => return Err(err("misplaced TRANSLATE_SCRIPT_NAME packet")),
                }
            }
            Command::Interpreter => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Cgi(a) | ResourceAddress::Fastcgi(a) => {
                        if a.interpreter.is_some() {
                            return Err(err("misplaced TRANSLATE_INTERPRETER packet"));
                        }
                        a.interpreter = Some(value);
                    }
                    _ => return Err(err("misplaced TRANSLATE_INTERPRETER packet")),
                }
            }
            Command::Action => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Cgi(a) | ResourceAddress::Fastcgi(a) => {
                        if a.action.is_some() {
                            return Err(err("misplaced TRANSLATE_ACTION packet"));
                        }
                        a.action = Some(value);
                    }
                    _ => return Err(err("misplaced TRANSLATE_ACTION packet")),
                }
            }
            Command::DocumentRoot => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Cgi(a) | ResourceAddress::Fastcgi(a)
                    | ResourceAddress::Was(a) => a.document_root = Some(value),
                    ResourceAddress::Local(a) => a.document_root = Some(value),
                    _ => self.response.document_root = Some(value),
                }
            }
            Command::ContentType => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Local(a) => a.content_type = Some(value),
                    ResourceAddress::None => self.response.content_type = Some(value),
                    _ => return Err(err("misplaced TRANSLATE_CONTENT_TYPE packet")),
                }
            }
            Command::Deflated => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Local(a) => a.deflated = Some(value),
                    _ => return Err(err("misplaced TRANSLATE_DEFLATED packet")),
                }
            }
            Command::Gzipped => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Local(a) => a.gzipped = Some(value),
                    _ => return Err(err("misplaced TRANSLATE_GZIPPED packet")),
                }
            }
            Command::JailCgi => match self.current_address_mut() {
                ResourceAddress::Cgi(a) | ResourceAddress::Fastcgi(a)
                | ResourceAddress::Was(a) => a.jail = true,
                _ => return Err(err("misplaced TRANSLATE_JAILCGI packet")),
            },
            Command::Home => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Cgi(a) | ResourceAddress::Fastcgi(a)
                    | ResourceAddress::Was(a)
                        if a.jail && a.home.is_none() =>
                    {
                        a.home = Some(value)
                    }
                    _ => return Err(err("misplaced TRANSLATE_HOME packet")),
                }
            }
            Command::Append => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Pipe(a) => {
                        if a.args.len() >= 32 {
                            return Err(err("too many TRANSLATE_APPEND packets"));
                        }
                        a.args.push(value);
                    }
                    _ => return Err(err("misplaced TRANSLATE_APPEND packet")),
                }
            }
            Command::Pair => {
                let value = payload_string(payload)?;
                if value.starts_with('=') || !value[1..].contains('=') {
                    return Err(err("malformed TRANSLATE_PAIR packet"));
                }
                match self.current_address_mut() {
                    ResourceAddress::Fastcgi(a) | ResourceAddress::Was(a) => {
                        if a.args.len() >= 32 {
                            return Err(err("too many TRANSLATE_PAIR packets"));
                        }
                        a.args.push(value);
                    }
                    _ => return Err(err("misplaced TRANSLATE_PAIR packet")),
                }
            }
            Command::Address | Command::AddressString => {
                let value = payload_string(payload)?;
                if value.len() < 7 && command == Command::AddressString {
                    return Err(err("malformed TRANSLATE_ADDRESS_STRING packet"));
                }
                match self.current_address_mut() {
                    ResourceAddress::Http(a) | ResourceAddress::Ajp(a) => {
                        a.addresses.push(value)
                    }
                    _ => return Err(err("misplaced TRANSLATE_ADDRESS packet")),
                }
            }
            Command::LhttpUri => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Lhttp(a) => a.uri = value,
                    _ => return Err(err("misplaced TRANSLATE_LHTTP_URI packet")),
                }
            }
            Command::LhttpHost => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Lhttp(a) => a.host = Some(value),
                    _ => return Err(err("misplaced TRANSLATE_LHTTP_HOST packet")),
                }
            }
            Command::NfsExport => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Nfs(a) => a.export = value,
                    _ => return Err(err("misplaced TRANSLATE_NFS_EXPORT packet")),
                }
            }

            // ── transformations ──────────────────────────────
            Command::Process => {
                self.add_transformation(Transformation::Process { container: false });
            }
            Command::ProcessCss => {
                self.add_transformation(Transformation::ProcessCss);
            }
            Command::ProcessText => {
                self.add_transformation(Transformation::ProcessText);
            }
            Command::Container => match self.current_view_mut().transformations.last_mut() {
                Some(Transformation::Process { container }) => *container = true,
                _ => return Err(err("misplaced TRANSLATE_CONTAINER packet")),
            },
            Command::Filter => {
                self.add_transformation(Transformation::Filter {
                    address: ResourceAddress::None,
                    reveal_user: false,
                });
                self.cursor = AddrCursor::Filter;
            }
            Command::RevealUser => match self.current_view_mut().transformations.last_mut() {
                Some(Transformation::Filter { reveal_user, .. }) => *reveal_user = true,
                _ => return Err(err("misplaced TRANSLATE_REVEAL_USER packet")),
            },
            Command::Filter4xx => {
                let view = self.current_view_mut();
                if view.name.is_some() {
                    view.filter_4xx = true;
                } else {
                    self.response.filter_4xx = true;
                }
            }

            Command::View => {
                let name = payload_string(payload)?;
                if !valid_view_name(&name) {
                    return Err(err("invalid view name"));
                }
                self.finish_current_view();
                self.response.views.push(View::new(Some(name)));
                self.cursor = AddrCursor::Base;
            }

            // ── response shaping ─────────────────────────────
            Command::Redirect => self.response.redirect = Some(payload_string(payload)?),
            Command::Bounce => self.response.bounce = Some(payload_string(payload)?),
            Command::Base => self.response.base = Some(payload_string(payload)?),
            Command::Regex => self.response.regex = Some(payload_string(payload)?),
            Command::InverseRegex => {
                self.response.inverse_regex = Some(payload_string(payload)?)
            }
            Command::Site => {
                let value = payload_string(payload)?;
                match self.current_address_mut() {
                    ResourceAddress::Cgi(a) | ResourceAddress::Fastcgi(a)
                    | ResourceAddress::Was(a)
                        if a.jail =>
                    {
                        a.site = Some(value)
                    }
                    _ => self.response.site = Some(value),
                }
            }
            Command::Scheme => {
                let value = payload_string(payload)?;
                if !value.starts_with("http") {
                    return Err(err("misplaced TRANSLATE_SCHEME packet"));
                }
                self.response.scheme = Some(value);
            }
            Command::Host => self.response.host = Some(payload_string(payload)?),
            Command::Uri => {
                let value = payload_string(payload)?;
                if !value.starts_with('/') {
                    return Err(err("malformed TRANSLATE_URI packet"));
                }
                self.response.uri = Some(value);
            }
            Command::TestPath => self.response.test_path = Some(payload_string(payload)?),

            Command::Untrusted => {
                let value = payload_string(payload)?;
                if value.is_empty() || value.starts_with('.') || value.ends_with('.') {
                    return Err(err("malformed TRANSLATE_UNTRUSTED packet"));
                }
                if self.response.untrusted_prefix.is_some() {
                    return Err(err("misplaced TRANSLATE_UNTRUSTED packet"));
                }
                self.response.untrusted = Some(value);
            }
            Command::UntrustedPrefix => {
                let value = payload_string(payload)?;
                if value.is_empty() || value.starts_with('.') || value.ends_with('.') {
                    return Err(err("malformed TRANSLATE_UNTRUSTED_PREFIX packet"));
                }
                if self.response.untrusted.is_some() {
                    return Err(err("misplaced TRANSLATE_UNTRUSTED_PREFIX packet"));
                }
                self.response.untrusted_prefix = Some(value);
            }
            Command::UntrustedSiteSuffix => {
                let value = payload_string(payload)?;
                if value.is_empty() || value.starts_with('.') || value.ends_with('.') {
                    return Err(err("malformed TRANSLATE_UNTRUSTED_SITE_SUFFIX packet"));
                }
                self.response.untrusted_site_suffix = Some(value);
            }

            Command::RequestHeaderForward => {
                if self.current_view_is_named() {
                    self.current_view_mut()
                        .request_header_forward
                        .apply_packet(payload)?;
                } else {
                    self.response.request_header_forward.apply_packet(payload)?;
                    self.response.views[0].request_header_forward =
                        self.response.request_header_forward;
                }
            }
            Command::ResponseHeaderForward => {
                if self.current_view_is_named() {
                    self.current_view_mut()
                        .response_header_forward
                        .apply_packet(payload)?;
                } else {
                    self.response.response_header_forward.apply_packet(payload)?;
                    self.response.views[0].response_header_forward =
                        self.response.response_header_forward;
                }
            }

            Command::WwwAuthenticate => {
                self.response.www_authenticate = Some(payload_string(payload)?)
            }
            Command::AuthenticationInfo => {
                self.response.authentication_info = Some(payload_string(payload)?)
            }
            Command::Header | Command::RequestHeader => {
                let value = payload_string(payload)?;
                let (name, value) = parse_header_payload(&value)?;
                if command == Command::Header {
                    self.response.response_headers.push((name, value));
                } else {
                    self.response.request_headers.push((name, value));
                }
            }

            // ── session / auth ───────────────────────────────
            Command::Session => self.response.session = Some(payload.clone()),
            Command::User => {
                self.response.user = Some(payload_string(payload)?);
                // subsequent MAX_AGE packets apply to the user
                self.previous_command = Some(Command::User);
            }
            Command::Language => self.response.language = Some(payload_string(payload)?),
            Command::Realm => self.response.realm = Some(payload_string(payload)?),
            Command::RealmFromAuthBase => self.response.realm_from_auth_base = true,
            Command::SessionSite => {
                self.response.session_site = Some(payload_string(payload)?)
            }
            Command::Check => self.response.check = Some(payload.clone()),
            Command::Auth => self.response.auth = Some(payload.clone()),
            Command::AuthFile => self.response.auth_file = Some(payload_string(payload)?),
            Command::AppendAuth => self.response.append_auth = Some(payload.clone()),
            Command::WantFullUri => self.response.want_full_uri = Some(payload.clone()),
            Command::InternalRedirect => {
                self.response.internal_redirect = Some(payload.clone())
            }
            Command::DiscardSession => self.response.discard_session = true,
            Command::SecureCookie => self.response.secure_cookie = true,
            Command::Stateful => self.response.stateful = true,
            Command::Previous => self.response.previous = true,
            Command::CookieDomain => {
                self.response.cookie_domain = Some(payload_string(payload)?)
            }
            Command::CookieHost => self.response.cookie_host = Some(payload_string(payload)?),
            Command::CookiePath => self.response.cookie_path = Some(payload_string(payload)?),
            Command::ExternalSessionManager => {
                self.response.external_session_manager = Some(payload_string(payload)?)
            }
            Command::ExternalSessionKeepalive => {
                if payload.len() != 2 {
                    return Err(err("malformed TRANSLATE_EXTERNAL_SESSION_KEEPALIVE packet"));
                }
                self.response.external_session_keepalive =
                    u16::from_le_bytes([payload[0], payload[1]]);
            }

            // ── cache directives ─────────────────────────────
            Command::MaxAge => {
                if payload.len() != 4 {
                    return Err(err("malformed TRANSLATE_MAX_AGE packet"));
                }
                let value = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                match self.previous_command {
                    Some(Command::User) => self.response.user_max_age = Some(value),
                    _ => self.response.max_age = Some(value),
                }
            }
            Command::ExpiresRelative => {
                if payload.len() != 4 {
                    return Err(err("malformed TRANSLATE_EXPIRES_RELATIVE packet"));
                }
                self.response.expires_relative = Some(u32::from_le_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]));
            }
            Command::Vary => self.response.vary = payload_u16_list(payload)?,
            Command::Invalidate => self.response.invalidate = payload_u16_list(payload)?,
            Command::Want => self.response.want = payload_u16_list(payload)?,

            // ── loop directives ──────────────────────────────
            Command::ErrorDocument => self.response.error_document = Some(payload.clone()),
            Command::FileNotFound => self.response.file_not_found = Some(payload.clone()),
            Command::Enotdir => self.response.enotdir = Some(payload.clone()),
            Command::DirectoryIndex => {
                self.response.directory_index = Some(payload.clone())
            }
            Command::ReadFile => self.response.read_file = Some(payload.clone()),
            Command::ProbePathSuffixes => {
                self.response.probe_path_suffixes = Some(payload.clone())
            }
            Command::ProbeSuffix => {
                if self.response.probe_suffixes.len() >= 16 {
                    return Err(err("too many TRANSLATE_PROBE_SUFFIX packets"));
                }
                self.response.probe_suffixes.push(payload_string(payload)?);
            }

            Command::AutoGzip => self.response.auto_gzip = true,
            Command::AutoDeflate => self.response.auto_deflate = true,
        }

        Ok(None)
    }

    fn start_address(
        &mut self,
        address: ResourceAddress,
        name: &str,
    ) -> Result<(), FerryError> {
        let target = self.current_address_mut();
        if target.is_defined() {
            return Err(err(format!("misplaced TRANSLATE_{} packet", name)));
        }
        *target = address;
        Ok(())
    }

    fn current_view_is_named(&self) -> bool {
        self.response
            .views
            .last()
            .map(|v| v.name.is_some())
            .unwrap_or(false)
    }

    fn current_view_mut(&mut self) -> &mut View {
        self.response.views.last_mut().expect("views never empty")
    }

    fn current_address_mut(&mut self) -> &mut ResourceAddress {
        match self.cursor {
            AddrCursor::Filter => {
                match self.current_view_mut().transformations.last_mut() {
                    Some(Transformation::Filter { address, .. }) => address,
                    _ => unreachable!("filter cursor without filter transformation"),
                }
            }
            AddrCursor::Base => {
                if self.current_view_is_named() {
                    &mut self.current_view_mut().address
                } else {
                    &mut self.response.address
                }
            }
        }
    }

    fn add_transformation(&mut self, t: Transformation) {
        self.current_view_mut().transformations.push(t);
    }

    /// The default view inherits the top-level address when it has
    /// none of its own.
    fn finish_current_view(&mut self) {
        if !self.current_view_is_named() {
            let addr = self.response.address.clone();
            let view = self.current_view_mut();
            if !view.address.is_defined() && addr.is_defined() {
                view.address = addr;
            }
        }
    }

    fn finish(&mut self) -> Result<(), FerryError> {
        self.finish_current_view();

        // later views inherit the default view's address
        let default_addr = {
            let v0 = &self.response.views[0];
            if v0.address.is_defined() {
                v0.address.clone()
            } else {
                self.response.address.clone()
            }
        };
        if !self.response.views[0].address.is_defined() && default_addr.is_defined() {
            self.response.views[0].address = default_addr.clone();
        }
        for view in self.response.views.iter_mut().skip(1) {
            if !view.address.is_defined() {
                view.address = default_addr.clone();
            }
        }

        // CGI-alike finalisation
        let uri = self.response.uri.clone();
        let document_root = self.response.document_root.clone();
        let site = self.response.site.clone();
        if let Some(a) = self.response.address.cgi_mut() {
            if a.uri.is_none() {
                a.uri = uri;
            }
            if a.document_root.is_none() {
                a.document_root = document_root;
            }
            if a.jail {
                if a.home.is_none() {
                    a.home = a.document_root.clone();
                }
                if a.site.is_none() {
                    a.site = site;
                }
                if a.home.is_none() {
                    return Err(err("jailed process without home directory"));
                }
            }
        }

        Ok(())
    }
}

fn parse_header_payload(value: &str) -> Result<(String, String), FerryError> {
    let colon = value
        .find(':')
        .ok_or_else(|| err("malformed HEADER packet"))?;
    let name = value[..colon].trim().to_ascii_lowercase();
    let header_value = value[colon + 1..].trim().to_string();
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic() && b != b':') {
        return Err(err("malformed HEADER packet"));
    }
    if ferry_http_hop_by_hop(&name) {
        return Err(err(format!("hop-by-hop HEADER not allowed: {}", name)));
    }
    Ok((name, header_value))
}

// local copy to avoid a dependency cycle with ferry-http
fn ferry_http_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Packet, write_packet};
    use bytes::BytesMut;

    fn packet(cmd: Command, payload: &[u8]) -> Packet {
        Packet {
            command: cmd as u16,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn parse(packets: &[(Command, &[u8])]) -> Result<TranslateResponse, FerryError> {
        let mut parser = ResponseParser::new();
        for (cmd, payload) in packets {
            if let Some(response) = parser.feed(&packet(*cmd, payload))? {
                return Ok(response);
            }
        }
        panic!("no END packet in test input");
    }

    #[test]
    fn minimal_file_response() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::Path, b"/srv/www/a.html"),
            (Command::End, b""),
        ])
        .unwrap();
        match &r.address {
            ResourceAddress::Local(a) => assert_eq!(a.path, "/srv/www/a.html"),
            other => panic!("expected Local, got {:?}", other),
        }
        // default view inherits the address
        assert_eq!(r.views.len(), 1);
        assert!(r.views[0].address.is_defined());
    }

    #[test]
    fn no_begin_is_an_error() {
        let mut parser = ResponseParser::new();
        let e = parser.feed(&packet(Command::Path, b"/x")).unwrap_err();
        assert!(e.to_string().contains("no BEGIN"));
    }

    #[test]
    fn double_begin_is_an_error() {
        let mut parser = ResponseParser::new();
        parser.feed(&packet(Command::Begin, b"")).unwrap();
        let e = parser.feed(&packet(Command::Begin, b"")).unwrap_err();
        assert!(e.to_string().contains("double BEGIN"));
    }

    #[test]
    fn unknown_command_is_an_error() {
        let mut parser = ResponseParser::new();
        parser.feed(&packet(Command::Begin, b"")).unwrap();
        let e = parser
            .feed(&Packet {
                command: 9999,
                payload: Bytes::new(),
            })
            .unwrap_err();
        assert_eq!(e.to_string(), "translation server failed: unknown translation packet 9999");
    }

    #[test]
    fn double_address_is_misplaced() {
        let e = parse(&[
            (Command::Begin, b""),
            (Command::Path, b"/a"),
            (Command::Proxy, b"http://h/"),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("misplaced TRANSLATE_PROXY"));
    }

    #[test]
    fn path_info_without_cgi_is_misplaced() {
        let e = parse(&[
            (Command::Begin, b""),
            (Command::Proxy, b"http://h/"),
            (Command::PathInfo, b"/x"),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("misplaced TRANSLATE_PATH_INFO"));
    }

    #[test]
    fn fastcgi_with_modifiers() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::Fastcgi, b"/usr/lib/app.fcgi"),
            (Command::ScriptName, b"/app"),
            (Command::PathInfo, b"/sub"),
            (Command::Pair, b"ENV=1"),
            (Command::End, b""),
        ])
        .unwrap();
        let a = r.address.cgi().unwrap();
        assert_eq!(a.path, "/usr/lib/app.fcgi");
        assert_eq!(a.script_name.as_deref(), Some("/app"));
        assert_eq!(a.path_info.as_deref(), Some("/sub"));
        assert_eq!(a.args, vec!["ENV=1".to_string()]);
    }

    #[test]
    fn pair_requires_equals_sign() {
        let e = parse(&[
            (Command::Begin, b""),
            (Command::Fastcgi, b"/app"),
            (Command::Pair, b"novalue"),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("malformed TRANSLATE_PAIR"));
    }

    #[test]
    fn status_validation() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::Status, &404u16.to_le_bytes()),
            (Command::End, b""),
        ])
        .unwrap();
        assert_eq!(r.status, 404);

        let e = parse(&[
            (Command::Begin, b""),
            (Command::Status, &999u16.to_le_bytes()),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("invalid HTTP status code"));

        let e = parse(&[
            (Command::Begin, b""),
            (Command::Status, b"x"),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("size mismatch"));
    }

    #[test]
    fn max_age_applies_to_begin_or_user() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::MaxAge, &60u32.to_le_bytes()),
            (Command::Path, b"/f"),
            (Command::User, b"alice"),
            (Command::MaxAge, &120u32.to_le_bytes()),
            (Command::End, b""),
        ])
        .unwrap();
        assert_eq!(r.max_age, Some(60));
        assert_eq!(r.user, Some("alice".into()));
        assert_eq!(r.user_max_age, Some(120));
    }

    #[test]
    fn untrusted_validation() {
        for bad in [&b""[..], b".x", b"x."] {
            let e = parse(&[
                (Command::Begin, b""),
                (Command::Untrusted, bad),
                (Command::End, b""),
            ])
            .unwrap_err();
            assert!(e.to_string().contains("TRANSLATE_UNTRUSTED"));
        }
        // untrusted and untrusted_prefix are mutually exclusive
        let e = parse(&[
            (Command::Begin, b""),
            (Command::UntrustedPrefix, b"p"),
            (Command::Untrusted, b"h"),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("misplaced TRANSLATE_UNTRUSTED"));
    }

    #[test]
    fn header_packet_validation() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::Header, b"X-Custom: value"),
            (Command::End, b""),
        ])
        .unwrap();
        assert_eq!(
            r.response_headers,
            vec![("x-custom".to_string(), "value".to_string())]
        );

        let e = parse(&[
            (Command::Begin, b""),
            (Command::Header, b"Connection: close"),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("hop-by-hop"));

        let e = parse(&[
            (Command::Begin, b""),
            (Command::Header, b"no-colon"),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("malformed HEADER"));
    }

    #[test]
    fn transformations_build_a_chain() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::Proxy, b"http://app/"),
            (Command::Process, b""),
            (Command::Container, b""),
            (Command::Filter, b""),
            (Command::Fastcgi, b"/filter.fcgi"),
            (Command::End, b""),
        ])
        .unwrap();
        let chain = &r.views[0].transformations;
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0], Transformation::Process { container: true });
        match &chain[1] {
            Transformation::Filter { address, reveal_user } => {
                assert!(!reveal_user);
                assert_eq!(address.cgi().unwrap().path, "/filter.fcgi");
            }
            other => panic!("expected Filter, got {:?}", other),
        }
    }

    #[test]
    fn views_inherit_default_address() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::Proxy, b"http://app/"),
            (Command::Process, b""),
            (Command::View, b"raw"),
            (Command::View, b"other"),
            (Command::Path, b"/var/www/alt.html"),
            (Command::End, b""),
        ])
        .unwrap();
        assert_eq!(r.views.len(), 3);
        assert_eq!(r.views[0].name, None);
        assert_eq!(r.views[1].name.as_deref(), Some("raw"));
        assert_eq!(r.views[2].name.as_deref(), Some("other"));
        // "raw" has no address of its own: inherits the default
        assert_eq!(r.views[1].address, r.views[0].address);
        // "other" has its own
        match &r.views[2].address {
            ResourceAddress::Local(a) => assert_eq!(a.path, "/var/www/alt.html"),
            other => panic!("expected Local, got {:?}", other),
        }
        // transformations attached to the default view only
        assert_eq!(r.views[0].transformations.len(), 1);
        assert!(r.views[1].transformations.is_empty());
    }

    #[test]
    fn invalid_view_name_rejected() {
        let e = parse(&[
            (Command::Begin, b""),
            (Command::View, b"bad name!"),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("invalid view name"));
    }

    #[test]
    fn find_view_by_name() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::Path, b"/f"),
            (Command::View, b"raw"),
            (Command::End, b""),
        ])
        .unwrap();
        assert!(r.find_view(Some("raw")).is_some());
        assert!(r.find_view(Some("missing")).is_none());
        assert_eq!(r.find_view(None).unwrap().name, None);
    }

    #[test]
    fn jail_finalisation_inherits_document_root() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::DocumentRoot, b"/srv/site"),
            (Command::Cgi, b"/usr/bin/script"),
            (Command::JailCgi, b""),
            (Command::End, b""),
        ])
        .unwrap();
        let a = r.address.cgi().unwrap();
        assert!(a.jail);
        assert_eq!(a.home.as_deref(), Some("/srv/site"));
    }

    #[test]
    fn jail_without_home_fails() {
        let e = parse(&[
            (Command::Begin, b""),
            (Command::Cgi, b"/usr/bin/script"),
            (Command::JailCgi, b""),
            (Command::End, b""),
        ])
        .unwrap_err();
        assert!(e.to_string().contains("jailed process without home"));
    }

    #[test]
    fn cgi_inherits_response_uri() {
        let r = parse(&[
            (Command::Begin, b""),
            (Command::Uri, b"/rewritten"),
            (Command::Cgi, b"/usr/bin/script"),
            (Command::End, b""),
        ])
        .unwrap();
        assert_eq!(r.address.cgi().unwrap().uri.as_deref(), Some("/rewritten"));
    }

    #[test]
    fn header_forward_packet() {
        let mut payload = BytesMut::new();
        // cookie group → YES
        payload.extend_from_slice(&(HeaderGroup::Cookie as u16).to_le_bytes());
        payload.extend_from_slice(&1u16.to_le_bytes());
        let r = parse(&[
            (Command::Begin, b""),
            (Command::RequestHeaderForward, &payload),
            (Command::End, b""),
        ])
        .unwrap();
        assert_eq!(r.request_header_forward.get(HeaderGroup::Cookie), ForwardMode::Yes);
        // untouched groups keep defaults
        assert_eq!(
            r.request_header_forward.get(HeaderGroup::Identity),
            ForwardMode::Mangle
        );
    }

    #[test]
    fn header_forward_all_groups() {
        let mut payload = BytesMut::new();
        payload.extend_from_slice(&0xffffu16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        let r = parse(&[
            (Command::Begin, b""),
            (Command::ResponseHeaderForward, &payload),
            (Command::End, b""),
        ])
        .unwrap();
        for group in 0..NUM_HEADER_GROUPS {
            assert_eq!(r.response_header_forward.modes[group], ForwardMode::No);
        }
    }

    #[test]
    fn vary_and_invalidate_lists() {
        let mut vary = BytesMut::new();
        vary.extend_from_slice(&(Command::QueryString as u16).to_le_bytes());
        vary.extend_from_slice(&(Command::Host as u16).to_le_bytes());
        let r = parse(&[
            (Command::Begin, b""),
            (Command::Path, b"/f"),
            (Command::Vary, &vary),
            (Command::End, b""),
        ])
        .unwrap();
        assert!(r.vary_contains(Command::QueryString));
        assert!(r.vary_contains(Command::Host));
        assert!(!r.vary_contains(Command::Session));
    }

    #[test]
    fn cacheability_rules() {
        let mut r = TranslateResponse::empty();
        assert!(r.is_cacheable());
        assert_eq!(r.effective_max_age(), 300);

        r.max_age = Some(60);
        assert_eq!(r.effective_max_age(), 60);

        r.max_age = Some(0);
        assert!(!r.is_cacheable());

        r.max_age = Some(600);
        assert_eq!(r.effective_max_age(), 300);
        assert!(r.is_cacheable());

        r.www_authenticate = Some("Basic".into());
        assert!(!r.is_cacheable());
        r.www_authenticate = None;

        r.status = 404;
        assert!(!r.is_cacheable());
    }

    #[test]
    fn marshal_then_parse_applies_identically() {
        // encode a response stream, parse it twice, compare key fields
        let mut buf = BytesMut::new();
        write_packet(&mut buf, Command::Begin, b"");
        write_packet(&mut buf, Command::Path, b"/srv/foo/bar.html");
        write_packet(&mut buf, Command::Base, b"/foo/");
        write_packet(&mut buf, Command::MaxAge, &120u32.to_le_bytes());
        write_packet(&mut buf, Command::End, b"");
        let raw = buf.freeze();

        let parse_stream = |raw: Bytes| {
            let packets = crate::protocol::parse_packets(raw).unwrap();
            let mut parser = ResponseParser::new();
            for p in &packets {
                if let Some(r) = parser.feed(p).unwrap() {
                    return r;
                }
            }
            panic!("no END");
        };

        let a = parse_stream(raw.clone());
        let b = parse_stream(raw);
        assert_eq!(a.base, b.base);
        assert_eq!(a.max_age, b.max_age);
        assert_eq!(a.address, b.address);
    }
}
