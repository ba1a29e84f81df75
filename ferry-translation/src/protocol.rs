//! Wire framing of the translation protocol.
//!
//! Each packet is `{u16 length, u16 command}` little-endian, followed
//! by `length` payload bytes.  A transaction is a stream of packets
//! beginning with `BEGIN` and terminated by `END`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ferry_core::FerryError;

/// The stable u16 command registry.  Values 1..=12 are fixed by the
/// first-generation protocol; later directives continue the registry
/// monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    End = 1,
    Begin = 2,
    Host = 3,
    Uri = 4,
    Status = 5,
    Path = 6,
    ContentType = 7,
    Proxy = 8,
    Redirect = 9,
    Filter = 10,
    Process = 11,
    Session = 12,

    Param = 13,
    User = 14,
    Language = 15,
    RemoteHost = 16,
    LocalAddress = 17,
    WidgetType = 18,
    UserAgent = 19,
    Stateful = 20,
    PathInfo = 21,
    Site = 22,
    Cgi = 23,
    DocumentRoot = 24,
    MaxAge = 25,
    Vary = 26,
    QueryString = 27,
    Pipe = 28,
    Base = 29,
    Interpreter = 30,
    Action = 31,
    ScriptName = 32,
    Ajp = 33,
    Fastcgi = 34,
    JailCgi = 35,
    Home = 36,
    Append = 37,
    Pair = 38,
    DiscardSession = 39,
    RequestHeaderForward = 40,
    ResponseHeaderForward = 41,
    WwwAuthenticate = 42,
    AuthenticationInfo = 43,
    Header = 44,
    SecureCookie = 45,
    ErrorDocument = 46,
    Check = 47,
    Previous = 48,
    Was = 49,
    Invalidate = 50,
    Scheme = 51,
    Untrusted = 52,
    UntrustedPrefix = 53,
    UntrustedSiteSuffix = 54,
    Bounce = 55,
    Filter4xx = 56,
    View = 57,
    LocalAddressString = 58,
    Authorization = 59,
    ListenerTag = 60,
    Want = 61,
    WantFullUri = 62,
    Auth = 63,
    AuthFile = 64,
    AppendAuth = 65,
    Realm = 66,
    RealmFromAuthBase = 67,
    SessionSite = 68,
    Lhttp = 69,
    LhttpUri = 70,
    LhttpHost = 71,
    InternalRedirect = 72,
    ContentTypeLookup = 73,
    Suffix = 74,
    DirectoryIndex = 75,
    FileNotFound = 76,
    Enotdir = 77,
    ReadFile = 78,
    ProbePathSuffixes = 79,
    ProbeSuffix = 80,
    TestPath = 81,
    Regex = 82,
    InverseRegex = 83,
    ExpiresRelative = 84,
    ExternalSessionManager = 85,
    ExternalSessionKeepalive = 86,
    CookieDomain = 87,
    CookieHost = 88,
    CookiePath = 89,
    ProcessCss = 90,
    ProcessText = 91,
    Container = 92,
    AutoGzip = 93,
    AutoDeflate = 94,
    Nfs = 95,
    NfsExport = 96,
    Address = 97,
    AddressString = 98,
    Deflated = 99,
    Gzipped = 100,
    RevealUser = 101,
    TcacheInvalidate = 102,
    DumpPools = 103,
    Args = 104,
    RequestHeader = 105,
}

impl Command {
    pub fn from_u16(value: u16) -> Option<Command> {
        use Command::*;
        Some(match value {
            1 => End,
            2 => Begin,
            3 => Host,
            4 => Uri,
            5 => Status,
            6 => Path,
            7 => ContentType,
            8 => Proxy,
            9 => Redirect,
            10 => Filter,
            11 => Process,
            12 => Session,
            13 => Param,
            14 => User,
            15 => Language,
            16 => RemoteHost,
            17 => LocalAddress,
            18 => WidgetType,
            19 => UserAgent,
            20 => Stateful,
            21 => PathInfo,
            22 => Site,
            23 => Cgi,
            24 => DocumentRoot,
            25 => MaxAge,
            26 => Vary,
            27 => QueryString,
            28 => Pipe,
            29 => Base,
            30 => Interpreter,
            31 => Action,
            32 => ScriptName,
            33 => Ajp,
            34 => Fastcgi,
            35 => JailCgi,
            36 => Home,
            37 => Append,
            38 => Pair,
            39 => DiscardSession,
            40 => RequestHeaderForward,
            41 => ResponseHeaderForward,
            42 => WwwAuthenticate,
            43 => AuthenticationInfo,
            44 => Header,
            45 => SecureCookie,
            46 => ErrorDocument,
            47 => Check,
            48 => Previous,
            49 => Was,
            50 => Invalidate,
            51 => Scheme,
            52 => Untrusted,
            53 => UntrustedPrefix,
            54 => UntrustedSiteSuffix,
            55 => Bounce,
            56 => Filter4xx,
            57 => View,
            58 => LocalAddressString,
            59 => Authorization,
            60 => ListenerTag,
            61 => Want,
            62 => WantFullUri,
            63 => Auth,
            64 => AuthFile,
            65 => AppendAuth,
            66 => Realm,
            67 => RealmFromAuthBase,
            68 => SessionSite,
            69 => Lhttp,
            70 => LhttpUri,
            71 => LhttpHost,
            72 => InternalRedirect,
            73 => ContentTypeLookup,
            74 => Suffix,
            75 => DirectoryIndex,
            76 => FileNotFound,
            77 => Enotdir,
            78 => ReadFile,
            79 => ProbePathSuffixes,
            80 => ProbeSuffix,
            81 => TestPath,
            82 => Regex,
            83 => InverseRegex,
            84 => ExpiresRelative,
            85 => ExternalSessionManager,
            86 => ExternalSessionKeepalive,
            87 => CookieDomain,
            88 => CookieHost,
            89 => CookiePath,
            90 => ProcessCss,
            91 => ProcessText,
            92 => Container,
            93 => AutoGzip,
            94 => AutoDeflate,
            95 => Nfs,
            96 => NfsExport,
            97 => Address,
            98 => AddressString,
            99 => Deflated,
            100 => Gzipped,
            101 => RevealUser,
            102 => TcacheInvalidate,
            103 => DumpPools,
            104 => Args,
            105 => RequestHeader,
            _ => return None,
        })
    }
}

/// Append one packet to an outgoing buffer.
pub fn write_packet(buf: &mut BytesMut, command: Command, payload: &[u8]) {
    debug_assert!(payload.len() <= u16::MAX as usize);
    buf.put_u16_le(payload.len() as u16);
    buf.put_u16_le(command as u16);
    buf.put_slice(payload);
}

/// Append a packet only when a payload is present.
pub fn write_optional_packet(buf: &mut BytesMut, command: Command, payload: Option<&[u8]>) {
    if let Some(payload) = payload {
        write_packet(buf, command, payload);
    }
}

/// A raw packet lifted off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub command: u16,
    pub payload: Bytes,
}

impl Packet {
    pub fn known_command(&self) -> Option<Command> {
        Command::from_u16(self.command)
    }
}

/// Try to parse one packet from the front of `input`, advancing it on
/// success.  Returns `None` when more bytes are needed.
pub fn try_parse_packet(input: &mut Bytes) -> Option<Packet> {
    if input.len() < 4 {
        return None;
    }
    let length = u16::from_le_bytes([input[0], input[1]]) as usize;
    let command = u16::from_le_bytes([input[2], input[3]]);
    if input.len() < 4 + length {
        return None;
    }
    input.advance(4);
    let payload = input.split_to(length);
    Some(Packet { command, payload })
}

/// Parse an entire buffer into packets; errors on trailing garbage.
pub fn parse_packets(mut input: Bytes) -> Result<Vec<Packet>, FerryError> {
    let mut out = Vec::new();
    while !input.is_empty() {
        match try_parse_packet(&mut input) {
            Some(p) => out.push(p),
            None => {
                return Err(FerryError::Translation(
                    "incomplete packet at end of stream".into(),
                ));
            }
        }
    }
    Ok(out)
}

/// Payload helper: NUL-free UTF-8 string.
pub fn payload_string(payload: &Bytes) -> Result<String, FerryError> {
    if payload.contains(&0) {
        return Err(FerryError::Translation("NUL byte in string payload".into()));
    }
    String::from_utf8(payload.to_vec())
        .map_err(|_| FerryError::Translation("invalid UTF-8 in string payload".into()))
}

/// Payload helper: little-endian u16 list.
pub fn payload_u16_list(payload: &Bytes) -> Result<Vec<u16>, FerryError> {
    if payload.is_empty() || payload.len() % 2 != 0 {
        return Err(FerryError::Translation("malformed u16 list payload".into()));
    }
    Ok(payload
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_values_are_stable() {
        // the first-generation registry must never move
        assert_eq!(Command::End as u16, 1);
        assert_eq!(Command::Begin as u16, 2);
        assert_eq!(Command::Host as u16, 3);
        assert_eq!(Command::Uri as u16, 4);
        assert_eq!(Command::Status as u16, 5);
        assert_eq!(Command::Path as u16, 6);
        assert_eq!(Command::ContentType as u16, 7);
        assert_eq!(Command::Proxy as u16, 8);
        assert_eq!(Command::Redirect as u16, 9);
        assert_eq!(Command::Filter as u16, 10);
        assert_eq!(Command::Process as u16, 11);
        assert_eq!(Command::Session as u16, 12);
    }

    #[test]
    fn from_u16_round_trip() {
        for v in 1..=105u16 {
            let cmd = Command::from_u16(v).unwrap_or_else(|| panic!("gap at {}", v));
            assert_eq!(cmd as u16, v);
        }
        assert_eq!(Command::from_u16(0), None);
        assert_eq!(Command::from_u16(9999), None);
    }

    #[test]
    fn packet_round_trip() {
        let mut buf = BytesMut::new();
        write_packet(&mut buf, Command::Begin, b"");
        write_packet(&mut buf, Command::Uri, b"/index.html");
        write_packet(&mut buf, Command::End, b"");

        let packets = parse_packets(buf.freeze()).unwrap();
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].known_command(), Some(Command::Begin));
        assert_eq!(packets[1].known_command(), Some(Command::Uri));
        assert_eq!(&packets[1].payload[..], b"/index.html");
        assert_eq!(packets[2].known_command(), Some(Command::End));
    }

    #[test]
    fn framing_is_little_endian() {
        let mut buf = BytesMut::new();
        write_packet(&mut buf, Command::Uri, b"/x");
        let raw = buf.freeze();
        assert_eq!(&raw[..], &[2, 0, 4, 0, b'/', b'x']);
    }

    #[test]
    fn incremental_parse_needs_full_packet() {
        let mut buf = BytesMut::new();
        write_packet(&mut buf, Command::Uri, b"/index.html");
        let full = buf.freeze();

        let mut partial = full.slice(..3);
        assert!(try_parse_packet(&mut partial).is_none());

        let mut partial = full.slice(..full.len() - 1);
        assert!(try_parse_packet(&mut partial).is_none());

        let mut whole = full.clone();
        let p = try_parse_packet(&mut whole).unwrap();
        assert_eq!(p.known_command(), Some(Command::Uri));
        assert!(whole.is_empty());
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let mut buf = BytesMut::new();
        write_packet(&mut buf, Command::End, b"");
        buf.put_slice(&[0xff, 0xff]);
        assert!(parse_packets(buf.freeze()).is_err());
    }

    #[test]
    fn u16_list_payload() {
        let payload = Bytes::from_static(&[26, 0, 3, 0]);
        assert_eq!(payload_u16_list(&payload).unwrap(), vec![26, 3]);
        assert!(payload_u16_list(&Bytes::from_static(&[1])).is_err());
        assert!(payload_u16_list(&Bytes::new()).is_err());
    }

    #[test]
    fn string_payload_rejects_nul() {
        assert!(payload_string(&Bytes::from_static(b"ok")).is_ok());
        assert!(payload_string(&Bytes::from_static(b"b\0d")).is_err());
    }
}
