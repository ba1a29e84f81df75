//! Address of a resource: a local file, a CGI-style script, or a
//! remote server speaking one of the backend protocols.

use crate::uri::unescape_sane_suffix;
use serde::{Deserialize, Serialize};

/// A local filesystem address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAddress {
    pub path: String,
    /// Path of a deflate-compressed sibling, if the translation server
    /// declared one.
    pub deflated: Option<String>,
    /// Path of a gzip-compressed sibling.
    pub gzipped: Option<String>,
    pub content_type: Option<String>,
    pub document_root: Option<String>,
}

impl FileAddress {
    pub fn new(path: impl Into<String>) -> Self {
        FileAddress {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Address of an HTTP (or AJP) server, parsed from an absolute URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpAddress {
    /// "host" or "host:port" exactly as it appeared in the URL.
    pub host_and_port: String,
    /// Path component, always starting with "/".
    pub path: String,
    /// Explicit socket addresses to connect to; when empty, the
    /// host_and_port is resolved instead.
    pub addresses: Vec<String>,
}

impl HttpAddress {
    /// Parse "http://host:port/path" (the scheme is tolerated but
    /// ignored; AJP addresses use the same shape).
    pub fn parse(url: &str) -> Option<Self> {
        let rest = url
            .strip_prefix("http://")
            .or_else(|| url.strip_prefix("ajp://"))
            .unwrap_or(url);
        let (host_and_port, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };
        if host_and_port.is_empty() {
            return None;
        }
        Some(HttpAddress {
            host_and_port: host_and_port.to_string(),
            path: path.to_string(),
            addresses: Vec::new(),
        })
    }
}

/// Address of a CGI-style resource (CGI, FastCGI, WAS, PIPE).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgiAddress {
    /// Path of the executable (or the FastCGI/WAS socket peer's binary).
    pub path: String,
    pub args: Vec<String>,
    pub interpreter: Option<String>,
    pub action: Option<String>,
    pub uri: Option<String>,
    pub script_name: Option<String>,
    pub path_info: Option<String>,
    pub query_string: Option<String>,
    pub document_root: Option<String>,
    /// Pre-spawned daemon addresses (remote FastCGI / WAS); when empty
    /// the executable is spawned locally.
    pub address_list: Vec<String>,
    /// Run the child inside the site jail.
    pub jail: bool,
    /// Home directory for the jailed child.
    pub home: Option<String>,
    /// Site id for the jail.
    pub site: Option<String>,
}

impl CgiAddress {
    pub fn new(path: impl Into<String>) -> Self {
        CgiAddress {
            path: path.into(),
            ..Default::default()
        }
    }

    /// The URI presented to the script: explicit `uri`, or
    /// script_name + path_info + "?" + query_string.
    pub fn cgi_uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }
        let mut out = self.script_name.clone().unwrap_or_default();
        if let Some(pi) = &self.path_info {
            out.push_str(pi);
        }
        if let Some(q) = &self.query_string {
            out.push('?');
            out.push_str(q);
        }
        out
    }
}

/// Address of a local-HTTP child process: the executable is spawned (or
/// leased) and spoken to over HTTP on a private unix socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LhttpAddress {
    pub path: String,
    pub args: Vec<String>,
    /// Request URI sent to the child.
    pub uri: String,
    /// Value for the Host header sent to the child.
    pub host: Option<String>,
}

/// Address of a file on an NFS export.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsAddress {
    pub server: String,
    pub export: String,
    pub path: String,
}

/// The tagged resource address union.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAddress {
    #[default]
    None,
    Local(FileAddress),
    Http(HttpAddress),
    Ajp(HttpAddress),
    Lhttp(LhttpAddress),
    Pipe(CgiAddress),
    Cgi(CgiAddress),
    Fastcgi(CgiAddress),
    Was(CgiAddress),
    Nfs(NfsAddress),
}

/// Remove `suffix` from the end of `s`, requiring that the character
/// before the suffix is '/' (or that the suffix is the whole remainder
/// of a path ending in '/').  Returns the base prefix.
fn strip_base_suffix<'a>(s: &'a str, suffix: &str) -> Option<&'a str> {
    let stripped = s.strip_suffix(suffix)?;
    if stripped.ends_with('/') { Some(stripped) } else { None }
}

impl ResourceAddress {
    pub fn is_defined(&self) -> bool {
        !matches!(self, ResourceAddress::None)
    }

    /// Is this a CGI address, or a similar protocol?
    pub fn is_cgi_alike(&self) -> bool {
        matches!(
            self,
            ResourceAddress::Cgi(_) | ResourceAddress::Fastcgi(_) | ResourceAddress::Was(_)
        )
    }

    pub fn cgi(&self) -> Option<&CgiAddress> {
        match self {
            ResourceAddress::Pipe(a)
            | ResourceAddress::Cgi(a)
            | ResourceAddress::Fastcgi(a)
            | ResourceAddress::Was(a) => Some(a),
            _ => None,
        }
    }

    pub fn cgi_mut(&mut self) -> Option<&mut CgiAddress> {
        match self {
            ResourceAddress::Pipe(a)
            | ResourceAddress::Cgi(a)
            | ResourceAddress::Fastcgi(a)
            | ResourceAddress::Was(a) => Some(a),
            _ => None,
        }
    }

    /// A string identifying the address, usable as a cache key part.
    pub fn id(&self) -> String {
        match self {
            ResourceAddress::None => String::new(),
            ResourceAddress::Local(a) => format!("file:{}", a.path),
            ResourceAddress::Http(a) => format!("http://{}{}", a.host_and_port, a.path),
            ResourceAddress::Ajp(a) => format!("ajp://{}{}", a.host_and_port, a.path),
            ResourceAddress::Lhttp(a) => format!("lhttp:{}|{}", a.path, a.uri),
            ResourceAddress::Pipe(a) => format!("pipe:{}", a.path),
            ResourceAddress::Cgi(a) => format!("cgi:{}{}", a.path, a.cgi_uri()),
            ResourceAddress::Fastcgi(a) => format!("fastcgi:{}{}", a.path, a.cgi_uri()),
            ResourceAddress::Was(a) => format!("was:{}{}", a.path, a.cgi_uri()),
            ResourceAddress::Nfs(a) => format!("nfs://{}/{}{}", a.server, a.export, a.path),
        }
    }

    /// Duplicate this address with the given suffix removed, yielding
    /// the BASE parent that the translation cache stores.  Returns
    /// `None` if the suffix does not match or this address type cannot
    /// have a base.
    pub fn save_base(&self, suffix: &str) -> Option<ResourceAddress> {
        let unescaped = unescape_sane_suffix(suffix)?;
        match self {
            ResourceAddress::Local(a) => {
                let base = strip_base_suffix(&a.path, &unescaped)?;
                let mut out = a.clone();
                out.path = base.to_string();
                // compressed siblings are specific to the full path
                out.deflated = None;
                out.gzipped = None;
                Some(ResourceAddress::Local(out))
            }
            ResourceAddress::Http(a) => {
                let base = strip_base_suffix(&a.path, &unescaped)?;
                let mut out = a.clone();
                out.path = base.to_string();
                Some(ResourceAddress::Http(out))
            }
            ResourceAddress::Ajp(a) => {
                let base = strip_base_suffix(&a.path, &unescaped)?;
                let mut out = a.clone();
                out.path = base.to_string();
                Some(ResourceAddress::Ajp(out))
            }
            ResourceAddress::Nfs(a) => {
                let base = strip_base_suffix(&a.path, &unescaped)?;
                let mut out = a.clone();
                out.path = base.to_string();
                Some(ResourceAddress::Nfs(out))
            }
            ResourceAddress::Cgi(_)
            | ResourceAddress::Fastcgi(_)
            | ResourceAddress::Was(_) => {
                let a = self.cgi().unwrap();
                let path_info = a.path_info.as_deref()?;
                let base = strip_base_suffix(path_info, &unescaped)?;
                let mut out = a.clone();
                out.path_info = Some(base.to_string());
                out.uri = None;
                Some(self.with_cgi(out))
            }
            _ => None,
        }
    }

    /// Duplicate this BASE address and append a suffix, reconstructing
    /// the concrete child address.  Returns `None` if the suffix is
    /// malformed or this address type cannot have a base.
    pub fn load_base(&self, suffix: &str) -> Option<ResourceAddress> {
        let unescaped = unescape_sane_suffix(suffix)?;
        match self {
            ResourceAddress::Local(a) => {
                debug_assert!(a.path.ends_with('/'));
                let mut out = a.clone();
                out.path = format!("{}{}", a.path, unescaped);
                Some(ResourceAddress::Local(out))
            }
            ResourceAddress::Http(a) => {
                let mut out = a.clone();
                out.path = format!("{}{}", a.path, unescaped);
                Some(ResourceAddress::Http(out))
            }
            ResourceAddress::Ajp(a) => {
                let mut out = a.clone();
                out.path = format!("{}{}", a.path, unescaped);
                Some(ResourceAddress::Ajp(out))
            }
            ResourceAddress::Nfs(a) => {
                let mut out = a.clone();
                out.path = format!("{}{}", a.path, unescaped);
                Some(ResourceAddress::Nfs(out))
            }
            ResourceAddress::Cgi(_)
            | ResourceAddress::Fastcgi(_)
            | ResourceAddress::Was(_) => {
                let a = self.cgi().unwrap();
                let base = a.path_info.as_deref().unwrap_or("/");
                let mut out = a.clone();
                out.path_info = Some(format!("{}{}", base, unescaped));
                Some(self.with_cgi(out))
            }
            _ => None,
        }
    }

    /// Duplicate with the query string from the given URI inserted, for
    /// address types that carry one.
    pub fn insert_query_string_from(&self, uri: &str) -> ResourceAddress {
        let Some(q) = uri.find('?').map(|i| &uri[i + 1..]) else {
            return self.clone();
        };
        if q.is_empty() {
            return self.clone();
        }
        match self {
            ResourceAddress::Http(a) => {
                let mut out = a.clone();
                if out.path.contains('?') {
                    out.path.push('&');
                } else {
                    out.path.push('?');
                }
                out.path.push_str(q);
                ResourceAddress::Http(out)
            }
            ResourceAddress::Ajp(a) => {
                let mut out = a.clone();
                if out.path.contains('?') {
                    out.path.push('&');
                } else {
                    out.path.push('?');
                }
                out.path.push_str(q);
                ResourceAddress::Ajp(out)
            }
            ResourceAddress::Cgi(_)
            | ResourceAddress::Fastcgi(_)
            | ResourceAddress::Was(_) => {
                let a = self.cgi().unwrap();
                let mut out = a.clone();
                out.query_string = Some(match &a.query_string {
                    Some(existing) => format!("{}&{}", q, existing),
                    None => q.to_string(),
                });
                self.with_cgi(out)
            }
            _ => self.clone(),
        }
    }

    /// Duplicate with the URI args segment appended to the path info.
    pub fn insert_args(&self, args: &str, path_info: &str) -> ResourceAddress {
        match self {
            ResourceAddress::Http(a) => {
                let mut out = a.clone();
                out.path = format!("{};{}{}", a.path, args, path_info);
                ResourceAddress::Http(out)
            }
            ResourceAddress::Ajp(a) => {
                let mut out = a.clone();
                out.path = format!("{};{}{}", a.path, args, path_info);
                ResourceAddress::Ajp(out)
            }
            ResourceAddress::Cgi(_)
            | ResourceAddress::Fastcgi(_)
            | ResourceAddress::Was(_) => {
                let a = self.cgi().unwrap();
                let mut out = a.clone();
                out.path_info = Some(format!(
                    "{};{}{}",
                    a.path_info.as_deref().unwrap_or(""),
                    args,
                    path_info
                ));
                self.with_cgi(out)
            }
            _ => self.clone(),
        }
    }

    fn with_cgi(&self, a: CgiAddress) -> ResourceAddress {
        match self {
            ResourceAddress::Pipe(_) => ResourceAddress::Pipe(a),
            ResourceAddress::Cgi(_) => ResourceAddress::Cgi(a),
            ResourceAddress::Fastcgi(_) => ResourceAddress::Fastcgi(a),
            ResourceAddress::Was(_) => ResourceAddress::Was(a),
            _ => unreachable!("with_cgi on non-CGI address"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── save_base / load_base on local files ─────────────────────

    #[test]
    fn local_save_load_base() {
        let addr = ResourceAddress::Local(FileAddress::new("/var/www/foo/bar.html"));

        let base = addr.save_base("bar.html").unwrap();
        match &base {
            ResourceAddress::Local(a) => assert_eq!(a.path, "/var/www/foo/"),
            other => panic!("expected Local, got {:?}", other),
        }

        let child = base.load_base("index.html").unwrap();
        match &child {
            ResourceAddress::Local(a) => assert_eq!(a.path, "/var/www/foo/index.html"),
            other => panic!("expected Local, got {:?}", other),
        }
    }

    #[test]
    fn local_save_base_requires_matching_suffix() {
        let addr = ResourceAddress::Local(FileAddress::new("/var/www/foo/bar.html"));
        assert!(addr.save_base("other.html").is_none());
        // no slash before the suffix
        assert!(addr.save_base("foo/bar.html").is_some());
        assert!(addr.save_base("o/bar.html").is_none());
    }

    #[test]
    fn load_base_rejects_traversal() {
        let base = ResourceAddress::Local(FileAddress::new("/var/www/foo/"));
        for evil in [
            "../hackme",
            ".%2e/hackme",
            "foo//bar",
            "foo/./bar",
            "foo/../bar",
            "foo/%2e/bar",
            "foo/.%2e/bar",
            "foo/.%2e",
            "f%00",
        ] {
            assert!(base.load_base(evil).is_none(), "accepted {:?}", evil);
        }
    }

    #[test]
    fn escaped_suffix_round_trip() {
        let addr = ResourceAddress::Local(FileAddress::new("/var/www/foo/space .txt"));
        let base = addr.save_base("space%20.txt").unwrap();
        match &base {
            ResourceAddress::Local(a) => assert_eq!(a.path, "/var/www/foo/"),
            other => panic!("expected Local, got {:?}", other),
        }
        let child = base.load_base("index%2ehtml").unwrap();
        match &child {
            ResourceAddress::Local(a) => assert_eq!(a.path, "/var/www/foo/index.html"),
            other => panic!("expected Local, got {:?}", other),
        }
    }

    // ── save_base / load_base on CGI path info ───────────────────

    #[test]
    fn cgi_save_load_base() {
        let mut cgi = CgiAddress::new("/usr/lib/cgi-bin/foo.pl");
        cgi.path_info = Some("/bar/baz".into());
        let addr = ResourceAddress::Cgi(cgi);

        let base = addr.save_base("bar/baz").unwrap();
        assert_eq!(base.cgi().unwrap().path_info.as_deref(), Some("/"));

        let child = base.load_base("").unwrap();
        assert_eq!(child.cgi().unwrap().path_info.as_deref(), Some("/"));

        let child = base.load_base("xyz").unwrap();
        assert_eq!(child.cgi().unwrap().path_info.as_deref(), Some("/xyz"));

        let base2 = addr.save_base("baz").unwrap();
        assert_eq!(base2.cgi().unwrap().path_info.as_deref(), Some("/bar/"));

        let child = base2.load_base("bar/").unwrap();
        assert_eq!(child.cgi().unwrap().path_info.as_deref(), Some("/bar/bar/"));

        let child = base2.load_base("bar/xyz").unwrap();
        assert_eq!(child.cgi().unwrap().path_info.as_deref(), Some("/bar/bar/xyz"));
    }

    // ── http addresses ───────────────────────────────────────────

    #[test]
    fn http_address_parse() {
        let a = HttpAddress::parse("http://backend:8080/app/").unwrap();
        assert_eq!(a.host_and_port, "backend:8080");
        assert_eq!(a.path, "/app/");

        let a = HttpAddress::parse("http://backend").unwrap();
        assert_eq!(a.path, "/");

        assert!(HttpAddress::parse("http:///nohost").is_none());
    }

    #[test]
    fn http_save_load_base() {
        let addr =
            ResourceAddress::Http(HttpAddress::parse("http://b:80/app/page.html").unwrap());
        let base = addr.save_base("page.html").unwrap();
        match &base {
            ResourceAddress::Http(a) => assert_eq!(a.path, "/app/"),
            other => panic!("expected Http, got {:?}", other),
        }
        let child = base.load_base("other.html").unwrap();
        match &child {
            ResourceAddress::Http(a) => assert_eq!(a.path, "/app/other.html"),
            other => panic!("expected Http, got {:?}", other),
        }
    }

    // ── query string / args insertion ────────────────────────────

    #[test]
    fn insert_query_string() {
        let addr =
            ResourceAddress::Http(HttpAddress::parse("http://b/app").unwrap());
        match addr.insert_query_string_from("/x?a=1") {
            ResourceAddress::Http(a) => assert_eq!(a.path, "/app?a=1"),
            other => panic!("expected Http, got {:?}", other),
        }
        // no query string: unchanged
        assert_eq!(addr.insert_query_string_from("/x"), addr);
    }

    #[test]
    fn insert_query_string_cgi_prepends() {
        let mut cgi = CgiAddress::new("/bin/app");
        cgi.query_string = Some("fixed=1".into());
        let addr = ResourceAddress::Fastcgi(cgi);
        let out = addr.insert_query_string_from("/x?a=1");
        assert_eq!(
            out.cgi().unwrap().query_string.as_deref(),
            Some("a=1&fixed=1")
        );
    }

    #[test]
    fn cgi_uri_composition() {
        let mut cgi = CgiAddress::new("/bin/app");
        cgi.script_name = Some("/app".into());
        cgi.path_info = Some("/sub".into());
        cgi.query_string = Some("a=1".into());
        assert_eq!(cgi.cgi_uri(), "/app/sub?a=1");

        cgi.uri = Some("/explicit".into());
        assert_eq!(cgi.cgi_uri(), "/explicit");
    }

    #[test]
    fn none_has_no_base() {
        assert!(ResourceAddress::None.save_base("x").is_none());
        assert!(ResourceAddress::None.load_base("x").is_none());
    }
}
