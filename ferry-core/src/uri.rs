//! Request-URI dissection and escaping.
//!
//! A client URI has the shape `/base;args/path_info?query`.  The args
//! segment carries frontend state (`session=...`, `focus=...`) as
//! `&`-separated pairs; everything after it up to the query string is
//! path info addressed to the focused widget or CGI script.

use std::collections::BTreeMap;

/// The dissected parts of a request URI.  All parts are stored
/// percent-encoded exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DissectedUri {
    /// Path up to (not including) the args separator or query string.
    pub base: String,
    /// URI args (`k=v` pairs joined by `&`), if present.
    pub args: BTreeMap<String, String>,
    /// Whether an args segment was present at all.
    pub has_args: bool,
    /// Path info following the args segment.
    pub path_info: String,
    /// Query string, without the leading `?`.
    pub query: Option<String>,
}

impl DissectedUri {
    pub fn parse(uri: &str) -> Self {
        let (without_query, query) = match uri.find('?') {
            Some(i) => (&uri[..i], Some(uri[i + 1..].to_string())),
            None => (uri, None),
        };

        match without_query.find(';') {
            Some(semi) => {
                let base = without_query[..semi].to_string();
                let rest = &without_query[semi + 1..];
                let (args_str, path_info) = match rest.find('/') {
                    Some(slash) => (&rest[..slash], rest[slash..].to_string()),
                    None => (rest, String::new()),
                };
                DissectedUri {
                    base,
                    args: parse_args(args_str),
                    has_args: true,
                    path_info,
                    query,
                }
            }
            None => DissectedUri {
                base: without_query.to_string(),
                args: BTreeMap::new(),
                has_args: false,
                path_info: String::new(),
                query,
            },
        }
    }

    /// The args segment in wire form.
    pub fn args_string(&self) -> String {
        format_args_map(&self.args)
    }

    /// Reassemble the URI from its parts.
    pub fn assemble(&self) -> String {
        let mut out = self.base.clone();
        if !self.args.is_empty() {
            out.push(';');
            out.push_str(&format_args_map(&self.args));
            out.push_str(&self.path_info);
        }
        if let Some(q) = &self.query {
            out.push('?');
            out.push_str(q);
        }
        out
    }
}

fn parse_args(s: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in s.split('&') {
        if pair.is_empty() {
            continue;
        }
        match pair.find('=') {
            Some(i) => map.insert(pair[..i].to_string(), pair[i + 1..].to_string()),
            None => map.insert(pair.to_string(), String::new()),
        };
    }
    map
}

fn format_args_map(args: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in args {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(k);
        out.push('=');
        out.push_str(v);
    }
    out
}

/// Decode percent-escapes.  Returns `None` when the input contains an
/// incomplete or non-hex escape, or encodes a NUL byte.
pub fn unescape(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len() {
                return None;
            }
            let hi = hex_digit(bytes[i + 1])?;
            let lo = hex_digit(bytes[i + 2])?;
            let b = (hi << 4) | lo;
            if b == 0 {
                return None;
            }
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Unescape a path suffix and verify it is safe to splice onto a base
/// path: no NUL, no "//", no "." or ".." segments.
pub fn unescape_sane_suffix(suffix: &str) -> Option<String> {
    let unescaped = unescape(suffix)?;
    if unescaped.contains("//") {
        return None;
    }
    for segment in unescaped.split('/') {
        if segment == "." || segment == ".." {
            return None;
        }
    }
    Some(unescaped)
}
