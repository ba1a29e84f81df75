//! Small HTTP helpers: token lists, hop-by-hop classification, and
//! Range header parsing.

/// Result of parsing a Range request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// No usable range; serve the whole entity.
    None,
    /// Serve `length` bytes starting at `skip`.
    Valid { skip: u64, length: u64 },
    /// The range is syntactically or semantically invalid (416).
    Invalid,
}

/// Parse `bytes=A-B` against an entity of `size` bytes.
///
/// `bytes=A-` serves the remainder ("wget -c"); `bytes=-N` serves the
/// last N bytes; a suffix covering the whole entity degenerates to
/// `None`.
pub fn parse_range_header(p: &str, size: u64) -> RangeSpec {
    let Some(spec) = p.strip_prefix("bytes=") else {
        return RangeSpec::Invalid;
    };

    if let Some(suffix) = spec.strip_prefix('-') {
        // suffix-byte-range-spec
        let Ok(n) = suffix.parse::<u64>() else {
            return RangeSpec::Invalid;
        };
        if n >= size {
            return RangeSpec::None;
        }
        return RangeSpec::Valid {
            skip: size - n,
            length: n,
        };
    }

    let (first, rest) = match spec.find('-') {
        Some(i) => (&spec[..i], &spec[i + 1..]),
        None => return RangeSpec::Invalid,
    };
    let Ok(skip) = first.parse::<u64>() else {
        return RangeSpec::Invalid;
    };
    if skip >= size {
        return RangeSpec::Invalid;
    }

    if rest.is_empty() {
        // open-ended: everything from skip
        return RangeSpec::Valid {
            skip,
            length: size - skip,
        };
    }

    let Ok(last) = rest.parse::<u64>() else {
        return RangeSpec::Invalid;
    };
    if last < skip || last >= size {
        return RangeSpec::Invalid;
    }

    RangeSpec::Valid {
        skip,
        length: last + 1 - skip,
    }
}

/// Does the comma-separated list `list` contain `item`?  Elements may
/// be quoted; comparison is case-insensitive per HTTP token rules.
pub fn http_list_contains(list: &str, item: &str) -> bool {
    let item = item.trim_matches('"');
    list.split(',').any(|element| {
        let element = element.trim().trim_matches('"');
        element.eq_ignore_ascii_case(item)
    })
}

/// Hop-by-hop headers are never forwarded across a proxy boundary
/// (RFC 7230 §6.1).
pub fn is_hop_by_hop(name: &str) -> bool {
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

/// Does the client accept the given content coding?
pub fn accepts_encoding(accept_encoding: Option<&str>, coding: &str) -> bool {
    match accept_encoding {
        Some(list) => http_list_contains(list, coding),
        None => false,
    }
}
