//! Rewrite absolute URIs (usually Location headers) emitted by a
//! backend behind an internal base so they point at the externally
//! visible base.

/// If `uri` has an authority, it must equal `internal_host` exactly
/// (byte compare, including the port); the path portion is returned.
/// Relative URIs are not supported.
fn match_uri_host<'a>(uri: &'a str, internal_host: &str) -> Option<&'a str> {
    let path = if let Some(rest) = uri.strip_prefix("http://") {
        let rest = rest.strip_prefix(internal_host)?;
        rest
    } else if let Some(rest) = uri.strip_prefix("//") {
        rest.strip_prefix(internal_host)?
    } else {
        uri
    };

    if path.starts_with('/') { Some(path) } else { None }
}

/// `uri` minus the `base` prefix, or `None` if `uri` does not start
/// with `base`.
fn uri_base_tail<'a>(uri: &'a str, base: &str) -> Option<&'a str> {
    uri.strip_prefix(base)
}

/// `uri` minus the `tail` suffix, requiring a '/' before the tail.
fn uri_prefix_before_tail<'a>(uri: &'a str, tail: &str) -> Option<&'a str> {
    if uri.len() <= tail.len() {
        return None;
    }
    let prefix = uri.strip_suffix(tail)?;
    if prefix.ends_with('/') { Some(prefix) } else { None }
}

/// Relocate `uri` from the internal namespace to the external one.
///
/// `external_path` must start with `base`; `internal_path` must end
/// with the remaining tail (preceded by a '/'); `uri`'s path must start
/// with the resulting internal prefix.  Returns `None` when any of the
/// three subtraction constraints fails.
pub fn relocate_uri(
    uri: &str,
    internal_host: &str,
    internal_path: &str,
    external_scheme: &str,
    external_host: &str,
    external_path: &str,
    base: &str,
) -> Option<String> {
    let path = match_uri_host(uri, internal_host)?;
    let tail = uri_base_tail(external_path, base)?;
    let prefix = uri_prefix_before_tail(internal_path, tail)?;
    let tail2 = uri_base_tail(path, prefix)?;

    Some(format!(
        "{}://{}{}{}",
        external_scheme, external_host, base, tail2
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(
        uri: &str,
        internal_host: &str,
        internal_path: &str,
        external_path: &str,
        base: &str,
        expected: Option<&str>,
    ) {
        let relocated = relocate_uri(
            uri,
            internal_host,
            internal_path,
            "https",
            "external-host:80",
            external_path,
            base,
        );
        assert_eq!(relocated.as_deref(), expected, "uri={:?}", uri);
    }

    #[test]
    fn absolute_uri_is_relocated() {
        check(
            "http://internal-host/int-base/c",
            "internal-host",
            "/int-base/request",
            "/ext-base/request",
            "/ext-base/",
            Some("https://external-host:80/ext-base/c"),
        );
    }

    #[test]
    fn protocol_relative_uri_is_relocated() {
        check(
            "//internal-host/int-base/c",
            "internal-host",
            "/int-base/request",
            "/ext-base/request",
            "/ext-base/",
            Some("https://external-host:80/ext-base/c"),
        );
    }

    #[test]
    fn path_only_uri_is_relocated() {
        check(
            "/int-base/c",
            "i",
            "/int-base/request",
            "/ext-base/request",
            "/ext-base/",
            Some("https://external-host:80/ext-base/c"),
        );
    }

    #[test]
    fn relative_uri_fails() {
        check(
            "c",
            "internal-host",
            "/int-base/request",
            "/ext-base/request",
            "/ext-base/",
            None,
        );
    }

    #[test]
    fn host_mismatch_fails() {
        check(
            "//host-mismatch/int-base/c",
            "internal-host",
            "/int-base/request",
            "/ext-base/request",
            "/ext-base/",
            None,
        );
    }

    #[test]
    fn internal_base_mismatch_fails() {
        check(
            "http://internal-host/wrong-base/c",
            "internal-host",
            "/int-base/request",
            "/ext-base/request",
            "/ext-base/",
            None,
        );
    }

    #[test]
    fn external_base_mismatch_fails() {
        check(
            "http://internal-host/int-base/c",
            "internal-host",
            "/int-base/request",
            "/wrong-base/request",
            "/ext-base/",
            None,
        );
    }
}
