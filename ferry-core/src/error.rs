use thiserror::Error;

/// Classification of an upstream failure, used by the orchestrator to
/// decide between retry, blacklisting, and the response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// Connection refused, or closed before the first response byte.
    Refused,
    /// Connection closed after some response bytes, before the end.
    Premature,
    /// Socket-level I/O failure mid-response.
    Io,
    /// The peer sent bytes that are not valid protocol.
    Garbage,
    /// A read or write timer expired.
    Timeout,
    /// Anything else; not counted as a server failure.
    Unspecified,
}

impl UpstreamErrorKind {
    /// Whether this failure should mark the address in the failure table.
    pub fn is_server_failure(self) -> bool {
        !matches!(self, UpstreamErrorKind::Unspecified)
    }
}

/// Unified error type for ferry.
#[derive(Error, Debug)]
pub enum FerryError {
    #[error("malformed request: {0}")]
    Protocol(String),

    #[error("timeout: {0}")]
    Timeout(&'static str),

    #[error("upstream error ({kind:?}): {message}")]
    Upstream {
        kind: UpstreamErrorKind,
        message: String,
    },

    #[error("translation server failed: {0}")]
    Translation(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found")]
    NotFound,

    #[error("too many {0} loops")]
    Loop(&'static str),

    #[error("request cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl FerryError {
    pub fn upstream(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        FerryError::Upstream {
            kind,
            message: message.into(),
        }
    }

    /// Map to the HTTP status code the client sees.
    pub fn status_code(&self) -> u16 {
        match self {
            FerryError::Protocol(_) => 400,
            FerryError::Timeout(_) => 504,
            FerryError::Upstream { kind, .. } => match kind {
                UpstreamErrorKind::Timeout => 504,
                _ => 502,
            },
            FerryError::Translation(_) => 502,
            FerryError::Forbidden(_) => 403,
            FerryError::NotFound => 404,
            FerryError::Loop(_) => 502,
            FerryError::Cancelled => 499,
            FerryError::Io(_) => 502,
            FerryError::Internal(_) => 500,
        }
    }

    /// The upstream error class, if this is an upstream error.
    pub fn upstream_kind(&self) -> Option<UpstreamErrorKind> {
        match self {
            FerryError::Upstream { kind, .. } => Some(*kind),
            FerryError::Timeout(_) => Some(UpstreamErrorKind::Timeout),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(FerryError::Protocol("x".into()).status_code(), 400);
        assert_eq!(FerryError::Timeout("idle").status_code(), 504);
        assert_eq!(FerryError::Translation("x".into()).status_code(), 502);
        assert_eq!(FerryError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(FerryError::NotFound.status_code(), 404);
        assert_eq!(FerryError::Loop("check").status_code(), 502);
        assert_eq!(
            FerryError::upstream(UpstreamErrorKind::Refused, "refused").status_code(),
            502
        );
        assert_eq!(
            FerryError::upstream(UpstreamErrorKind::Timeout, "slow").status_code(),
            504
        );
    }

    #[test]
    fn loop_error_names_the_counter() {
        assert_eq!(
            FerryError::Loop("CHECK").to_string(),
            "too many CHECK loops"
        );
    }

    #[test]
    fn server_failure_classification() {
        assert!(UpstreamErrorKind::Refused.is_server_failure());
        assert!(UpstreamErrorKind::Premature.is_server_failure());
        assert!(UpstreamErrorKind::Io.is_server_failure());
        assert!(UpstreamErrorKind::Garbage.is_server_failure());
        assert!(UpstreamErrorKind::Timeout.is_server_failure());
        assert!(!UpstreamErrorKind::Unspecified.is_server_failure());
    }

    #[test]
    fn upstream_kind_accessor() {
        let e = FerryError::upstream(UpstreamErrorKind::Premature, "early close");
        assert_eq!(e.upstream_kind(), Some(UpstreamErrorKind::Premature));
        assert_eq!(FerryError::NotFound.upstream_kind(), None);
    }
}
