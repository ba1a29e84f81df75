//! 64-bit session ids with an embedded cluster hash.

use std::fmt;

/// A session id.  The low 32 bits double as the cluster hash for
/// session-modulo backend stickiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    /// Generate a fresh random id.
    pub fn generate() -> SessionId {
        let bytes = uuid::Uuid::new_v4();
        let mut raw = u64::from_le_bytes(bytes.as_bytes()[..8].try_into().unwrap());
        if raw == 0 {
            raw = 1;
        }
        SessionId(raw)
    }

    /// Parse the 16-hex-digit cookie form.
    pub fn parse(s: &str) -> Option<SessionId> {
        if s.len() != 16 {
            return None;
        }
        u64::from_str_radix(s, 16).ok().filter(|&v| v != 0).map(SessionId)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// The hash used for SESSION_MODULO backend stickiness.
    pub fn cluster_hash(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parse_round_trip() {
        let id = SessionId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 16);
        assert_eq!(SessionId::parse(&s), Some(id));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(SessionId::parse(""), None);
        assert_eq!(SessionId::parse("zzzz"), None);
        assert_eq!(SessionId::parse("0123456789abcde"), None); // 15 digits
        assert_eq!(SessionId::parse("0123456789abcdef0"), None); // 17 digits
        assert_eq!(SessionId::parse("0000000000000000"), None); // zero id
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn cluster_hash_is_low_bits() {
        let id = SessionId::parse("0123456789abcdef").unwrap();
        assert_eq!(id.cluster_hash(), 0x89abcdef);
    }
}
