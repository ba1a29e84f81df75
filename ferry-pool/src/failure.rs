//! Track recently failed backend addresses so the balancer can skip
//! them briefly.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The kind of failure recorded for an address.  Transitions are
/// monotone until the entry expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailureStatus {
    Ok,
    /// An external monitor flagged the node.
    Monitor,
    /// The upstream answered with a server-failure response.
    Response,
    /// The node did not accept a connection.
    Failed,
}

struct Entry {
    status: FailureStatus,
    expires: Instant,
}

/// Per-worker failure table keyed by the canonical address string.
#[derive(Default)]
pub struct FailureTable {
    map: RefCell<HashMap<String, Entry>>,
}

impl FailureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure.  An existing worse (greater) unexpired status
    /// is kept.
    pub fn set(&self, addr: &str, status: FailureStatus, duration: Duration) {
        assert!(status != FailureStatus::Ok);
        let mut map = self.map.borrow_mut();
        let now = Instant::now();
        let entry = map.entry(addr.to_string()).or_insert(Entry {
            status,
            expires: now + duration,
        });
        if entry.expires <= now || status >= entry.status {
            entry.status = status;
            entry.expires = now + duration;
        }
    }

    /// Clear a specific status (e.g. `Response` after a success);
    /// a worse status stays.
    pub fn unset(&self, addr: &str, status: FailureStatus) {
        let mut map = self.map.borrow_mut();
        if let Some(entry) = map.get(addr) {
            if entry.status <= status {
                map.remove(addr);
            }
        }
    }

    pub fn get(&self, addr: &str) -> FailureStatus {
        let mut map = self.map.borrow_mut();
        match map.get(addr) {
            Some(entry) if entry.expires > Instant::now() => entry.status,
            Some(_) => {
                map.remove(addr);
                FailureStatus::Ok
            }
            None => FailureStatus::Ok,
        }
    }

    /// Is the address currently usable?
    pub fn is_usable(&self, addr: &str) -> bool {
        !matches!(
            self.get(addr),
            FailureStatus::Failed | FailureStatus::Response
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_address_is_ok() {
        let table = FailureTable::new();
        assert_eq!(table.get("10.0.0.1:80"), FailureStatus::Ok);
        assert!(table.is_usable("10.0.0.1:80"));
    }

    #[test]
    fn set_and_get() {
        let table = FailureTable::new();
        table.set("10.0.0.1:80", FailureStatus::Failed, Duration::from_secs(20));
        assert_eq!(table.get("10.0.0.1:80"), FailureStatus::Failed);
        assert!(!table.is_usable("10.0.0.1:80"));
        // other addresses unaffected
        assert!(table.is_usable("10.0.0.2:80"));
    }

    #[test]
    fn expired_entry_is_ok() {
        let table = FailureTable::new();
        table.set("10.0.0.1:80", FailureStatus::Failed, Duration::ZERO);
        assert_eq!(table.get("10.0.0.1:80"), FailureStatus::Ok);
    }

    #[test]
    fn worse_status_wins() {
        let table = FailureTable::new();
        table.set("a:80", FailureStatus::Response, Duration::from_secs(20));
        table.set("a:80", FailureStatus::Failed, Duration::from_secs(20));
        assert_eq!(table.get("a:80"), FailureStatus::Failed);
        // a lesser status does not downgrade
        table.set("a:80", FailureStatus::Response, Duration::from_secs(20));
        assert_eq!(table.get("a:80"), FailureStatus::Failed);
    }

    #[test]
    fn unset_clears_only_lesser_or_equal() {
        let table = FailureTable::new();
        table.set("a:80", FailureStatus::Response, Duration::from_secs(20));
        table.unset("a:80", FailureStatus::Response);
        assert_eq!(table.get("a:80"), FailureStatus::Ok);

        table.set("a:80", FailureStatus::Failed, Duration::from_secs(20));
        table.unset("a:80", FailureStatus::Response);
        assert_eq!(table.get("a:80"), FailureStatus::Failed);
    }

    #[test]
    fn monitor_is_usable() {
        let table = FailureTable::new();
        table.set("a:80", FailureStatus::Monitor, Duration::from_secs(20));
        assert!(table.is_usable("a:80"));
    }
}
