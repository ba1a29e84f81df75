//! Sticky-aware selection of one backend address from a cluster list.

use crate::bulldog::BulldogTable;
use crate::failure::{FailureStatus, FailureTable};
use crate::stock::TcpStock;
use ferry_core::FerryError;
use ferry_core::error::UpstreamErrorKind;
use monoio::net::TcpStream;
use std::cell::Cell;
use std::net::IpAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// How long a connect failure blacklists an address.
pub const FAILED_HOLD: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StickyMode {
    #[default]
    None,
    Failover,
    SourceIp,
    SessionModulo,
    Cookie,
    JvmRoute,
}

/// A cluster: orderered addresses plus the sticky strategy.
#[derive(Debug, Clone, Default)]
pub struct AddressList {
    pub addresses: Vec<String>,
    pub sticky_mode: StickyMode,
    /// Tomcat-style route names parallel to `addresses`, for
    /// `StickyMode::JvmRoute`.
    pub jvm_routes: Vec<String>,
}

impl AddressList {
    pub fn single(addr: impl Into<String>) -> Self {
        AddressList {
            addresses: vec![addr.into()],
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// The outcome of a successful lease.
#[derive(Debug)]
pub struct BalancedStream {
    pub stream: TcpStream,
    pub addr: String,
    /// When `Cookie` stickiness generated a fresh node cookie, its
    /// 1-based value; the caller emits `ferry_lb_node=0-<hex>`.
    pub new_cookie: Option<u32>,
}

/// Derive a sticky hash from the client address.
pub fn socket_address_sticky(ip: IpAddr) -> u32 {
    match ip {
        IpAddr::V4(v4) => u32::from_be_bytes(v4.octets()),
        IpAddr::V6(v6) => {
            let o = v6.octets();
            let mut h: u32 = 0;
            for chunk in o.chunks_exact(4) {
                h ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
            h
        }
    }
}

/// Parse the `ferry_lb_node=0-<hex>` cookie value into the 1-based
/// node index.
pub fn lb_cookie_value(value: &str) -> Option<u32> {
    let hex = value.strip_prefix("0-")?;
    u32::from_str_radix(hex, 16).ok().filter(|&v| v > 0)
}

pub fn format_lb_cookie(value: u32) -> String {
    format!("0-{:x}", value)
}

pub struct TcpBalancer {
    failure: Rc<FailureTable>,
    bulldog: Arc<BulldogTable>,
    next_rr: Cell<usize>,
}

impl TcpBalancer {
    pub fn new(failure: Rc<FailureTable>, bulldog: Arc<BulldogTable>) -> Self {
        TcpBalancer {
            failure,
            bulldog,
            next_rr: Cell::new(0),
        }
    }

    pub fn failure_table(&self) -> &FailureTable {
        &self.failure
    }

    fn node_ok(&self, addr: &str) -> bool {
        self.failure.is_usable(addr) && self.bulldog.check(addr)
    }

    /// Generate a sticky cookie value (1-based node index) avoiding
    /// failing and fading nodes.  Falls back to an arbitrary node when
    /// everything is down.
    pub fn generate_cookie(&self, list: &AddressList) -> u32 {
        debug_assert!(list.len() >= 2);
        let n = list.len() as u32;
        let seed = u32::from_le_bytes(
            uuid::Uuid::new_v4().as_bytes()[..4].try_into().unwrap(),
        );
        let first = (seed % n) + 1;
        let mut i = first;
        loop {
            let addr = &list.addresses[(i as usize) % list.len()];
            if self.failure.get(addr) == FailureStatus::Ok
                && self.bulldog.check(addr)
                && !self.bulldog.is_fading(addr)
            {
                return i;
            }
            i = (i % n) + 1;
            if i == first {
                return first;
            }
        }
    }

    /// The candidate order for one request.  `sticky_hint` is the
    /// mode-specific selector value (0 = none).
    fn candidate_order(&self, list: &AddressList, sticky_hint: u32) -> Vec<usize> {
        let n = list.len();
        let start = match list.sticky_mode {
            StickyMode::Failover => 0,
            StickyMode::None => {
                // round-robin start, skipping known-bad nodes
                let mut start = self.next_rr.get() % n;
                self.next_rr.set(start + 1);
                for probe in 0..n {
                    let i = (start + probe) % n;
                    if self.node_ok(&list.addresses[i]) {
                        start = i;
                        break;
                    }
                }
                start
            }
            StickyMode::SourceIp | StickyMode::SessionModulo => (sticky_hint as usize) % n,
            StickyMode::Cookie | StickyMode::JvmRoute => {
                if sticky_hint >= 1 && (sticky_hint as usize) <= n {
                    (sticky_hint as usize) - 1
                } else {
                    self.next_rr.replace(self.next_rr.get() + 1) % n
                }
            }
        };
        (0..n).map(|i| (start + i) % n).collect()
    }

    /// Lease a connection to one node of the cluster, trying up to
    /// `list.len()` candidates.
    pub async fn get(
        &self,
        stock: &TcpStock,
        list: &AddressList,
        sticky_hint: u32,
    ) -> Result<BalancedStream, FerryError> {
        if list.is_empty() {
            return Err(FerryError::upstream(
                UpstreamErrorKind::Unspecified,
                "empty address list",
            ));
        }

        let mut new_cookie = None;
        let mut sticky_hint = sticky_hint;
        if list.sticky_mode == StickyMode::Cookie && sticky_hint == 0 && list.len() >= 2 {
            let value = self.generate_cookie(list);
            new_cookie = Some(value);
            sticky_hint = value;
        }

        let order = self.candidate_order(list, sticky_hint);
        let mut last_error = None;

        for (tried, &index) in order.iter().enumerate() {
            let addr = &list.addresses[index];

            // skip known-bad candidates while an alternative remains
            if !self.node_ok(addr) && tried + 1 < order.len() {
                continue;
            }

            match stock.get(addr).await {
                Ok(stream) => {
                    return Ok(BalancedStream {
                        stream,
                        addr: addr.clone(),
                        new_cookie,
                    });
                }
                Err(e) => {
                    tracing::debug!(addr = %addr, error = %e, "balancer candidate failed");
                    self.failure.set(addr, FailureStatus::Failed, FAILED_HOLD);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            FerryError::upstream(UpstreamErrorKind::Refused, "all cluster nodes failed")
        }))
    }

    /// A successful response clears a `Response` mark on the address.
    pub fn on_response_success(&self, addr: &str) {
        self.failure.unset(addr, FailureStatus::Response);
    }

    /// A server-failure response blacklists the address briefly.
    pub fn on_response_failure(&self, addr: &str) {
        self.failure.set(addr, FailureStatus::Response, FAILED_HOLD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer() -> TcpBalancer {
        TcpBalancer::new(Rc::new(FailureTable::new()), Arc::new(BulldogTable::new()))
    }

    fn cluster(n: usize, mode: StickyMode) -> AddressList {
        AddressList {
            addresses: (0..n).map(|i| format!("10.0.0.{}:80", i + 1)).collect(),
            sticky_mode: mode,
            jvm_routes: Vec::new(),
        }
    }

    #[test]
    fn failover_always_starts_at_zero() {
        let b = balancer();
        let list = cluster(3, StickyMode::Failover);
        for _ in 0..5 {
            let order = b.candidate_order(&list, 0);
            assert_eq!(order, vec![0, 1, 2]);
        }
    }

    #[test]
    fn round_robin_rotates() {
        let b = balancer();
        let list = cluster(3, StickyMode::None);
        let first = b.candidate_order(&list, 0)[0];
        let second = b.candidate_order(&list, 0)[0];
        assert_ne!(first, second);
    }

    #[test]
    fn round_robin_skips_failed_nodes() {
        let b = balancer();
        let list = cluster(3, StickyMode::None);
        b.failure
            .set("10.0.0.1:80", FailureStatus::Failed, Duration::from_secs(20));
        for _ in 0..6 {
            let order = b.candidate_order(&list, 0);
            assert_ne!(order[0], 0, "failed node must not start the order");
        }
    }

    #[test]
    fn source_ip_is_deterministic() {
        let b = balancer();
        let list = cluster(3, StickyMode::SourceIp);
        let hash = socket_address_sticky("192.168.1.7".parse().unwrap());
        let a = b.candidate_order(&list, hash)[0];
        let bb = b.candidate_order(&list, hash)[0];
        assert_eq!(a, bb);
        assert_eq!(a, (hash as usize) % 3);
    }

    #[test]
    fn cookie_value_selects_node() {
        let b = balancer();
        let list = cluster(3, StickyMode::Cookie);
        // cookie value is the 1-based index
        assert_eq!(b.candidate_order(&list, 2)[0], 1);
        assert_eq!(b.candidate_order(&list, 3)[0], 2);
        // out-of-range values fall back to rotation
        let order = b.candidate_order(&list, 9);
        assert!(order[0] < 3);
    }

    #[test]
    fn lb_cookie_parsing() {
        assert_eq!(lb_cookie_value("0-1"), Some(1));
        assert_eq!(lb_cookie_value("0-a"), Some(10));
        assert_eq!(lb_cookie_value("1-1"), None);
        assert_eq!(lb_cookie_value("0-0"), None);
        assert_eq!(lb_cookie_value("junk"), None);
        assert_eq!(format_lb_cookie(10), "0-a");
    }

    #[test]
    fn generate_cookie_avoids_failed_nodes() {
        let b = balancer();
        let list = cluster(3, StickyMode::Cookie);
        b.failure
            .set("10.0.0.1:80", FailureStatus::Failed, Duration::from_secs(20));
        b.failure
            .set("10.0.0.2:80", FailureStatus::Failed, Duration::from_secs(20));
        for _ in 0..10 {
            // only node 3 is healthy
            assert_eq!(b.generate_cookie(&list), 3);
        }
    }

    #[test]
    fn generate_cookie_all_failed_falls_back() {
        let b = balancer();
        let list = cluster(2, StickyMode::Cookie);
        for addr in &list.addresses {
            b.failure
                .set(addr, FailureStatus::Failed, Duration::from_secs(20));
        }
        let v = b.generate_cookie(&list);
        assert!(v >= 1 && v <= 2);
    }

    #[test]
    fn sticky_hash_ipv4() {
        assert_eq!(
            socket_address_sticky("1.2.3.4".parse().unwrap()),
            0x01020304
        );
    }

    #[monoio::test(timer_enabled = true)]
    async fn get_reports_all_failed() {
        let b = balancer();
        // unroutable ports
        let list = AddressList {
            addresses: vec!["127.0.0.1:1".into()],
            sticky_mode: StickyMode::Failover,
            jvm_routes: Vec::new(),
        };
        let stock = TcpStock::new(4, Duration::from_secs(60), Duration::from_millis(200));
        let err = b.get(&stock, &list, 0).await.unwrap_err();
        assert!(matches!(err, FerryError::Upstream { .. }));
        // the failure must have been recorded
        assert_eq!(b.failure.get("127.0.0.1:1"), FailureStatus::Failed);
    }

    #[test]
    fn empty_list_is_an_error() {
        let list = AddressList::default();
        assert!(list.is_empty());
    }
}
