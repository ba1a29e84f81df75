//! Keyed pool of upstream TCP connections.
//!
//! Items are keyed by the canonical "host:port" string.  At most
//! `limit` connections may be busy per key; idle items expire after
//! `idle_expiry` and are destroyed on `put(reuse=false)`.

use ferry_core::FerryError;
use ferry_core::error::UpstreamErrorKind;
use monoio::net::TcpStream;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

struct IdleItem {
    stream: TcpStream,
    since: Instant,
}

#[derive(Default)]
struct Pools {
    idle: HashMap<String, VecDeque<IdleItem>>,
    busy: HashMap<String, usize>,
}

pub struct TcpStock {
    pools: RefCell<Pools>,
    /// Per-key busy cap.
    limit: usize,
    idle_expiry: Duration,
    connect_timeout: Duration,
}

/// Resolve an address string to socket addresses, IPv4 first.  Most
/// upstreams listen on IPv4 only, and on dual-stack hosts "localhost"
/// often resolves to `::1` first.
fn resolve_addrs(addr: &str) -> Vec<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return vec![sa];
    }
    use std::net::ToSocketAddrs;
    let all: Vec<SocketAddr> = match addr.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return vec![],
    };
    let mut v4: Vec<SocketAddr> = all.iter().copied().filter(|a| a.is_ipv4()).collect();
    v4.extend(all.iter().copied().filter(|a| a.is_ipv6()));
    v4
}

impl TcpStock {
    pub fn new(limit: usize, idle_expiry: Duration, connect_timeout: Duration) -> Self {
        TcpStock {
            pools: RefCell::new(Pools::default()),
            limit,
            idle_expiry,
            connect_timeout,
        }
    }

    /// Lease a connection: an unexpired idle one if available,
    /// otherwise a fresh connect, subject to the per-key busy cap.
    pub async fn get(&self, addr: &str) -> Result<TcpStream, FerryError> {
        {
            let mut pools = self.pools.borrow_mut();
            let busy = pools.busy.get(addr).copied().unwrap_or(0);
            if busy >= self.limit {
                return Err(FerryError::upstream(
                    UpstreamErrorKind::Unspecified,
                    format!("connection limit reached for {}", addr),
                ));
            }

            if let Some(queue) = pools.idle.get_mut(addr) {
                let now = Instant::now();
                while let Some(item) = queue.pop_front() {
                    if now.duration_since(item.since) < self.idle_expiry {
                        *pools.busy.entry(addr.to_string()).or_insert(0) += 1;
                        return Ok(item.stream);
                    }
                    // expired: drop closes the fd
                }
            }
            *pools.busy.entry(addr.to_string()).or_insert(0) += 1;
        }

        match self.connect(addr).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.release(addr);
                Err(e)
            }
        }
    }

    async fn connect(&self, addr: &str) -> Result<TcpStream, FerryError> {
        let candidates = resolve_addrs(addr);
        if candidates.is_empty() {
            return Err(FerryError::upstream(
                UpstreamErrorKind::Refused,
                format!("address resolve failed: {}", addr),
            ));
        }
        let mut last_error = None;
        for sa in &candidates {
            let connect = TcpStream::connect(*sa);
            match monoio::time::timeout(self.connect_timeout, connect).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(addr = %addr, resolved = %sa, "upstream connected");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    tracing::debug!(addr = %addr, resolved = %sa, error = %e, "upstream candidate failed");
                    last_error = Some(FerryError::upstream(
                        UpstreamErrorKind::Refused,
                        format!("connect to {} failed: {}", addr, e),
                    ));
                }
                Err(_) => {
                    last_error = Some(FerryError::upstream(
                        UpstreamErrorKind::Timeout,
                        format!("connect to {} timed out", addr),
                    ));
                }
            }
        }
        Err(last_error.unwrap())
    }

    /// Return a leased connection.  `reuse=false` destroys it.
    pub fn put(&self, addr: &str, stream: TcpStream, reuse: bool) {
        let mut pools = self.pools.borrow_mut();
        if let Some(busy) = pools.busy.get_mut(addr) {
            *busy = busy.saturating_sub(1);
        }
        if reuse {
            let queue = pools.idle.entry(addr.to_string()).or_default();
            if queue.len() < self.limit {
                queue.push_back(IdleItem {
                    stream,
                    since: Instant::now(),
                });
                return;
            }
        }
        // dropped here: closes the fd
    }

    /// Release the busy slot for a lease whose stream was consumed
    /// elsewhere (e.g. handed to a tunnel).
    pub fn release(&self, addr: &str) {
        let mut pools = self.pools.borrow_mut();
        if let Some(busy) = pools.busy.get_mut(addr) {
            *busy = busy.saturating_sub(1);
        }
    }

    pub fn idle_count(&self, addr: &str) -> usize {
        self.pools
            .borrow()
            .idle
            .get(addr)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn busy_count(&self, addr: &str) -> usize {
        self.pools.borrow().busy.get(addr).copied().unwrap_or(0)
    }
}
