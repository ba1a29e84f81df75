//! Backend health oracle.
//!
//! A background prober thread runs plain TCP connect checks against
//! the known backends and publishes the result map via `arc-swap`;
//! workers read it lock-free on the request path.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHealth {
    pub healthy: bool,
    /// Still answering, but scheduled for drain: the balancer avoids
    /// it for new sticky assignments.
    pub fading: bool,
}

pub struct BulldogTable {
    map: ArcSwap<HashMap<String, NodeHealth>>,
}

impl Default for BulldogTable {
    fn default() -> Self {
        Self::new()
    }
}

impl BulldogTable {
    pub fn new() -> Self {
        BulldogTable {
            map: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Unknown nodes are assumed healthy.
    pub fn check(&self, addr: &str) -> bool {
        self.map
            .load()
            .get(addr)
            .map(|h| h.healthy)
            .unwrap_or(true)
    }

    pub fn is_fading(&self, addr: &str) -> bool {
        self.map
            .load()
            .get(addr)
            .map(|h| h.fading)
            .unwrap_or(false)
    }

    pub fn publish(&self, map: HashMap<String, NodeHealth>) {
        self.map.store(Arc::new(map));
    }
}

/// Spawn the prober thread.  Nodes flip unhealthy after
/// `unhealthy_failures` consecutive failed connects, and healthy again
/// after `healthy_successes` consecutive good ones.
pub fn spawn_prober(
    table: Arc<BulldogTable>,
    nodes: Vec<String>,
    interval: Duration,
    timeout: Duration,
    healthy_successes: u32,
    unhealthy_failures: u32,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("ferry-bulldog".to_string())
        .spawn(move || {
            let mut success_counts: HashMap<String, u32> = HashMap::new();
            let mut failure_counts: HashMap<String, u32> = HashMap::new();
            let mut states: HashMap<String, NodeHealth> = HashMap::new();

            loop {
                for node in &nodes {
                    let ok = probe(node, timeout);
                    if ok {
                        let count = success_counts.entry(node.clone()).or_insert(0);
                        *count += 1;
                        failure_counts.insert(node.clone(), 0);
                        if *count >= healthy_successes {
                            states.insert(
                                node.clone(),
                                NodeHealth {
                                    healthy: true,
                                    fading: false,
                                },
                            );
                        }
                    } else {
                        let count = failure_counts.entry(node.clone()).or_insert(0);
                        *count += 1;
                        success_counts.insert(node.clone(), 0);
                        if *count >= unhealthy_failures {
                            tracing::warn!(node = %node, "node marked unhealthy");
                            states.insert(
                                node.clone(),
                                NodeHealth {
                                    healthy: false,
                                    fading: false,
                                },
                            );
                        }
                    }
                }
                table.publish(states.clone());
                std::thread::sleep(interval);
            }
        })
        .expect("failed to spawn bulldog prober thread")
}

fn probe(node: &str, timeout: Duration) -> bool {
    let addrs: Vec<SocketAddr> = match node.to_socket_addrs() {
        Ok(iter) => iter.collect(),
        Err(_) => return false,
    };
    addrs
        .iter()
        .any(|sa| TcpStream::connect_timeout(sa, timeout).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_nodes_are_healthy() {
        let table = BulldogTable::new();
        assert!(table.check("10.0.0.1:80"));
        assert!(!table.is_fading("10.0.0.1:80"));
    }

    #[test]
    fn published_state_is_visible() {
        let table = BulldogTable::new();
        let mut map = HashMap::new();
        map.insert(
            "10.0.0.1:80".to_string(),
            NodeHealth {
                healthy: false,
                fading: false,
            },
        );
        map.insert(
            "10.0.0.2:80".to_string(),
            NodeHealth {
                healthy: true,
                fading: true,
            },
        );
        table.publish(map);

        assert!(!table.check("10.0.0.1:80"));
        assert!(table.check("10.0.0.2:80"));
        assert!(table.is_fading("10.0.0.2:80"));
    }
}
