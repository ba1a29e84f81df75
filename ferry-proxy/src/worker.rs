//! Worker threads: one monoio runtime per core, shared-nothing except
//! the session store, health table, and metrics.

use crate::control::ControlCommand;
use crate::handler::ProxyHandler;
use crate::instance::Instance;
use ferry_core::GatewayConfig;
use ferry_http::server::{ConnState, HttpConnection, ServerTunables};
use ferry_observability::MetricsCollector;
use ferry_pool::BulldogTable;
use ferry_session::SessionManager;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Shared state across all worker threads.
pub struct SharedState {
    pub config: Arc<GatewayConfig>,
    pub sessions: Arc<SessionManager>,
    pub bulldog: Arc<BulldogTable>,
    pub metrics: Arc<MetricsCollector>,
}

impl SharedState {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(
            config.session.idle_seconds,
        )));
        Arc::new(SharedState {
            config: Arc::new(config),
            sessions,
            bulldog: Arc::new(BulldogTable::new()),
            metrics: Arc::new(MetricsCollector::default()),
        })
    }
}

/// Spawn monoio worker threads, one per core.
///
/// Each thread runs an independent monoio runtime with its own
/// listener, event loop, and `Instance`.
pub fn spawn_workers(
    shared: Arc<SharedState>,
    num_workers: usize,
    mut control_rxs: Vec<crossbeam_channel::Receiver<ControlCommand>>,
) -> Vec<std::thread::JoinHandle<()>> {
    let listen_addr = shared.config.listener.http_addr;
    let mut handles = Vec::with_capacity(num_workers);

    for worker_id in 0..num_workers {
        let shared = Arc::clone(&shared);
        let control_rx = if control_rxs.is_empty() {
            None
        } else {
            Some(control_rxs.remove(0))
        };

        let handle = std::thread::Builder::new()
            .name(format!("ferry-worker-{}", worker_id))
            .spawn(move || {
                let mut rt = monoio::RuntimeBuilder::<monoio::FusionDriver>::new()
                    .enable_all()
                    .build()
                    .expect("failed to build monoio runtime");

                rt.block_on(worker_loop(worker_id, shared, listen_addr, control_rx));
            })
            .expect("failed to spawn worker thread");

        handles.push(handle);
    }

    info!(workers = num_workers, addr = %listen_addr, "workers spawned");
    handles
}

/// Main loop for a single worker thread.
async fn worker_loop(
    worker_id: usize,
    shared: Arc<SharedState>,
    addr: std::net::SocketAddr,
    control_rx: Option<crossbeam_channel::Receiver<ControlCommand>>,
) {
    use monoio::net::TcpListener;

    let listener = TcpListener::bind(addr).unwrap_or_else(|e| {
        panic!("worker {} failed to bind to {}: {}", worker_id, addr, e);
    });

    info!(worker = worker_id, addr = %addr, "worker listening");

    let instance = Instance::new(
        Arc::clone(&shared.config),
        Arc::clone(&shared.sessions),
        Arc::clone(&shared.bulldog),
        Arc::clone(&shared.metrics),
        control_rx,
    );
    let handler = Rc::new(ProxyHandler::new(Rc::clone(&instance)));

    let tunables = ServerTunables {
        max_body_size: shared.config.proxy.body_buffer_size,
        ..ServerTunables::default()
    };
    let max_connections = shared.config.listener.max_connections;

    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let _ = stream.set_nodelay(true);

                // cold path: control-channel invalidations
                instance.apply_control_messages();

                // overload: drop low-score connections first
                if instance.connections.count() >= max_connections {
                    let dropped = instance.connections.drop_some();
                    instance.metrics.dropped_connections.inc_by(dropped as u64);
                    if dropped == 0 {
                        tracing::warn!(
                            worker = worker_id,
                            "connection limit reached, refusing connection"
                        );
                        drop(stream);
                        continue;
                    }
                }

                let state = ConnState::new();
                instance.connections.add(Rc::clone(&state));

                let local_addr = stream.local_addr().unwrap_or(addr);
                let connection = HttpConnection::new(
                    stream,
                    peer_addr,
                    local_addr,
                    state,
                    tunables.clone(),
                );

                let handler = Rc::clone(&handler);
                let metrics = Arc::clone(&instance.metrics);
                metrics.active_connections.inc();
                monoio::spawn(async move {
                    let end = connection.serve(&*handler).await;
                    tracing::debug!(end = ?end, "connection finished");
                    metrics.active_connections.dec();
                });
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "accept error");
            }
        }
    }
}
