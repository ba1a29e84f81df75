// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  ferry — translation-driven web application frontend
//
//  Architecture: monoio thread-per-core + shared-nothing data plane
//  Routing:      external translation server, vary-aware cache
//  Control:      UDP invalidation channel fanned out to workers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use clap::Parser;
use ferry_core::GatewayConfig;
use ferry_proxy::control::{ControlCommand, parse_control_datagram};
use ferry_proxy::worker::{self, SharedState};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

/// Global shutdown flag, set by the signal handler.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Parser, Debug)]
#[command(name = "ferry", version, about = "ferry — translation-driven web frontend")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/ferry/ferry.yaml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // ── Tracing ──
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "ferry starting — monoio thread-per-core engine"
    );

    // ── Config ──
    let config = if cli.config.exists() {
        info!(path = %cli.config.display(), "loading config file");
        GatewayConfig::load(&cli.config)?
    } else {
        info!("no config file found, using defaults");
        GatewayConfig::default()
    };

    let num_workers = config.effective_workers();
    info!(workers = num_workers, "worker count");

    // ── Shared state ──
    let shared = SharedState::new(config.clone());

    // ── Bulldog health prober ──
    if config.bulldog.enabled && !config.bulldog.nodes.is_empty() {
        ferry_pool::bulldog::spawn_prober(
            Arc::clone(&shared.bulldog),
            config.bulldog.nodes.clone(),
            Duration::from_secs(config.bulldog.interval_seconds),
            Duration::from_secs(config.bulldog.timeout_seconds),
            config.bulldog.healthy_successes,
            config.bulldog.unhealthy_failures,
        );
        info!(nodes = config.bulldog.nodes.len(), "bulldog prober started");
    }

    // ── Control channel ──
    let mut control_rxs = Vec::new();
    if config.control.enabled {
        let mut control_txs = Vec::with_capacity(num_workers);
        for _ in 0..num_workers {
            let (tx, rx) = crossbeam_channel::unbounded::<ControlCommand>();
            control_txs.push(tx);
            control_rxs.push(rx);
        }
        spawn_control_listener(config.control.addr, control_txs)?;
        info!(addr = %config.control.addr, "control listener started");
    }

    // ── Worker threads ──
    let worker_handles = worker::spawn_workers(Arc::clone(&shared), num_workers, control_rxs);

    info!(
        workers = num_workers,
        proxy_addr = %config.listener.http_addr,
        translation = %config.translation.addr,
        "ferry is ready — serving traffic"
    );

    // ── Graceful shutdown: wait for SIGTERM/SIGINT ──
    setup_signal_handler();

    while !SHUTDOWN.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("shutdown signal received, stopping...");

    // workers run an infinite accept loop; on process exit, all
    // threads are cleaned up by the OS
    drop(worker_handles);

    info!("ferry stopped");
    Ok(())
}

/// Receive control datagrams and fan the parsed operations out to
/// every worker.
fn spawn_control_listener(
    addr: std::net::SocketAddr,
    txs: Vec<crossbeam_channel::Sender<ControlCommand>>,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let socket = std::net::UdpSocket::bind(addr)?;
    let handle = std::thread::Builder::new()
        .name("ferry-control".to_string())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                let (n, peer) = match socket.recv_from(&mut buf) {
                    Ok(x) => x,
                    Err(e) => {
                        tracing::warn!(error = %e, "control socket receive failed");
                        continue;
                    }
                };
                let data = bytes::Bytes::copy_from_slice(&buf[..n]);
                match parse_control_datagram(data) {
                    Ok(ops) => {
                        for op in ops {
                            for tx in &txs {
                                let _ = tx.send(op.clone());
                            }
                        }
                    }
                    Err(e) => {
                        tracing::info!(peer = %peer, error = %e, "malformed control datagram");
                    }
                }
            }
        })?;
    Ok(handle)
}

fn setup_signal_handler() {
    // SIGTERM (docker stop) + SIGINT (Ctrl+C)
    for sig in [libc::SIGTERM, libc::SIGINT] {
        unsafe {
            libc::signal(sig, signal_handler as libc::sighandler_t);
        }
    }
}

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}
