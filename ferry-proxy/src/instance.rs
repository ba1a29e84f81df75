//! Per-worker service container.
//!
//! Every construct receives the `Instance` explicitly; there are no
//! global singletons.  Shared-between-workers state is limited to the
//! session manager, the bulldog health table, and the metrics
//! registry.

use crate::backends::lhttp::LhttpStock;
use crate::control::ControlCommand;
use crate::drop_policy::ConnectionRegistry;
use crate::transform::ProcessorRegistry;
use ferry_core::{FerryError, GatewayConfig};
use ferry_observability::MetricsCollector;
use ferry_pool::{BulldogTable, FailureTable, TcpBalancer, TcpStock};
use ferry_session::SessionManager;
use ferry_translation::{TranslateRequest, TranslateResponse, TranslateStock, TranslationCache};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

pub struct Instance {
    pub config: Arc<GatewayConfig>,

    pub tstock: TranslateStock,
    pub tcache: RefCell<TranslationCache>,

    pub tcp_stock: Rc<TcpStock>,
    pub balancer: TcpBalancer,

    pub sessions: Arc<SessionManager>,
    pub metrics: Arc<MetricsCollector>,
    pub connections: ConnectionRegistry,
    pub processors: ProcessorRegistry,
    pub lhttp: LhttpStock,

    control_rx: Option<crossbeam_channel::Receiver<ControlCommand>>,
}

impl Instance {
    pub fn new(
        config: Arc<GatewayConfig>,
        sessions: Arc<SessionManager>,
        bulldog: Arc<BulldogTable>,
        metrics: Arc<MetricsCollector>,
        control_rx: Option<crossbeam_channel::Receiver<ControlCommand>>,
    ) -> Rc<Self> {
        let failure = Rc::new(FailureTable::new());
        let tstock = TranslateStock::new(
            config.translation.addr.clone(),
            Duration::from_millis(config.translation.write_timeout_ms),
            Duration::from_millis(config.translation.read_timeout_ms),
        );
        let tcache = RefCell::new(TranslationCache::new(config.translation.cache_entries));
        let tcp_stock = Rc::new(TcpStock::new(
            config.proxy.pool_limit,
            Duration::from_secs(config.proxy.pool_idle_seconds),
            Duration::from_millis(config.proxy.connect_timeout_ms),
        ));
        let balancer = TcpBalancer::new(Rc::clone(&failure), bulldog);

        Rc::new(Instance {
            config,
            tstock,
            tcache,
            tcp_stock,
            balancer,
            sessions,
            metrics,
            connections: ConnectionRegistry::new(),
            processors: ProcessorRegistry::default(),
            lhttp: LhttpStock::new(),
            control_rx,
        })
    }

    /// Upstream read/write timeouts for backend clients.
    pub fn upstream_read_timeout(&self) -> Duration {
        Duration::from_millis(self.config.proxy.read_timeout_ms)
    }

    pub fn upstream_write_timeout(&self) -> Duration {
        Duration::from_millis(self.config.proxy.write_timeout_ms)
    }

    /// One translate turn through the cache.
    pub async fn translate(
        &self,
        request: &TranslateRequest,
    ) -> Result<TranslateResponse, FerryError> {
        let cache_enabled = self.config.translation.cache_entries > 0;

        if cache_enabled {
            if let Some(response) = self.tcache.borrow_mut().lookup(request) {
                self.metrics.tcache_hits.inc();
                return Ok(response);
            }
            self.metrics.tcache_misses.inc();
        }

        let response = self.tstock.translate(request).await?;

        if cache_enabled {
            let mut tcache = self.tcache.borrow_mut();
            if !response.invalidate.is_empty() {
                tcache.invalidate(request, &response.invalidate, None);
            }
            tcache.store(request, &response);
        }

        Ok(response)
    }

    /// Drain pending control operations; called from the accept loop.
    pub fn apply_control_messages(&self) {
        let Some(rx) = &self.control_rx else { return };
        while let Ok(op) = rx.try_recv() {
            match op {
                ControlCommand::TcacheInvalidate {
                    request,
                    dims,
                    site,
                } => {
                    let mut tcache = self.tcache.borrow_mut();
                    match site {
                        Some(site) => {
                            tcache.invalidate_site(&site);
                        }
                        None if dims.is_empty() => tcache.clear(),
                        None => {
                            tcache.invalidate(&request, &dims, None);
                        }
                    }
                }
                ControlCommand::DumpPools => {
                    tracing::info!(
                        sessions = self.sessions.len(),
                        tcache_entries = self.tcache.borrow().len(),
                        connections = self.connections.count(),
                        "pool dump"
                    );
                }
            }
        }
    }
}
