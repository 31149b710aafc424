//! Composition root wiring the node pool, fan-out, log tailer and
//! orchestrator together from one [`MonitorConfig`].

use replmon_pool::{ConnectionFactory, NodePool};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::events::{EventBus, EventKind, ListenerId, MonitorEvent};
use crate::fanout::QueryFanout;
use crate::log_tailer::LogTailer;
use crate::model::CycleResult;
use crate::orchestrator::PollOrchestrator;
use crate::pglogical::PglogicalCache;
use crate::position::PositionStore;

/// A configured replication monitor
#[derive(Debug)]
pub struct Monitor {
    config: MonitorConfig,
    pool: NodePool,
    capabilities: Arc<PglogicalCache>,
    tailer: Option<Arc<LogTailer>>,
    orchestrator: PollOrchestrator,
}

impl Monitor {
    /// Validate `config`, register its nodes and open the position file.
    ///
    /// Nothing is polled until [`Monitor::start`].
    pub async fn new(config: MonitorConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.validate()?;

        let pool = NodePool::new(config.node_pool.clone(), factory);
        for (id, node) in &config.nodes {
            pool.add_node(id.clone(), node.clone())?;
        }

        let tailer = if config.log_tailer.is_enabled() {
            let positions = match &config.log_tailer.position_file {
                Some(path) => PositionStore::open(path).await?,
                None => PositionStore::in_memory(),
            };
            let locations: HashMap<_, _> = config
                .log_tailer
                .nodes
                .iter()
                .map(|(id, location)| (id.clone(), location.clone()))
                .collect();
            Some(Arc::new(LogTailer::new(
                pool.clone(),
                locations,
                Arc::new(positions),
            )))
        } else {
            None
        };

        let capabilities = Arc::new(PglogicalCache::new());
        let fanout = QueryFanout::new(pool.clone(), capabilities.clone(), tailer.clone());
        let orchestrator =
            PollOrchestrator::new(pool.clone(), fanout, Arc::new(EventBus::new()), config.poll);

        info!(
            nodes = config.nodes.len(),
            log_nodes = config.log_tailer.nodes.len(),
            "replication monitor configured"
        );

        Ok(Self {
            config,
            pool,
            capabilities,
            tailer,
            orchestrator,
        })
    }

    /// Build a monitor that connects with tokio-postgres
    #[cfg(feature = "postgres")]
    pub async fn with_postgres(config: MonitorConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(replmon_pool::postgres::PgConnectionFactory),
        )
        .await
    }

    /// Start health checks and polling
    pub fn start(&self) -> Result<()> {
        self.pool.start()?;
        self.orchestrator.start();
        Ok(())
    }

    /// Stop polling; health checks keep running
    pub fn stop(&self) {
        self.orchestrator.stop();
    }

    /// Stop polling and close every connection
    pub async fn shutdown(&self) {
        self.orchestrator.stop();
        self.pool.shutdown().await;
        info!("replication monitor shut down");
    }

    /// Configuration the monitor was built from
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Node pool
    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    /// Poll orchestrator
    pub fn orchestrator(&self) -> &PollOrchestrator {
        &self.orchestrator
    }

    /// Capability cache; clear a node after changing its extensions
    pub fn capabilities(&self) -> &Arc<PglogicalCache> {
        &self.capabilities
    }

    /// Log tailer, when any node has a log location
    pub fn tailer(&self) -> Option<&Arc<LogTailer>> {
        self.tailer.as_ref()
    }

    /// Most recently published cycle result
    pub fn last_result(&self) -> Option<Arc<CycleResult>> {
        self.orchestrator.last_result()
    }

    /// Event bus
    pub fn events(&self) -> &Arc<EventBus> {
        self.orchestrator.events()
    }

    /// Receive every event
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.orchestrator.events().subscribe()
    }

    /// Register a listener for one kind of event
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.orchestrator.on(kind, listener)
    }

    /// Unregister a listener
    pub fn off(&self, id: ListenerId) -> bool {
        self.orchestrator.off(id)
    }
}
