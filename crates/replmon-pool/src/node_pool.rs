//! Node pool: the registry of monitored nodes
//!
//! Owns one [`ConnectionPool`] per node plus the shared health monitor task.
//! Nodes are kept in registration order and every multi-node operation
//! reports results in that order.
//!
//! # Example
//!
//! ```rust,ignore
//! let pool = NodePool::with_postgres(NodePoolConfig::default());
//! pool.add_node("primary", NodeConfig::new("db1", "app", "monitor"))?;
//! pool.start();
//!
//! for result in pool.query_healthy_nodes("SELECT 1", &[]).await {
//!     println!("{}: {:?}", result.node_id, result.error());
//! }
//!
//! pool.shutdown().await;
//! ```

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connection::ConnectionFactory;
use crate::error::{Error, Result};
use crate::health::{HealthConfig, HealthEvent, HealthMonitor, NodeHealth};
use crate::node::{validate_node_id, Node, NodeConfig, PoolSizing};
use crate::pool::{ConnectionPool, PoolStats};
use crate::result::NodeResult;
use crate::types::{Row, Value};

fn default_query_timeout_ms() -> u64 {
    10_000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

/// Node pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePoolConfig {
    /// Health monitor settings
    #[serde(default)]
    pub health: HealthConfig,
    /// Pool sizing for nodes that don't set their own
    #[serde(default)]
    pub pool: PoolSizing,
    /// Timeout for every query, including connection acquisition
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    /// Upper bound for closing all pools on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for NodePoolConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            pool: PoolSizing::default(),
            query_timeout_ms: default_query_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl NodePoolConfig {
    /// Query timeout
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Shutdown timeout
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Set health settings
    pub fn with_health(mut self, health: HealthConfig) -> Self {
        self.health = health;
        self
    }

    /// Set default pool sizing
    pub fn with_pool(mut self, pool: PoolSizing) -> Self {
        self.pool = pool;
        self
    }

    /// Set query timeout
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Validate
    pub fn validate(&self) -> Result<()> {
        self.health.validate()?;
        self.pool.validate()?;
        if self.query_timeout_ms == 0 {
            return Err(Error::config("query timeout must be greater than zero"));
        }
        Ok(())
    }
}

/// A registered node as seen from outside the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Node id
    pub id: String,
    /// Display name
    pub name: String,
    /// Config exactly as supplied
    pub config: NodeConfig,
}

impl From<&Node> for NodeInfo {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            name: node.name().to_string(),
            config: node.config.clone(),
        }
    }
}

type NodeList = Arc<RwLock<Vec<Arc<Node>>>>;

struct MonitorTask {
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

struct Shared {
    config: NodePoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    nodes: NodeList,
    monitor: Arc<HealthMonitor>,
    task: Mutex<Option<MonitorTask>>,
    running: AtomicBool,
    closed: AtomicBool,
}

/// Registry of monitored nodes with per-node pools and health tracking.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Clone)]
pub struct NodePool {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for NodePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePool")
            .field("nodes", &self.node_ids())
            .field("running", &self.is_running())
            .finish()
    }
}

impl NodePool {
    /// Create an empty pool using the given connection factory
    pub fn new(config: NodePoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            shared: Arc::new(Shared {
                monitor: Arc::new(HealthMonitor::new(config.health)),
                config,
                factory,
                nodes: Arc::new(RwLock::new(Vec::new())),
                task: Mutex::new(None),
                running: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Create an empty pool backed by tokio-postgres
    #[cfg(feature = "postgres")]
    pub fn with_postgres(config: NodePoolConfig) -> Self {
        Self::new(config, Arc::new(crate::postgres::PgConnectionFactory))
    }

    /// Pool configuration
    pub fn config(&self) -> &NodePoolConfig {
        &self.shared.config
    }

    fn find(&self, id: &str) -> Option<Arc<Node>> {
        self.shared.nodes.read().iter().find(|n| n.id == id).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Node>> {
        self.shared.nodes.read().clone()
    }

    /// Register a node.
    ///
    /// Connections are opened lazily, so an unreachable node can still be
    /// added. The node starts out `Connecting`; if the monitor is running it
    /// is probed right away instead of waiting for the next tick.
    pub fn add_node(&self, id: impl Into<String>, config: NodeConfig) -> Result<()> {
        let id = id.into();
        validate_node_id(&id)?;
        config.validate()?;
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }

        let sizing = config.pool.unwrap_or(self.shared.config.pool);
        let pool = ConnectionPool::new(
            sizing.pool_config(),
            config
                .connection_config(&sizing)
                .with_application_name(format!("replmon:{id}")),
            self.shared.factory.clone(),
        );

        let node = {
            let mut nodes = self.shared.nodes.write();
            if nodes.iter().any(|n| n.id == id) {
                return Err(Error::duplicate_node(id));
            }
            let node = Arc::new(Node::new(id, config, pool));
            nodes.push(node.clone());
            node
        };
        info!(node_id = %node.id, endpoint = %node.pool.connection_config().endpoint(), "node added");

        if self.is_running() {
            let monitor = self.shared.monitor.clone();
            tokio::spawn(async move { monitor.probe(&node).await });
        }
        Ok(())
    }

    /// Remove a node and close its pool
    pub async fn remove_node(&self, id: &str) -> Result<()> {
        let node = {
            let mut nodes = self.shared.nodes.write();
            let idx = nodes
                .iter()
                .position(|n| n.id == id)
                .ok_or_else(|| Error::node_not_found(id))?;
            nodes.remove(idx)
        };
        if let Err(e) = node.pool.close().await {
            warn!(node_id = %id, error = %e, "error closing node pool");
        }
        info!(node_id = %id, "node removed");
        Ok(())
    }

    /// Look up a node
    pub fn get_node(&self, id: &str) -> Option<NodeInfo> {
        self.find(id).map(|n| NodeInfo::from(n.as_ref()))
    }

    /// All registered nodes, in registration order
    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.shared
            .nodes
            .read()
            .iter()
            .map(|n| NodeInfo::from(n.as_ref()))
            .collect()
    }

    /// Registered node ids, in registration order
    pub fn node_ids(&self) -> Vec<String> {
        self.shared.nodes.read().iter().map(|n| n.id.clone()).collect()
    }

    /// Current health of a node
    pub fn get_health(&self, id: &str) -> Option<NodeHealth> {
        self.find(id).map(|n| n.health.read().clone())
    }

    /// Nodes that are currently healthy, in registration order
    pub fn get_healthy_nodes(&self) -> Vec<NodeInfo> {
        self.shared
            .nodes
            .read()
            .iter()
            .filter(|n| n.health.read().is_healthy())
            .map(|n| NodeInfo::from(n.as_ref()))
            .collect()
    }

    /// Pool statistics of a node
    pub fn get_pool_stats(&self, id: &str) -> Option<PoolStats> {
        self.find(id).map(|n| n.pool.stats())
    }

    /// Subscribe to connectivity changes
    pub fn subscribe_health(&self) -> broadcast::Receiver<HealthEvent> {
        self.shared.monitor.subscribe()
    }

    /// Whether the health monitor is running
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Run a statement on one node, racing the query timeout
    pub async fn query(&self, node_id: &str, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let node = self
            .find(node_id)
            .ok_or_else(|| Error::node_not_found(node_id))?;
        self.run_query(&node, sql, params).await
    }

    async fn run_query(&self, node: &Node, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let timeout = self.shared.config.query_timeout();
        let query = async {
            let conn = node.pool.get().await?;
            conn.query(sql, params).await
        };
        match tokio::time::timeout(timeout, query).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!(
                "query on node '{}' timed out after {}ms",
                node.id,
                timeout.as_millis()
            ))),
        }
    }

    async fn query_node(&self, node: &Node, sql: &str, params: &[Value]) -> NodeResult<Vec<Row>> {
        let start = Instant::now();
        let result = self.run_query(node, sql, params).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(rows) => NodeResult::success(&node.id, node.name(), rows, duration_ms),
            Err(e) => {
                debug!(node_id = %node.id, error = %e, "node query failed");
                NodeResult::failure(&node.id, node.name(), e.to_string(), duration_ms)
            }
        }
    }

    async fn query_nodes(
        &self,
        nodes: &[Arc<Node>],
        sql: &str,
        params: &[Value],
    ) -> Vec<NodeResult<Vec<Row>>> {
        join_all(nodes.iter().map(|n| self.query_node(n, sql, params))).await
    }

    /// Run a statement on every node concurrently
    pub async fn query_all_nodes(&self, sql: &str, params: &[Value]) -> Vec<NodeResult<Vec<Row>>> {
        let nodes = self.snapshot();
        self.query_nodes(&nodes, sql, params).await
    }

    /// Run a statement on every healthy node concurrently.
    ///
    /// Returns an empty vec when no node is healthy.
    pub async fn query_healthy_nodes(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Vec<NodeResult<Vec<Row>>> {
        let nodes: Vec<Arc<Node>> = self
            .snapshot()
            .into_iter()
            .filter(|n| n.health.read().is_healthy())
            .collect();
        self.query_nodes(&nodes, sql, params).await
    }

    /// Probe every node once, outside the periodic schedule
    pub async fn check_now(&self) {
        let nodes = self.snapshot();
        self.shared.monitor.probe_all(&nodes).await;
    }

    /// Start the health monitor. No-op if already running.
    pub fn start(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        let mut task = self.shared.task.lock();
        if task.is_some() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = spawn_monitor(
            self.shared.monitor.clone(),
            self.shared.nodes.clone(),
            shutdown_rx,
        );
        *task = Some(MonitorTask {
            shutdown_tx,
            handle,
        });
        self.shared.running.store(true, Ordering::Release);
        info!(
            interval_ms = self.shared.monitor.config().interval_ms,
            "health monitor started"
        );
        Ok(())
    }

    async fn stop_monitor(&self) {
        self.shared.running.store(false, Ordering::Release);
        let task = self.shared.task.lock().take();
        if let Some(task) = task {
            let _ = task.shutdown_tx.send(());
            if let Err(e) = task.handle.await {
                warn!(error = %e, "health monitor task ended abnormally");
            }
            debug!("health monitor stopped");
        }
    }

    /// Stop the monitor and close every node's pool.
    ///
    /// Pools are closed concurrently; a failing close is logged and does not
    /// affect the others. Pools still closing when the shutdown timeout
    /// expires are abandoned.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_monitor().await;

        let nodes: Vec<Arc<Node>> = self.shared.nodes.write().drain(..).collect();
        let timeout = self.shared.config.shutdown_timeout();
        let closes = join_all(nodes.iter().map(|node| async move {
            if let Err(e) = node.pool.close().await {
                warn!(node_id = %node.id, error = %e, "error closing node pool");
            }
        }));

        match tokio::time::timeout(timeout, closes).await {
            Ok(_) => info!(nodes = nodes.len(), "node pool shut down"),
            Err(_) => warn!(
                timeout_ms = timeout.as_millis() as u64,
                "node pool shutdown timed out, abandoning remaining connections"
            ),
        }
    }
}

fn spawn_monitor(
    monitor: Arc<HealthMonitor>,
    nodes: NodeList,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(monitor.config().interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let snapshot: Vec<Arc<Node>> = nodes.read().clone();
                    monitor.probe_all(&snapshot).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_pool_config_defaults() {
        let config: NodePoolConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, NodePoolConfig::default());
        assert_eq!(config.query_timeout(), Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_node_pool_config_rejects_zero_query_timeout() {
        let config = NodePoolConfig::default().with_query_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
