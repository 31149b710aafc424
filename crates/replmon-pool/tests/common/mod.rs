//! In-memory connection factory for driving the node pool without a database

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use replmon_pool::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct HostBehavior {
    down: bool,
    delay: Duration,
}

/// Hosts are addressed by `ConnectionConfig::host`; unknown hosts are up
#[derive(Clone, Default)]
pub struct MockCluster {
    hosts: Arc<Mutex<HashMap<String, HostBehavior>>>,
    queries: Arc<AtomicU64>,
    sessions_die: Arc<AtomicBool>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, host: &str, down: bool) {
        self.hosts.lock().entry(host.to_string()).or_default().down = down;
    }

    pub fn set_delay(&self, host: &str, delay: Duration) {
        self.hosts.lock().entry(host.to_string()).or_default().delay = delay;
    }

    /// Make a connection that failed stay closed even after its host is back,
    /// like a client whose server restarted
    pub fn set_sessions_die(&self, die: bool) {
        self.sessions_die.store(die, Ordering::Relaxed);
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    fn behavior(&self, host: &str) -> HostBehavior {
        self.hosts.lock().get(host).cloned().unwrap_or_default()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }
}

struct MockConnection {
    host: String,
    cluster: MockCluster,
    dead: AtomicBool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        let behavior = self.cluster.behavior(&self.host);
        if !behavior.delay.is_zero() {
            tokio::time::sleep(behavior.delay).await;
        }
        if self.dead.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        if behavior.down {
            if self.cluster.sessions_die.load(Ordering::Relaxed) {
                self.dead.store(true, Ordering::Relaxed);
            }
            return Err(Error::connection(format!("{} is down", self.host)));
        }
        self.cluster.queries.fetch_add(1, Ordering::Relaxed);
        Ok(vec![Row::from_pairs([
            ("host", Value::from(self.host.as_str())),
            ("sql", Value::from(sql)),
        ])])
    }

    async fn is_valid(&self) -> bool {
        !self.dead.load(Ordering::Relaxed) && !self.cluster.behavior(&self.host).down
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ConnectionFactory for MockCluster {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        if self.behavior(&config.host).down {
            return Err(Error::connection(format!("connection refused: {}", config.host)));
        }
        Ok(Box::new(MockConnection {
            host: config.host.clone(),
            cluster: self.clone(),
            dead: AtomicBool::new(false),
        }))
    }
}

pub fn node(host: &str) -> NodeConfig {
    NodeConfig::new(host, "app", "monitor")
}

/// Let spawned tasks run; with a paused clock this also advances time
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("replmon_pool=debug")
        .with_test_writer()
        .try_init();
}
