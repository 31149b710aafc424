//! Scripted PostgreSQL stand-in answering the monitor's catalog queries

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use replmon::prelude::*;
use replmon_pool::{Connection, ConnectionConfig, ConnectionFactory, Error, Row, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Default)]
struct HostBehavior {
    down: bool,
    delay: Duration,
}

/// Hosts are addressed by `ConnectionConfig::host`; unknown hosts are up
/// and report PG16 without pglogical, one walsender and one slot.
#[derive(Clone, Default)]
pub struct ScriptedCluster {
    hosts: Arc<Mutex<HashMap<String, HostBehavior>>>,
    logs: Arc<Mutex<HashMap<String, (String, Vec<u8>)>>>,
    queries: Arc<AtomicU64>,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, host: &str, down: bool) {
        self.hosts.lock().entry(host.to_string()).or_default().down = down;
    }

    pub fn set_delay(&self, host: &str, delay: Duration) {
        self.hosts.lock().entry(host.to_string()).or_default().delay = delay;
    }

    /// Serve `contents` as the host's current csvlog at `path`
    pub fn set_log(&self, host: &str, path: &str, contents: &[u8]) {
        self.logs
            .lock()
            .insert(host.to_string(), (path.to_string(), contents.to_vec()));
    }

    /// Append to the host's current csvlog
    pub fn append_log(&self, host: &str, contents: &[u8]) {
        if let Some((_, log)) = self.logs.lock().get_mut(host) {
            log.extend_from_slice(contents);
        }
    }

    /// Catalog queries issued so far; health probes are not counted
    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }

    fn behavior(&self, host: &str) -> HostBehavior {
        self.hosts.lock().get(host).cloned().unwrap_or_default()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }

    fn answer(&self, host: &str, sql: &str, params: &[Value]) -> Vec<Row> {
        if sql.contains("pg_current_logfile") {
            return match self.logs.lock().get(host) {
                Some((path, log)) => vec![Row::from_pairs([
                    ("path", Value::from(path.as_str())),
                    ("size", Value::Int64(log.len() as i64)),
                ])],
                None => vec![Row::from_pairs([("path", Value::Null), ("size", Value::Null)])],
            };
        }
        if sql.contains("pg_read_binary_file") {
            let (Some(Value::Int64(offset)), Some(Value::Int64(len))) =
                (params.get(1), params.get(2))
            else {
                return Vec::new();
            };
            let logs = self.logs.lock();
            let log = logs.get(host).map(|(_, log)| log.as_slice()).unwrap_or_default();
            let start = (*offset as usize).min(log.len());
            let end = (start + *len as usize).min(log.len());
            return vec![Row::from_pairs([("data", Value::Bytes(log[start..end].to_vec()))])];
        }
        catalog(host, sql)
    }
}

fn catalog(host: &str, sql: &str) -> Vec<Row> {
    if sql.contains("server_version_num") {
        vec![Row::from_pairs([
            ("server_version_num", Value::Int32(160_002)),
            ("has_pglogical", Value::Bool(false)),
            ("has_conflict_history", Value::Bool(false)),
            ("conflict_history_enabled", Value::from("off")),
        ])]
    } else if sql.contains("pg_stat_replication") {
        vec![Row::from_pairs([
            ("pid", Value::Int32(100)),
            ("application_name", Value::from(format!("{host}-replica"))),
            ("state", Value::from("streaming")),
            ("replay_lag_ms", Value::Float64(3.5)),
        ])]
    } else if sql.contains("pg_replication_slots") {
        vec![Row::from_pairs([
            ("slot_name", Value::from(format!("{host}_slot"))),
            ("slot_type", Value::from("logical")),
            ("active", Value::Bool(true)),
            ("wal_status", Value::from("reserved")),
        ])]
    } else if sql.contains("pg_stat_subscription_stats") {
        vec![Row::from_pairs([
            ("subscription_name", Value::from("sub1")),
            ("apply_error_count", Value::Int64(2)),
            ("sync_error_count", Value::Int64(0)),
        ])]
    } else {
        Vec::new()
    }
}

struct ScriptedConnection {
    host: String,
    cluster: ScriptedCluster,
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> replmon_pool::Result<Vec<Row>> {
        let probe = sql.trim() == "SELECT 1";
        if !probe {
            self.cluster.queries.fetch_add(1, Ordering::SeqCst);
        }
        let behavior = self.cluster.behavior(&self.host);
        if !behavior.delay.is_zero() && !probe {
            tokio::time::sleep(behavior.delay).await;
        }
        if behavior.down {
            return Err(Error::connection(format!("{} is down", self.host)));
        }
        if probe {
            return Ok(vec![Row::from_pairs([("?column?", Value::Int32(1))])]);
        }
        Ok(self.cluster.answer(&self.host, sql, params))
    }

    async fn is_valid(&self) -> bool {
        !self.cluster.behavior(&self.host).down
    }

    async fn close(&self) -> replmon_pool::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ConnectionFactory for ScriptedCluster {
    async fn connect(
        &self,
        config: &ConnectionConfig,
    ) -> replmon_pool::Result<Box<dyn Connection>> {
        if self.behavior(&config.host).down {
            return Err(Error::connection(format!("connection refused: {}", config.host)));
        }
        Ok(Box::new(ScriptedConnection {
            host: config.host.clone(),
            cluster: self.clone(),
        }))
    }
}

pub fn node(host: &str) -> NodeConfig {
    NodeConfig::new(host, "app", "monitor")
}

/// Node pool config whose health timer only fires at start
pub fn pool_config() -> NodePoolConfig {
    NodePoolConfig::default().with_health(
        HealthConfig::default()
            .with_interval(Duration::from_secs(3600))
            .with_probe_timeout(Duration::from_secs(5)),
    )
}

/// Started node pool with nodes `a`, `b`, ... on hosts `db1`, `db2`, ...
pub async fn healthy_pool(cluster: &ScriptedCluster, count: usize) -> NodePool {
    let pool = NodePool::new(pool_config(), cluster.factory());
    for i in 0..count {
        let id = ((b'a' + i as u8) as char).to_string();
        pool.add_node(id, node(&format!("db{}", i + 1))).unwrap();
    }
    pool.start().unwrap();
    settle().await;
    assert_eq!(pool.get_healthy_nodes().len(), count);
    pool
}

/// Orchestrator over `pool` whose timer only fires at start
pub fn orchestrator(pool: &NodePool) -> PollOrchestrator {
    let fanout = QueryFanout::new(pool.clone(), Arc::new(PglogicalCache::new()), None);
    PollOrchestrator::new(
        pool.clone(),
        fanout,
        Arc::new(EventBus::new()),
        PollConfig::new(3_600_000),
    )
}

/// Let spawned tasks run; with a paused clock this also advances time
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Every event received so far
pub fn drain(rx: &mut broadcast::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn kinds(events: &[MonitorEvent]) -> Vec<EventKind> {
    events.iter().map(MonitorEvent::kind).collect()
}

pub fn count(events: &[MonitorEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("replmon=debug,replmon_pool=debug")
        .with_test_writer()
        .try_init();
}
