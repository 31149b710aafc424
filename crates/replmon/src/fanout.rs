//! Per-node query fan-out
//!
//! Runs the four category queries for one node concurrently after a
//! (cached) capability check. Every category always produces a
//! [`NodeResult`]; a failing query never aborts its siblings.

use replmon_pool::{NodeInfo, NodePool, NodeResult};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::Result;
use crate::log_tailer::LogTailer;
use crate::model::{ConflictReport, ConflictSource, ReplicationStat, SlotInfo, SubscriptionInfo};
use crate::pglogical::{NodeCapabilities, PglogicalCache};
use crate::queries;

/// Results of all categories for one node
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    /// Replication stats
    pub stats: NodeResult<Vec<ReplicationStat>>,
    /// Slots
    pub slots: NodeResult<Vec<SlotInfo>>,
    /// Subscriptions
    pub subscriptions: NodeResult<Vec<SubscriptionInfo>>,
    /// Conflicts
    pub conflicts: NodeResult<ConflictReport>,
}

impl NodeSnapshot {
    /// Every category failed
    pub fn all_failed(&self) -> bool {
        !self.stats.is_success()
            && !self.slots.is_success()
            && !self.subscriptions.is_success()
            && !self.conflicts.is_success()
    }

    /// First error reported for the node, in category order
    pub fn first_error(&self) -> Option<&str> {
        self.stats
            .error()
            .or_else(|| self.slots.error())
            .or_else(|| self.subscriptions.error())
            .or_else(|| self.conflicts.error())
    }

    fn failed(node: &NodeInfo, error: &str, duration_ms: u64) -> Self {
        Self {
            stats: NodeResult::failure(&node.id, &node.name, error, duration_ms),
            slots: NodeResult::failure(&node.id, &node.name, error, duration_ms),
            subscriptions: NodeResult::failure(&node.id, &node.name, error, duration_ms),
            conflicts: NodeResult::failure(&node.id, &node.name, error, duration_ms),
        }
    }
}

/// Queries one node at a time on behalf of the orchestrator
#[derive(Debug, Clone)]
pub struct QueryFanout {
    pool: NodePool,
    capabilities: Arc<PglogicalCache>,
    tailer: Option<Arc<LogTailer>>,
}

impl QueryFanout {
    /// Create a fan-out over `pool`. Without a tailer, nodes lacking a
    /// conflict history table report conflicts as unavailable.
    pub fn new(
        pool: NodePool,
        capabilities: Arc<PglogicalCache>,
        tailer: Option<Arc<LogTailer>>,
    ) -> Self {
        Self {
            pool,
            capabilities,
            tailer,
        }
    }

    /// Capability cache
    pub fn capabilities(&self) -> &Arc<PglogicalCache> {
        &self.capabilities
    }

    /// Log tailer, if configured
    pub fn tailer(&self) -> Option<&Arc<LogTailer>> {
        self.tailer.as_ref()
    }

    /// Query all categories on one node
    pub async fn query_node(&self, node: &NodeInfo) -> NodeSnapshot {
        let started = Instant::now();

        let caps = match self.capabilities.get_or_detect(&self.pool, &node.id).await {
            Ok(caps) => caps,
            Err(e) => {
                debug!(node_id = %node.id, error = %e, "capability detection failed");
                return NodeSnapshot::failed(node, &e.to_string(), elapsed_ms(started));
            }
        };

        let (stats, slots, subscriptions, conflicts) = tokio::join!(
            timed(started, queries::fetch_stats(&self.pool, &node.id)),
            timed(started, queries::fetch_slots(&self.pool, &node.id, &caps)),
            timed(
                started,
                queries::fetch_subscriptions(&self.pool, &node.id, &caps)
            ),
            timed(started, self.fetch_conflicts(&node.id, &caps)),
        );

        NodeSnapshot {
            stats: node_result(node, &caps, stats),
            slots: node_result(node, &caps, slots),
            subscriptions: node_result(node, &caps, subscriptions),
            conflicts: node_result(node, &caps, conflicts),
        }
    }

    async fn fetch_conflicts(
        &self,
        node_id: &str,
        caps: &NodeCapabilities,
    ) -> Result<ConflictReport> {
        let source = match &self.tailer {
            Some(tailer) => tailer.detect_source(node_id, caps),
            None if caps.conflict_history => ConflictSource::History,
            None => ConflictSource::Unavailable,
        };

        let events = async {
            match (source, &self.tailer) {
                (ConflictSource::History, _) => {
                    queries::fetch_conflict_history(&self.pool, node_id).await
                }
                (ConflictSource::Log, Some(tailer)) => Ok(tailer.read(node_id).await),
                _ => Ok(Vec::new()),
            }
        };
        let (counters, events) = tokio::join!(
            queries::fetch_conflict_counters(&self.pool, node_id, caps),
            events
        );

        Ok(ConflictReport {
            source,
            counters: counters?,
            events: events?,
        })
    }
}

async fn timed<T>(started: Instant, fut: impl Future<Output = Result<T>>) -> (Result<T>, Duration) {
    let result = fut.await;
    (result, started.elapsed())
}

fn node_result<T>(
    node: &NodeInfo,
    caps: &NodeCapabilities,
    (result, elapsed): (Result<T>, Duration),
) -> NodeResult<T> {
    let duration_ms = elapsed.as_millis() as u64;
    match result {
        Ok(data) => NodeResult::success(&node.id, &node.name, data, duration_ms),
        Err(e) => NodeResult::failure(&node.id, &node.name, e.to_string(), duration_ms),
    }
    .with_pglogical(caps.has_pglogical)
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
