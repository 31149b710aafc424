//! Per-node capability detection
//!
//! Whether pglogical is installed, the server version, and whether the
//! conflict history table is usable are read in one round trip and cached
//! per node without expiry. Call [`PglogicalCache::clear`] after installing
//! or dropping the extension on a node.

use parking_lot::RwLock;
use replmon_pool::{NodePool, Row};
use std::collections::HashMap;

use crate::error::Result;

pub(crate) const DETECT_SQL: &str = "\
SELECT current_setting('server_version_num')::int4 AS server_version_num, \
       EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'pglogical') AS has_pglogical, \
       to_regclass('pglogical.conflict_history') IS NOT NULL AS has_conflict_history, \
       coalesce(current_setting('pglogical.conflict_history_enabled', true), 'off') \
           AS conflict_history_enabled";

/// What a node supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeCapabilities {
    /// `server_version_num`, e.g. `150004`
    pub server_version_num: i64,
    /// pglogical extension installed
    pub has_pglogical: bool,
    /// `pglogical.conflict_history` exists and logging to it is enabled
    pub conflict_history: bool,
}

impl NodeCapabilities {
    /// `pg_replication_slots.wal_status` and `safe_wal_size` exist (PG13+)
    pub fn has_wal_status(&self) -> bool {
        self.server_version_num >= 130_000
    }

    /// `pg_stat_subscription_stats` exists (PG15+)
    pub fn has_subscription_stats(&self) -> bool {
        self.server_version_num >= 150_000
    }

    pub(crate) fn from_row(row: &Row) -> Result<Self> {
        let enabled = row
            .opt_str("conflict_history_enabled")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "on" | "true" | "1"))
            .unwrap_or(false);
        Ok(Self {
            server_version_num: row.try_i64("server_version_num")?,
            has_pglogical: row.try_bool("has_pglogical")?,
            conflict_history: row.opt_bool("has_conflict_history").unwrap_or(false) && enabled,
        })
    }
}

/// Capability cache keyed by node id
#[derive(Debug, Default)]
pub struct PglogicalCache {
    entries: RwLock<HashMap<String, NodeCapabilities>>,
}

impl PglogicalCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached capabilities of a node
    pub fn get(&self, node_id: &str) -> Option<NodeCapabilities> {
        self.entries.read().get(node_id).copied()
    }

    /// Store capabilities for a node
    pub fn insert(&self, node_id: impl Into<String>, caps: NodeCapabilities) {
        self.entries.write().insert(node_id.into(), caps);
    }

    /// Forget one node
    pub fn clear(&self, node_id: &str) {
        self.entries.write().remove(node_id);
    }

    /// Forget every node
    pub fn clear_all(&self) {
        self.entries.write().clear();
    }

    /// Cached capabilities, detecting them on a miss
    pub async fn get_or_detect(&self, pool: &NodePool, node_id: &str) -> Result<NodeCapabilities> {
        if let Some(caps) = self.get(node_id) {
            return Ok(caps);
        }
        let rows = pool.query(node_id, DETECT_SQL, &[]).await?;
        let row = rows.first().ok_or_else(|| {
            replmon_pool::Error::type_conversion("capability query returned no rows")
        })?;
        let caps = NodeCapabilities::from_row(row)?;
        tracing::debug!(
            node_id = %node_id,
            server_version_num = caps.server_version_num,
            has_pglogical = caps.has_pglogical,
            conflict_history = caps.conflict_history,
            "detected node capabilities"
        );
        self.insert(node_id, caps);
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replmon_pool::Value;

    fn caps(version: i64) -> NodeCapabilities {
        NodeCapabilities {
            server_version_num: version,
            has_pglogical: true,
            conflict_history: false,
        }
    }

    #[test]
    fn test_cache_operations() {
        let cache = PglogicalCache::new();
        assert!(cache.get("a").is_none());

        cache.insert("a", caps(150_000));
        cache.insert("b", caps(120_000));
        assert_eq!(cache.get("a"), Some(caps(150_000)));

        cache.clear("a");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());

        cache.clear_all();
        assert!(cache.get("b").is_none());
    }

    #[test]
    fn test_version_gates() {
        assert!(!caps(120_015).has_wal_status());
        assert!(caps(130_000).has_wal_status());
        assert!(!caps(140_010).has_subscription_stats());
        assert!(caps(150_004).has_subscription_stats());
    }

    #[test]
    fn test_history_requires_table_and_setting() {
        let row = |table: bool, setting: Value| {
            Row::from_pairs([
                ("server_version_num", Value::Int32(160_002)),
                ("has_pglogical", Value::Bool(true)),
                ("has_conflict_history", Value::Bool(table)),
                ("conflict_history_enabled", setting),
            ])
        };
        let from = |r: Row| NodeCapabilities::from_row(&r).unwrap().conflict_history;

        assert!(from(row(true, "on".into())));
        assert!(!from(row(true, "off".into())));
        assert!(!from(row(false, "on".into())));
        assert!(!from(row(true, Value::Null)));
    }
}
