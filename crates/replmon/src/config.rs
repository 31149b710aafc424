//! Monitor configuration
//!
//! ```json
//! {
//!   "nodes": {
//!     "primary": { "host": "db1", "database": "app", "user": "monitor" },
//!     "replica": { "host": "db2", "database": "app", "user": "monitor" }
//!   },
//!   "poll": { "interval_ms": 2000 },
//!   "health": { "unhealthy_threshold": 3 },
//!   "log_tailer": {
//!     "position_file": "/var/lib/replmon/positions.json",
//!     "nodes": { "replica": { "type": "local", "path": "/var/log/postgresql" } }
//!   }
//! }
//! ```
//!
//! Reading the document from disk or the environment is up to the caller.

use replmon_pool::{validate_node_id, NodeConfig, NodePoolConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{MonitorError, Result};
use crate::log_tailer::LogLocation;
use crate::orchestrator::PollConfig;

/// Log tailer settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogTailerConfig {
    /// JSON file for read positions; positions live in memory when unset
    #[serde(default)]
    pub position_file: Option<PathBuf>,
    /// Log location per node id
    #[serde(default)]
    pub nodes: BTreeMap<String, LogLocation>,
}

impl LogTailerConfig {
    /// Whether any node has a log location
    pub fn is_enabled(&self) -> bool {
        !self.nodes.is_empty()
    }
}

/// Everything needed to build a [`crate::Monitor`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Nodes by id; registered in id order
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeConfig>,
    /// Poll timing
    #[serde(default)]
    pub poll: PollConfig,
    /// Health, pool sizing and timeouts of the node pool
    #[serde(flatten)]
    pub node_pool: NodePoolConfig,
    /// Log tailer settings
    #[serde(default)]
    pub log_tailer: LogTailerConfig,
}

impl MonitorConfig {
    /// Add a node
    pub fn with_node(mut self, id: impl Into<String>, config: NodeConfig) -> Self {
        self.nodes.insert(id.into(), config);
        self
    }

    /// Set poll timing
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Set node pool settings
    pub fn with_node_pool(mut self, node_pool: NodePoolConfig) -> Self {
        self.node_pool = node_pool;
        self
    }

    /// Set log tailer settings
    pub fn with_log_tailer(mut self, log_tailer: LogTailerConfig) -> Self {
        self.log_tailer = log_tailer;
        self
    }

    /// Check ids, node settings, and that every log location belongs to a
    /// configured node. Poll intervals below the minimum are clamped later
    /// rather than rejected.
    pub fn validate(&self) -> Result<()> {
        self.node_pool.validate()?;
        for (id, node) in &self.nodes {
            validate_node_id(id)?;
            node.validate()
                .map_err(|e| MonitorError::config(format!("node '{id}': {e}")))?;
        }
        for (id, location) in &self.log_tailer.nodes {
            if !self.nodes.contains_key(id) {
                return Err(MonitorError::config(format!(
                    "log location for unknown node '{id}'"
                )));
            }
            if let LogLocation::Local { path } = location {
                if path.as_os_str().is_empty() {
                    return Err(MonitorError::config(format!(
                        "log path for node '{id}' must not be empty"
                    )));
                }
            }
        }
        Ok(())
    }
}
