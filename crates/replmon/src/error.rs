//! Error types for replmon
//!
//! Only configuration and persistence problems are returned to callers.
//! Connectivity and query failures on the poll path are captured per node in
//! [`replmon_pool::NodeResult`] and surfaced through [`PollError`] events.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for replmon operations
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors returned by the monitor
#[derive(Error, Debug)]
pub enum MonitorError {
    /// Node pool error
    #[error(transparent)]
    Pool(#[from] replmon_pool::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Reading the server log failed
    #[error("Log source error: {0}")]
    LogSource(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a log source error
    pub fn log_source(msg: impl Into<String>) -> Self {
        Self::LogSource(msg.into())
    }

    /// Whether retrying later may succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Pool(e) => e.is_retriable(),
            Self::LogSource(_) | Self::Io(_) => true,
            Self::Config(_) | Self::Json(_) => false,
        }
    }
}

/// Error of one node in a cycle where every node failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    /// Node id
    pub node_id: String,
    /// First error reported for the node
    pub error: String,
}

/// Cycle-level failure, published as an `Error` event
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PollError {
    /// The node pool is not running
    #[error("node pool is not running")]
    PoolNotRunning,

    /// Every polled node failed every category
    #[error("all {} nodes failed", node_errors.len())]
    AllNodesFailed {
        /// One entry per polled node
        node_errors: Vec<NodeError>,
    },

    /// Unexpected failure inside the cycle
    #[error("internal error: {message}")]
    Internal {
        /// Description
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_keep_classification() {
        let err = MonitorError::from(replmon_pool::Error::timeout("slow"));
        assert!(err.is_retriable());
        assert!(err.to_string().contains("slow"));

        let err = MonitorError::from(replmon_pool::Error::invalid_node_id("9x"));
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_poll_error_display() {
        let err = PollError::AllNodesFailed {
            node_errors: vec![
                NodeError {
                    node_id: "a".into(),
                    error: "down".into(),
                },
                NodeError {
                    node_id: "b".into(),
                    error: "down".into(),
                },
            ],
        };
        assert_eq!(err.to_string(), "all 2 nodes failed");
        assert_eq!(PollError::PoolNotRunning.to_string(), "node pool is not running");
    }
}
