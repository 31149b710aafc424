//! Per-node query results

use serde::{Deserialize, Serialize};

/// Outcome of running one operation against one node.
///
/// Data is present exactly when the operation succeeded and an error
/// message exactly when it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult<T> {
    /// Node id
    pub node_id: String,
    /// Node display name
    pub node_name: String,
    /// Data or error message
    pub outcome: Result<T, String>,
    /// Wall time spent on the node
    pub duration_ms: u64,
    /// Whether the pglogical extension is installed on the node
    pub has_pglogical: bool,
}

impl<T> NodeResult<T> {
    /// Successful result
    pub fn success(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        data: T,
        duration_ms: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            outcome: Ok(data),
            duration_ms,
            has_pglogical: false,
        }
    }

    /// Failed result
    pub fn failure(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            outcome: Err(error.into()),
            duration_ms,
            has_pglogical: false,
        }
    }

    /// Set the pglogical flag
    pub fn with_pglogical(mut self, has_pglogical: bool) -> Self {
        self.has_pglogical = has_pglogical;
        self
    }

    /// Whether the operation succeeded
    #[inline]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Data, if the operation succeeded
    pub fn data(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    /// Error message, if the operation failed
    pub fn error(&self) -> Option<&str> {
        self.outcome.as_ref().err().map(String::as_str)
    }

    /// Map the data, keeping node metadata
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> NodeResult<U> {
        NodeResult {
            node_id: self.node_id,
            node_name: self.node_name,
            outcome: self.outcome.map(f),
            duration_ms: self.duration_ms,
            has_pglogical: self.has_pglogical,
        }
    }
}
