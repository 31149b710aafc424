//! Error types for replmon-pool
//!
//! Errors are classified so callers can tell configuration mistakes (fail
//! fast at the call that introduced them) from connectivity problems (absorbed
//! by the health state machine and retried on the next probe).

use std::fmt;
use thiserror::Error;

/// Result type for replmon-pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid or conflicting configuration (not retriable)
    Configuration,
    /// Connection-related errors (retriable)
    Connection,
    /// Query execution errors
    Query,
    /// Timeout errors (retriable)
    Timeout,
    /// Pool exhausted or closed (retriable with backoff)
    PoolExhausted,
    /// Row decoding errors (not retriable)
    TypeConversion,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::PoolExhausted
        )
    }
}

/// Main error type for replmon-pool
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Node id does not match `^[A-Za-z][A-Za-z0-9_-]*$`
    #[error("invalid node id '{id}': must start with a letter and contain only letters, digits, '_' or '-'")]
    InvalidNodeId { id: String },

    /// Node id already registered
    #[error("duplicate node: {id}")]
    DuplicateNode { id: String },

    /// Node id not registered
    #[error("node not found: {id}")]
    NodeNotFound { id: String },

    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query { message: String, sql: Option<String> },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Connection pool exhausted
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Pool has been shut down
    #[error("pool closed")]
    PoolClosed,

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Column could not be decoded into the requested type
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidNodeId { .. }
            | Self::DuplicateNode { .. }
            | Self::NodeNotFound { .. }
            | Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::PoolExhausted { .. } | Self::PoolClosed => ErrorCategory::PoolExhausted,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create an invalid node id error
    pub fn invalid_node_id(id: impl Into<String>) -> Self {
        Self::InvalidNodeId { id: id.into() }
    }

    /// Create a duplicate node error
    pub fn duplicate_node(id: impl Into<String>) -> Self {
        Self::DuplicateNode { id: id.into() }
    }

    /// Create a node not found error
    pub fn node_not_found(id: impl Into<String>) -> Self {
        Self::NodeNotFound { id: id.into() }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Timeout => write!(f, "timeout"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::TypeConversion => write!(f, "type_conversion"),
        }
    }
}
