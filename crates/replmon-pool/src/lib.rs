//! # replmon-pool
//!
//! Per-node PostgreSQL connection pools with independent health tracking.
//!
//! ## Features
//!
//! - **Node Registry**: validated node ids, configs kept exactly as supplied
//! - **Connection Pooling**: one lazily-filled pool per node with acquire,
//!   connect and idle timeouts
//! - **Health Monitoring**: a shared probe timer with a debounced
//!   `connecting -> healthy -> unhealthy` state machine and connectivity
//!   notifications
//! - **Fan-out Queries**: run a statement on all (or all healthy) nodes
//!   concurrently with one [`NodeResult`] per node
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use replmon_pool::prelude::*;
//!
//! let pool = NodePool::with_postgres(NodePoolConfig::default());
//! pool.add_node("primary", NodeConfig::new("db1", "app", "monitor"))?;
//! pool.add_node("replica", NodeConfig::new("db2", "app", "monitor").with_port(6432))?;
//! pool.start()?;
//!
//! let mut health = pool.subscribe_health();
//! while let Ok(event) = health.recv().await {
//!     println!("{event:?}");
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL backend via tokio-postgres (default)
//! - `postgres-tls` - TLS via rustls

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod connection;
pub mod error;
pub mod health;
pub mod node;
pub mod node_pool;
pub mod pool;
pub mod result;
pub mod tls;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use connection::{Connection, ConnectionConfig, ConnectionFactory};
pub use error::{Error, ErrorCategory, Result};
pub use health::{HealthConfig, HealthEvent, HealthState, NodeHealth};
pub use node::{validate_node_id, NodeConfig, PoolSizing};
pub use node_pool::{NodeInfo, NodePool, NodePoolConfig};
pub use pool::PoolStats;
pub use result::NodeResult;
pub use types::{Row, Value};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::health::{HealthConfig, HealthEvent, HealthState, NodeHealth};
    pub use crate::node::{validate_node_id, NodeConfig, PoolSizing};
    pub use crate::node_pool::{NodeInfo, NodePool, NodePoolConfig};
    pub use crate::pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
    pub use crate::result::NodeResult;
    pub use crate::tls::{SslMode, TlsConfig};
    pub use crate::types::{Row, Value};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::{PgConnection, PgConnectionFactory};
}
