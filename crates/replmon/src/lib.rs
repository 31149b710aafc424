//! # replmon
//!
//! Cycle-based replication monitor for PostgreSQL and pglogical clusters.
//!
//! Every poll cycle queries all healthy nodes concurrently for four
//! categories of data and publishes one [`CycleResult`]:
//!
//! - **Stats**: walsenders from `pg_stat_replication`
//! - **Slots**: replication slots with retained WAL
//! - **Subscriptions**: native or pglogical subscriptions
//! - **Conflicts**: subscription error counters plus conflict events from
//!   `pglogical.conflict_history` or, failing that, the csvlog
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use replmon::prelude::*;
//!
//! let config: MonitorConfig = serde_json::from_str(&std::fs::read_to_string("replmon.json")?)?;
//! let monitor = Monitor::with_postgres(config).await?;
//!
//! monitor.on(EventKind::Slots, |event| {
//!     if let Some(cycle) = event.cycle() {
//!         for node in &cycle.slots {
//!             println!("{}: {:?}", node.node_name, node.data().map(Vec::len));
//!         }
//!     }
//! });
//! monitor.start()?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL backend via tokio-postgres (default)
//! - `postgres-tls` - TLS via rustls

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod log_tailer;
pub mod model;
pub mod monitor;
pub mod orchestrator;
pub mod pglogical;
pub mod position;
pub mod queries;

pub use config::{LogTailerConfig, MonitorConfig};
pub use error::{MonitorError, NodeError, PollError, Result};
pub use events::{EventBus, EventKind, ListenerId, MonitorEvent, SkipReason};
pub use log_tailer::{LogLocation, LogTailer};
pub use model::{
    ConflictCounter, ConflictEvent, ConflictReport, ConflictSource, CycleResult, ReplicationStat,
    SlotInfo, SubscriptionInfo,
};
pub use monitor::Monitor;
pub use orchestrator::{PollConfig, PollOrchestrator};
pub use pglogical::{NodeCapabilities, PglogicalCache};
pub use position::{LogPosition, PositionStore};

pub use replmon_pool;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{LogTailerConfig, MonitorConfig};
    pub use crate::error::{MonitorError, NodeError, PollError, Result};
    pub use crate::events::{EventBus, EventKind, ListenerId, MonitorEvent, SkipReason};
    pub use crate::fanout::{NodeSnapshot, QueryFanout};
    pub use crate::log_tailer::{LogLocation, LogTailer};
    pub use crate::model::*;
    pub use crate::monitor::Monitor;
    pub use crate::orchestrator::{PollConfig, PollOrchestrator};
    pub use crate::pglogical::{NodeCapabilities, PglogicalCache};
    pub use crate::position::{LogPosition, PositionStore};
    pub use replmon_pool::{
        HealthConfig, HealthEvent, HealthState, NodeConfig, NodeInfo, NodePool, NodePoolConfig,
        NodeResult, PoolSizing,
    };
}
