//! Snapshot data model
//!
//! One struct per polled category plus the cycle result that bundles them.
//! LSNs are kept in their textual `X/Y` form; lags and sizes are numeric.

use chrono::{DateTime, Utc};
use replmon_pool::NodeResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A walsender as reported by `pg_stat_replication`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStat {
    /// Walsender process id
    pub pid: i64,
    /// Client application name
    pub application_name: Option<String>,
    /// Client address
    pub client_addr: Option<String>,
    /// Walsender state (`streaming`, `catchup`, ...)
    pub state: Option<String>,
    /// Synchronous state (`async`, `sync`, ...)
    pub sync_state: Option<String>,
    /// Last WAL location sent
    pub sent_lsn: Option<String>,
    /// Last WAL location written by the standby
    pub write_lsn: Option<String>,
    /// Last WAL location flushed by the standby
    pub flush_lsn: Option<String>,
    /// Last WAL location replayed by the standby
    pub replay_lsn: Option<String>,
    /// Write lag in milliseconds
    pub write_lag_ms: Option<f64>,
    /// Flush lag in milliseconds
    pub flush_lag_ms: Option<f64>,
    /// Replay lag in milliseconds
    pub replay_lag_ms: Option<f64>,
    /// Bytes between the current WAL position and the replay position
    pub lag_bytes: Option<i64>,
}

/// A replication slot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotInfo {
    /// Slot name
    pub slot_name: String,
    /// Output plugin (logical slots)
    pub plugin: Option<String>,
    /// `physical` or `logical`
    pub slot_type: String,
    /// Database (logical slots)
    pub database: Option<String>,
    /// Whether a consumer is attached
    pub active: bool,
    /// Oldest WAL the slot still needs
    pub restart_lsn: Option<String>,
    /// Position confirmed by the logical consumer
    pub confirmed_flush_lsn: Option<String>,
    /// WAL bytes retained by the slot
    pub retained_bytes: Option<i64>,
    /// WAL availability (`reserved`, `extended`, `unreserved`, `lost`); PG13+
    pub wal_status: Option<String>,
    /// Bytes that can still be written before the slot is lost; PG13+
    pub safe_wal_size: Option<i64>,
}

/// Where a subscription is defined
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionSource {
    /// `CREATE SUBSCRIPTION`
    #[default]
    Native,
    /// `pglogical.create_subscription`
    Pglogical,
}

/// A logical replication subscription
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Subscription name
    pub name: String,
    /// Whether the subscription is enabled
    pub enabled: bool,
    /// Status (`replicating`, `down`, `disabled`, `initializing`, ...)
    pub status: String,
    /// Publications (native) or provider node (pglogical)
    pub provider: Option<String>,
    /// Publications (native) or replication sets (pglogical)
    pub replication_sets: Vec<String>,
    /// Last WAL location received
    pub received_lsn: Option<String>,
    /// Time the last message was received
    pub last_msg_receipt_time: Option<DateTime<Utc>>,
    /// Last WAL location reported back to the publisher
    pub latest_end_lsn: Option<String>,
    /// Native or pglogical
    pub source: SubscriptionSource,
}

/// Kind of replication conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Incoming insert collided with an existing row
    InsertInsert,
    /// Incoming update collided with a local update
    UpdateUpdate,
    /// Incoming update targeted a deleted row
    UpdateDelete,
    /// Incoming delete targeted a deleted row
    DeleteDelete,
}

impl ConflictType {
    /// Parse the tokens used in history tables and server logs
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "insert_insert" | "insert_exists" => Some(Self::InsertInsert),
            "update_update" | "update_differ" | "update_exists" => Some(Self::UpdateUpdate),
            "update_delete" | "update_missing" => Some(Self::UpdateDelete),
            "delete_delete" | "delete_missing" => Some(Self::DeleteDelete),
            _ => None,
        }
    }

    /// Conflict implied by the incoming operation when no explicit type is given
    pub fn from_operation(operation: &str) -> Option<Self> {
        match operation.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::InsertInsert),
            "UPDATE" => Some(Self::UpdateUpdate),
            "DELETE" => Some(Self::DeleteDelete),
            _ => None,
        }
    }
}

/// How a conflict was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Remote change won
    ApplyRemote,
    /// Local row was kept
    KeepLocal,
    /// Change was skipped
    Skip,
}

impl Resolution {
    /// Parse a resolution token
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apply_remote" => Some(Self::ApplyRemote),
            "keep_local" => Some(Self::KeepLocal),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

/// Where conflict data for a node comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSource {
    /// `pglogical.conflict_history` table
    History,
    /// Server csvlog, tailed incrementally
    Log,
    /// Neither is available
    #[default]
    Unavailable,
}

/// Origin of a single conflict event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictEventSource {
    /// Read from the history table
    History,
    /// Parsed from the server log
    Log,
}

/// One replication conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEvent {
    /// Event id (history row id, or a generated UUID for log events)
    pub id: String,
    /// Node the conflict happened on
    pub node_id: String,
    /// When the conflict was recorded
    pub recorded_at: DateTime<Utc>,
    /// Subscription that applied the change
    pub subscription_name: Option<String>,
    /// Conflict kind
    pub conflict_type: ConflictType,
    /// Resolution applied
    pub resolution: Resolution,
    /// Schema of the affected table
    pub schema_name: String,
    /// Affected table
    pub table_name: String,
    /// Index that detected the conflict
    pub index_name: Option<String>,
    /// Local row
    pub local_tuple: Option<serde_json::Value>,
    /// Incoming row
    pub remote_tuple: Option<serde_json::Value>,
    /// Commit time of the local row
    pub local_commit_ts: Option<DateTime<Utc>>,
    /// Commit time of the incoming change
    pub remote_commit_ts: Option<DateTime<Utc>>,
    /// LSN of the incoming change
    pub remote_lsn: Option<String>,
    /// History table or log
    pub source: ConflictEventSource,
}

impl ConflictEvent {
    /// Event parsed from a log line; tuple, commit and LSN fields are unknown
    #[allow(clippy::too_many_arguments)]
    pub fn from_log(
        node_id: impl Into<String>,
        recorded_at: DateTime<Utc>,
        conflict_type: ConflictType,
        resolution: Resolution,
        schema_name: impl Into<String>,
        table_name: impl Into<String>,
        index_name: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            node_id: node_id.into(),
            recorded_at,
            subscription_name: None,
            conflict_type,
            resolution,
            schema_name: schema_name.into(),
            table_name: table_name.into(),
            index_name,
            local_tuple: None,
            remote_tuple: None,
            local_commit_ts: None,
            remote_commit_ts: None,
            remote_lsn: None,
            source: ConflictEventSource::Log,
        }
    }
}

/// Error counters from `pg_stat_subscription_stats` (PG15+)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCounter {
    /// Subscription name
    pub subscription_name: String,
    /// Errors while applying changes
    pub apply_error_count: i64,
    /// Errors during initial table sync
    pub sync_error_count: i64,
}

/// Conflict information for one node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Where events come from
    pub source: ConflictSource,
    /// Per-subscription error counters; empty before PG15
    pub counters: Vec<ConflictCounter>,
    /// Recent events, newest last
    pub events: Vec<ConflictEvent>,
}

/// Snapshot of one poll cycle across all polled nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleResult {
    /// Cycle id
    pub cycle_id: Uuid,
    /// When the cycle started
    pub started_at: DateTime<Utc>,
    /// When the cycle finished
    pub completed_at: DateTime<Utc>,
    /// Wall time of the cycle
    pub duration_ms: u64,
    /// Replication stats per node
    pub stats: Vec<NodeResult<Vec<ReplicationStat>>>,
    /// Slots per node
    pub slots: Vec<NodeResult<Vec<SlotInfo>>>,
    /// Subscriptions per node
    pub subscriptions: Vec<NodeResult<Vec<SubscriptionInfo>>>,
    /// Conflicts per node
    pub conflicts: Vec<NodeResult<ConflictReport>>,
}

impl CycleResult {
    /// A cycle that polled no nodes
    pub fn empty(cycle_id: Uuid, started_at: DateTime<Utc>) -> Self {
        let completed_at = Utc::now();
        Self {
            cycle_id,
            started_at,
            completed_at,
            duration_ms: duration_ms(started_at, completed_at),
            stats: Vec::new(),
            slots: Vec::new(),
            subscriptions: Vec::new(),
            conflicts: Vec::new(),
        }
    }

    /// Number of nodes polled
    pub fn node_count(&self) -> usize {
        self.stats.len()
    }

    /// Whether no node was polled
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

pub(crate) fn duration_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}
