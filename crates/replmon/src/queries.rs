//! Category queries and row mapping
//!
//! One SQL statement and one mapping function per category. Values the row
//! decoder does not handle natively (`pg_lsn`, `interval`, `inet`, `numeric`,
//! arrays) are cast in SQL. Version-gated columns are selected only when the
//! server has them, and mapping treats a missing column like NULL.

use replmon_pool::{NodePool, Row, Value};

use crate::error::Result;
use crate::model::{
    ConflictCounter, ConflictEvent, ConflictEventSource, ConflictType, ReplicationStat,
    Resolution, SlotInfo, SubscriptionInfo, SubscriptionSource,
};
use crate::pglogical::NodeCapabilities;

/// Upper bound on conflict events kept per node
pub const MAX_EVENTS_PER_NODE: usize = 500;

pub(crate) const STATS_SQL: &str = "\
SELECT pid, application_name, client_addr::text AS client_addr, state, sync_state, \
       sent_lsn::text AS sent_lsn, write_lsn::text AS write_lsn, \
       flush_lsn::text AS flush_lsn, replay_lsn::text AS replay_lsn, \
       (extract(epoch FROM write_lag) * 1000)::float8 AS write_lag_ms, \
       (extract(epoch FROM flush_lag) * 1000)::float8 AS flush_lag_ms, \
       (extract(epoch FROM replay_lag) * 1000)::float8 AS replay_lag_ms, \
       CASE WHEN pg_is_in_recovery() THEN NULL \
            ELSE pg_wal_lsn_diff(pg_current_wal_lsn(), replay_lsn)::int8 END AS lag_bytes \
FROM pg_stat_replication \
ORDER BY application_name, pid";

pub(crate) const SLOTS_SQL_PG13: &str = "\
SELECT slot_name::text AS slot_name, plugin::text AS plugin, slot_type, \
       database::text AS database, active, \
       restart_lsn::text AS restart_lsn, confirmed_flush_lsn::text AS confirmed_flush_lsn, \
       CASE WHEN pg_is_in_recovery() THEN NULL \
            ELSE pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn)::int8 END AS retained_bytes, \
       wal_status, safe_wal_size \
FROM pg_replication_slots \
ORDER BY slot_name";

pub(crate) const SLOTS_SQL_LEGACY: &str = "\
SELECT slot_name::text AS slot_name, plugin::text AS plugin, slot_type, \
       database::text AS database, active, \
       restart_lsn::text AS restart_lsn, confirmed_flush_lsn::text AS confirmed_flush_lsn, \
       CASE WHEN pg_is_in_recovery() THEN NULL \
            ELSE pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn)::int8 END AS retained_bytes \
FROM pg_replication_slots \
ORDER BY slot_name";

pub(crate) const SUBSCRIPTIONS_NATIVE_SQL: &str = "\
SELECT s.subname::text AS name, s.subenabled AS enabled, \
       array_to_string(s.subpublications, ',') AS publications, \
       CASE WHEN NOT s.subenabled THEN 'disabled' \
            WHEN st.pid IS NULL THEN 'down' \
            ELSE 'replicating' END AS status, \
       st.received_lsn::text AS received_lsn, st.last_msg_receipt_time, \
       st.latest_end_lsn::text AS latest_end_lsn \
FROM pg_subscription s \
LEFT JOIN pg_stat_subscription st ON st.subid = s.oid AND st.relid IS NULL \
WHERE s.subdbid = (SELECT oid FROM pg_database WHERE datname = current_database()) \
ORDER BY s.subname";

pub(crate) const SUBSCRIPTIONS_PGLOGICAL_SQL: &str = "\
SELECT subscription_name::text AS name, status, provider_node::text AS provider, \
       array_to_string(replication_sets, ',') AS replication_sets \
FROM pglogical.show_subscription_status() \
ORDER BY subscription_name";

pub(crate) const SUBSCRIPTION_STATS_SQL: &str = "\
SELECT subname::text AS subscription_name, apply_error_count, sync_error_count \
FROM pg_stat_subscription_stats \
ORDER BY subname";

pub(crate) const CONFLICT_HISTORY_SQL: &str = "\
SELECT * FROM ( \
    SELECT id::text AS id, recorded_at, sub_name::text AS subscription_name, \
           conflict_type::text AS conflict_type, conflict_resolution::text AS resolution, \
           nspname::text AS schema_name, relname::text AS table_name, \
           index_name::text AS index_name, \
           local_tuple::json AS local_tuple, remote_tuple::json AS remote_tuple, \
           local_commit_ts, remote_commit_ts, remote_lsn::text AS remote_lsn \
    FROM pglogical.conflict_history \
    ORDER BY recorded_at DESC \
    LIMIT $1 \
) recent ORDER BY recorded_at";

/// Map a `pg_stat_replication` row
pub fn map_replication_stat(row: &Row) -> Result<ReplicationStat> {
    Ok(ReplicationStat {
        pid: row.try_i64("pid")?,
        application_name: row.opt_str("application_name"),
        client_addr: row.opt_str("client_addr"),
        state: row.opt_str("state"),
        sync_state: row.opt_str("sync_state"),
        sent_lsn: row.opt_str("sent_lsn"),
        write_lsn: row.opt_str("write_lsn"),
        flush_lsn: row.opt_str("flush_lsn"),
        replay_lsn: row.opt_str("replay_lsn"),
        write_lag_ms: row.opt_f64("write_lag_ms"),
        flush_lag_ms: row.opt_f64("flush_lag_ms"),
        replay_lag_ms: row.opt_f64("replay_lag_ms"),
        lag_bytes: row.opt_i64("lag_bytes"),
    })
}

/// Map a `pg_replication_slots` row; `wal_status`/`safe_wal_size` are
/// absent before PG13
pub fn map_slot(row: &Row) -> Result<SlotInfo> {
    Ok(SlotInfo {
        slot_name: row.try_str("slot_name")?,
        plugin: row.opt_str("plugin"),
        slot_type: row.opt_str("slot_type").unwrap_or_else(|| "physical".into()),
        database: row.opt_str("database"),
        active: row.opt_bool("active").unwrap_or(false),
        restart_lsn: row.opt_str("restart_lsn"),
        confirmed_flush_lsn: row.opt_str("confirmed_flush_lsn"),
        retained_bytes: row.opt_i64("retained_bytes"),
        wal_status: row.opt_str("wal_status"),
        safe_wal_size: row.opt_i64("safe_wal_size"),
    })
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Map a native subscription row
pub fn map_native_subscription(row: &Row) -> Result<SubscriptionInfo> {
    let publications = row.opt_str("publications");
    Ok(SubscriptionInfo {
        name: row.try_str("name")?,
        enabled: row.opt_bool("enabled").unwrap_or(false),
        status: row.opt_str("status").unwrap_or_else(|| "unknown".into()),
        replication_sets: split_list(publications.clone()),
        provider: publications,
        received_lsn: row.opt_str("received_lsn"),
        last_msg_receipt_time: row.opt_timestamp("last_msg_receipt_time"),
        latest_end_lsn: row.opt_str("latest_end_lsn"),
        source: SubscriptionSource::Native,
    })
}

/// Map a `pglogical.show_subscription_status()` row
pub fn map_pglogical_subscription(row: &Row) -> Result<SubscriptionInfo> {
    let status = row.opt_str("status").unwrap_or_else(|| "unknown".into());
    Ok(SubscriptionInfo {
        name: row.try_str("name")?,
        enabled: status != "disabled",
        status,
        provider: row.opt_str("provider"),
        replication_sets: split_list(row.opt_str("replication_sets")),
        received_lsn: None,
        last_msg_receipt_time: None,
        latest_end_lsn: None,
        source: SubscriptionSource::Pglogical,
    })
}

/// Map a `pg_stat_subscription_stats` row
pub fn map_conflict_counter(row: &Row) -> Result<ConflictCounter> {
    Ok(ConflictCounter {
        subscription_name: row.try_str("subscription_name")?,
        apply_error_count: row.opt_i64("apply_error_count").unwrap_or(0),
        sync_error_count: row.opt_i64("sync_error_count").unwrap_or(0),
    })
}

/// Map a `pglogical.conflict_history` row. Rows with an unknown conflict
/// type or resolution are skipped.
pub fn map_history_event(node_id: &str, row: &Row) -> Result<Option<ConflictEvent>> {
    let conflict_type = row.opt_str("conflict_type").and_then(|s| ConflictType::parse(&s));
    let resolution = row.opt_str("resolution").and_then(|s| Resolution::parse(&s));
    let (Some(conflict_type), Some(resolution)) = (conflict_type, resolution) else {
        return Ok(None);
    };

    Ok(Some(ConflictEvent {
        id: row.try_str("id")?,
        node_id: node_id.to_string(),
        recorded_at: row
            .opt_timestamp("recorded_at")
            .unwrap_or_else(chrono::Utc::now),
        subscription_name: row.opt_str("subscription_name"),
        conflict_type,
        resolution,
        schema_name: row.opt_str("schema_name").unwrap_or_default(),
        table_name: row.try_str("table_name")?,
        index_name: row.opt_str("index_name"),
        local_tuple: row.opt_json("local_tuple"),
        remote_tuple: row.opt_json("remote_tuple"),
        local_commit_ts: row.opt_timestamp("local_commit_ts"),
        remote_commit_ts: row.opt_timestamp("remote_commit_ts"),
        remote_lsn: row.opt_str("remote_lsn"),
        source: ConflictEventSource::History,
    }))
}

fn map_rows<T>(rows: &[Row], f: impl Fn(&Row) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(f).collect()
}

/// Walsenders on the node
pub async fn fetch_stats(pool: &NodePool, node_id: &str) -> Result<Vec<ReplicationStat>> {
    let rows = pool.query(node_id, STATS_SQL, &[]).await?;
    map_rows(&rows, map_replication_stat)
}

/// Replication slots on the node
pub async fn fetch_slots(
    pool: &NodePool,
    node_id: &str,
    caps: &NodeCapabilities,
) -> Result<Vec<SlotInfo>> {
    let sql = if caps.has_wal_status() {
        SLOTS_SQL_PG13
    } else {
        SLOTS_SQL_LEGACY
    };
    let rows = pool.query(node_id, sql, &[]).await?;
    map_rows(&rows, map_slot)
}

/// Subscriptions on the node, from pglogical when installed
pub async fn fetch_subscriptions(
    pool: &NodePool,
    node_id: &str,
    caps: &NodeCapabilities,
) -> Result<Vec<SubscriptionInfo>> {
    if caps.has_pglogical {
        let rows = pool.query(node_id, SUBSCRIPTIONS_PGLOGICAL_SQL, &[]).await?;
        map_rows(&rows, map_pglogical_subscription)
    } else {
        let rows = pool.query(node_id, SUBSCRIPTIONS_NATIVE_SQL, &[]).await?;
        map_rows(&rows, map_native_subscription)
    }
}

/// Subscription error counters; empty before PG15
pub async fn fetch_conflict_counters(
    pool: &NodePool,
    node_id: &str,
    caps: &NodeCapabilities,
) -> Result<Vec<ConflictCounter>> {
    if !caps.has_subscription_stats() {
        return Ok(Vec::new());
    }
    let rows = pool.query(node_id, SUBSCRIPTION_STATS_SQL, &[]).await?;
    map_rows(&rows, map_conflict_counter)
}

/// Most recent conflicts from the history table, oldest first
pub async fn fetch_conflict_history(pool: &NodePool, node_id: &str) -> Result<Vec<ConflictEvent>> {
    let rows = pool
        .query(
            node_id,
            CONFLICT_HISTORY_SQL,
            &[Value::Int64(MAX_EVENTS_PER_NODE as i64)],
        )
        .await?;
    let mut events = Vec::with_capacity(rows.len());
    for row in &rows {
        if let Some(event) = map_history_event(node_id, row)? {
            events.push(event);
        }
    }
    Ok(events)
}
