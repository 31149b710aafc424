//! Incremental csvlog tailer
//!
//! Recovers conflict events from PostgreSQL's csvlog for nodes without a
//! usable `pglogical.conflict_history` table. Each read continues from the
//! persisted byte offset of the node's current log file:
//!
//! - a different current file (rotation) restarts at offset 0 on the new file
//! - a current file shorter than the stored offset was truncated in place and
//!   is handled like rotation
//! - at most [`MAX_READ_BYTES`] are read per call; when the window is full
//!   only complete lines are consumed so the next read starts on a line
//!   boundary
//!
//! Logs are read either from the local filesystem or through the server with
//! `pg_current_logfile()` and `pg_read_binary_file()`.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use replmon_pool::{NodePool, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::error::{MonitorError, Result};
use crate::model::{ConflictEvent, ConflictSource, ConflictType, Resolution};
use crate::pglogical::NodeCapabilities;
use crate::position::{LogPosition, PositionStore};

/// Maximum bytes read from a log per call
pub const MAX_READ_BYTES: u64 = 1024 * 1024;

const CURRENT_LOGFILE_SQL: &str = "\
SELECT f.path, (pg_stat_file(f.path, true)).size AS size \
FROM (SELECT pg_current_logfile('csvlog') AS path) f";

const READ_LOGFILE_SQL: &str = "SELECT pg_read_binary_file($1, $2, $3, true) AS data";

static CONFLICT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r#"CONFLICT:\s+remote\s+(?P<op>INSERT|UPDATE|DELETE)\s+on\s+relation\s+"#,
        r#"(?P<schema>"(?:[^"]|"")+"|[\w$]+)\.(?P<table>"(?:[^"]|"")+"|[\w$]+)"#,
        r#"(?:\s+\(local\s+index\s+(?P<index>"(?:[^"]|"")+"|[\w$]+)\))?"#,
        r#"(?:.*?\b(?P<ctype>insert_insert|update_update|update_delete|delete_delete)\b)?"#,
        r#".*?Resolution:\s+(?P<res>apply_remote|keep_local|skip)"#,
    ))
    .expect("valid conflict regex")
});

/// Where a node's csvlog can be read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LogLocation {
    /// A csvlog file, or a log directory whose newest `*.csv` file is current
    Local {
        /// File or directory
        path: PathBuf,
    },
    /// Read through the server (requires `pg_read_server_files` or superuser)
    Remote,
}

/// The log file currently being written
#[derive(Debug, Clone, PartialEq, Eq)]
struct CurrentLog {
    path: String,
    len: u64,
}

/// Tails csvlogs and turns conflict lines into [`ConflictEvent`]s
pub struct LogTailer {
    pool: NodePool,
    locations: HashMap<String, LogLocation>,
    positions: Arc<PositionStore>,
}

impl std::fmt::Debug for LogTailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTailer")
            .field("locations", &self.locations)
            .field("positions", &self.positions)
            .finish()
    }
}

impl LogTailer {
    /// Create a tailer for the given per-node locations
    pub fn new(
        pool: NodePool,
        locations: HashMap<String, LogLocation>,
        positions: Arc<PositionStore>,
    ) -> Self {
        Self {
            pool,
            locations,
            positions,
        }
    }

    /// Position store used by this tailer
    pub fn positions(&self) -> &Arc<PositionStore> {
        &self.positions
    }

    /// Log location configured for a node
    pub fn location(&self, node_id: &str) -> Option<&LogLocation> {
        self.locations.get(node_id)
    }

    /// Where conflict data for a node comes from: the history table when it
    /// exists and is enabled, else the log when a location is configured
    pub fn detect_source(&self, node_id: &str, caps: &NodeCapabilities) -> ConflictSource {
        if caps.conflict_history {
            ConflictSource::History
        } else if self.locations.contains_key(node_id) {
            ConflictSource::Log
        } else {
            ConflictSource::Unavailable
        }
    }

    /// Read new conflict events for a node.
    ///
    /// Errors are logged and yield no events.
    pub async fn read(&self, node_id: &str) -> Vec<ConflictEvent> {
        match self.try_read(node_id).await {
            Ok(events) => events,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "log tailer read failed");
                Vec::new()
            }
        }
    }

    /// Read new conflict events for a node, returning errors
    pub async fn try_read(&self, node_id: &str) -> Result<Vec<ConflictEvent>> {
        let location = self.locations.get(node_id).ok_or_else(|| {
            MonitorError::log_source(format!("no log location configured for node '{node_id}'"))
        })?;
        let current = self.current_log(node_id, location).await?;

        let mut offset = match self.positions.get(node_id) {
            Some(pos) if pos.path == current.path => pos.offset,
            Some(pos) => {
                info!(node_id = %node_id, from = %pos.path, to = %current.path, "log rotated");
                0
            }
            None => 0,
        };
        if offset > current.len {
            info!(
                node_id = %node_id,
                path = %current.path,
                offset,
                len = current.len,
                "log truncated, restarting at beginning"
            );
            offset = 0;
        }

        let want = (current.len - offset).min(MAX_READ_BYTES);
        let bytes = if want == 0 {
            Vec::new()
        } else {
            self.read_range(node_id, location, &current.path, offset, want)
                .await?
        };

        let consumed = consumable_len(&bytes);
        let text = String::from_utf8_lossy(&bytes[..consumed]);
        let events = parse_log_chunk(node_id, &text);

        let new_offset = offset + consumed as u64;
        self.positions
            .save(node_id, LogPosition::new(current.path.clone(), new_offset))
            .await?;

        debug!(
            node_id = %node_id,
            path = %current.path,
            offset = new_offset,
            events = events.len(),
            "log read"
        );
        Ok(events)
    }

    async fn current_log(&self, node_id: &str, location: &LogLocation) -> Result<CurrentLog> {
        match location {
            LogLocation::Local { path } => current_local_log(path).await,
            LogLocation::Remote => {
                let rows = self.pool.query(node_id, CURRENT_LOGFILE_SQL, &[]).await?;
                let row = rows.first();
                let path = row.and_then(|r| r.opt_str("path")).ok_or_else(|| {
                    MonitorError::log_source("csvlog is not enabled on the server")
                })?;
                let len = row.and_then(|r| r.opt_i64("size")).ok_or_else(|| {
                    MonitorError::log_source(format!("cannot stat log file '{path}'"))
                })?;
                Ok(CurrentLog {
                    path,
                    len: len.max(0) as u64,
                })
            }
        }
    }

    async fn read_range(
        &self,
        node_id: &str,
        location: &LogLocation,
        path: &str,
        offset: u64,
        len: u64,
    ) -> Result<Vec<u8>> {
        match location {
            LogLocation::Local { .. } => {
                let mut file = fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = Vec::with_capacity(len as usize);
                file.take(len).read_to_end(&mut buf).await?;
                Ok(buf)
            }
            LogLocation::Remote => {
                let params = [
                    Value::from(path),
                    Value::Int64(offset as i64),
                    Value::Int64(len as i64),
                ];
                let rows = self.pool.query(node_id, READ_LOGFILE_SQL, &params).await?;
                Ok(rows
                    .first()
                    .and_then(|r| r.get_by_name("data"))
                    .and_then(Value::as_bytes)
                    .map(<[u8]>::to_vec)
                    .unwrap_or_default())
            }
        }
    }
}

async fn current_local_log(path: &Path) -> Result<CurrentLog> {
    let meta = fs::metadata(path).await?;
    if meta.is_file() {
        return Ok(CurrentLog {
            path: path.display().to_string(),
            len: meta.len(),
        });
    }

    let mut newest: Option<(std::time::SystemTime, PathBuf, u64)> = None;
    let mut entries = fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        if entry_path.extension() != Some(std::ffi::OsStr::new("csv")) {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified()?;
        let is_newer = match &newest {
            Some((t, p, _)) => (modified, &entry_path) > (*t, p),
            None => true,
        };
        if is_newer {
            newest = Some((modified, entry_path, meta.len()));
        }
    }

    newest
        .map(|(_, path, len)| CurrentLog {
            path: path.display().to_string(),
            len,
        })
        .ok_or_else(|| {
            MonitorError::log_source(format!("no csvlog files in '{}'", path.display()))
        })
}

/// Bytes of a read window that may be consumed: up to the last newline, so
/// a line still being written is read again once complete. A full window
/// without any newline holds a single oversized line, which is skipped.
fn consumable_len(bytes: &[u8]) -> usize {
    match bytes.iter().rposition(|b| *b == b'\n') {
        Some(idx) => idx + 1,
        None if bytes.len() as u64 >= MAX_READ_BYTES => bytes.len(),
        None => 0,
    }
}

/// Parse every conflict line in a chunk of csvlog text
pub fn parse_log_chunk(node_id: &str, text: &str) -> Vec<ConflictEvent> {
    text.lines()
        .filter_map(|line| parse_log_line(node_id, line))
        .collect()
}

/// Parse one csvlog line; `None` unless it reports a conflict
pub fn parse_log_line(node_id: &str, line: &str) -> Option<ConflictEvent> {
    if !line.contains("CONFLICT") {
        return None;
    }
    let unescaped = line.replace("\"\"", "\"");
    let caps = CONFLICT_REGEX.captures(&unescaped)?;

    let operation = caps.name("op")?.as_str();
    let conflict_type = caps
        .name("ctype")
        .and_then(|m| ConflictType::parse(m.as_str()))
        .or_else(|| ConflictType::from_operation(operation))?;
    let resolution = Resolution::parse(caps.name("res")?.as_str())?;

    let recorded_at = parse_csvlog_timestamp(line).unwrap_or_else(Utc::now);

    Some(ConflictEvent::from_log(
        node_id,
        recorded_at,
        conflict_type,
        resolution,
        unquote_ident(caps.name("schema")?.as_str()),
        unquote_ident(caps.name("table")?.as_str()),
        caps.name("index").map(|m| unquote_ident(m.as_str())),
    ))
}

fn unquote_ident(ident: &str) -> String {
    match ident.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.replace("\"\"", "\""),
        None => ident.to_string(),
    }
}

/// First csvlog column, e.g. `2024-05-01 12:00:00.123 UTC`
fn parse_csvlog_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let field = line.split(',').next()?.trim();
    let (datetime, zone) = field.rsplit_once(' ')?;

    if matches!(zone, "UTC" | "GMT" | "Z") {
        return NaiveDateTime::parse_from_str(datetime, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .map(|dt| dt.and_utc());
    }
    DateTime::parse_from_str(field, "%Y-%m-%d %H:%M:%S%.f %#z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
