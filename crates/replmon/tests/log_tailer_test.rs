//! Tests for incremental csvlog reading with persisted positions

mod common;

use common::{healthy_pool, init_tracing, ScriptedCluster};
use pretty_assertions::assert_eq;
use replmon::log_tailer::MAX_READ_BYTES;
use replmon::prelude::*;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::tempdir;

fn conflict_line(table: &str) -> String {
    format!(
        "2024-05-01 12:00:00.000 UTC,\"postgres\",\"app\",4242,,,1,,,,,LOG,00000,\
         \"CONFLICT: remote INSERT on relation public.{table} (local index {table}_pkey). \
         Resolution: apply_remote.\",,,,,,,,,\"pglogical apply 16384:1\"\n"
    )
}

fn noise_line() -> String {
    "2024-05-01 12:00:01.000 UTC,,,,,,,,,,,LOG,00000,\"checkpoint starting: time\",,,,,,,,,\"\"\n"
        .to_string()
}

fn append(path: &Path, text: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(text.as_bytes()).unwrap();
}

fn set_mtime(path: &Path, secs_ago: u64) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - Duration::from_secs(secs_ago))
        .unwrap();
}

async fn local_tailer(location: &Path, positions: Arc<PositionStore>) -> LogTailer {
    let pool = NodePool::new(NodePoolConfig::default(), ScriptedCluster::new().factory());
    let locations = HashMap::from([(
        "a".to_string(),
        LogLocation::Local {
            path: location.to_path_buf(),
        },
    )]);
    LogTailer::new(pool, locations, positions)
}

fn tables(events: &[ConflictEvent]) -> Vec<&str> {
    events.iter().map(|e| e.table_name.as_str()).collect()
}

#[tokio::test]
async fn test_second_read_returns_only_appended_lines() {
    init_tracing();
    let dir = tempdir().unwrap();
    let log = dir.path().join("postgresql.csv");
    let position_file = dir.path().join("positions.json");

    let first = format!("{}{}{}", conflict_line("t1"), noise_line(), conflict_line("t2"));
    append(&log, &first);

    let store = Arc::new(PositionStore::open(&position_file).await.unwrap());
    let tailer = local_tailer(&log, store).await;
    let events = tailer.try_read("a").await.unwrap();
    assert_eq!(tables(&events), vec!["t1", "t2"]);
    assert!(events.iter().all(|e| e.source == ConflictEventSource::Log));
    assert!(events.iter().all(|e| e.remote_lsn.is_none() && e.local_tuple.is_none()));

    let second = format!("{}{}", noise_line(), conflict_line("t3"));
    append(&log, &second);
    let events = tailer.try_read("a").await.unwrap();
    assert_eq!(tables(&events), vec!["t3"]);

    let position = tailer.positions().get("a").unwrap();
    assert_eq!(position.offset, (first.len() + second.len()) as u64);
    assert_eq!(position.path, log.display().to_string());

    // A restarted tailer continues from the persisted offset
    let reopened = Arc::new(PositionStore::open(&position_file).await.unwrap());
    let tailer = local_tailer(&log, reopened).await;
    assert!(tailer.try_read("a").await.unwrap().is_empty());

    append(&log, &conflict_line("t4"));
    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["t4"]);
}

#[tokio::test]
async fn test_line_split_across_reads_is_not_lost() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("postgresql.csv");
    let line = conflict_line("split");
    let (head, tail) = line.split_at(60);

    append(&log, &format!("{}{}", conflict_line("t1"), head));
    let tailer = local_tailer(&log, Arc::new(PositionStore::in_memory())).await;
    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["t1"]);
    assert_eq!(
        tailer.positions().get("a").unwrap().offset,
        conflict_line("t1").len() as u64
    );

    // Nothing new is complete yet
    assert!(tailer.try_read("a").await.unwrap().is_empty());

    append(&log, tail);
    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["split"]);
    assert_eq!(
        tailer.positions().get("a").unwrap().offset,
        (conflict_line("t1").len() + line.len()) as u64
    );
}

#[tokio::test]
async fn test_rotation_restarts_at_beginning_of_new_file() {
    let dir = tempdir().unwrap();
    let old = dir.path().join("postgresql-01.csv");
    append(&old, &format!("{}{}", conflict_line("old1"), conflict_line("old2")));
    set_mtime(&old, 120);
    append(&dir.path().join("postgresql-01.log"), "stderr output\n");

    let tailer = local_tailer(dir.path(), Arc::new(PositionStore::in_memory())).await;
    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["old1", "old2"]);

    // The new file is longer than the old offset would suggest; it must
    // still be read from byte zero
    let new = dir.path().join("postgresql-02.csv");
    let mut text = String::new();
    for _ in 0..20 {
        text.push_str(&noise_line());
    }
    text.push_str(&conflict_line("new1"));
    append(&new, &text);
    set_mtime(&new, 0);

    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["new1"]);
    let position = tailer.positions().get("a").unwrap();
    assert_eq!(position.path, new.display().to_string());
    assert_eq!(position.offset, text.len() as u64);
}

#[tokio::test]
async fn test_truncated_file_is_read_from_start() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("postgresql.csv");
    append(&log, &format!("{}{}", noise_line(), conflict_line("before")));

    let tailer = local_tailer(&log, Arc::new(PositionStore::in_memory())).await;
    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["before"]);

    std::fs::write(&log, conflict_line("after")).unwrap();
    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["after"]);
}

#[tokio::test]
async fn test_large_backlog_is_read_in_whole_lines() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("postgresql.csv");

    let mut text = String::new();
    let mut expected = Vec::new();
    let mut i = 0;
    while (text.len() as u64) < MAX_READ_BYTES + MAX_READ_BYTES / 2 {
        if i % 500 == 0 {
            let table = format!("t{i}");
            text.push_str(&conflict_line(&table));
            expected.push(table);
        } else {
            text.push_str(&noise_line());
        }
        i += 1;
    }
    append(&log, &text);

    let tailer = local_tailer(&log, Arc::new(PositionStore::in_memory())).await;
    let first = tailer.try_read("a").await.unwrap();
    let offset = tailer.positions().get("a").unwrap().offset;
    assert!(offset <= MAX_READ_BYTES);
    assert_eq!(&text.as_bytes()[offset as usize - 1..offset as usize], b"\n");

    let second = tailer.try_read("a").await.unwrap();
    assert_eq!(tailer.positions().get("a").unwrap().offset, text.len() as u64);

    let mut seen: Vec<String> = tables(&first).into_iter().map(String::from).collect();
    seen.extend(tables(&second).into_iter().map(String::from));
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_read_errors_yield_no_events() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope").join("postgresql.csv");
    let tailer = local_tailer(&missing, Arc::new(PositionStore::in_memory())).await;

    assert!(tailer.try_read("a").await.is_err());
    assert!(tailer.read("a").await.is_empty());
    assert!(tailer.positions().get("a").is_none());

    let err = tailer.try_read("unconfigured").await.unwrap_err();
    assert!(matches!(err, MonitorError::LogSource(_)));
}

#[tokio::test]
async fn test_empty_directory_is_an_error() {
    let dir = tempdir().unwrap();
    let tailer = local_tailer(dir.path(), Arc::new(PositionStore::in_memory())).await;
    let err = tailer.try_read("a").await.unwrap_err();
    assert!(err.to_string().contains("no csvlog files"));
}

#[tokio::test]
async fn test_detect_source() {
    let dir = tempdir().unwrap();
    let tailer = local_tailer(dir.path(), Arc::new(PositionStore::in_memory())).await;
    let caps = |conflict_history| NodeCapabilities {
        server_version_num: 160_000,
        has_pglogical: true,
        conflict_history,
    };

    assert_eq!(tailer.detect_source("a", &caps(true)), ConflictSource::History);
    assert_eq!(tailer.detect_source("a", &caps(false)), ConflictSource::Log);
    assert_eq!(
        tailer.detect_source("b", &caps(false)),
        ConflictSource::Unavailable
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_log_through_server_functions() {
    let cluster = ScriptedCluster::new();
    let pool = healthy_pool(&cluster, 1).await;
    cluster.set_log("db1", "log/postgresql-01.csv", conflict_line("r1").as_bytes());

    let locations = HashMap::from([("a".to_string(), LogLocation::Remote)]);
    let tailer = LogTailer::new(pool, locations, Arc::new(PositionStore::in_memory()));
    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["r1"]);

    cluster.append_log("db1", conflict_line("r2").as_bytes());
    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["r2"]);

    // Rotation on the server
    cluster.set_log("db1", "log/postgresql-02.csv", conflict_line("r3").as_bytes());
    assert_eq!(tables(&tailer.try_read("a").await.unwrap()), vec!["r3"]);
    assert_eq!(
        tailer.positions().get("a").unwrap().path,
        "log/postgresql-02.csv"
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_log_without_csvlog_is_an_error() {
    let cluster = ScriptedCluster::new();
    let pool = healthy_pool(&cluster, 1).await;
    let locations = HashMap::from([("a".to_string(), LogLocation::Remote)]);
    let tailer = LogTailer::new(pool, locations, Arc::new(PositionStore::in_memory()));

    assert!(tailer.try_read("a").await.is_err());
    assert!(tailer.read("a").await.is_empty());
}
