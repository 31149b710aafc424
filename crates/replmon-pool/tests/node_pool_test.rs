//! Tests for the node pool and health monitor

mod common;

use common::{init_tracing, node, settle, MockCluster};
use pretty_assertions::assert_eq;
use replmon_pool::prelude::*;
use std::time::Duration;

fn pool_config() -> NodePoolConfig {
    NodePoolConfig::default().with_health(
        HealthConfig::default()
            .with_interval(Duration::from_secs(1))
            .with_probe_timeout(Duration::from_millis(500))
            .with_unhealthy_threshold(3),
    )
}

// ==================== Registry Tests ====================

#[tokio::test]
async fn test_add_then_get_returns_config_as_supplied() {
    let cluster = MockCluster::new();
    let pool = NodePool::new(pool_config(), cluster.factory());

    let ids = ["a", "Node_1", "east-2", "z9"];
    for id in ids {
        pool.add_node(id, node("db1")).unwrap();
    }
    pool.add_node("custom", node("db2").with_port(6432).with_name("Replica"))
        .unwrap();

    for id in ids {
        let info = pool.get_node(id).unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.name, id);
        assert_eq!(info.config, node("db1"));
        assert_eq!(info.config.port, 5432);
    }
    let custom = pool.get_node("custom").unwrap();
    assert_eq!(custom.config.port, 6432);
    assert_eq!(custom.name, "Replica");

    assert_eq!(pool.node_ids(), vec!["a", "Node_1", "east-2", "z9", "custom"]);
    assert!(pool.get_node("missing").is_none());
}

#[tokio::test]
async fn test_add_node_rejects_invalid_and_duplicate_ids() {
    let pool = NodePool::new(pool_config(), MockCluster::new().factory());

    let err = pool.add_node("1bad", node("db1")).unwrap_err();
    assert!(matches!(err, Error::InvalidNodeId { .. }));
    assert_eq!(err.category(), ErrorCategory::Configuration);

    pool.add_node("a", node("db1")).unwrap();
    let err = pool.add_node("a", node("db2")).unwrap_err();
    assert!(matches!(err, Error::DuplicateNode { .. }));

    // The original registration is untouched
    assert_eq!(pool.get_node("a").unwrap().config.host, "db1");
}

#[tokio::test]
async fn test_new_node_starts_connecting_even_when_unreachable() {
    let cluster = MockCluster::new();
    cluster.set_down("db1", true);
    let pool = NodePool::new(pool_config(), cluster.factory());

    pool.add_node("a", node("db1")).unwrap();
    let health = pool.get_health("a").unwrap();
    assert_eq!(health.state, HealthState::Connecting);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(pool.get_pool_stats("a").unwrap().total, 0);
}

#[tokio::test]
async fn test_remove_node() {
    let pool = NodePool::new(pool_config(), MockCluster::new().factory());
    pool.add_node("a", node("db1")).unwrap();
    pool.add_node("b", node("db2")).unwrap();

    pool.remove_node("a").await.unwrap();
    assert_eq!(pool.node_ids(), vec!["b"]);
    assert!(matches!(
        pool.remove_node("a").await,
        Err(Error::NodeNotFound { .. })
    ));
}

// ==================== Health Tests ====================

#[tokio::test(start_paused = true)]
async fn test_failure_threshold_debounces_single_transition() {
    init_tracing();
    let cluster = MockCluster::new();
    let pool = NodePool::new(pool_config(), cluster.factory());
    let mut events = pool.subscribe_health();

    pool.add_node("a", node("db1")).unwrap();
    pool.start().unwrap();
    settle().await;

    assert_eq!(pool.get_health("a").unwrap().state, HealthState::Healthy);
    assert_eq!(
        events.try_recv().unwrap(),
        HealthEvent::ConnectivityRestored {
            node_id: "a".into()
        }
    );

    cluster.set_down("db1", true);

    // Two failures: still healthy, no notification
    for expected_failures in 1..=2 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let health = pool.get_health("a").unwrap();
        assert_eq!(health.state, HealthState::Healthy);
        assert_eq!(health.consecutive_failures, expected_failures);
        assert!(events.try_recv().is_err());
    }

    // Third failure crosses the threshold exactly once
    tokio::time::sleep(Duration::from_secs(1)).await;
    let health = pool.get_health("a").unwrap();
    assert_eq!(health.state, HealthState::Unhealthy);
    assert!(health.last_error.is_some());
    assert!(matches!(
        events.try_recv().unwrap(),
        HealthEvent::ConnectivityLost { ref node_id, .. } if node_id == "a"
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.get_health("a").unwrap().consecutive_failures, 4);
    assert!(events.try_recv().is_err());

    // Recovery on the next successful probe
    cluster.set_down("db1", false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let health = pool.get_health("a").unwrap();
    assert_eq!(health.state, HealthState::Healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert!(matches!(
        events.try_recv().unwrap(),
        HealthEvent::ConnectivityRestored { .. }
    ));

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovers_when_old_session_stays_closed() {
    init_tracing();
    let cluster = MockCluster::new();
    cluster.set_sessions_die(true);
    let pool = NodePool::new(NodePoolConfig::default(), cluster.factory());

    pool.add_node("a", node("db1")).unwrap();
    pool.start().unwrap();
    settle().await;
    assert_eq!(pool.get_health("a").unwrap().state, HealthState::Healthy);

    cluster.set_down("db1", true);
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(pool.get_health("a").unwrap().state, HealthState::Unhealthy);

    // The session that saw the outage is gone for good; only a fresh
    // connection can succeed
    cluster.set_down("db1", false);
    tokio::time::sleep(Duration::from_secs(6)).await;

    let health = pool.get_health("a").unwrap();
    assert_eq!(health.state, HealthState::Healthy);
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(pool.get_pool_stats("a").unwrap().connections_created, 2);
    pool.query("a", "SELECT 2", &[]).await.unwrap();

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_probe_timeout_counts_as_failure() {
    let cluster = MockCluster::new();
    cluster.set_delay("slow", Duration::from_secs(2));
    let pool = NodePool::new(pool_config(), cluster.factory());

    pool.add_node("s", node("slow")).unwrap();
    pool.start().unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let health = pool.get_health("s").unwrap();
    assert_eq!(health.state, HealthState::Connecting);
    assert_eq!(health.consecutive_failures, 1);
    assert!(health.last_error.unwrap().contains("timed out"));

    pool.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_node_added_while_running_is_probed_immediately() {
    let pool = NodePool::new(pool_config(), MockCluster::new().factory());
    pool.start().unwrap();
    assert!(pool.is_running());
    settle().await;

    pool.add_node("late", node("db1")).unwrap();
    settle().await;

    // Well before the next one-second tick
    assert_eq!(pool.get_health("late").unwrap().state, HealthState::Healthy);
    pool.shutdown().await;
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let pool = NodePool::new(pool_config(), MockCluster::new().factory());
    pool.start().unwrap();
    pool.start().unwrap();
    assert!(pool.is_running());
    pool.shutdown().await;
    assert!(!pool.is_running());
}

// ==================== Query Tests ====================

#[tokio::test]
async fn test_query_healthy_nodes_with_none_healthy_is_empty() {
    let pool = NodePool::new(pool_config(), MockCluster::new().factory());
    pool.add_node("a", node("db1")).unwrap();
    pool.add_node("b", node("db2")).unwrap();

    // Never probed, so nothing is healthy yet
    assert!(pool.get_healthy_nodes().is_empty());
    assert!(pool.query_healthy_nodes("SELECT 1", &[]).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_query_healthy_nodes_only_targets_healthy() {
    let cluster = MockCluster::new();
    cluster.set_down("db2", true);
    let pool = NodePool::new(pool_config(), cluster.factory());
    pool.add_node("a", node("db1")).unwrap();
    pool.add_node("b", node("db2")).unwrap();
    pool.add_node("c", node("db3")).unwrap();
    pool.start().unwrap();
    settle().await;

    let healthy: Vec<String> = pool.get_healthy_nodes().into_iter().map(|n| n.id).collect();
    assert_eq!(healthy, vec!["a", "c"]);

    let results = pool.query_healthy_nodes("SELECT 1", &[]).await;
    let ids: Vec<&str> = results.iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);
    assert!(results.iter().all(NodeResult::is_success));

    pool.shutdown().await;
}

#[tokio::test]
async fn test_query_all_nodes_isolates_failures() {
    let cluster = MockCluster::new();
    cluster.set_down("db2", true);
    let pool = NodePool::new(pool_config(), cluster.factory());
    pool.add_node("a", node("db1")).unwrap();
    pool.add_node("b", node("db2")).unwrap();
    pool.add_node("c", node("db3")).unwrap();

    let results = pool.query_all_nodes("SELECT 1", &[]).await;
    assert_eq!(results.len(), 3);
    assert!(results[0].is_success());
    assert!(!results[1].is_success());
    assert!(results[1].error().unwrap().contains("refused"));
    assert!(results[2].is_success());

    let row = &results[2].data().unwrap()[0];
    assert_eq!(row.opt_str("host").as_deref(), Some("db3"));
}

#[tokio::test(start_paused = true)]
async fn test_query_times_out() {
    let cluster = MockCluster::new();
    cluster.set_delay("slow", Duration::from_secs(30));
    let pool = NodePool::new(
        pool_config().with_query_timeout(Duration::from_millis(200)),
        cluster.factory(),
    );
    pool.add_node("s", node("slow")).unwrap();

    let err = pool.query("s", "SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(err.is_retriable());

    assert!(matches!(
        pool.query("missing", "SELECT 1", &[]).await,
        Err(Error::NodeNotFound { .. })
    ));
}

#[tokio::test]
async fn test_pool_stats_track_connections() {
    let pool = NodePool::new(pool_config(), MockCluster::new().factory());
    pool.add_node("a", node("db1")).unwrap();

    pool.query("a", "SELECT 1", &[]).await.unwrap();
    pool.query("a", "SELECT 2", &[]).await.unwrap();

    let stats = pool.get_pool_stats("a").unwrap();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.acquisitions, 2);
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.waiting, 0);
}

// ==================== Shutdown Tests ====================

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let pool = NodePool::new(pool_config(), MockCluster::new().factory());
    pool.add_node("a", node("db1")).unwrap();
    pool.add_node("b", node("db2")).unwrap();
    pool.query_all_nodes("SELECT 1", &[]).await;
    pool.start().unwrap();

    pool.shutdown().await;
    assert!(!pool.is_running());
    assert!(pool.node_ids().is_empty());
    assert!(matches!(
        pool.add_node("c", node("db3")),
        Err(Error::PoolClosed)
    ));
    assert!(matches!(pool.start(), Err(Error::PoolClosed)));

    // Second shutdown is a no-op
    pool.shutdown().await;
}
