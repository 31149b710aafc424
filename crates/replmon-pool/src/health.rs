//! # Node Health Monitoring
//!
//! Per-node connectivity tracking driven by a periodic `SELECT 1` probe.
//!
//! ## State machine
//!
//! - Every node starts in [`HealthState::Connecting`].
//! - A successful probe moves the node to [`HealthState::Healthy`] and resets
//!   the failure counter.
//! - A failed probe increments the counter; the node only becomes
//!   [`HealthState::Unhealthy`] once the counter reaches the threshold, so a
//!   single transient failure never flips a healthy node.
//!
//! Transitions that change connectivity are broadcast as [`HealthEvent`]s:
//! `ConnectivityRestored` whenever a node becomes healthy from any other
//! state, `ConnectivityLost` only on `Healthy -> Unhealthy`.
//!
//! Health is written only here. Everyone else reads clones.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::node::Node;

const PROBE_SQL: &str = "SELECT 1";

/// Connectivity state of a node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Registered, not yet confirmed reachable
    #[default]
    Connecting,
    /// Last probe succeeded
    Healthy,
    /// Failure threshold reached
    Unhealthy,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthState::Connecting => write!(f, "connecting"),
            HealthState::Healthy => write!(f, "healthy"),
            HealthState::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Health of one node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHealth {
    /// Current state
    pub state: HealthState,
    /// Time of the last probe
    pub last_check: Option<DateTime<Utc>>,
    /// Time of the last successful probe
    pub last_success: Option<DateTime<Utc>>,
    /// Failed probes since the last success
    pub consecutive_failures: u32,
    /// Error of the last failed probe
    pub last_error: Option<String>,
    /// Round-trip time of the last probe
    pub latency_ms: Option<u64>,
}

impl NodeHealth {
    /// Whether the node is currently healthy
    #[inline]
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }
}

/// Connectivity change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthEvent {
    /// Node became healthy after being connecting or unhealthy
    ConnectivityRestored {
        /// Node id
        node_id: String,
    },
    /// Node went from healthy to unhealthy
    ConnectivityLost {
        /// Node id
        node_id: String,
        /// Error from the probe that crossed the threshold
        error: String,
    },
}

impl HealthEvent {
    /// Node the event refers to
    pub fn node_id(&self) -> &str {
        match self {
            HealthEvent::ConnectivityRestored { node_id } => node_id,
            HealthEvent::ConnectivityLost { node_id, .. } => node_id,
        }
    }
}

/// Outcome of one probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probe answered within the timeout
    Success {
        /// Round-trip time
        latency_ms: u64,
    },
    /// Probe failed or timed out
    Failure {
        /// Error description
        error: String,
        /// Time until failure
        latency_ms: u64,
    },
}

/// Result of applying a probe outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Health after the probe
    pub next: NodeHealth,
    /// Notification to emit, if connectivity changed
    pub event: Option<HealthEvent>,
}

/// Apply a probe outcome to the current health.
///
/// Pure: the caller stores `next` and publishes `event`.
pub fn apply_probe(
    node_id: &str,
    current: &NodeHealth,
    outcome: ProbeOutcome,
    unhealthy_threshold: u32,
    now: DateTime<Utc>,
) -> Transition {
    let mut next = current.clone();
    next.last_check = Some(now);

    match outcome {
        ProbeOutcome::Success { latency_ms } => {
            next.state = HealthState::Healthy;
            next.consecutive_failures = 0;
            next.last_success = Some(now);
            next.last_error = None;
            next.latency_ms = Some(latency_ms);

            let event = (current.state != HealthState::Healthy).then(|| {
                HealthEvent::ConnectivityRestored {
                    node_id: node_id.to_string(),
                }
            });
            Transition { next, event }
        }
        ProbeOutcome::Failure { error, latency_ms } => {
            next.consecutive_failures = current.consecutive_failures.saturating_add(1);
            next.latency_ms = Some(latency_ms);
            if next.consecutive_failures >= unhealthy_threshold {
                next.state = HealthState::Unhealthy;
            }

            let event = (current.state == HealthState::Healthy
                && next.state == HealthState::Unhealthy)
                .then(|| HealthEvent::ConnectivityLost {
                    node_id: node_id.to_string(),
                    error: error.clone(),
                });
            next.last_error = Some(error);
            Transition { next, event }
        }
    }
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

/// Configuration for health monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between probe rounds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Timeout for an individual probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Consecutive failures before a node is unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl HealthConfig {
    /// Probe interval
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Probe timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Set probe interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set probe timeout
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set failure threshold
    pub fn with_unhealthy_threshold(mut self, threshold: u32) -> Self {
        self.unhealthy_threshold = threshold;
        self
    }

    /// Validate
    pub fn validate(&self) -> crate::Result<()> {
        if self.interval_ms == 0 {
            return Err(crate::Error::config("health interval must be greater than zero"));
        }
        if self.probe_timeout_ms == 0 {
            return Err(crate::Error::config("probe timeout must be greater than zero"));
        }
        if self.unhealthy_threshold == 0 {
            return Err(crate::Error::config("unhealthy threshold must be at least 1"));
        }
        Ok(())
    }
}

/// Probes nodes and applies the state machine
pub(crate) struct HealthMonitor {
    config: HealthConfig,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub(crate) fn new(config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { config, events }
    }

    pub(crate) fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Run `SELECT 1` against the node, racing the probe timeout
    async fn run_probe(&self, node: &Node) -> ProbeOutcome {
        let start = Instant::now();
        let probe = async {
            let conn = node.pool.get().await?;
            conn.query(PROBE_SQL, &[]).await
        };
        let result = tokio::time::timeout(self.config.probe_timeout(), probe).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(_)) => ProbeOutcome::Success { latency_ms },
            Ok(Err(e)) => ProbeOutcome::Failure {
                error: e.to_string(),
                latency_ms,
            },
            Err(_) => ProbeOutcome::Failure {
                error: format!("probe timed out after {}ms", self.config.probe_timeout_ms),
                latency_ms,
            },
        }
    }

    /// Probe one node and record the transition
    pub(crate) async fn probe(&self, node: &Node) {
        let outcome = self.run_probe(node).await;
        if let ProbeOutcome::Failure { error, .. } = &outcome {
            debug!(node_id = %node.id, error = %error, "health probe failed");
        }

        let transition = {
            let mut health = node.health.write();
            let transition = apply_probe(
                &node.id,
                &health,
                outcome,
                self.config.unhealthy_threshold,
                Utc::now(),
            );
            *health = transition.next.clone();
            transition
        };

        if let Some(event) = transition.event {
            match &event {
                HealthEvent::ConnectivityRestored { node_id } => {
                    info!(node_id = %node_id, "node connectivity restored");
                }
                HealthEvent::ConnectivityLost { node_id, error } => {
                    warn!(node_id = %node_id, error = %error, "node connectivity lost");
                }
            }
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Probe all nodes concurrently, then reap idle connections
    pub(crate) async fn probe_all(&self, nodes: &[Arc<Node>]) {
        join_all(nodes.iter().map(|node| async move {
            self.probe(node).await;
            node.pool.reap_idle().await;
        }))
        .await;
    }
}
