//! # Poll Orchestrator
//!
//! Drives poll cycles on a timer and publishes their results.
//!
//! ## Cycle lifecycle
//!
//! 1. A cycle that starts while another is still running publishes
//!    `CycleSkip` and issues no queries.
//! 2. If the node pool is not running an `Error` event is published.
//! 3. Healthy nodes are snapshotted and queried concurrently.
//! 4. Once every node has settled the cycle checks that it is still the
//!    active one. A [`PollOrchestrator::stop`] in between discards the
//!    result silently.
//! 5. The result is published as `Data`, the four category events, then
//!    `CycleComplete`. If every node failed an `Error` event with the
//!    per-node causes is published first.
//!
//! The timer spawns each cycle as its own task, so a slow cycle causes
//! later ticks to be skipped rather than queued.

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use replmon_pool::NodePool;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{NodeError, PollError};
use crate::events::{EventBus, EventKind, ListenerId, MonitorEvent, SkipReason};
use crate::fanout::{NodeSnapshot, QueryFanout};
use crate::model::{duration_ms, ConflictEvent, ConflictSource, CycleResult};
use crate::queries::MAX_EVENTS_PER_NODE;

/// Shortest accepted poll interval
pub const MIN_INTERVAL_MS: u64 = 250;

/// Poll interval used when none is configured
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Poll timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Milliseconds between cycle starts, at least [`MIN_INTERVAL_MS`]
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    DEFAULT_INTERVAL_MS
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

impl PollConfig {
    /// Config with the given interval, clamped to the minimum
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: clamp_interval(interval_ms),
        }
    }

    /// Interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Raise intervals below [`MIN_INTERVAL_MS`] to the minimum
pub fn clamp_interval(interval_ms: u64) -> u64 {
    interval_ms.max(MIN_INTERVAL_MS)
}

struct TimerTask {
    shutdown_tx: broadcast::Sender<()>,
    rearm: Arc<Notify>,
    _handle: JoinHandle<()>,
}

struct Inner {
    pool: NodePool,
    fanout: QueryFanout,
    events: Arc<EventBus>,
    interval_ms: AtomicU64,
    running: AtomicBool,
    in_progress: AtomicBool,
    active_cycle: Mutex<Option<Uuid>>,
    last_result: RwLock<Option<Arc<CycleResult>>>,
    log_events: Mutex<HashMap<String, VecDeque<ConflictEvent>>>,
    timer: Mutex<Option<TimerTask>>,
}

/// Clears the in-progress flag however the cycle ends
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Timer-driven poll loop.
///
/// Cloning is cheap and yields a handle to the same orchestrator.
#[derive(Clone)]
pub struct PollOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PollOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollOrchestrator")
            .field("interval_ms", &self.inner.interval_ms.load(Ordering::Relaxed))
            .field("running", &self.is_running())
            .field("in_progress", &self.is_cycle_in_progress())
            .finish()
    }
}

impl PollOrchestrator {
    /// Create a stopped orchestrator
    pub fn new(
        pool: NodePool,
        fanout: QueryFanout,
        events: Arc<EventBus>,
        config: PollConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool,
                fanout,
                events,
                interval_ms: AtomicU64::new(clamp_interval(config.interval_ms)),
                running: AtomicBool::new(false),
                in_progress: AtomicBool::new(false),
                active_cycle: Mutex::new(None),
                last_result: RwLock::new(None),
                log_events: Mutex::new(HashMap::new()),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Start polling: one cycle right away, then one per interval.
    ///
    /// No-op when already running. Must be called within a tokio runtime.
    pub fn start(&self) {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("poll orchestrator already running");
            return;
        }

        let interval_ms = self.inner.interval_ms.load(Ordering::Acquire);
        info!(interval_ms, "poll orchestrator started");
        self.inner.events.emit(MonitorEvent::Started);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let rearm = Arc::new(Notify::new());
        let handle = tokio::spawn(run_timer(
            Arc::downgrade(&self.inner),
            rearm.clone(),
            shutdown_rx,
        ));
        *self.inner.timer.lock() = Some(TimerTask {
            shutdown_tx,
            rearm,
            _handle: handle,
        });
    }

    /// Stop polling. No-op when already stopped.
    ///
    /// A cycle still in flight runs to completion but its result is
    /// discarded.
    pub fn stop(&self) {
        {
            // Same lock a cycle holds while it checks `running` and claims
            // its id, so no cycle can slip in between
            let mut active = self.inner.active_cycle.lock();
            if self
                .inner
                .running
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            if let Some(cycle_id) = active.take() {
                debug!(%cycle_id, "invalidated in-flight cycle");
            }
        }
        if let Some(task) = self.inner.timer.lock().take() {
            let _ = task.shutdown_tx.send(());
        }

        info!("poll orchestrator stopped");
        self.inner.events.emit(MonitorEvent::Stopped);
    }

    /// Change the poll interval, clamped to [`MIN_INTERVAL_MS`].
    ///
    /// A running timer is rearmed; a cycle in progress is not interrupted.
    pub fn set_interval(&self, interval_ms: u64) {
        let clamped = clamp_interval(interval_ms);
        self.inner.interval_ms.store(clamped, Ordering::Release);
        if let Some(task) = self.inner.timer.lock().as_ref() {
            task.rearm.notify_one();
        }
        debug!(requested = interval_ms, interval_ms = clamped, "poll interval changed");
    }

    /// Current poll settings
    pub fn config(&self) -> PollConfig {
        PollConfig {
            interval_ms: self.inner.interval_ms.load(Ordering::Acquire),
        }
    }

    /// Whether polling is active
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Whether a cycle is executing right now
    pub fn is_cycle_in_progress(&self) -> bool {
        self.inner.in_progress.load(Ordering::Acquire)
    }

    /// Most recently published cycle result
    pub fn last_result(&self) -> Option<Arc<CycleResult>> {
        self.inner.last_result.read().clone()
    }

    /// Buffered log conflict events of a node, oldest first
    pub fn log_events(&self, node_id: &str) -> Vec<ConflictEvent> {
        self.inner
            .log_events
            .lock()
            .get(node_id)
            .map(|buf| buf.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Event bus the orchestrator publishes to
    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Register a listener, see [`EventBus::on`]
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    /// Register a one-shot listener, see [`EventBus::once`]
    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.inner.events.once(kind, listener)
    }

    /// Unregister a listener
    pub fn off(&self, id: ListenerId) -> bool {
        self.inner.events.off(id)
    }

    /// Run one cycle now and return its result if it was published.
    ///
    /// Returns `None` when the cycle was skipped, failed to start, or was
    /// invalidated by [`PollOrchestrator::stop`].
    pub async fn execute_poll(&self) -> Option<Arc<CycleResult>> {
        self.inner.execute_poll().await
    }
}

impl Inner {
    async fn execute_poll(&self) -> Option<Arc<CycleResult>> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("previous poll cycle still in progress, skipping");
            self.events.emit(MonitorEvent::CycleSkip {
                reason: SkipReason::CycleInProgress,
            });
            return None;
        }
        let _guard = InProgressGuard(&self.in_progress);

        if !self.running.load(Ordering::Acquire) {
            debug!("poll orchestrator not running, cycle not started");
            return None;
        }

        if !self.pool.is_running() {
            warn!("node pool is not running, cannot poll");
            self.events.emit(MonitorEvent::Error(PollError::PoolNotRunning));
            return None;
        }

        let Some(cycle_id) = self.begin_cycle() else {
            debug!("poll orchestrator stopped, cycle not started");
            return None;
        };
        let started_at = Utc::now();
        self.events.emit(MonitorEvent::CycleStart { cycle_id });

        let nodes = self.pool.get_healthy_nodes();
        debug!(%cycle_id, nodes = nodes.len(), "poll cycle started");

        let snapshots =
            join_all(nodes.iter().map(|node| self.fanout.query_node(node))).await;

        if !self.is_current(cycle_id) {
            debug!(%cycle_id, "discarding result of invalidated cycle");
            return None;
        }

        let node_errors = total_failure(&snapshots);
        let mut result = CycleResult::empty(cycle_id, started_at);
        for snapshot in snapshots {
            result.stats.push(snapshot.stats);
            result.slots.push(snapshot.slots);
            result.subscriptions.push(snapshot.subscriptions);
            result.conflicts.push(snapshot.conflicts);
        }
        self.merge_log_events(&mut result);
        result.completed_at = Utc::now();
        result.duration_ms = duration_ms(started_at, result.completed_at);

        let result = Arc::new(result);
        *self.last_result.write() = Some(result.clone());

        if let Some(node_errors) = node_errors {
            warn!(%cycle_id, nodes = node_errors.len(), "every node failed in poll cycle");
            self.events
                .emit(MonitorEvent::Error(PollError::AllNodesFailed { node_errors }));
        }

        self.events.emit(MonitorEvent::Data(result.clone()));
        self.events.emit(MonitorEvent::Stats(result.clone()));
        self.events.emit(MonitorEvent::Slots(result.clone()));
        self.events.emit(MonitorEvent::Subscriptions(result.clone()));
        self.events.emit(MonitorEvent::Conflicts(result.clone()));
        self.events.emit(MonitorEvent::CycleComplete {
            cycle_id,
            duration_ms: result.duration_ms,
        });

        debug!(
            %cycle_id,
            nodes = result.node_count(),
            duration_ms = result.duration_ms,
            "poll cycle complete"
        );
        Some(result)
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    /// Claim the active cycle slot, unless stopped
    fn begin_cycle(&self) -> Option<Uuid> {
        let mut active = self.active_cycle.lock();
        if !self.running.load(Ordering::Acquire) {
            return None;
        }
        let cycle_id = Uuid::new_v4();
        *active = Some(cycle_id);
        Some(cycle_id)
    }

    fn is_current(&self, cycle_id: Uuid) -> bool {
        let active = self.active_cycle.lock();
        self.running.load(Ordering::Acquire) && *active == Some(cycle_id)
    }

    /// Log sources only return events newer than the last read, so they are
    /// accumulated per node. A read that failed returned nothing and leaves
    /// the buffer as it was.
    fn merge_log_events(&self, result: &mut CycleResult) {
        let mut buffers = self.log_events.lock();
        for conflicts in &mut result.conflicts {
            let Ok(report) = &mut conflicts.outcome else {
                continue;
            };
            if report.source != ConflictSource::Log {
                continue;
            }
            let buffer = buffers.entry(conflicts.node_id.clone()).or_default();
            append_bounded(buffer, std::mem::take(&mut report.events));
            report.events = buffer.iter().cloned().collect();
        }
    }
}

fn append_bounded(buffer: &mut VecDeque<ConflictEvent>, events: Vec<ConflictEvent>) {
    buffer.extend(events);
    while buffer.len() > MAX_EVENTS_PER_NODE {
        buffer.pop_front();
    }
}

/// Per-node causes when every polled node failed, `None` otherwise
fn total_failure(snapshots: &[NodeSnapshot]) -> Option<Vec<NodeError>> {
    if snapshots.is_empty() || !snapshots.iter().all(NodeSnapshot::all_failed) {
        return None;
    }
    Some(
        snapshots
            .iter()
            .map(|s| NodeError {
                node_id: s.stats.node_id.clone(),
                error: s.first_error().unwrap_or("unknown error").to_string(),
            })
            .collect(),
    )
}

fn ticker(start: Instant, period: Duration) -> Interval {
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_timer(
    inner: Weak<Inner>,
    rearm: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let Some(period) = inner.upgrade().map(|i| i.interval()) else {
        return;
    };
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = rearm.notified() => {
                let Some(inner) = inner.upgrade() else { break };
                let period = inner.interval();
                timer = ticker(Instant::now() + period, period);
                debug!(interval_ms = period.as_millis() as u64, "poll timer rearmed");
            }
            _ = timer.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                spawn_cycle(inner);
            }
        }
    }
    debug!("poll timer stopped");
}

fn spawn_cycle(inner: Arc<Inner>) {
    tokio::spawn(async move {
        let cycle = AssertUnwindSafe(inner.execute_poll()).catch_unwind().await;
        if cycle.is_err() {
            error!("poll cycle panicked");
            inner.events.emit(MonitorEvent::Error(PollError::Internal {
                message: "poll cycle panicked".to_string(),
            }));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConflictType, Resolution};

    fn event(n: usize) -> ConflictEvent {
        ConflictEvent::from_log(
            "n1",
            Utc::now(),
            ConflictType::InsertInsert,
            Resolution::ApplyRemote,
            "public",
            format!("t{n}"),
            None,
        )
    }

    #[test]
    fn test_interval_clamp() {
        assert_eq!(clamp_interval(100), MIN_INTERVAL_MS);
        assert_eq!(clamp_interval(0), MIN_INTERVAL_MS);
        assert_eq!(clamp_interval(5000), 5000);
        assert_eq!(PollConfig::new(10).interval_ms, 250);
        assert_eq!(PollConfig::default().interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_poll_config_serde_default() {
        let config: PollConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.interval_ms, DEFAULT_INTERVAL_MS);
    }

    #[test]
    fn test_append_bounded_keeps_newest() {
        let mut buffer = VecDeque::new();
        append_bounded(&mut buffer, (0..MAX_EVENTS_PER_NODE).map(event).collect());
        append_bounded(&mut buffer, (0..10).map(|n| event(1000 + n)).collect());

        assert_eq!(buffer.len(), MAX_EVENTS_PER_NODE);
        assert_eq!(buffer.front().unwrap().table_name, "t10");
        assert_eq!(buffer.back().unwrap().table_name, "t1009");
    }

    #[test]
    fn test_in_progress_guard_clears_on_panic() {
        let flag = AtomicBool::new(true);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = InProgressGuard(&flag);
            panic!("cycle bug");
        }));
        assert!(outcome.is_err());
        assert!(!flag.load(Ordering::SeqCst));
    }
}
