//! # Monitor Events
//!
//! Typed publish/subscribe for poll cycle output.
//!
//! Two ways to consume events:
//!
//! - **Listeners**: callbacks registered per [`EventKind`] with
//!   [`EventBus::on`] or [`EventBus::once`], invoked synchronously in
//!   registration order on the publishing task.
//! - **Broadcast**: [`EventBus::subscribe`] returns a tokio broadcast
//!   receiver carrying every event. Slow receivers lag and drop events
//!   rather than blocking the poll loop.
//!
//! ```rust,ignore
//! let id = bus.on(EventKind::Stats, |event| {
//!     if let MonitorEvent::Stats(cycle) = event {
//!         println!("{} nodes", cycle.node_count());
//!     }
//! });
//! bus.off(id);
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::PollError;
use crate::model::CycleResult;

/// Kinds of events published by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Full cycle result
    Data,
    /// Replication stats of a cycle
    Stats,
    /// Slots of a cycle
    Slots,
    /// Subscriptions of a cycle
    Subscriptions,
    /// Conflicts of a cycle
    Conflicts,
    /// Polling started
    Started,
    /// Polling stopped
    Stopped,
    /// A cycle began
    CycleStart,
    /// A cycle published its result
    CycleComplete,
    /// A cycle was skipped
    CycleSkip,
    /// A cycle failed
    Error,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Data => "data",
            Self::Stats => "stats",
            Self::Slots => "slots",
            Self::Subscriptions => "subscriptions",
            Self::Conflicts => "conflicts",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::CycleStart => "cycle:start",
            Self::CycleComplete => "cycle:complete",
            Self::CycleSkip => "cycle:skip",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Why a cycle did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The previous cycle is still running
    CycleInProgress,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CycleInProgress => f.write_str("previous cycle still in progress"),
        }
    }
}

/// An event published by the monitor.
///
/// Category events share the cycle result of the `Data` event that
/// precedes them.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Full cycle result
    Data(Arc<CycleResult>),
    /// Replication stats (read `stats`)
    Stats(Arc<CycleResult>),
    /// Slots (read `slots`)
    Slots(Arc<CycleResult>),
    /// Subscriptions (read `subscriptions`)
    Subscriptions(Arc<CycleResult>),
    /// Conflicts (read `conflicts`)
    Conflicts(Arc<CycleResult>),
    /// Polling started
    Started,
    /// Polling stopped
    Stopped,
    /// A cycle began
    CycleStart {
        /// Cycle id
        cycle_id: Uuid,
    },
    /// A cycle published its result
    CycleComplete {
        /// Cycle id
        cycle_id: Uuid,
        /// Wall time of the cycle
        duration_ms: u64,
    },
    /// A cycle was skipped
    CycleSkip {
        /// Why
        reason: SkipReason,
    },
    /// A cycle failed
    Error(PollError),
}

impl MonitorEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Stats(_) => EventKind::Stats,
            Self::Slots(_) => EventKind::Slots,
            Self::Subscriptions(_) => EventKind::Subscriptions,
            Self::Conflicts(_) => EventKind::Conflicts,
            Self::Started => EventKind::Started,
            Self::Stopped => EventKind::Stopped,
            Self::CycleStart { .. } => EventKind::CycleStart,
            Self::CycleComplete { .. } => EventKind::CycleComplete,
            Self::CycleSkip { .. } => EventKind::CycleSkip,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// Cycle result carried by data and category events
    pub fn cycle(&self) -> Option<&Arc<CycleResult>> {
        match self {
            Self::Data(c)
            | Self::Stats(c)
            | Self::Slots(c)
            | Self::Subscriptions(c)
            | Self::Conflicts(c) => Some(c),
            _ => None,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

struct Registration {
    id: ListenerId,
    kind: EventKind,
    once: bool,
    listener: Listener,
}

/// Listener registry plus broadcast channel
pub struct EventBus {
    listeners: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<MonitorEvent>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.lock().len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default broadcast capacity
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a bus with a custom broadcast capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Call `listener` for every event of `kind`
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.register(kind, false, Arc::new(listener))
    }

    /// Call `listener` for the next event of `kind` only
    pub fn once<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&MonitorEvent) + Send + Sync + 'static,
    {
        self.register(kind, true, Arc::new(listener))
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Number of listeners registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.lock().iter().filter(|r| r.kind == kind).count()
    }

    /// Receive every event through a broadcast channel
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    /// Number of broadcast subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event to listeners, then to broadcast subscribers.
    ///
    /// Listeners run outside the registry lock, so they may register or
    /// unregister listeners themselves. A panicking listener is logged and
    /// does not affect the others.
    pub fn emit(&self, event: MonitorEvent) {
        let kind = event.kind();
        let targets: Vec<Listener> = {
            let mut listeners = self.listeners.lock();
            let targets = listeners
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| r.listener.clone())
                .collect();
            listeners.retain(|r| !(r.once && r.kind == kind));
            targets
        };

        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!(event = %kind, "event listener panicked");
            }
        }

        if self.sender.send(event).is_err() {
            debug!(event = %kind, "no broadcast subscribers");
        }
    }

    fn register(&self, kind: EventKind, once: bool, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push(Registration {
            id,
            kind,
            once,
            listener,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(bus: &EventBus, kind: EventKind, once: bool) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let f = move |_: &MonitorEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        };
        if once {
            bus.once(kind, f);
        } else {
            bus.on(kind, f);
        }
        count
    }

    #[test]
    fn test_on_receives_matching_kind_only() {
        let bus = EventBus::new();
        let started = counter(&bus, EventKind::Started, false);

        bus.emit(MonitorEvent::Started);
        bus.emit(MonitorEvent::Stopped);
        bus.emit(MonitorEvent::Started);

        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_once_fires_a_single_time() {
        let bus = EventBus::new();
        let count = counter(&bus, EventKind::Stopped, true);
        assert_eq!(bus.listener_count(EventKind::Stopped), 1);

        bus.emit(MonitorEvent::Stopped);
        bus.emit(MonitorEvent::Stopped);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::Stopped), 0);
    }

    #[test]
    fn test_off_unregisters() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.on(EventKind::CycleSkip, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let skip = MonitorEvent::CycleSkip {
            reason: SkipReason::CycleInProgress,
        };
        bus.emit(skip.clone());
        assert!(bus.off(id));
        assert!(!bus.off(id));
        bus.emit(skip);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            bus.on(EventKind::Started, move |_| order.lock().push(i));
        }
        bus.emit(MonitorEvent::Started);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let bus = EventBus::new();
        bus.on(EventKind::Started, |_| panic!("listener bug"));
        let count = counter(&bus, EventKind::Started, false);

        bus.emit(MonitorEvent::Started);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_subscriber_sees_all_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(MonitorEvent::Started);
        bus.emit(MonitorEvent::Error(PollError::PoolNotRunning));

        assert_eq!(rx.recv().await.unwrap().kind(), EventKind::Started);
        match rx.recv().await.unwrap() {
            MonitorEvent::Error(PollError::PoolNotRunning) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EventKind::CycleSkip.to_string(), "cycle:skip");
        assert_eq!(EventKind::Data.to_string(), "data");
        assert_eq!(
            serde_json::to_string(&EventKind::CycleComplete).unwrap(),
            "\"cycle_complete\""
        );
    }
}
