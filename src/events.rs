//! Prioritized, batched fan-out of task events to subscribers (spec §4.8).
//! Replaces the source's Qt-signal event system (`event_system.py`) with an
//! explicit bus: priority queues, a 16ms coalescing window for idempotent
//! event kinds, and bounded per-subscriber queues that drop the oldest
//! non-critical entry on overflow rather than blocking a slow subscriber.

use crate::error::ErrorKind;
use crate::model::{Progress, TaskStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};

pub const COALESCE_WINDOW: Duration = Duration::from_millis(16);
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl EventPriority {
    /// Target delivery latency, informational (spec §4.8); the bus
    /// delivers as soon as an event clears coalescing, it does not sleep
    /// to hit these numbers exactly.
    pub fn target_latency(self) -> Duration {
        match self {
            EventPriority::Critical => Duration::ZERO,
            EventPriority::High => Duration::from_millis(10),
            EventPriority::Normal => Duration::from_millis(50),
            EventPriority::Low => Duration::from_millis(200),
            EventPriority::Background => Duration::from_secs(1),
        }
    }

    fn is_droppable(self) -> bool {
        matches!(self, EventPriority::Normal | EventPriority::Low | EventPriority::Background)
    }
}

#[derive(Debug, Clone)]
pub enum TaskEventKind {
    Created,
    StatusChanged { from: TaskStatus, to: TaskStatus },
    Progress(Progress),
    Completed,
    Failed { index: usize, kind: ErrorKind, reason: String },
}

impl TaskEventKind {
    fn type_name(&self) -> &'static str {
        match self {
            TaskEventKind::Created => "task.created",
            TaskEventKind::StatusChanged { .. } => "task.status_changed",
            TaskEventKind::Progress(_) => "task.progress",
            TaskEventKind::Completed => "task.completed",
            TaskEventKind::Failed { .. } => "task.failed",
        }
    }

    /// Idempotent event kinds may be coalesced; the last one in a window
    /// wins (spec §4.8).
    fn is_idempotent(&self) -> bool {
        matches!(self, TaskEventKind::Progress(_) | TaskEventKind::StatusChanged { .. })
    }

    fn default_priority(&self) -> EventPriority {
        match self {
            TaskEventKind::Created => EventPriority::Normal,
            TaskEventKind::StatusChanged { .. } => EventPriority::High,
            TaskEventKind::Progress(_) => EventPriority::Low,
            TaskEventKind::Completed => EventPriority::Critical,
            TaskEventKind::Failed { .. } => EventPriority::Critical,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub source_id: String,
    pub kind: TaskEventKind,
    pub priority: EventPriority,
    pub emitted_at: Instant,
}

/// A bounded FIFO queue that drops the oldest droppable (non-Critical/High)
/// entry when full, rather than refusing new Critical/High events.
struct SubscriberQueue {
    items: Mutex<VecDeque<TaskEvent>>,
    capacity: usize,
    notify: Notify,
    dropped: std::sync::atomic::AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        SubscriberQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
            dropped: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn push(&self, event: TaskEvent) {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            if let Some(pos) = items.iter().position(|e| e.priority.is_droppable()) {
                items.remove(pos);
                self.dropped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            } else {
                // Queue is saturated with Critical/High events only; per
                // spec those must never be dropped, so grow past capacity
                // rather than lose one.
            }
        }
        items.push_back(event);
        drop(items);
        self.notify.notify_one();
    }

    fn drain_ready(&self) -> Vec<TaskEvent> {
        let mut items = self.items.lock().unwrap();
        items.drain(..).collect()
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(std::sync::atomic::Ordering::Relaxed)
    }
}

pub struct Subscription {
    queue: std::sync::Arc<SubscriberQueue>,
}

impl Subscription {
    /// Receive the next event, waiting if none is queued. Events for a
    /// fixed `source_id` always arrive in emission order (spec §8 property
    /// 7) because a single dispatcher thread pushes into this queue.
    pub async fn recv(&self) -> Option<TaskEvent> {
        loop {
            {
                let mut items = self.queue.items.lock().unwrap();
                if let Some(event) = items.pop_front() {
                    return Some(event);
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Drain everything currently queued without waiting.
    pub fn try_drain(&self) -> Vec<TaskEvent> {
        self.queue.drain_ready()
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped_count()
    }
}

enum BusCommand {
    Publish(TaskEvent),
    Subscribe(std::sync::Arc<SubscriberQueue>),
}

/// Handle used to publish events; cheap to clone, fed to a single internal
/// dispatcher task that owns subscriber fan-out and coalescing.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<BusCommand>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatcher_loop(rx));
        EventBus { tx }
    }

    pub fn subscribe(&self) -> Subscription {
        let queue = std::sync::Arc::new(SubscriberQueue::new(DEFAULT_SUBSCRIBER_CAPACITY));
        let _ = self.tx.send(BusCommand::Subscribe(queue.clone()));
        Subscription { queue }
    }

    pub fn publish(&self, source_id: impl Into<String>, kind: TaskEventKind) {
        let priority = kind.default_priority();
        let event = TaskEvent {
            source_id: source_id.into(),
            kind,
            priority,
            emitted_at: Instant::now(),
        };
        let _ = self.tx.send(BusCommand::Publish(event));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatcher_loop(mut rx: mpsc::UnboundedReceiver<BusCommand>) {
    let mut subscribers: Vec<std::sync::Arc<SubscriberQueue>> = Vec::new();
    let mut pending: HashMap<(String, String), (TaskEvent, Instant)> = HashMap::new();
    let mut ticker = tokio::time::interval(COALESCE_WINDOW);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    None => break,
                    Some(BusCommand::Subscribe(queue)) => subscribers.push(queue),
                    Some(BusCommand::Publish(event)) => {
                        if event.priority == EventPriority::Critical || !event.kind.is_idempotent() {
                            // A buffered same-source event was emitted earlier;
                            // flush it first so this subscriber never observes
                            // the later event jumping the queue (spec §4.8,
                            // §8 property 7: per source_id, FIFO).
                            flush_pending_for_source(&mut pending, &subscribers, &event.source_id);
                            fan_out(&subscribers, event);
                        } else {
                            let key = (event.kind.type_name().to_string(), event.source_id.clone());
                            pending.insert(key, (event, Instant::now()));
                        }
                    }
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let mut ready: Vec<_> = pending
                    .iter()
                    .filter(|(_, (_, since))| now.duration_since(*since) >= COALESCE_WINDOW)
                    .map(|(k, (_, since))| (k.clone(), *since))
                    .collect();
                // Oldest-buffered-first so two different idempotent event
                // types for the same source_id still flush in emission order.
                ready.sort_by_key(|(_, since)| *since);
                for (key, _) in ready {
                    if let Some((event, _)) = pending.remove(&key) {
                        fan_out(&subscribers, event);
                    }
                }
            }
        }
    }
}

fn fan_out(subscribers: &[std::sync::Arc<SubscriberQueue>], event: TaskEvent) {
    for sub in subscribers {
        sub.push(event.clone());
    }
}

/// Drain every still-buffered coalesced event for `source_id`, oldest first,
/// and fan each out immediately. Called before an immediately-delivered
/// event for the same source so emission order is preserved across the
/// coalescing buffer.
fn flush_pending_for_source(
    pending: &mut HashMap<(String, String), (TaskEvent, Instant)>,
    subscribers: &[std::sync::Arc<SubscriberQueue>],
    source_id: &str,
) {
    let mut keys: Vec<_> = pending
        .keys()
        .filter(|(_, sid)| sid == source_id)
        .cloned()
        .collect();
    keys.sort_by_key(|key| pending.get(key).map(|(_, since)| *since));
    for key in keys {
        if let Some((event, _)) = pending.remove(&key) {
            fan_out(subscribers, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_for_its_source_in_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        tokio::time::sleep(Duration::from_millis(5)).await; // let Subscribe land

        bus.publish("task-1", TaskEventKind::Created);
        bus.publish(
            "task-1",
            TaskEventKind::StatusChanged {
                from: TaskStatus::Created,
                to: TaskStatus::Queued,
            },
        );
        bus.publish("task-1", TaskEventKind::Completed);

        let first = sub.recv().await.unwrap();
        assert!(matches!(first.kind, TaskEventKind::Created));
        let second = sub.recv().await.unwrap();
        assert!(matches!(second.kind, TaskEventKind::StatusChanged { .. }));
        let third = sub.recv().await.unwrap();
        assert!(matches!(third.kind, TaskEventKind::Completed));
    }

    #[tokio::test]
    async fn critical_events_are_never_coalesced() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        tokio::time::sleep(Duration::from_millis(5)).await;

        for _ in 0..5 {
            bus.publish("t", TaskEventKind::Failed { index: 0, kind: ErrorKind::Disk, reason: "x".into() });
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        let drained = sub.try_drain();
        assert_eq!(drained.len(), 5);
    }

    #[tokio::test]
    async fn progress_events_in_the_same_window_coalesce_to_the_last() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        tokio::time::sleep(Duration::from_millis(5)).await;

        for i in 0..5 {
            bus.publish(
                "t",
                TaskEventKind::Progress(Progress {
                    completed_segments: i,
                    total_segments: 5,
                    downloaded_bytes: i as u64 * 10,
                    total_bytes_estimate: None,
                    speed_bps_ewma: 0.0,
                    eta_seconds: None,
                }),
            );
        }
        tokio::time::sleep(COALESCE_WINDOW * 3).await;
        let drained = sub.try_drain();
        assert_eq!(drained.len(), 1);
        if let TaskEventKind::Progress(p) = &drained[0].kind {
            assert_eq!(p.completed_segments, 4);
        } else {
            panic!("expected progress event");
        }
    }

    #[test]
    fn queue_drops_oldest_droppable_entry_when_full() {
        let queue = SubscriberQueue::new(2);
        let make = |priority| TaskEvent {
            source_id: "t".into(),
            kind: TaskEventKind::Created,
            priority,
            emitted_at: Instant::now(),
        };
        queue.push(make(EventPriority::Normal));
        queue.push(make(EventPriority::Low));
        queue.push(make(EventPriority::Normal));
        assert_eq!(queue.dropped_count(), 1);
        let remaining = queue.drain_ready();
        assert_eq!(remaining.len(), 2);
    }

    #[test]
    fn queue_never_drops_critical_or_high() {
        let queue = SubscriberQueue::new(1);
        let make = |priority| TaskEvent {
            source_id: "t".into(),
            kind: TaskEventKind::Created,
            priority,
            emitted_at: Instant::now(),
        };
        queue.push(make(EventPriority::Critical));
        queue.push(make(EventPriority::High));
        assert_eq!(queue.dropped_count(), 0);
        assert_eq!(queue.drain_ready().len(), 2);
    }
}
