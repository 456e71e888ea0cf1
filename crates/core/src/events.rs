//! Execution events and their per-run delivery.
//!
//! Every run owns an [`EventEmitter`]. Emitting never blocks the engine:
//! each subscriber has a bounded queue, and when a queue is full the oldest
//! buffered `Progress` event is discarded to make room. Node and run
//! lifecycle events are never discarded.

use crate::error::NodeError;
use crate::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;

/// An event in a run's execution stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub run_id: RunId,
    /// Monotonically increasing within a run, starting at 0
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

/// Types of events that can occur during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Progress {
        completed: usize,
        total: usize,
        percent: u8,
        message: String,
    },
    NodeStarted {
        node_id: NodeId,
        node_type: String,
    },
    NodeFinished {
        node_id: NodeId,
        status: NodeStatus,
        attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<NodeError>,
    },
    RunFinished {
        status: RunStatus,
        tally: NodeTally,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl EventKind {
    pub fn progress(completed: usize, total: usize, message: impl Into<String>) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (completed * 100 / total) as u8
        };
        Self::Progress {
            completed,
            total,
            percent,
            message: message.into(),
        }
    }

    /// Progress events may be dropped under backpressure; nothing else may.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Self::Progress { .. })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fans a run's events out to its subscribers in sequence order
pub struct EventEmitter {
    run_id: RunId,
    capacity: usize,
    inner: Mutex<EmitterInner>,
}

struct EmitterInner {
    next_sequence: u64,
    closed: bool,
    subscribers: Vec<Weak<Subscription>>,
}

impl EventEmitter {
    pub fn new(run_id: RunId, capacity: usize) -> Self {
        Self {
            run_id,
            capacity: capacity.max(1),
            inner: Mutex::new(EmitterInner {
                next_sequence: 0,
                closed: false,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Attach a subscriber. It receives every event emitted from now on.
    ///
    /// Subscribing to a closed emitter yields an already-closed stream.
    pub fn subscribe(&self) -> EventSubscriber {
        let subscription = Arc::new(Subscription {
            capacity: self.capacity,
            queue: Mutex::new(SubscriptionQueue::default()),
            notify: Notify::new(),
        });

        let mut inner = lock(&self.inner);
        if inner.closed {
            lock(&subscription.queue).closed = true;
        } else {
            inner.subscribers.push(Arc::downgrade(&subscription));
        }

        EventSubscriber { subscription }
    }

    /// Assign the next sequence number and deliver the event.
    ///
    /// A `RunFinished` event closes the stream. Emitting after that is a no-op.
    pub fn emit(&self, kind: EventKind) -> Option<u64> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            tracing::warn!("Dropping event emitted after run {} finished", self.run_id);
            return None;
        }

        let closes = matches!(kind, EventKind::RunFinished { .. });
        let event = ExecutionEvent {
            run_id: self.run_id,
            sequence: inner.next_sequence,
            timestamp: Utc::now(),
            kind,
        };
        inner.next_sequence += 1;

        tracing::debug!(
            "Emitting event #{} for run {}: {:?}",
            event.sequence,
            self.run_id,
            event.kind
        );

        inner.subscribers.retain(|weak| match weak.upgrade() {
            Some(subscription) => {
                subscription.push(event.clone(), closes);
                true
            }
            None => false,
        });

        if closes {
            inner.closed = true;
            inner.subscribers.clear();
        }

        Some(event.sequence)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).closed
    }

    pub fn subscriber_count(&self) -> usize {
        let inner = lock(&self.inner);
        inner
            .subscribers
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

struct Subscription {
    capacity: usize,
    queue: Mutex<SubscriptionQueue>,
    notify: Notify,
}

#[derive(Default)]
struct SubscriptionQueue {
    events: VecDeque<ExecutionEvent>,
    closed: bool,
    dropped: u64,
}

impl Subscription {
    fn push(&self, event: ExecutionEvent, close: bool) {
        {
            let mut queue = lock(&self.queue);
            if queue.events.len() >= self.capacity {
                let oldest_progress = queue.events.iter().position(|e| e.kind.is_droppable());
                match oldest_progress {
                    Some(index) => {
                        queue.events.remove(index);
                        queue.dropped += 1;
                        queue.events.push_back(event);
                    }
                    // Queue holds only lifecycle events: shed the new one if we can,
                    // otherwise grow past capacity.
                    None if event.kind.is_droppable() => queue.dropped += 1,
                    None => queue.events.push_back(event),
                }
            } else {
                queue.events.push_back(event);
            }
            if close {
                queue.closed = true;
            }
        }
        self.notify.notify_one();
    }
}

/// Receiving half of a run's event stream
pub struct EventSubscriber {
    subscription: Arc<Subscription>,
}

impl EventSubscriber {
    /// Wait for the next event. Returns `None` once the run has finished and
    /// every buffered event has been consumed.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        loop {
            {
                let mut queue = lock(&self.subscription.queue);
                if let Some(event) = queue.events.pop_front() {
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }
            self.subscription.notify.notified().await;
        }
    }

    /// Take the next buffered event without waiting
    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        lock(&self.subscription.queue).events.pop_front()
    }

    /// Number of progress events discarded because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        lock(&self.subscription.queue).dropped
    }

    pub fn is_closed(&self) -> bool {
        let queue = lock(&self.subscription.queue);
        queue.closed && queue.events.is_empty()
    }

    /// Drain the stream until the run finishes
    pub async fn collect(mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> EventKind {
        EventKind::NodeStarted {
            node_id: NodeId::new(id),
            node_type: "echo".to_string(),
        }
    }

    fn finished_run() -> EventKind {
        EventKind::RunFinished {
            status: RunStatus::Succeeded,
            tally: NodeTally::default(),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_sequence() {
        let emitter = EventEmitter::new(RunId::new(), 16);
        let subscriber = emitter.subscribe();

        emitter.emit(EventKind::progress(0, 2, "start"));
        emitter.emit(started("a"));
        emitter.emit(finished_run());

        let events = subscriber.collect().await;
        assert_eq!(events.len(), 3);
        let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        assert!(matches!(events[2].kind, EventKind::RunFinished { .. }));
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_only_progress() {
        let emitter = EventEmitter::new(RunId::new(), 3);
        let mut subscriber = emitter.subscribe();

        emitter.emit(EventKind::progress(0, 4, "p0"));
        emitter.emit(started("a"));
        emitter.emit(EventKind::progress(1, 4, "p1"));
        emitter.emit(started("b"));
        emitter.emit(started("c"));
        emitter.emit(finished_run());

        let mut kinds = Vec::new();
        while let Some(event) = subscriber.recv().await {
            kinds.push(event.kind);
        }

        assert_eq!(subscriber.dropped(), 2);
        assert_eq!(kinds.len(), 4);
        assert!(kinds.iter().all(|k| !k.is_droppable()));
        assert!(matches!(kinds.last(), Some(EventKind::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_incoming_progress_shed_when_queue_holds_lifecycle_only() {
        let emitter = EventEmitter::new(RunId::new(), 1);
        let mut subscriber = emitter.subscribe();

        emitter.emit(started("a"));
        emitter.emit(EventKind::progress(1, 1, "done"));

        assert_eq!(subscriber.dropped(), 1);
        let event = subscriber.try_recv().unwrap();
        assert!(matches!(event.kind, EventKind::NodeStarted { .. }));
        assert!(subscriber.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_subscribe_after_close_is_empty() {
        let emitter = EventEmitter::new(RunId::new(), 4);
        emitter.emit(finished_run());
        assert!(emitter.is_closed());
        assert_eq!(emitter.emit(started("late")), None);

        let mut subscriber = emitter.subscribe();
        assert!(subscriber.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let emitter = EventEmitter::new(RunId::new(), 4);
        let kept = emitter.subscribe();
        drop(emitter.subscribe());

        emitter.emit(started("a"));
        assert_eq!(emitter.subscriber_count(), 1);
        drop(kept);
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn test_progress_percent() {
        match EventKind::progress(1, 3, "x") {
            EventKind::Progress { percent, .. } => assert_eq!(percent, 33),
            other => panic!("unexpected {:?}", other),
        }
        match EventKind::progress(0, 0, "empty") {
            EventKind::Progress { percent, .. } => assert_eq!(percent, 100),
            other => panic!("unexpected {:?}", other),
        }
    }
}
