// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-process event fan-out.
//!
//! Publishing never blocks: each subscriber has its own bounded queue, and
//! when a slow subscriber falls behind, the oldest queued events are dropped
//! and replaced by a single synthesized `BusOverflow` event carrying the
//! drop count.  Events for one `task_id` are delivered to every subscriber
//! in publication order; cross-task ordering is not guaranteed to mean
//! anything.  Nothing is persisted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::task::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TaskCreated,
    TaskStatusChanged,
    TaskCancelled,
    IterationStart,
    IterationWarning,
    AgentOutput,
    ToolCalled,
    DelegationStart,
    StreamingStart,
    StreamingToken,
    StreamingEnd,
    ParallelBatchStart,
    ParallelBatchEnd,
    PlanProposed,
    PatternLearned,
    MetricsUpdated,
    ModelLoaded,
    ModelUnloaded,
    ModelDegraded,
    Error,
    BusOverflow,
    ToolParseFailed,
    Heartbeat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub task_id: Option<TaskId>,
    /// Monotonic publication counter within this process.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

const SUBSCRIBER_QUEUE_CAP: usize = 1024;

struct SubQueue {
    buf: Mutex<VecDeque<Event>>,
    dropped: AtomicU64,
    notify: Notify,
    capacity: usize,
}

/// Receiving end of one subscription.
pub struct EventSubscriber {
    queue: Arc<SubQueue>,
}

impl EventSubscriber {
    /// Next event, waiting if none is queued.  A period of overload shows
    /// up as a `BusOverflow` event before the next real event.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(ev) = self.try_recv() {
                return ev;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking variant of [`Self::recv`].
    pub fn try_recv(&self) -> Option<Event> {
        let dropped = self.queue.dropped.swap(0, Ordering::AcqRel);
        if dropped > 0 {
            return Some(Event {
                kind: EventKind::BusOverflow,
                task_id: None,
                seq: 0,
                timestamp: Utc::now(),
                payload: serde_json::json!({ "dropped": dropped }),
            });
        }
        self.queue.buf.lock().unwrap_or_else(|e| e.into_inner()).pop_front()
    }

    /// Drain everything currently queued (tests, shutdown).
    pub fn drain(&self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Some(ev) = self.try_recv() {
            out.push(ev);
        }
        out
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BusMetrics {
    pub published: u64,
    pub dropped: u64,
}

pub struct EventBus {
    subscribers: Mutex<Vec<Arc<SubQueue>>>,
    seq: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    default_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_QUEUE_CAP)
    }

    pub fn with_capacity(default_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            default_capacity: default_capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        let queue = Arc::new(SubQueue {
            buf: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            notify: Notify::new(),
            capacity: self.default_capacity,
        });
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(queue.clone());
        EventSubscriber { queue }
    }

    /// Publish to every subscriber.  Synchronous and non-blocking by
    /// construction; a full subscriber queue loses its oldest event.
    pub fn publish(&self, kind: EventKind, task_id: Option<TaskId>, payload: serde_json::Value) {
        let event = Event {
            kind,
            task_id,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            payload,
        };
        self.published.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        for sub in subscribers.iter() {
            let mut buf = sub.buf.lock().unwrap_or_else(|e| e.into_inner());
            if buf.len() >= sub.capacity {
                buf.pop_front();
                sub.dropped.fetch_add(1, Ordering::AcqRel);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(event.clone());
            drop(buf);
            sub.notify.notify_one();
        }
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(EventKind::Heartbeat, None, json!({}));
        assert_eq!(a.drain().len(), 1);
        assert_eq!(b.drain().len(), 1);
    }

    #[test]
    fn per_task_order_is_publication_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(EventKind::IterationStart, Some("t1".into()), json!({ "i": i }));
        }
        let events = sub.drain();
        let iters: Vec<i64> = events
            .iter()
            .filter(|e| e.task_id.as_deref() == Some("t1"))
            .map(|e| e.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(iters, vec![0, 1, 2, 3, 4]);
        // seq is strictly increasing.
        assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn overflow_drops_oldest_and_reports() {
        let bus = EventBus::with_capacity(3);
        let sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(EventKind::StreamingToken, None, json!({ "i": i }));
        }
        let events = sub.drain();
        // First event out is the overflow notice for the 2 dropped events.
        assert_eq!(events[0].kind, EventKind::BusOverflow);
        assert_eq!(events[0].payload["dropped"], 2);
        // The survivors are the newest 3, still in order.
        let kept: Vec<i64> = events[1..]
            .iter()
            .map(|e| e.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(kept, vec![2, 3, 4]);
        assert_eq!(bus.metrics().dropped, 2);
    }

    #[test]
    fn late_subscriber_sees_only_new_events() {
        let bus = EventBus::new();
        bus.publish(EventKind::Heartbeat, None, json!({}));
        let sub = bus.subscribe();
        assert!(sub.try_recv().is_none());
        bus.publish(EventKind::Heartbeat, None, json!({}));
        assert_eq!(sub.drain().len(), 1);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe();
        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            publisher.publish(EventKind::Heartbeat, None, json!({}));
        });
        let ev = sub.recv().await;
        assert_eq!(ev.kind, EventKind::Heartbeat);
    }
}
