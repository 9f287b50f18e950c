//! EventBus - single-process pub/sub with bounded fan-out
//!
//! Contract:
//! - `publish` is non-blocking and returns promptly even under load
//! - each subscription has a bounded queue (default 1024); when full the
//!   oldest event for that subscription is dropped and a `dropped` counter
//!   incremented - the publisher is never blocked
//! - FIFO per subscriber; across subscribers only publication order holds
//! - handlers are async and awaited sequentially per subscription, so a
//!   slow handler delays only its own queue

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::event::types::{Event, EventKind};
use crate::util::EVENT_QUEUE_CAPACITY;

/// Subscription filter: a specific event type or the wildcard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    Type(String),
    Wildcard,
}

impl EventFilter {
    pub fn matches(&self, kind: &EventKind) -> bool {
        match self {
            EventFilter::Wildcard => true,
            EventFilter::Type(name) => kind.type_name() == name,
        }
    }
}

type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

struct SubscriptionInner {
    filter: EventFilter,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    delivered: AtomicU64,
    closed: AtomicBool,
}

/// Handle to an active subscription.
#[derive(Clone)]
pub struct Subscription {
    id: u64,
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Events dropped for this subscription because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Events handed to the handler so far.
    pub fn delivered(&self) -> u64 {
        self.inner.delivered.load(Ordering::Relaxed)
    }

    /// Events currently waiting in the queue.
    pub fn backlog(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

/// Bus-wide counters for `metrics.snapshot`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BusStats {
    pub subscriptions: usize,
    pub published: u64,
    pub dropped: u64,
}

/// Typed pub/sub with wildcard subscribers.
pub struct EventBus {
    subs: DashMap<u64, Arc<SubscriptionInner>>,
    next_sub: AtomicU64,
    next_event: AtomicU64,
    capacity: usize,
    start: Instant,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_QUEUE_CAPACITY)
    }

    /// Bus with a custom per-subscription queue capacity (tests use small
    /// capacities to exercise the drop policy).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subs: DashMap::new(),
            next_sub: AtomicU64::new(0),
            next_event: AtomicU64::new(0),
            capacity: capacity.max(1),
            start: Instant::now(),
        }
    }

    /// Milliseconds since the bus was created.
    pub fn uptime_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Subscribe with an async handler. The handler runs on a dedicated
    /// delivery task; events are handed over in FIFO order, one at a time.
    pub fn subscribe<F, Fut>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        let inner = Arc::new(SubscriptionInner {
            filter,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let id = self.next_sub.fetch_add(1, Ordering::SeqCst);
        self.subs.insert(id, Arc::clone(&inner));

        // Delivery task: drains this subscription's queue sequentially
        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            loop {
                let event = task_inner.queue.lock().pop_front();
                match event {
                    Some(event) => {
                        task_inner.delivered.fetch_add(1, Ordering::Relaxed);
                        handler(event).await;
                    }
                    None => {
                        if task_inner.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        task_inner.notify.notified().await;
                    }
                }
            }
        });

        Subscription { id, inner }
    }

    /// Publish an event to every matching subscription. Never blocks: full
    /// queues drop their oldest entry.
    pub fn publish(&self, source: &str, kind: EventKind) -> u64 {
        let id = self.next_event.fetch_add(1, Ordering::SeqCst);
        let event = Event {
            id,
            timestamp_ms: self.uptime_ms(),
            source: Arc::from(source),
            kind,
        };

        for entry in self.subs.iter() {
            let sub = entry.value();
            if !sub.filter.matches(&event.kind) {
                continue;
            }
            {
                let mut queue = sub.queue.lock();
                if queue.len() >= self.capacity {
                    queue.pop_front();
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(event.clone());
            }
            sub.notify.notify_one();
        }

        id
    }

    /// Remove a subscription; its delivery task drains what is already
    /// queued and exits.
    pub fn unsubscribe(&self, sub: &Subscription) {
        if let Some((_, inner)) = self.subs.remove(&sub.id) {
            inner.closed.store(true, Ordering::SeqCst);
            inner.notify.notify_one();
        }
    }

    pub fn stats(&self) -> BusStats {
        let dropped = self
            .subs
            .iter()
            .map(|s| s.value().dropped.load(Ordering::Relaxed))
            .sum();
        BusStats {
            subscriptions: self.subs.len(),
            published: self.next_event.load(Ordering::SeqCst),
            dropped,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("EventBus")
            .field("subscriptions", &stats.subscriptions)
            .field("published", &stats.published)
            .field("dropped", &stats.dropped)
            .finish()
    }
}
