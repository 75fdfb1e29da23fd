//! Broadcaster: pub/sub fan-out with per-subscriber bounded queues
//! and a drop-oldest backpressure policy, so one slow subscriber never blocks the
//! publisher or the other subscribers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, Notify};
use tracing::warn;

use crate::event::BroadcastEvent;

/// Bound on a subscriber's pending-event queue before the oldest entry is dropped
/// to make room for the newest.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct SubscriberQueue {
    items: Mutex<VecDeque<BroadcastEvent>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    async fn push(&self, event: BroadcastEvent) {
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            items.pop_front();
        }
        items.push_back(event);
        drop(items);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Handle returned from [`Broadcaster::subscribe`]. Drains events with
/// [`Subscription::recv`] and removes itself from the registry via
/// [`Broadcaster::unsubscribe`], either explicitly or automatically when dropped
/// (e.g. an SSE client disconnecting drops its stream, which drops this handle).
pub struct Subscription {
    id: u64,
    queue: Arc<SubscriberQueue>,
    registry: Weak<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event. Returns `None` once the broadcaster has shut down
    /// and no further events will arrive.
    pub async fn recv(&self) -> Option<BroadcastEvent> {
        loop {
            {
                let mut items = self.queue.items.lock().await;
                if let Some(event) = items.pop_front() {
                    return Some(event);
                }
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(broadcaster) = self.registry.upgrade() else {
            return;
        };
        let id = self.id;
        tokio::spawn(async move {
            broadcaster.subscribers.lock().await.remove(&id);
        });
    }
}

pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, Arc<SubscriberQueue>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            queue_capacity,
        }
    }

    /// Atomically adds a new bounded queue; the returned subscription only
    /// receives events published after this call returns. Takes
    /// `self` by `Arc` so the returned [`Subscription`] can unsubscribe itself on
    /// drop (e.g. a client disconnecting).
    pub async fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(SubscriberQueue::new(self.queue_capacity));
        self.subscribers.lock().await.insert(id, queue.clone());
        Subscription {
            id,
            queue,
            registry: Arc::downgrade(self),
        }
    }

    /// Idempotent.
    pub async fn unsubscribe(&self, subscription: &Subscription) {
        self.subscribers.lock().await.remove(&subscription.id);
    }

    /// Enqueues `event` on every current subscriber's queue. A no-op with zero
    /// subscribers — there is no buffering for subscribers that join later.
    pub async fn publish(&self, event: BroadcastEvent) {
        let subscribers: Vec<_> = self.subscribers.lock().await.values().cloned().collect();
        if subscribers.is_empty() {
            return;
        }
        for queue in subscribers {
            queue.push(event.clone()).await;
        }
    }

    /// Closes every subscriber queue (so pending `recv` calls return `None` once
    /// drained) and clears the registry.
    pub async fn shutdown(&self) {
        let mut subscribers = self.subscribers.lock().await;
        if subscribers.is_empty() {
            warn!("broadcaster shutdown with no active subscribers");
        }
        for queue in subscribers.values() {
            queue.close();
        }
        subscribers.clear();
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: i64) -> BroadcastEvent {
        BroadcastEvent::new("test_event", json!({ "n": n }))
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_noop() {
        let b = Arc::new(Broadcaster::default());
        b.publish(event(1)).await;
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let b = Arc::new(Broadcaster::default());
        let sub = b.subscribe().await;
        b.publish(event(1)).await;
        b.publish(event(2)).await;
        assert_eq!(sub.recv().await.unwrap().payload["n"], json!(1));
        assert_eq!(sub.recv().await.unwrap().payload["n"], json!(2));
    }

    #[tokio::test]
    async fn late_subscriber_does_not_see_earlier_events() {
        let b = Arc::new(Broadcaster::default());
        b.publish(event(1)).await;
        let sub = b.subscribe().await;
        b.publish(event(2)).await;
        assert_eq!(sub.recv().await.unwrap().payload["n"], json!(2));
    }

    #[tokio::test]
    async fn full_queue_drops_oldest() {
        let b = Arc::new(Broadcaster::new(2));
        let sub = b.subscribe().await;
        b.publish(event(1)).await;
        b.publish(event(2)).await;
        b.publish(event(3)).await;
        assert_eq!(sub.recv().await.unwrap().payload["n"], json!(2));
        assert_eq!(sub.recv().await.unwrap().payload["n"], json!(3));
    }

    #[tokio::test]
    async fn unsubscribe_stops_further_delivery() {
        let b = Arc::new(Broadcaster::default());
        let sub = b.subscribe().await;
        b.unsubscribe(&sub).await;
        b.publish(event(1)).await;
        assert_eq!(b.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_drains_then_closes() {
        let b = Arc::new(Broadcaster::default());
        let sub = b.subscribe().await;
        b.publish(event(1)).await;
        b.shutdown().await;
        assert_eq!(sub.recv().await.unwrap().payload["n"], json!(1));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_subscription_unsubscribes_itself() {
        let b = Arc::new(Broadcaster::default());
        let sub = b.subscribe().await;
        assert_eq!(b.subscriber_count().await, 1);
        drop(sub);
        // cleanup runs on a spawned task; give the runtime a turn to drive it.
        for _ in 0..50 {
            if b.subscriber_count().await == 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("subscriber was not removed after dropping its Subscription");
    }
}
