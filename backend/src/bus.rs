//! Change notifications.
//!
//! A notification says only *which* bargain changed and roughly how. It never
//! carries the record itself; receivers re-read the store. Publishing never
//! waits on a subscriber: each subscription drains its own bounded queue on
//! its own task, and a handler that panics is logged and skipped. A queue that
//! fills up stops growing; its pending changes collapse into one
//! [`Delivery::Resync`], after which the subscriber re-reads everything.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::models::{Bargain, BargainId};

/// Queue depth per subscriber.
pub const SUBSCRIBER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Message,
    StatusChange,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub bargain_id: BargainId,
    pub change_kind: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Bargain(BargainId),
    Supplier(i64),
    Vendor(i64),
}

impl Topic {
    /// Every topic a change to `bargain` should be announced on.
    pub fn all_for(bargain: &Bargain) -> [Topic; 3] {
        [
            Topic::Bargain(bargain.id),
            Topic::Supplier(bargain.supplier_id),
            Topic::Vendor(bargain.vendor_id),
        ]
    }
}

/// What a subscriber pulls off its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Change(ChangeNotification),
    /// The queue overflowed and some changes were dropped.
    Resync,
}

impl Delivery {
    pub fn notification(self) -> Option<ChangeNotification> {
        match self {
            Delivery::Change(n) => Some(n),
            Delivery::Resync => None,
        }
    }
}

#[async_trait]
pub trait ChangeHandler: Send + Sync + 'static {
    async fn on_change(&self, notification: ChangeNotification);

    /// Changes were dropped; rebuild from the store.
    async fn on_resync(&self);
}

struct Outlet {
    id: u64,
    tx: mpsc::Sender<ChangeNotification>,
    lagged: Arc<AtomicBool>,
}

struct Inner {
    next_id: AtomicU64,
    capacity: usize,
    topics: Mutex<HashMap<Topic, Vec<Outlet>>>,
}

/// In-process fan-out. Cheap to clone; clones share subscribers.
#[derive(Clone)]
pub struct UpdateBus {
    inner: Arc<Inner>,
}

impl Default for UpdateBus {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateBus {
    pub fn new() -> Self {
        Self::with_capacity(SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Hand `notification` to every subscriber of `topic`, queued or folded
    /// into a pending resync. Returns how many subscribers were reached.
    pub fn publish(&self, topic: Topic, notification: ChangeNotification) -> usize {
        let mut topics = match self.inner.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(outlets) = topics.get_mut(&topic) else {
            return 0;
        };
        outlets.retain(|outlet| match outlet.tx.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !outlet.lagged.swap(true, Ordering::SeqCst) {
                    log::warn!(
                        "Subscriber {} on {:?} fell behind; pending changes collapse into a resync",
                        outlet.id,
                        topic
                    );
                }
                true
            }
            // Closed receivers belong to dropped subscriptions; forget them.
            Err(TrySendError::Closed(_)) => false,
        });
        let delivered = outlets.len();
        if outlets.is_empty() {
            topics.remove(&topic);
        }
        log::debug!(
            "Published {:?} for bargain {} on {:?} to {} subscriber(s)",
            notification.change_kind,
            notification.bargain_id,
            topic,
            delivered
        );
        delivered
    }

    /// Subscribe with a raw queue; the caller drains the returned [`Changes`].
    pub fn subscribe_channel(&self, topic: Topic) -> (Subscription, Changes) {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = match self.inner.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics.entry(topic).or_default().push(Outlet {
            id,
            tx,
            lagged: lagged.clone(),
        });
        let sub = Subscription {
            bus: Arc::downgrade(&self.inner),
            topic,
            id,
        };
        (sub, Changes { rx, lagged })
    }

    /// Run `handler` for every delivery on `topic` until the returned
    /// subscription is dropped or unsubscribed. Must be called inside a Tokio runtime.
    pub fn subscribe<H: ChangeHandler>(&self, topic: Topic, handler: Arc<H>) -> Subscription {
        let (sub, mut changes) = self.subscribe_channel(topic);
        tokio::spawn(async move {
            while let Some(delivery) = changes.recv().await {
                let outcome = match delivery {
                    Delivery::Change(n) => {
                        AssertUnwindSafe(handler.on_change(n)).catch_unwind().await
                    }
                    Delivery::Resync => AssertUnwindSafe(handler.on_resync()).catch_unwind().await,
                };
                if outcome.is_err() {
                    log::warn!("Subscriber on {:?} panicked handling {:?}", topic, delivery);
                }
            }
        });
        sub
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        match self.inner.topics.lock() {
            Ok(topics) => topics.get(&topic).map_or(0, Vec::len),
            Err(poisoned) => poisoned.into_inner().get(&topic).map_or(0, Vec::len),
        }
    }
}

/// Receiving end of one subscription.
pub struct Changes {
    rx: mpsc::Receiver<ChangeNotification>,
    lagged: Arc<AtomicBool>,
}

impl Changes {
    /// `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        if let Some(resync) = self.take_resync() {
            return Some(resync);
        }
        let notification = self.rx.recv().await?;
        Some(self.take_resync().unwrap_or(Delivery::Change(notification)))
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        if let Some(resync) = self.take_resync() {
            return Some(resync);
        }
        self.rx.try_recv().ok().map(Delivery::Change)
    }

    // A resync covers everything still queued, so the backlog goes with it.
    fn take_resync(&mut self) -> Option<Delivery> {
        if !self.lagged.swap(false, Ordering::SeqCst) {
            return None;
        }
        while self.rx.try_recv().is_ok() {}
        Some(Delivery::Resync)
    }
}

/// Handle returned by subscribe. Dropping it unsubscribes.
pub struct Subscription {
    bus: Weak<Inner>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut topics = match inner.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(outlets) = topics.get_mut(&self.topic) {
            outlets.retain(|outlet| outlet.id != self.id);
            if outlets.is_empty() {
                topics.remove(&self.topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn note(id: BargainId) -> ChangeNotification {
        ChangeNotification {
            bargain_id: id,
            change_kind: ChangeKind::Message,
        }
    }

    #[derive(Default)]
    struct Counter {
        seen: AtomicUsize,
        resyncs: AtomicUsize,
        notify: Notify,
    }

    impl Counter {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        async fn wait_for(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(2), async {
                while self.seen.load(Ordering::SeqCst) < n {
                    self.notify.notified().await;
                }
            })
            .await
            .expect("notifications arrive");
        }
    }

    #[async_trait]
    impl ChangeHandler for Counter {
        async fn on_change(&self, _n: ChangeNotification) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }

        async fn on_resync(&self) {
            self.resyncs.fetch_add(1, Ordering::SeqCst);
            self.seen.fetch_add(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    struct Stuck;

    #[async_trait]
    impl ChangeHandler for Stuck {
        async fn on_change(&self, _n: ChangeNotification) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        async fn on_resync(&self) {}
    }

    struct Panics;

    #[async_trait]
    impl ChangeHandler for Panics {
        async fn on_change(&self, n: ChangeNotification) {
            if n.bargain_id == 1 {
                panic!("boom");
            }
        }

        async fn on_resync(&self) {}
    }

    #[test]
    fn test_notification_wire_shape() {
        let json = serde_json::to_value(ChangeNotification {
            bargain_id: 3,
            change_kind: ChangeKind::StatusChange,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"bargainId": 3, "changeKind": "status_change"}));
    }

    #[tokio::test]
    async fn test_publish_reaches_topic_subscribers_only() {
        let bus = UpdateBus::new();
        let (_a, mut rx_a) = bus.subscribe_channel(Topic::Vendor(1));
        let (_b, mut rx_b) = bus.subscribe_channel(Topic::Vendor(2));

        assert_eq!(bus.publish(Topic::Vendor(1), note(5)), 1);
        assert_eq!(rx_a.recv().await, Some(Delivery::Change(note(5))));
        assert!(rx_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let bus = UpdateBus::new();
        let (sub, _rx) = bus.subscribe_channel(Topic::Bargain(1));
        assert_eq!(bus.subscriber_count(Topic::Bargain(1)), 1);
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(Topic::Bargain(1)), 0);
        assert_eq!(bus.publish(Topic::Bargain(1), note(1)), 0);
    }

    #[tokio::test]
    async fn test_undrained_queue_stays_bounded() {
        let bus = UpdateBus::with_capacity(4);
        let (_sub, mut rx) = bus.subscribe_channel(Topic::Bargain(1));

        for _ in 0..100_000 {
            assert_eq!(bus.publish(Topic::Bargain(1), note(1)), 1);
        }

        // Everything beyond the first four collapsed into one resync, which
        // also swallows the backlog.
        assert_eq!(rx.try_recv(), Some(Delivery::Resync));
        assert_eq!(rx.try_recv(), None);

        bus.publish(Topic::Bargain(1), note(7));
        assert_eq!(rx.recv().await, Some(Delivery::Change(note(7))));
    }

    #[tokio::test]
    async fn test_overflowed_handler_gets_one_resync() {
        let bus = UpdateBus::with_capacity(2);
        let counter = Counter::new();
        let _sub = bus.subscribe(Topic::Supplier(2), counter.clone());

        // The handler task cannot run before the next await.
        for id in 0..50 {
            bus.publish(Topic::Supplier(2), note(id));
        }
        counter.wait_for(1).await;
        tokio::task::yield_now().await;
        assert_eq!(counter.resyncs.load(Ordering::SeqCst), 1);
        assert_eq!(counter.seen.load(Ordering::SeqCst), 1);

        bus.publish(Topic::Supplier(2), note(99));
        counter.wait_for(2).await;
        assert_eq!(counter.resyncs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let bus = UpdateBus::new();
        let _stuck = bus.subscribe(Topic::Supplier(2), Arc::new(Stuck));
        let counter = Counter::new();
        let _counting = bus.subscribe(Topic::Supplier(2), counter.clone());

        for id in 0..3 {
            assert_eq!(bus.publish(Topic::Supplier(2), note(id)), 2);
        }
        counter.wait_for(3).await;
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_its_subscription() {
        let bus = UpdateBus::new();
        let _bad = bus.subscribe(Topic::Vendor(1), Arc::new(Panics));
        let counter = Counter::new();
        let _good = bus.subscribe(Topic::Vendor(1), counter.clone());

        bus.publish(Topic::Vendor(1), note(1));
        bus.publish(Topic::Vendor(1), note(2));
        counter.wait_for(2).await;
        tokio::task::yield_now().await;
        assert_eq!(bus.subscriber_count(Topic::Vendor(1)), 2);
    }
}
