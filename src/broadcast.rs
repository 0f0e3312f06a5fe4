//! Holds the live snapshot and fans every new one out to subscribers.
//!
//! Lock order is always `current` before `subscribers`. `publish` enumerates
//! subscribers while still holding the snapshot write lock and `subscribe`
//! registers while holding the snapshot read lock, so a new subscriber sees
//! either the old snapshot followed by the new one, or only the new one.

use crate::state::Snapshot;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, warn};

pub type SubscriberId = u64;

/// Serialized snapshots are shared between every subscriber queue.
pub type Payload = Arc<str>;

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<Payload>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub evicted: usize,
}

struct Current {
    snapshot: Snapshot,
    payload: Option<Payload>,
}

pub struct Broadcaster {
    current: RwLock<Current>,
    subscribers: RwLock<BTreeMap<SubscriberId, mpsc::Sender<Payload>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    publish_gate: Mutex<()>,
    evictions_tx: mpsc::UnboundedSender<SubscriberId>,
    evictions_rx: Mutex<mpsc::UnboundedReceiver<SubscriberId>>,
}

impl Broadcaster {
    pub fn new(queue_capacity: usize) -> Arc<Self> {
        let snapshot = Snapshot::default();
        let payload = match serde_json::to_string(&snapshot) {
            Ok(text) => Some(Payload::from(text)),
            Err(err) => {
                warn!(error = %err, "failed to encode initial snapshot");
                None
            }
        };
        let (evictions_tx, evictions_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            current: RwLock::new(Current { snapshot, payload }),
            subscribers: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
            publish_gate: Mutex::new(()),
            evictions_tx,
            evictions_rx: Mutex::new(evictions_rx),
        })
    }

    /// Installs `snapshot` as current and queues it for every subscriber.
    /// Never waits on a subscriber: a full or closed queue evicts it.
    pub async fn publish(&self, snapshot: Snapshot) -> Result<PublishReport, BroadcastError> {
        let _gate = self.publish_gate.lock().await;
        let payload = Payload::from(serde_json::to_string(&snapshot)?);

        let targets: Vec<(SubscriberId, mpsc::Sender<Payload>)> = {
            let mut current = self.current.write().await;
            current.snapshot = snapshot;
            current.payload = Some(payload.clone());
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut report = PublishReport::default();
        for (id, tx) in targets {
            match tx.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, "subscriber queue full, evicting");
                    let _ = self.evictions_tx.send(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = id, "subscriber gone, evicting");
                    let _ = self.evictions_tx.send(id);
                }
            }
        }

        report.evicted = self.apply_evictions().await;
        Ok(report)
    }

    /// Registers an observer whose first message is the current snapshot.
    pub async fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::channel(self.queue_capacity);

        let current = self.current.read().await;
        if let Some(payload) = &current.payload {
            // The queue is fresh, so this cannot be full.
            let _ = tx.try_send(payload.clone());
        }
        self.subscribers.write().await.insert(id, tx);
        drop(current);

        debug!(subscriber = id, "subscriber added");
        Subscription { id, receiver }
    }

    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().await.remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "subscriber removed");
        }
        removed
    }

    pub async fn current(&self) -> Snapshot {
        self.current.read().await.snapshot.clone()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Drops every subscriber queue; receivers drain what is buffered and
    /// then observe the end of the stream.
    pub async fn close_all(&self) {
        let mut subscribers = self.subscribers.write().await;
        debug!(count = subscribers.len(), "closing all subscribers");
        subscribers.clear();
    }

    async fn apply_evictions(&self) -> usize {
        let mut pending = Vec::new();
        {
            let mut rx = self.evictions_rx.lock().await;
            while let Ok(id) = rx.try_recv() {
                pending.push(id);
            }
        }
        if pending.is_empty() {
            return 0;
        }

        let mut subscribers = self.subscribers.write().await;
        pending
            .into_iter()
            .filter(|id| subscribers.remove(id).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> Snapshot {
        Snapshot {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            cpu_usage_percent: secs as f64,
            ..Snapshot::default()
        }
    }

    fn timestamp_of(payload: &Payload) -> DateTime<Utc> {
        serde_json::from_str::<Snapshot>(payload).unwrap().timestamp
    }

    async fn drain(sub: &mut Subscription) -> Vec<DateTime<Utc>> {
        let mut seen = Vec::new();
        while let Ok(payload) = sub.receiver.try_recv() {
            seen.push(timestamp_of(&payload));
        }
        seen
    }

    #[tokio::test]
    async fn fan_out_preserves_order() {
        let broadcaster = Broadcaster::new(8);
        let mut a = broadcaster.subscribe().await;
        let mut b = broadcaster.subscribe().await;

        for secs in [10, 20, 30] {
            let report = broadcaster.publish(at(secs)).await.unwrap();
            assert_eq!(report.delivered, 2);
        }

        let expected: Vec<_> = [0, 10, 20, 30]
            .iter()
            .map(|s| Utc.timestamp_opt(*s, 0).unwrap())
            .collect();
        assert_eq!(drain(&mut a).await, expected);
        assert_eq!(drain(&mut b).await, expected);
    }

    #[tokio::test]
    async fn unsubscribe_leaves_others_untouched() {
        let broadcaster = Broadcaster::new(8);
        let mut a = broadcaster.subscribe().await;
        let b = broadcaster.subscribe().await;

        broadcaster.publish(at(1)).await.unwrap();
        assert!(broadcaster.unsubscribe(b.id).await);
        assert!(!broadcaster.unsubscribe(b.id).await);

        let report = broadcaster.publish(at(2)).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(broadcaster.subscriber_count().await, 1);
        assert_eq!(drain(&mut a).await.len(), 3);
    }

    #[tokio::test]
    async fn late_subscriber_starts_from_current() {
        let broadcaster = Broadcaster::new(8);
        broadcaster.publish(at(100)).await.unwrap();

        let mut late = broadcaster.subscribe().await;
        broadcaster.publish(at(200)).await.unwrap();

        let seen = drain(&mut late).await;
        assert_eq!(
            seen,
            vec![
                Utc.timestamp_opt(100, 0).unwrap(),
                Utc.timestamp_opt(200, 0).unwrap()
            ]
        );
        assert_eq!(broadcaster.current().await, at(200));
    }

    #[tokio::test]
    async fn full_queue_evicts_only_the_slow_subscriber() {
        let broadcaster = Broadcaster::new(2);
        let mut slow = broadcaster.subscribe().await;
        let mut fast = broadcaster.subscribe().await;

        let mut evicted = 0;
        for secs in 1..=3 {
            let report = broadcaster.publish(at(secs)).await.unwrap();
            evicted += report.evicted;
            drain(&mut fast).await;
        }

        assert_eq!(evicted, 1);
        assert_eq!(broadcaster.subscriber_count().await, 1);

        // Buffered messages are still delivered before the stream ends.
        assert_eq!(slow.receiver.recv().await.map(|p| timestamp_of(&p)), Some(at(0).timestamp));
        assert!(slow.receiver.recv().await.is_some());
        assert!(slow.receiver.recv().await.is_none());

        broadcaster.publish(at(4)).await.unwrap();
        assert_eq!(drain(&mut fast).await, vec![Utc.timestamp_opt(4, 0).unwrap()]);
    }

    #[tokio::test]
    async fn dropped_receiver_is_evicted_on_next_publish() {
        let broadcaster = Broadcaster::new(4);
        let gone = broadcaster.subscribe().await;
        let _kept = broadcaster.subscribe().await;
        drop(gone);

        let report = broadcaster.publish(at(1)).await.unwrap();
        assert_eq!(report, PublishReport { delivered: 1, evicted: 1 });
        assert_eq!(broadcaster.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn close_all_ends_every_stream() {
        let broadcaster = Broadcaster::new(4);
        let mut a = broadcaster.subscribe().await;
        let mut b = broadcaster.subscribe().await;

        broadcaster.close_all().await;
        assert_eq!(broadcaster.subscriber_count().await, 0);
        for sub in [&mut a, &mut b] {
            assert!(sub.receiver.recv().await.is_some());
            assert!(sub.receiver.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn concurrent_subscribe_never_misses_a_snapshot() {
        let broadcaster = Broadcaster::new(64);
        let publisher = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                for secs in 1..=20 {
                    broadcaster.publish(at(secs)).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut subs = Vec::new();
        for _ in 0..5 {
            subs.push(broadcaster.subscribe().await);
            tokio::task::yield_now().await;
        }
        publisher.await.unwrap();

        for sub in &mut subs {
            let seen = drain(sub).await;
            let secs: Vec<i64> = seen.iter().map(|t| t.timestamp()).collect();
            assert_eq!(secs.last(), Some(&20));
            assert!(secs.windows(2).all(|w| w[1] == w[0] + 1), "gap in {secs:?}");
        }
    }
}
