//! Fan-out of lifecycle events to observers.
//!
//! Every subscriber has its own bounded queue. Publishing never blocks: a
//! full queue drops the event for that subscriber only, and a closed queue
//! unregisters the subscriber.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use tether_core::events::{Event, EventEnvelope};
use tether_core::ids::{OwnerId, SessionId, SubscriberId};

struct Subscriber {
    owner_id: OwnerId,
    session_id: Option<SessionId>,
    tx: mpsc::Sender<Arc<EventEnvelope>>,
    dropped: AtomicU64,
}

impl Subscriber {
    fn wants(&self, event: &Event) -> bool {
        self.owner_id == event.owner_id
            && self
                .session_id
                .as_ref()
                .map_or(true, |id| *id == event.session_id)
    }
}

/// Receiving end of a subscription.
pub struct Subscription {
    pub id: SubscriberId,
    pub owner_id: OwnerId,
    pub session_id: Option<SessionId>,
    receiver: mpsc::Receiver<Arc<EventEnvelope>>,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<EventEnvelope>> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> ReceiverStream<Arc<EventEnvelope>> {
        ReceiverStream::new(self.receiver)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

pub struct EventBroadcaster {
    subscribers: DashMap<SubscriberId, Subscriber>,
    queue_size: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventBroadcaster {
    pub fn new(queue_size: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            queue_size: queue_size.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to the events of `owner`, optionally narrowed to one session.
    pub fn subscribe(&self, owner: OwnerId, session: Option<SessionId>) -> Subscription {
        let (tx, receiver) = mpsc::channel(self.queue_size);
        let id = SubscriberId::new();
        self.subscribers.insert(
            id.clone(),
            Subscriber {
                owner_id: owner.clone(),
                session_id: session.clone(),
                tx,
                dropped: AtomicU64::new(0),
            },
        );
        debug!(subscriber_id = %id, owner_id = %owner, session_id = ?session, "subscriber added");
        Subscription {
            id,
            owner_id: owner,
            session_id: session,
            receiver,
        }
    }

    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            debug!(subscriber_id = %id, "subscriber removed");
        }
        removed
    }

    /// Drop every subscription of `owner`.
    pub fn unsubscribe_owner(&self, owner: &OwnerId) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|_, sub| sub.owner_id != *owner);
        before - self.subscribers.len()
    }

    pub fn close_all(&self) {
        self.subscribers.clear();
    }

    /// Deliver `event` to every matching subscriber without waiting.
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, event: &Event) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let envelope = Arc::new(event.to_envelope());
        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if !sub.wants(event) {
                continue;
            }
            match sub.tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        subscriber_id = %entry.key(),
                        session_id = %event.session_id,
                        event_type = event.event_type(),
                        dropped,
                        "subscriber queue full, event dropped"
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            debug!(subscriber_id = %id, "pruned closed subscriber");
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn published_total(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Events dropped on full queues, across all subscribers.
    pub fn dropped_total(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tether_core::events::EventPayload;
    use tether_core::session::Session;

    fn event_for(session: &Session) -> Event {
        Event::for_session(session, EventPayload::PairingScanned {}, Utc::now())
    }

    fn session(owner: &str) -> Session {
        Session::new(OwnerId::from_raw(owner), "phone", Utc::now())
    }

    #[tokio::test]
    async fn owner_and_session_filters() {
        let bus = EventBroadcaster::new(8);
        let a1 = session("a");
        let a2 = session("a");
        let b1 = session("b");

        let mut all_a = bus.subscribe(OwnerId::from_raw("a"), None);
        let mut only_a1 = bus.subscribe(OwnerId::from_raw("a"), Some(a1.id.clone()));
        let mut all_b = bus.subscribe(OwnerId::from_raw("b"), None);

        bus.publish(&event_for(&a1));
        bus.publish(&event_for(&a2));
        bus.publish(&event_for(&b1));

        assert_eq!(all_a.recv().await.unwrap().session_id, a1.id);
        assert_eq!(all_a.recv().await.unwrap().session_id, a2.id);
        assert!(all_a.try_recv().is_none());

        assert_eq!(only_a1.recv().await.unwrap().session_id, a1.id);
        assert!(only_a1.try_recv().is_none());

        assert_eq!(all_b.recv().await.unwrap().session_id, b1.id);
        assert!(all_b.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_queue_drops_only_for_that_subscriber() {
        let bus = EventBroadcaster::new(2);
        let s = session("a");
        let _stalled = bus.subscribe(s.owner_id.clone(), None);
        let mut reader = bus.subscribe(s.owner_id.clone(), None);

        for _ in 0..5 {
            bus.publish(&event_for(&s));
            assert!(reader.recv().await.is_some());
        }
        assert_eq!(bus.dropped_total(), 3);
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let bus = EventBroadcaster::new(4);
        let s = session("a");
        let sub = bus.subscribe(s.owner_id.clone(), None);
        drop(sub);
        assert_eq!(bus.publish(&event_for(&s)), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_ends_stream() {
        let bus = EventBroadcaster::new(4);
        let mut sub = bus.subscribe(OwnerId::from_raw("a"), None);
        assert!(bus.unsubscribe(&sub.id));
        assert!(!bus.unsubscribe(&sub.id));
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn unsubscribe_owner_leaves_others() {
        let bus = EventBroadcaster::new(4);
        let _a1 = bus.subscribe(OwnerId::from_raw("a"), None);
        let _a2 = bus.subscribe(OwnerId::from_raw("a"), None);
        let _b = bus.subscribe(OwnerId::from_raw("b"), None);
        assert_eq!(bus.unsubscribe_owner(&OwnerId::from_raw("a")), 2);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
