//! Engine events and the live-update subscriber hub.
//!
//! Publishing is fire-and-forget: a slow or dead subscriber never blocks or
//! fails the operation that produced the event. The hub keeps an explicit
//! registry of subscriber channels keyed by subscriber id and broadcasts over
//! a snapshot of that registry.

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::blood::BloodGroup;
use crate::domain::donor::DonorId;
use crate::domain::request::RequestId;

/// Audit/UI event emitted by the engine.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    RequestOpened {
        request_id: RequestId,
        blood_group: BloodGroup,
        quantity_needed: u32,
        eligible_donors: usize,
    },
    DonorNotified {
        request_id: RequestId,
        donor_id: DonorId,
    },
    DonationConfirmed {
        request_id: RequestId,
        confirmed_units: u32,
    },
    RequestFulfilled {
        request_id: RequestId,
    },
    RequestExpired {
        request_id: RequestId,
    },
    RequestCancelled {
        request_id: RequestId,
    },
}

/// Fire-and-forget event publication. Failures are swallowed.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// Unique identifier for an event subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SubscriberId(pub Uuid);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Process-wide registry of live event subscribers.
///
/// Subscribers are added on connect and removed on disconnect (explicitly or
/// when their channel closes). Broadcast iterates a snapshot of the registry,
/// so concurrent subscribe/unsubscribe never invalidates an in-progress send.
#[derive(Default)]
pub struct EventHub {
    subscribers: DashMap<SubscriberId, mpsc::Sender<Event>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; returns its id and the receiving end.
    pub fn subscribe(&self, capacity: usize) -> (SubscriberId, mpsc::Receiver<Event>) {
        let id = SubscriberId(Uuid::new_v4());
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.insert(id, tx);
        tracing::debug!(subscriber_id = %id, "Event subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.remove(&id).is_some() {
            tracing::debug!(subscriber_id = %id, "Event subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn broadcast(&self, event: Event) {
        // Snapshot: sends happen outside the map's shard locks
        let snapshot: Vec<(SubscriberId, mpsc::Sender<Event>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        for (id, sender) in snapshot {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop this event for them, keep the handle
                    tracing::trace!(subscriber_id = %id, "Subscriber buffer full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber_id = %id, "Subscriber gone, removing");
                    self.subscribers.remove(&id);
                }
            }
        }
    }
}

impl EventSink for EventHub {
    fn publish(&self, event: Event) {
        self.broadcast(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fulfilled_event() -> Event {
        Event::RequestFulfilled {
            request_id: RequestId::from(Uuid::new_v4()),
        }
    }

    #[tokio::test]
    async fn test_subscribe_receive_unsubscribe() {
        let hub = EventHub::new();
        let (id, mut rx) = hub.subscribe(8);
        assert_eq!(hub.subscriber_count(), 1);

        hub.publish(fulfilled_event());
        assert!(matches!(
            rx.recv().await,
            Some(Event::RequestFulfilled { .. })
        ));

        hub.unsubscribe(id);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_pruned() {
        let hub = EventHub::new();
        let (_id, rx) = hub.subscribe(8);
        drop(rx);

        hub.publish(fulfilled_event());
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_event_but_keeps_subscriber() {
        let hub = EventHub::new();
        let (_id, mut rx) = hub.subscribe(1);

        hub.publish(fulfilled_event());
        hub.publish(fulfilled_event()); // dropped, buffer full
        assert_eq!(hub.subscriber_count(), 1);

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
