//! # Change Notifications
//!
//! Other SDK components hold onto events they fetched from the queue (the
//! delivery pipeline keeps a batch in flight, for example). When records change
//! under them, they are told through a broadcast of [`StoreChange`] values.
//!
//! ```text
//!   queue worker / one-shot task ──commit──► ChangeNotifier::notify
//!                                                  │
//!                                    tokio::sync::broadcast
//!                                    ┌─────────────┼─────────────┐
//!                                    ▼             ▼             ▼
//!                                 receiver      receiver      receiver
//! ```
//!
//! Notifications fire only after a successful save and only when rows actually
//! changed. With no receivers, sending is a no-op.
//!
//! ## Backpressure
//!
//! The channel is bounded. A receiver that falls behind gets
//! `RecvError::Lagged(n)` and should re-read whatever state it cares about.

use tokio::sync::broadcast;

use crate::types::TransactionId;

/// Capacity of the change channel.
pub const DEFAULT_CHANGE_CAPACITY: usize = 256;

/// Why a batch of records left the store without being named one by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// The queue held more than its capacity.
    Capacity,
    /// Records outlived the event lifetime.
    Expired,
    /// The host reported memory pressure.
    MemoryPressure,
    /// `erase()` on an in-memory store.
    Erased,
}

/// One committed change to a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Inserted { transaction_id: TransactionId },
    /// A delivery attempt was stamped.
    Updated { transaction_id: TransactionId },
    /// Records removed by key (acknowledged delivery, on-disk erase).
    Deleted { transaction_ids: Vec<TransactionId> },
    /// Records removed in bulk.
    Evicted { count: usize, reason: EvictionReason },
}

/// Sending half of a store's change channel.
///
/// Cloned into one-shot background tasks so their commits notify too.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<StoreChange>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_CAPACITY)
    }
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns a new receiver that sees every change sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.tx.subscribe()
    }

    /// Broadcasts `change`.
    pub fn notify(&self, change: StoreChange) {
        // No receivers is not an error.
        let _ = self.tx.send(change);
    }

    /// Broadcasts an eviction unless nothing was removed.
    pub fn evicted(&self, count: usize, reason: EvictionReason) {
        if count > 0 {
            self.notify(StoreChange::Evicted { count, reason });
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_reaches_every_subscriber() {
        let notifier = ChangeNotifier::new(8);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.notify(StoreChange::Inserted {
            transaction_id: TransactionId::new("t1"),
        });

        for rx in [&mut a, &mut b] {
            assert_eq!(
                rx.try_recv().unwrap(),
                StoreChange::Inserted {
                    transaction_id: TransactionId::new("t1")
                }
            );
        }
    }

    #[test]
    fn test_empty_eviction_is_not_sent() {
        let notifier = ChangeNotifier::default();
        let mut rx = notifier.subscribe();

        notifier.evicted(0, EvictionReason::Capacity);
        notifier.evicted(2, EvictionReason::Expired);

        assert_eq!(
            rx.try_recv().unwrap(),
            StoreChange::Evicted {
                count: 2,
                reason: EvictionReason::Expired
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_notify_without_subscribers_is_noop() {
        let notifier = ChangeNotifier::new(1);
        notifier.notify(StoreChange::Deleted {
            transaction_ids: vec![],
        });
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
