use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub that pushes hold and booking changes to their holder.
///
/// Channels are keyed by holder id, so a client watching its cart sees
/// acquisitions, renewals, expiries and promotions without polling.
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a holder's events. Creates the channel if needed.
    pub fn subscribe(&self, holder: &str) -> broadcast::Receiver<Event> {
        if let Some(sender) = self.channels.get(holder) {
            return sender.subscribe();
        }
        self.channels
            .entry(holder.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening. Channels whose receivers are all gone are dropped.
    pub fn send(&self, holder: &str, event: &Event) {
        let orphaned = match self.channels.get(holder) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => return,
        };
        if orphaned {
            self.channels
                .remove_if(holder, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn remove(&self, holder: &str) {
        self.channels.remove(holder);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReleaseReason, SlotKey};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn released() -> Event {
        Event::HoldReleased {
            id: Ulid::new(),
            key: SlotKey::new(Ulid::new(), NaiveDate::from_ymd_opt(2025, 3, 14).unwrap()),
            reason: ReleaseReason::Expired,
            at: 42,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe("alice");
        let event = released();
        hub.send("alice", &event);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn holders_are_isolated() {
        let hub = NotifyHub::new();
        let mut alice = hub.subscribe("alice");
        let _bob = hub.subscribe("bob");
        hub.send("bob", &released());
        assert!(alice.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send("nobody", &released());
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn dropped_receivers_free_the_channel() {
        let hub = NotifyHub::new();
        drop(hub.subscribe("alice"));
        assert_eq!(hub.channel_count(), 1);
        hub.send("alice", &released());
        assert_eq!(hub.channel_count(), 0);
    }
}
