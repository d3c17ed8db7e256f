//! In-process fan-in for listing announcements. Producers (catalog
//! registration and used-book listing) push a [`ListingEvent`] onto the bus
//! and never talk to the notification machinery directly; a single listener
//! drains the channel in the background.

use std::fmt;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    New,
    Old,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::New => "NEW",
            EventType::Old => "OLD",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the listener needs to match subscribers and build a
/// notification, captured at publish time so the listener never has to
/// reach back into the producer's tables.
#[derive(Debug, Clone)]
pub struct ListingEvent {
    pub event_type: EventType,
    pub title: String,
    pub author: Option<String>,
    pub book_id: Option<Uuid>,
    pub deal_id: Option<Uuid>,
    pub seller_id: Option<Uuid>,
    pub price: Option<i64>,
    pub image: Option<String>,
}

#[derive(Clone)]
pub struct EventBus {
    tx: UnboundedSender<ListingEvent>,
}

impl EventBus {
    pub fn new() -> (Self, UnboundedReceiver<ListingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Fire and forget; a send failure is logged and swallowed.
    pub fn publish(&self, event: ListingEvent) {
        if let Err(err) = self.tx.send(event) {
            log::warn!("listing event dropped, listener is gone: {}", err.0.title);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn published_events_reach_the_receiver() {
        let (bus, mut rx) = EventBus::new();
        bus.publish(ListingEvent {
            event_type: EventType::Old,
            title: "Dune".to_string(),
            author: Some("Frank Herbert".to_string()),
            book_id: Some(Uuid::new_v4()),
            deal_id: Some(Uuid::new_v4()),
            seller_id: Some(Uuid::new_v4()),
            price: Some(4500),
            image: None,
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::Old);
        assert_eq!(received.title, "Dune");
    }

    #[test]
    fn publish_after_receiver_drop_does_not_panic() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.publish(ListingEvent {
            event_type: EventType::New,
            title: "orphaned".to_string(),
            author: None,
            book_id: None,
            deal_id: None,
            seller_id: None,
            price: None,
            image: None,
        });
    }
}
