use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// One topic of the lifecycle event bus.
///
/// Every subscriber sees every event, in publish order. Subscribers that went
/// away are pruned on the next publish.
pub struct Publisher<T> {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Default for Publisher<T> {
    fn default() -> Self {
        Self {
            subscribers: Arc::default(),
        }
    }
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            subscribers: self.subscribers.clone(),
        }
    }
}

pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T: Clone> Publisher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);

        Subscription { rx }
    }

    pub fn publish(&self, event: T) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let publisher = Publisher::new();
        let mut a = publisher.subscribe();
        let mut b = publisher.subscribe();

        publisher.publish(1);
        publisher.publish(2);

        assert_eq!(a.recv().await, Some(1));
        assert_eq!(a.recv().await, Some(2));
        assert_eq!(b.recv().await, Some(1));
        assert_eq!(b.recv().await, Some(2));
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let publisher = Publisher::new();
        let a = publisher.subscribe();
        let mut b = publisher.subscribe();
        drop(a);

        publisher.publish("x");

        assert_eq!(b.recv().await, Some("x"));
    }
}
