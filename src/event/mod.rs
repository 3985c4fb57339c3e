//! Multi-subscriber event streams
//!
//! A [`Publisher`] fans every item out to all live [`Subscription`]s. Each
//! subscriber has its own unbounded queue, so a slow subscriber never blocks
//! the producer or other subscribers. Dropping a subscription unsubscribes it.

use parking_lot::Mutex;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::Stream;

/// Fan-out sender side
pub struct Publisher<T> {
    subscribers: Mutex<Option<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T: Clone + Send> Publisher<T> {
    /// Create a publisher without subscribers
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Register a new subscriber.
    ///
    /// Subscribing to a closed publisher yields an already-finished stream.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(subscribers) = self.subscribers.lock().as_mut() {
            subscribers.push(tx);
        }
        Subscription::from_receiver(rx)
    }

    /// Deliver `item` to every live subscriber, returning how many received it
    pub fn publish(&self, item: T) -> usize {
        let mut guard = self.subscribers.lock();
        let Some(subscribers) = guard.as_mut() else {
            return 0;
        };
        subscribers.retain(|tx| !tx.is_closed());

        let Some((last, rest)) = subscribers.split_last() else {
            return 0;
        };
        let mut delivered = 0;
        for tx in rest {
            if tx.send(item.clone()).is_ok() {
                delivered += 1;
            }
        }
        if last.send(item).is_ok() {
            delivered += 1;
        }
        delivered
    }

    /// Number of subscribers still listening
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .as_ref()
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Check if anyone is listening
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Finish every subscription; later publishes are dropped
    pub fn close(&self) {
        self.subscribers.lock().take();
    }

    /// Check if the publisher was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.subscribers.lock().is_none()
    }
}

impl<T: Clone + Send> Default for Publisher<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.subscribers.lock().as_ref().map(Vec::len);
        f.debug_struct("Publisher")
            .field("subscribers", &count)
            .finish()
    }
}

/// Receiving side of a [`Publisher`]
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Subscription<T> {
    /// Wrap a receiver fed by some other producer
    pub fn from_receiver(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx }
    }

    /// Wait for the next item; `None` once the publisher is closed
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take an item if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}
