use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc as tokio_mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::trace;

type SubscriptionId = u64;

struct FeedInner<T> {
    subscribers: HashMap<SubscriptionId, tokio_mpsc::UnboundedSender<T>>,
    next_id: SubscriptionId,
    last: Option<T>,
    distinct: bool,
}

/// Latest-value broadcast with replay to new subscribers
///
/// Every published value is delivered in order to each live subscriber.
/// A subscriber is removed as soon as its receiver is dropped.
pub struct Feed<T> {
    name: &'static str,
    inner: Arc<Mutex<FeedInner<T>>>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + PartialEq + Send + 'static> Feed<T> {
    /// Feed that forwards every published value
    pub fn new(name: &'static str) -> Self {
        Self::with_mode(name, false)
    }

    /// Feed that drops a value equal to the last one published
    pub fn distinct(name: &'static str) -> Self {
        Self::with_mode(name, true)
    }

    fn with_mode(name: &'static str, distinct: bool) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(FeedInner {
                subscribers: HashMap::new(),
                next_id: 1,
                last: None,
                distinct,
            })),
        }
    }

    /// Publish a value, returns false if it was suppressed as a duplicate
    pub fn publish(&self, value: T) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.distinct && inner.last.as_ref() == Some(&value) {
            return false;
        }

        let mut to_remove = Vec::new();
        for (id, tx) in inner.subscribers.iter() {
            // Receiver dropped means unsubscribed
            if tx.send(value.clone()).is_err() {
                to_remove.push(*id);
            }
        }
        for id in to_remove {
            inner.subscribers.remove(&id);
            trace!(feed = self.name, id, "Dropped closed subscription");
        }

        inner.last = Some(value);
        true
    }

    /// Subscribe to the feed. The latest value, if any, is delivered first.
    pub fn subscribe(&self) -> tokio_mpsc::UnboundedReceiver<T> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();

        if let Some(last) = inner.last.clone() {
            let _ = tx.send(last);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);
        rx
    }

    /// Subscribe as a `Stream`
    pub fn stream(&self) -> UnboundedReceiverStream<T> {
        UnboundedReceiverStream::new(self.subscribe())
    }

    pub fn latest(&self) -> Option<T> {
        self.inner.lock().unwrap().last.clone()
    }

    /// Number of subscribers that were alive at the last publish
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|_, tx| !tx.is_closed());
        inner.subscribers.len()
    }
}
