use std::{
    cell::RefCell,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use derive_ex::derive_ex;
use futures::{
    channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender},
    Stream, StreamExt,
};
use slabmap::SlabMap;

use crate::Subscription;


/// A single-threaded broadcast channel: `publish` fans a value out to every
/// live subscriber stream.
///
/// This is the explicit replacement for observable fan-out: server-push
/// events (triggers, task status, variable requests) are published onto a
/// topic, and each consumer holds its own [`TopicStream`]. Dropping the
/// stream removes the subscriber; there is no buffering for subscribers
/// that do not yet exist.
#[derive_ex(Clone, Default, bound())]
pub struct Topic<T>(Rc<RefCell<SlabMap<UnboundedSender<T>>>>);

impl<T: Clone + 'static> Topic<T> {
    pub fn new() -> Self {
        Topic(Rc::new(RefCell::new(SlabMap::new())))
    }

    /// Delivers `value` to every current subscriber, in subscription order.
    ///
    /// Values queue unboundedly in each subscriber's channel until polled;
    /// a subscriber that was dropped without unsubscribing is skipped.
    pub fn publish(&self, value: T) {
        let senders: Vec<UnboundedSender<T>> = self.0.borrow().values().cloned().collect();
        for sender in senders {
            // A closed receiver just means the stream guard has not been
            // dropped yet; the slot is reclaimed when it is.
            let _ = sender.unbounded_send(value.clone());
        }
    }

    pub fn subscribe(&self) -> TopicStream<T> {
        let (tx, rx) = unbounded();
        let slot = self.0.borrow_mut().insert(tx);
        let topics = Rc::downgrade(&self.0);
        let guard = Subscription::from_fn(move || {
            if let Some(topics) = topics.upgrade() {
                topics.borrow_mut().remove(slot);
            }
        });
        TopicStream { rx, _guard: guard }
    }

    pub fn subscriber_count(&self) -> usize {
        self.0.borrow().len()
    }
}

/// A stream of values published to a [`Topic`] after subscription.
/// Dropping it unsubscribes.
pub struct TopicStream<T> {
    rx: UnboundedReceiver<T>,
    _guard: Subscription,
}

impl<T> Stream for TopicStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}
