use std::mem::take;


/// A guard that undoes a subscription when dropped.
///
/// Returned by [`StateSynchronizer::subscribe`](crate::StateSynchronizer::subscribe)
/// and [`Topic::subscribe`](crate::Topic::subscribe). Unsubscribing is
/// idempotent by construction: the cleanup runs at most once, on drop.
#[derive(Default)]
#[must_use]
pub struct Subscription(RawSubscription);

impl Subscription {
    pub fn from_fn(f: impl FnOnce() + 'static) -> Self {
        Subscription(RawSubscription::Fn(Box::new(f)))
    }
}
impl Drop for Subscription {
    fn drop(&mut self) {
        match take(&mut self.0) {
            RawSubscription::Empty => {}
            RawSubscription::Fn(f) => f(),
        }
    }
}

#[derive(Default)]
enum RawSubscription {
    #[default]
    Empty,
    Fn(Box<dyn FnOnce() + 'static>),
}
