use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    rc::Rc,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slabmap::SlabMap;

use crate::Subscription;


/// One broadcast message of the synchronizer, tagged on the wire as
/// `initial` (seeded at registration) or `update` (every later write).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VariableUpdate {
    Initial {
        value: Value,
    },
    Update {
        value: Value,
        #[serde(rename = "oldValue")]
        old_value: Value,
        #[serde(rename = "nodeKey", default, skip_serializing_if = "Option::is_none")]
        node_key: Option<String>,
        #[serde(rename = "isReset", default)]
        is_reset: bool,
    },
}

impl VariableUpdate {
    pub fn update(value: Value, old_value: Value) -> Self {
        VariableUpdate::Update {
            value,
            old_value,
            node_key: None,
            is_reset: false,
        }
    }

    pub fn reset(value: Value, old_value: Value) -> Self {
        VariableUpdate::Update {
            value,
            old_value,
            node_key: None,
            is_reset: true,
        }
    }

    pub fn value(&self) -> &Value {
        match self {
            VariableUpdate::Initial { value } => value,
            VariableUpdate::Update { value, .. } => value,
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            VariableUpdate::Initial { value } => value,
            VariableUpdate::Update { value, .. } => value,
        }
    }
}

/// Keyed broadcaster reconciling independent state instances that refer to
/// the same logical variable.
///
/// Every key holds the latest [`VariableUpdate`], replayed synchronously to
/// each new subscriber before any later update (behavior-subject contract).
/// Keys are created lazily and deleted when their last subscriber
/// unsubscribes, so the registry does not grow across mount/unmount cycles.
///
/// This is an explicit service object, not a global: construct one per
/// session and pass clones of the handle to every consumer. Tests construct
/// a fresh instance instead of resetting shared state.
#[derive(Clone, Default)]
pub struct StateSynchronizer(Rc<SyncState>);

#[derive(Default)]
struct SyncState {
    entries: RefCell<HashMap<String, Entry>>,
    // Updates issued while a dispatch is running are queued here and
    // flushed after the current dispatch, preserving global notify order.
    queue: RefCell<VecDeque<(String, VariableUpdate)>>,
    dispatching: Cell<bool>,
}

struct Entry {
    last: VariableUpdate,
    subscribers: SlabMap<Rc<dyn Fn(&VariableUpdate)>>,
}

impl Entry {
    fn new(default: Value) -> Self {
        Entry {
            last: VariableUpdate::Initial { value: default },
            subscribers: SlabMap::new(),
        }
    }
}

impl StateSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `key` with an `initial` update. Idempotent: later calls for a
    /// registered key are no-ops.
    pub fn register(&self, key: &str, default: Value) {
        let mut entries = self.0.entries.borrow_mut();
        entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(default));
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.0.entries.borrow().contains_key(key)
    }

    /// The latest broadcast update for `key`, without subscribing.
    pub fn current(&self, key: &str) -> Option<VariableUpdate> {
        self.0.entries.borrow().get(key).map(|e| e.last.clone())
    }

    /// Attaches `on_update` to `key`, replaying the current update
    /// synchronously before returning. An unregistered key is registered
    /// with a null default first.
    ///
    /// Dropping the returned guard detaches the callback; when the last
    /// subscriber for a key detaches, the key is removed from the registry.
    pub fn subscribe(
        &self,
        key: &str,
        on_update: impl Fn(&VariableUpdate) + 'static,
    ) -> Subscription {
        let cb: Rc<dyn Fn(&VariableUpdate)> = Rc::new(on_update);
        let (slot, replay) = {
            let mut entries = self.0.entries.borrow_mut();
            let entry = entries.entry(key.to_string()).or_insert_with(|| {
                tracing::warn!(key, "subscribe before register; seeding with null");
                Entry::new(Value::Null)
            });
            (entry.subscribers.insert(cb.clone()), entry.last.clone())
        };
        cb(&replay);

        let state = Rc::downgrade(&self.0);
        let key = key.to_string();
        Subscription::from_fn(move || {
            let Some(state) = state.upgrade() else {
                return;
            };
            let mut entries = state.entries.borrow_mut();
            if let Some(entry) = entries.get_mut(&key) {
                entry.subscribers.remove(slot);
                if entry.subscribers.is_empty() {
                    tracing::debug!(key, "last subscriber gone; dropping key");
                    entries.remove(&key);
                }
            }
        })
    }

    /// Stores `update` as the latest value for `key` and delivers it
    /// synchronously to a snapshot of the current subscribers, in
    /// subscription order. An unregistered key is registered first.
    ///
    /// A `notify` issued from inside a subscriber callback does not nest:
    /// it is queued and delivered after the current dispatch completes.
    pub fn notify(&self, key: &str, update: VariableUpdate) {
        self.register(key, Value::Null);
        self.0
            .queue
            .borrow_mut()
            .push_back((key.to_string(), update));
        if self.0.dispatching.get() {
            return;
        }
        self.0.dispatching.set(true);
        loop {
            let next = self.0.queue.borrow_mut().pop_front();
            let Some((key, update)) = next else {
                break;
            };
            let subscribers: Vec<Rc<dyn Fn(&VariableUpdate)>> = {
                let mut entries = self.0.entries.borrow_mut();
                match entries.get_mut(&key) {
                    Some(entry) => {
                        entry.last = update.clone();
                        entry.subscribers.values().cloned().collect()
                    }
                    // Key dropped while the update was queued.
                    None => Vec::new(),
                }
            };
            for cb in subscribers {
                cb(&update);
            }
        }
        self.0.dispatching.set(false);
    }
}
