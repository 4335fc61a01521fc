//! Change observation
//!
//! Write transactions accumulate an ordered touch set; after a commit is
//! durable, every registered observer receives the touched entities in
//! enqueue order. One mutex is the single serialization point: registry
//! mutation and delivery never interleave.

use parking_lot::Mutex;
use std::sync::Arc;

/// One entry of a write transaction's touch set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Touch {
    pub kind: String,
    pub id: i64,
    pub should_reindex: bool,
}

/// In-process listener for committed changes.
///
/// Callbacks run on the committing thread (or the watcher thread for
/// external changes) while the registry lock is held; they must not
/// mutate the registry and should hand heavy work off elsewhere.
pub trait ChangeObserver: Send + Sync {
    /// Called once per touched entity after a local write commits.
    fn entity_did_change(&self, kind: &str, id: i64);

    /// Called when a sibling process reports a write. No entity detail is
    /// available; anything cached since the last read may be stale.
    fn did_change_externally(&self) {}
}

/// Interface of the external search-index collaborator. Entities touched
/// with the reindex flag are handed here after observer delivery.
pub trait ReindexSink: Send + Sync {
    fn reindex_entity(&self, kind: &str, id: i64);
}

/// Handle returned by [`ObserverRegistry::append`]; used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

struct Registered {
    subscription: Subscription,
    observer: Arc<dyn ChangeObserver>,
}

#[derive(Default)]
struct Inner {
    observers: Vec<Registered>,
    reindex_sink: Option<Arc<dyn ReindexSink>>,
    next_subscription: u64,
}

#[derive(Default)]
pub struct ObserverRegistry {
    inner: Mutex<Inner>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer. Delivery order is registration order.
    pub fn append(&self, observer: Arc<dyn ChangeObserver>) -> Subscription {
        let mut inner = self.inner.lock();
        let subscription = Subscription(inner.next_subscription);
        inner.next_subscription += 1;
        inner.observers.push(Registered {
            subscription,
            observer,
        });
        subscription
    }

    pub fn remove(&self, subscription: Subscription) {
        self.inner
            .lock()
            .observers
            .retain(|registered| registered.subscription != subscription);
    }

    pub fn set_reindex_sink(&self, sink: Arc<dyn ReindexSink>) {
        self.inner.lock().reindex_sink = Some(sink);
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Delivers a committed touch set: every observer sees each entity in
    /// enqueue order, then reindex-flagged entities go to the sink.
    pub(crate) fn notify_committed(&self, touches: &[Touch]) {
        let inner = self.inner.lock();
        for touch in touches {
            for registered in &inner.observers {
                registered.observer.entity_did_change(&touch.kind, touch.id);
            }
            if touch.should_reindex {
                if let Some(sink) = &inner.reindex_sink {
                    sink.reindex_entity(&touch.kind, touch.id);
                }
            }
        }
    }

    /// Fans an external-write signal out to every observer, as if a local
    /// write had invalidated everything since the last known state.
    pub fn notify_external(&self) {
        let inner = self.inner.lock();
        for registered in &inner.observers {
            registered.observer.did_change_externally();
        }
    }
}
