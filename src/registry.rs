//! Logical subscription registry.
//!
//! The registry holds the canonical set of `(topic, handler)` registrations.
//! Registrations survive reconnects: the connection kernel re-attaches every
//! entry on each successful connect, and only the kernel reads or writes the
//! physical handle on an entry. Mutation and dispatch never observe a
//! half-updated entry; the map is guarded by a mutex held only for short
//! critical sections and never across an await point.

use std::{
    collections::{BTreeSet, HashMap},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use tracing::{error, trace};

/// Identifier of one logical registration.
pub(crate) type EntryId = u64;

/// Opaque handle to a live broker-side subscription.
///
/// Exists only while the entry is attached; its wire id is what the broker
/// echoes back in the `subscription` header of MESSAGE frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalHandle {
    wire_id: String,
}

impl PhysicalHandle {
    pub(crate) fn for_entry(id: EntryId) -> Self {
        PhysicalHandle {
            wire_id: format!("sub-{id}"),
        }
    }

    pub fn wire_id(&self) -> &str {
        &self.wire_id
    }
}

/// One inbound broker message, payload left opaque for the consumer.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Bytes,
}

/// Callback invoked per message on the registered topic.
pub type Handler = Arc<dyn Fn(&TopicMessage) + Send + Sync + 'static>;

struct Entry {
    topic: String,
    handler: Handler,
    physical: Option<PhysicalHandle>,
}

/// Canonical set of logical subscriptions.
pub(crate) struct SubscriptionRegistry {
    entries: Mutex<HashMap<EntryId, Entry>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        SubscriptionRegistry {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Records a new detached entry and returns its id.
    pub(crate) fn insert(&self, topic: String, handler: Handler) -> EntryId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries.insert(
            id,
            Entry {
                topic,
                handler,
                physical: None,
            },
        );
        id
    }

    /// Removes an entry, returning its physical handle for best-effort detach.
    ///
    /// After this returns no further messages reach the entry's handler, even
    /// if the wire-level detach is still in flight or fails.
    pub(crate) fn remove(&self, id: EntryId) -> Option<PhysicalHandle> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries.remove(&id).and_then(|entry| entry.physical)
    }

    pub(crate) fn topic_of(&self, id: EntryId) -> Option<String> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.get(&id).map(|entry| entry.topic.clone())
    }

    pub(crate) fn is_attached(&self, id: EntryId) -> bool {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .get(&id)
            .map(|entry| entry.physical.is_some())
            .unwrap_or(false)
    }

    /// Marks an entry attached. Returns the handle back if the entry was
    /// unsubscribed while the attach was in flight, so the caller can detach.
    pub(crate) fn set_attached(
        &self,
        id: EntryId,
        handle: PhysicalHandle,
    ) -> Result<(), PhysicalHandle> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        match entries.get_mut(&id) {
            Some(entry) => {
                entry.physical = Some(handle);
                Ok(())
            }
            None => Err(handle),
        }
    }

    /// Clears and returns the stale handle of one entry, if any.
    pub(crate) fn take_physical(&self, id: EntryId) -> Option<PhysicalHandle> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries.get_mut(&id).and_then(|entry| entry.physical.take())
    }

    /// Clears every physical handle; called whenever the connection drops.
    pub(crate) fn clear_attachments(&self) -> Vec<PhysicalHandle> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .values_mut()
            .filter_map(|entry| entry.physical.take())
            .collect()
    }

    /// Ids of all registered entries.
    pub(crate) fn ids(&self) -> BTreeSet<EntryId> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries.keys().copied().collect()
    }

    /// Ids of entries currently holding a physical handle.
    pub(crate) fn attached_ids(&self) -> BTreeSet<EntryId> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .iter()
            .filter(|(_, entry)| entry.physical.is_some())
            .map(|(id, _)| *id)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    /// Routes one inbound message to its handler(s).
    ///
    /// Routing is by wire subscription id when the broker echoes one (each
    /// physical subscription belongs to exactly one entry), falling back to
    /// topic equality. Handler panics are caught and logged; one broken
    /// consumer never affects siblings or the connection. Returns the number
    /// of handlers invoked.
    pub(crate) fn dispatch(&self, wire_id: Option<&str>, topic: &str, payload: Bytes) -> usize {
        let handlers: Vec<Handler> = {
            let entries = self.entries.lock().expect("registry lock poisoned");
            let by_wire_id: Vec<Handler> = wire_id
                .map(|wid| {
                    entries
                        .values()
                        .filter(|e| e.physical.as_ref().is_some_and(|h| h.wire_id() == wid))
                        .map(|e| Arc::clone(&e.handler))
                        .collect()
                })
                .unwrap_or_default();
            if by_wire_id.is_empty() {
                entries
                    .values()
                    .filter(|e| e.topic == topic)
                    .map(|e| Arc::clone(&e.handler))
                    .collect()
            } else {
                by_wire_id
            }
        };

        if handlers.is_empty() {
            trace!("No subscriber for message on topic {topic}");
            return 0;
        }

        let message = TopicMessage {
            topic: topic.to_string(),
            payload,
        };
        let mut delivered = 0;
        for handler in handlers {
            let result = catch_unwind(AssertUnwindSafe(|| handler(&message)));
            match result {
                Ok(()) => delivered += 1,
                Err(_) => error!("Subscription handler panicked on topic {topic}"),
            }
        }
        delivered
    }
}

/// Attach/detach plan computed from the current and desired attachment sets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct ReconcilePlan {
    /// Entries holding a handle that is no longer wanted (or is stale).
    pub detach: Vec<EntryId>,
    /// Entries that need a fresh physical subscription.
    pub attach: Vec<EntryId>,
}

/// Pure reconciliation step used by the reconnect sweep.
///
/// Given the set of entries currently holding a physical handle and the set of
/// entries that should be attached, yields the detaches and attaches that make
/// them equal. Idempotent: applying the plan and reconciling again yields an
/// empty plan.
pub(crate) fn reconcile(attached: &BTreeSet<EntryId>, desired: &BTreeSet<EntryId>) -> ReconcilePlan {
    ReconcilePlan {
        detach: attached.difference(desired).copied().collect(),
        attach: desired.difference(attached).copied().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn noop_handler() -> Handler {
        Arc::new(|_msg| {})
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = SubscriptionRegistry::new();
        let id = registry.insert("/topic/orders".into(), noop_handler());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.topic_of(id).as_deref(), Some("/topic/orders"));
        assert!(!registry.is_attached(id));

        assert!(registry.remove(id).is_none());
        assert_eq!(registry.len(), 0);
        // Second removal is a no-op.
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_remove_returns_live_handle() {
        let registry = SubscriptionRegistry::new();
        let id = registry.insert("/topic/routes".into(), noop_handler());
        registry
            .set_attached(id, PhysicalHandle::for_entry(id))
            .unwrap();

        let handle = registry.remove(id).expect("handle returned for detach");
        assert_eq!(handle.wire_id(), format!("sub-{id}"));
    }

    #[test]
    fn test_set_attached_after_unsubscribe_hands_handle_back() {
        let registry = SubscriptionRegistry::new();
        let id = registry.insert("/topic/drivers".into(), noop_handler());
        registry.remove(id);

        let handle = PhysicalHandle::for_entry(id);
        assert_eq!(registry.set_attached(id, handle.clone()), Err(handle));
    }

    #[test]
    fn test_clear_attachments() {
        let registry = SubscriptionRegistry::new();
        let a = registry.insert("/topic/a".into(), noop_handler());
        let b = registry.insert("/topic/b".into(), noop_handler());
        registry.set_attached(a, PhysicalHandle::for_entry(a)).unwrap();
        registry.set_attached(b, PhysicalHandle::for_entry(b)).unwrap();

        let cleared = registry.clear_attachments();
        assert_eq!(cleared.len(), 2);
        assert!(registry.attached_ids().is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_dispatch_by_wire_id() {
        let registry = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::channel();
        let id = registry.insert(
            "/topic/orders".into(),
            Arc::new(move |msg: &TopicMessage| {
                tx.send(msg.payload.clone()).unwrap();
            }),
        );
        registry
            .set_attached(id, PhysicalHandle::for_entry(id))
            .unwrap();

        let delivered = registry.dispatch(
            Some(&format!("sub-{id}")),
            "/topic/orders",
            Bytes::from_static(b"payload"),
        );
        assert_eq!(delivered, 1);
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_dispatch_falls_back_to_topic_match() {
        let registry = SubscriptionRegistry::new();
        let (tx, rx) = mpsc::channel();
        registry.insert(
            "/topic/vehicles".into(),
            Arc::new(move |_msg: &TopicMessage| {
                tx.send(()).unwrap();
            }),
        );

        // Entry is detached, so no wire id matches; topic routing applies.
        let delivered = registry.dispatch(Some("sub-999"), "/topic/vehicles", Bytes::new());
        assert_eq!(delivered, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_dispatch_isolates_panicking_handler() {
        let registry = SubscriptionRegistry::new();
        registry.insert(
            "/topic/orders".into(),
            Arc::new(|_msg: &TopicMessage| panic!("broken consumer")),
        );
        let (tx, rx) = mpsc::channel();
        registry.insert(
            "/topic/drivers".into(),
            Arc::new(move |_msg: &TopicMessage| {
                tx.send(()).unwrap();
            }),
        );

        assert_eq!(registry.dispatch(None, "/topic/orders", Bytes::new()), 0);
        // The sibling keeps receiving in later dispatch cycles.
        assert_eq!(registry.dispatch(None, "/topic/drivers", Bytes::new()), 1);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_dispatch_unknown_topic_is_noop() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(registry.dispatch(None, "/topic/unknown", Bytes::new()), 0);
    }

    #[test]
    fn test_reconcile_plan() {
        let attached: BTreeSet<EntryId> = [1, 2, 3].into_iter().collect();
        let desired: BTreeSet<EntryId> = [2, 3, 4, 5].into_iter().collect();

        let plan = reconcile(&attached, &desired);
        assert_eq!(plan.detach, vec![1]);
        assert_eq!(plan.attach, vec![4, 5]);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let attached: BTreeSet<EntryId> = [7, 9].into_iter().collect();
        let desired = attached.clone();
        assert_eq!(reconcile(&attached, &desired), ReconcilePlan::default());
    }

    #[test]
    fn test_reconcile_empty_desired_detaches_all() {
        let attached: BTreeSet<EntryId> = [1, 2].into_iter().collect();
        let plan = reconcile(&attached, &BTreeSet::new());
        assert_eq!(plan.detach, vec![1, 2]);
        assert!(plan.attach.is_empty());
    }
}
