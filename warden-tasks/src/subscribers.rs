//! Terminal-state subscribers (spec.md §4.5 "Terminal subscribers",
//! §4.8 `addOnTerminalState`/`removeOnTerminalState`): callbacks invoked
//! once a task's finalize step has persisted a terminal snapshot.
//! Subscriber panics are swallowed (logged only) so one bad callback never
//! takes down a finalize in progress, grounded on
//! `pipeline/harness/src/lib.rs`'s `catch_unwind(AssertUnwindSafe(...))`
//! use around user-supplied test bodies.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::model::TaskSnapshot;

/// A caller-supplied callback invoked with the finalized snapshot of every
/// task that reaches a terminal state (spec.md §4.5).
pub trait TerminalSubscriber: Send + Sync {
    fn on_terminal(&self, snapshot: &TaskSnapshot);
}

/// An opaque handle returned by [`SubscriberRegistry::add`], used to
/// unregister via [`SubscriberRegistry::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// The concrete, `Arc`-shared registry of terminal-state subscribers a
/// [`crate::machine::TaskEngine`] notifies from its finalize step. Owned by
/// the engine, but exposed so the facade crate (component C8) can add and
/// remove subscribers without reaching into the engine's internals.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn TerminalSubscriber>)>>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        SubscriberRegistry::default()
    }

    pub fn add(&self, subscriber: Arc<dyn TerminalSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers.write().expect("subscriber registry lock poisoned").push((id, subscriber));
        id
    }

    pub fn remove(&self, id: SubscriptionId) {
        self.subscribers.write().expect("subscriber registry lock poisoned").retain(|(sid, _)| *sid != id);
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().expect("subscriber registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every registered subscriber with `snapshot` (spec.md §4.5:
    /// "swallow subscriber exceptions (logged only)").
    pub fn notify_all(&self, snapshot: &TaskSnapshot) {
        let subscribers: Vec<_> =
            self.subscribers.read().expect("subscriber registry lock poisoned").iter().map(|(_, s)| s.clone()).collect();
        for subscriber in subscribers {
            let snapshot = AssertUnwindSafe(snapshot);
            if let Err(panic) = catch_unwind(move || subscriber.on_terminal(&snapshot)) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(error = %message, task_id = %snapshot.0.task.task_id, "terminal-state subscriber panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskSnapshot;
    use std::sync::atomic::AtomicUsize;
    use warden_lib::{TaskId, TaskState};

    fn sample_snapshot() -> TaskSnapshot {
        TaskSnapshot::new(crate::model::TaskInfo {
            task_id: TaskId::from(1),
            entity_type: "echo".into(),
            entity_id: "e1".into(),
            task_state: TaskState::Success,
            monitor_id: crate::model::MonitorSlot::None,
            lock_ids: vec![],
            prerequisite_task_ids: vec![],
            any_prerequisite: false,
            checkpoint_data: vec![],
            update_data: None,
            start_time: Some(0),
            end_time: Some(1),
            run_count: 1,
            requeues: 0,
            milliseconds_remaining: None,
            canceled_by: None,
            error_message: None,
            error_stack_trace: None,
            error_id: None,
        })
    }

    struct CountingSubscriber(Arc<AtomicUsize>);

    impl TerminalSubscriber for CountingSubscriber {
        fn on_terminal(&self, _snapshot: &TaskSnapshot) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingSubscriber;

    impl TerminalSubscriber for PanickingSubscriber {
        fn on_terminal(&self, _snapshot: &TaskSnapshot) {
            panic!("boom");
        }
    }

    #[test]
    fn notifies_every_registered_subscriber() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.add(Arc::new(CountingSubscriber(count.clone())));
        registry.add(Arc::new(CountingSubscriber(count.clone())));

        registry.notify_all(&sample_snapshot());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_subscriber_is_not_notified() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = registry.add(Arc::new(CountingSubscriber(count.clone())));
        registry.remove(id);

        registry.notify_all(&sample_snapshot());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn a_panicking_subscriber_does_not_block_the_rest() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry.add(Arc::new(PanickingSubscriber));
        registry.add(Arc::new(CountingSubscriber(count.clone())));

        registry.notify_all(&sample_snapshot());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
