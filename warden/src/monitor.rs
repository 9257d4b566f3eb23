//! A minimal, single-process implementation of the external "Monitor
//! contract" spec.md §6 requires (`monitor_id`, `node_name`,
//! `has_failed_heartbeat`, `force_heartbeat_failure`, `is_active_monitor`).
//!
//! The real heartbeat registry spec.md §1 declares out of scope: a process
//! that periodically renews a liveness row elsewhere and tells peers when a
//! monitor id has gone dark. This crate only needs *something* that
//! satisfies [`warden_tasks::Monitor`] to run standalone (tests, the demo
//! binary, or a caller who supplies their own real heartbeat elsewhere and
//! just wants the flag-flip semantics). Grounded on
//! `reqactor::actor::Actor`'s `is_paused: Arc<AtomicBool>` — a single
//! shared flag flipped from one call and read from many.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use warden_tasks::Monitor;

/// A [`Monitor`] backed by one shared atomic flag: alive until
/// [`SimpleMonitor::force_heartbeat_failure`] is called (directly, or via
/// the `TaskContext::commit_checkpoint` lost-lock path), never automatically
/// recovering. A caller embedding a real heartbeat should implement
/// [`Monitor`] directly instead of using this type.
#[derive(Clone)]
pub struct SimpleMonitor {
    monitor_id: Arc<str>,
    node_name: Arc<str>,
    failed: Arc<AtomicBool>,
}

impl SimpleMonitor {
    pub fn new(monitor_id: impl Into<String>, node_name: impl Into<String>) -> Self {
        SimpleMonitor {
            monitor_id: Arc::from(monitor_id.into()),
            node_name: Arc::from(node_name.into()),
            failed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Monitor for SimpleMonitor {
    fn monitor_id(&self) -> &str {
        &self.monitor_id
    }

    fn node_name(&self) -> &str {
        &self.node_name
    }

    fn has_failed_heartbeat(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn force_heartbeat_failure(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    fn is_active_monitor(&self) -> bool {
        !self.has_failed_heartbeat()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_active_and_latches_failed() {
        let monitor = SimpleMonitor::new("m1", "node-a");
        assert!(monitor.is_active_monitor());
        monitor.force_heartbeat_failure();
        assert!(!monitor.is_active_monitor());
        assert!(monitor.has_failed_heartbeat());
    }
}
