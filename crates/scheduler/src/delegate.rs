//! A component's registered execution unit within the scheduler.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use ahash::AHashSet;

use crate::sentinel::Sentinel;

/// A stable identifier derived from a component's name, independent of
/// ahash's per-process random seed so the same name always maps to the
/// same identifier, including across a restart.
pub fn identifier_for(name: &str) -> u64 {
    // FNV-1a.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in name.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// A component's registered task-runner. `available_tasks` is incremented
/// by producers (including off-thread, e.g. the TaskService's submission
/// queue) and decremented by the core thread after each `run`.
pub struct Delegate {
    identifier: u64,
    dependencies: AHashSet<u64>,
    available_tasks: AtomicUsize,
    /// Set by delegates whose readiness isn't purely counter-driven, e.g.
    /// the TaskService while it holds live interval tasks: it must be
    /// considered ready every cycle to check interval cadence even with an
    /// empty one-shot queue.
    always_ready: AtomicBool,
    sentinel: Weak<Sentinel>,
    execute: Box<dyn Fn(u64) -> usize + Send + Sync>,
}

impl Delegate {
    pub fn new(
        identifier: u64,
        dependencies: AHashSet<u64>,
        sentinel: Weak<Sentinel>,
        execute: impl Fn(u64) -> usize + Send + Sync + 'static,
    ) -> Self {
        Self {
            identifier,
            dependencies,
            available_tasks: AtomicUsize::new(0),
            always_ready: AtomicBool::new(false),
            sentinel,
            execute: Box::new(execute),
        }
    }

    pub fn identifier(&self) -> u64 {
        self.identifier
    }

    pub fn dependencies(&self) -> &AHashSet<u64> {
        &self.dependencies
    }

    pub fn is_ready(&self) -> bool {
        self.always_ready.load(Ordering::Relaxed) || self.available_tasks.load(Ordering::Relaxed) > 0
    }

    pub fn set_always_ready(&self, value: bool) {
        self.always_ready.store(value, Ordering::Relaxed);
    }

    pub fn available_tasks(&self) -> usize {
        self.available_tasks.load(Ordering::Relaxed)
    }

    /// Record `count` newly available tasks and wake the Registrar's
    /// Sentinel if it is currently blocked.
    pub fn notify(&self, count: usize) {
        if count == 0 {
            return;
        }

        self.available_tasks.fetch_add(count, Ordering::Relaxed);
        if let Some(sentinel) = self.sentinel.upgrade() {
            sentinel.notify_available(count);
        }
    }

    /// Invoke the execute callback for `frame` and decrement the available
    /// counter by the reported executed count.
    pub fn run(&self, frame: u64) -> usize {
        let executed = (self.execute)(frame);
        if executed > 0 {
            let _ = self.available_tasks.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(executed))
            });
        }

        executed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn identifier_for_is_stable_for_the_same_name() {
        assert_eq!(identifier_for("peer_manager"), identifier_for("peer_manager"));
        assert_ne!(identifier_for("peer_manager"), identifier_for("router"));
    }

    #[test]
    fn notify_then_run_consumes_the_available_counter() {
        let calls = Arc::new(StdAtomicUsize::new(0));
        let calls_in_closure = calls.clone();

        let delegate = Delegate::new(1, AHashSet::default(), Weak::new(), move |_frame| {
            calls_in_closure.fetch_add(1, Ordering::Relaxed);
            1
        });

        assert!(!delegate.is_ready());
        delegate.notify(1);
        assert!(delegate.is_ready());

        let executed = delegate.run(0);
        assert_eq!(executed, 1);
        assert!(!delegate.is_ready());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn always_ready_overrides_empty_counter() {
        let delegate = Delegate::new(1, AHashSet::default(), Weak::new(), |_| 0);
        assert!(!delegate.is_ready());
        delegate.set_always_ready(true);
        assert!(delegate.is_ready());
    }
}
