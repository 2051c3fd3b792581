//! Resolves delegate dependencies into a priority order and drives the
//! per-cycle `Execute()` that the core thread calls in a loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use parking_lot::RwLock;

use crate::delegate::Delegate;
use crate::sentinel::Sentinel;

#[derive(Debug, PartialEq, Eq)]
pub enum SchedulerError {
    DependencyCycle,
}

/// Owns every registered delegate and the order `Execute()` calls them in.
/// One instance per core thread.
pub struct Registrar {
    delegates: RwLock<AHashMap<u64, Arc<Delegate>>>,
    resolved: RwLock<AHashMap<u64, AHashSet<u64>>>,
    priorities: RwLock<AHashMap<u64, usize>>,
    order: RwLock<Vec<u64>>,
    sentinel: Arc<Sentinel>,
    frame: AtomicU64,
}

impl Default for Registrar {
    fn default() -> Self {
        Self::new()
    }
}

impl Registrar {
    pub fn new() -> Self {
        Self {
            delegates: RwLock::new(AHashMap::default()),
            resolved: RwLock::new(AHashMap::default()),
            priorities: RwLock::new(AHashMap::default()),
            order: RwLock::new(Vec::new()),
            sentinel: Arc::new(Sentinel::new()),
            frame: AtomicU64::new(0),
        }
    }

    pub fn sentinel(&self) -> Arc<Sentinel> {
        self.sentinel.clone()
    }

    /// Registers a delegate. Does not recompute priority order; call
    /// `initialize()` once every delegate is registered.
    pub fn register(&self, delegate: Arc<Delegate>) {
        self.delegates.write().insert(delegate.identifier(), delegate);
    }

    /// Removes a delegate; its counter is subtracted from the Sentinel's
    /// global total so a stale signal can't spin the core thread. Its
    /// identifier may be re-registered later (e.g. during restart), but the
    /// priority order must be recomputed via `initialize()` again first.
    pub fn delist(&self, identifier: u64) {
        if let Some(delegate) = self.delegates.write().remove(&identifier) {
            self.sentinel.consume(delegate.available_tasks());
        }

        self.resolved.write().remove(&identifier);
        self.priorities.write().remove(&identifier);
        self.order.write().retain(|id| *id != identifier);
    }

    pub fn get(&self, identifier: u64) -> Option<Arc<Delegate>> {
        self.delegates.read().get(&identifier).cloned()
    }

    pub fn priority_of(&self, identifier: u64) -> Option<usize> {
        self.priorities.read().get(&identifier).copied()
    }

    /// Resolve dependencies via DFS (detecting cycles) and compute each
    /// delegate's priority via Kahn's algorithm so delegates with no
    /// dependencies execute first.
    pub fn initialize(&self) -> Result<(), SchedulerError> {
        let delegates = self.delegates.read();
        let ids: Vec<u64> = delegates.keys().copied().collect();

        let mut resolved_all: AHashMap<u64, AHashSet<u64>> = AHashMap::default();
        for &id in &ids {
            let mut visiting = AHashSet::default();
            let mut resolved = AHashSet::default();
            resolve_transitive(id, &delegates, &mut visiting, &mut resolved)?;
            resolved_all.insert(id, resolved);
        }

        let mut in_degree: AHashMap<u64, usize> = ids.iter().map(|&id| (id, 0)).collect();
        let mut dependents: AHashMap<u64, Vec<u64>> = AHashMap::default();

        for &id in &ids {
            let delegate = &delegates[&id];
            for &dependency in delegate.dependencies() {
                if delegates.contains_key(&dependency) {
                    *in_degree.get_mut(&id).expect("id is registered") += 1;
                    dependents.entry(dependency).or_default().push(id);
                }
            }
        }

        let mut ready: VecDeque<u64> = ids
            .iter()
            .copied()
            .filter(|id| in_degree[id] == 0)
            .collect();
        // Deterministic ordering among equally-ready delegates.
        ready.make_contiguous().sort_unstable();

        let mut order = Vec::with_capacity(ids.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);

            if let Some(dependents_of_id) = dependents.get(&id) {
                let mut newly_ready = Vec::new();
                for &dependent in dependents_of_id {
                    let degree = in_degree.get_mut(&dependent).expect("dependent is registered");
                    *degree -= 1;
                    if *degree == 0 {
                        newly_ready.push(dependent);
                    }
                }
                newly_ready.sort_unstable();
                for id in newly_ready {
                    ready.push_back(id);
                }
            }
        }

        if order.len() != ids.len() {
            // Defense in depth: the DFS pass above should already have
            // caught any cycle.
            return Err(SchedulerError::DependencyCycle);
        }

        let total = order.len();
        let priorities: AHashMap<u64, usize> = order
            .iter()
            .enumerate()
            .map(|(index, &id)| (id, total - index))
            .collect();

        drop(delegates);

        *self.resolved.write() = resolved_all;
        *self.priorities.write() = priorities;
        *self.order.write() = order;

        Ok(())
    }

    /// Runs each ready delegate, in priority order, exactly once. Returns
    /// the total executed-task count across all delegates this cycle.
    pub fn execute(&self) -> usize {
        let frame = self.frame.fetch_add(1, Ordering::Relaxed);
        let order = self.order.read();
        let delegates = self.delegates.read();

        let mut total = 0;
        for identifier in order.iter() {
            let Some(delegate) = delegates.get(identifier) else {
                continue;
            };

            if delegate.is_ready() {
                let executed = delegate.run(frame);
                total += executed;
                self.sentinel.consume(executed);
            }
        }

        total
    }

    /// Blocks the calling (core) thread until new work arrives or `timeout`
    /// elapses.
    pub fn await_task(&self, timeout: Duration) -> bool {
        self.sentinel.wait_for_task(timeout)
    }

    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }
}

fn resolve_transitive(
    id: u64,
    delegates: &AHashMap<u64, Arc<Delegate>>,
    visiting: &mut AHashSet<u64>,
    resolved: &mut AHashSet<u64>,
) -> Result<(), SchedulerError> {
    if visiting.contains(&id) {
        return Err(SchedulerError::DependencyCycle);
    }

    let Some(delegate) = delegates.get(&id) else {
        return Ok(());
    };

    visiting.insert(id);
    for &dependency in delegate.dependencies() {
        resolved.insert(dependency);
        resolve_transitive(dependency, delegates, visiting, resolved)?;
    }
    visiting.remove(&id);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn leaf(id: u64, registrar: &Registrar) -> Arc<Delegate> {
        let delegate = Arc::new(Delegate::new(id, AHashSet::default(), Arc::downgrade(&registrar.sentinel()), |_| 1));
        delegate.notify(1);
        delegate
    }

    fn dependent(id: u64, deps: &[u64], registrar: &Registrar) -> Arc<Delegate> {
        let mut dependencies = AHashSet::default();
        for &d in deps {
            dependencies.insert(d);
        }
        let delegate = Arc::new(Delegate::new(id, dependencies, Arc::downgrade(&registrar.sentinel()), |_| 1));
        delegate.notify(1);
        delegate
    }

    #[test]
    fn priority_order_matches_dependency_chain() {
        let registrar = Registrar::new();
        let i = leaf(1, &registrar);
        let g = dependent(2, &[1], &registrar);
        let a = dependent(3, &[2], &registrar);
        let b = dependent(4, &[3, 2], &registrar);

        registrar.register(i);
        registrar.register(g);
        registrar.register(a);
        registrar.register(b);
        registrar.initialize().unwrap();

        let order = registrar.order.read().clone();
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert!(registrar.priority_of(1).unwrap() > registrar.priority_of(2).unwrap());
        assert!(registrar.priority_of(2).unwrap() > registrar.priority_of(3).unwrap());
        assert!(registrar.priority_of(3).unwrap() > registrar.priority_of(4).unwrap());
    }

    #[test]
    fn cycle_is_rejected() {
        let registrar = Registrar::new();
        let a = dependent(1, &[2], &registrar);
        let b = dependent(2, &[1], &registrar);

        registrar.register(a);
        registrar.register(b);

        assert_eq!(registrar.initialize(), Err(SchedulerError::DependencyCycle));
    }

    #[test]
    fn unknown_dependency_identifiers_do_not_block_ordering() {
        let registrar = Registrar::new();
        let solo = dependent(1, &[0xdead_beef], &registrar);
        registrar.register(solo);
        assert!(registrar.initialize().is_ok());
        assert_eq!(registrar.order.read().clone(), vec![1]);
    }

    #[test]
    fn execute_runs_each_ready_delegate_once_per_cycle() {
        let registrar = Registrar::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_closure = calls.clone();

        let delegate = Arc::new(Delegate::new(1, AHashSet::default(), Arc::downgrade(&registrar.sentinel()), move |_frame| {
            calls_in_closure.fetch_add(1, Ordering::Relaxed);
            1
        }));
        delegate.notify(1);

        registrar.register(delegate);
        registrar.initialize().unwrap();

        assert_eq!(registrar.execute(), 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        // No new work notified; the next cycle should run nothing.
        assert_eq!(registrar.execute(), 0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn delist_subtracts_available_counter_from_sentinel_total() {
        let registrar = Registrar::new();
        let delegate = Arc::new(Delegate::new(1, AHashSet::default(), Arc::downgrade(&registrar.sentinel()), |_| 0));
        delegate.notify(3);
        registrar.register(delegate);

        assert_eq!(registrar.sentinel().total(), 3);
        registrar.delist(1);
        assert_eq!(registrar.sentinel().total(), 0);
        assert!(registrar.get(1).is_none());
    }
}
