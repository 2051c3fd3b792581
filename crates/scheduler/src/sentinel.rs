//! The condvar the core thread blocks on between cycles.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Tracks the Registrar's global available-task total and wakes waiters
/// when it transitions from zero to positive.
pub struct Sentinel {
    total: Mutex<usize>,
    condvar: Condvar,
}

impl Default for Sentinel {
    fn default() -> Self {
        Self::new()
    }
}

impl Sentinel {
    pub fn new() -> Self {
        Self {
            total: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    pub fn notify_available(&self, count: usize) {
        if count == 0 {
            return;
        }

        let mut total = self.total.lock();
        *total += count;
        self.condvar.notify_all();
    }

    pub fn consume(&self, count: usize) {
        if count == 0 {
            return;
        }

        let mut total = self.total.lock();
        *total = total.saturating_sub(count);
    }

    pub fn total(&self) -> usize {
        *self.total.lock()
    }

    /// Blocks until the total is positive or `timeout` elapses. Returns
    /// whether work was observed available.
    pub fn wait_for_task(&self, timeout: Duration) -> bool {
        let mut total = self.total.lock();
        if *total > 0 {
            return true;
        }

        let result = self.condvar.wait_for(&mut total, timeout);
        !result.timed_out() && *total > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_immediately_when_already_positive() {
        let sentinel = Sentinel::new();
        sentinel.notify_available(1);
        assert!(sentinel.wait_for_task(Duration::from_millis(10)));
    }

    #[test]
    fn wait_times_out_with_no_work() {
        let sentinel = Sentinel::new();
        assert!(!sentinel.wait_for_task(Duration::from_millis(5)));
    }

    #[test]
    fn consume_floors_at_zero() {
        let sentinel = Sentinel::new();
        sentinel.notify_available(1);
        sentinel.consume(5);
        assert_eq!(sentinel.total(), 0);
    }
}
