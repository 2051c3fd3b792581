//! A special delegate accepting ad-hoc one-shot and interval tasks,
//! submittable from off the core thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::delegate::{Delegate, identifier_for};
use crate::sentinel::Sentinel;

type OneShot = Box<dyn FnMut() + Send>;

struct IntervalTask {
    interval_frames: u64,
    callback: Mutex<Box<dyn FnMut() + Send>>,
}

/// One-shot tasks are consumed the next cycle they are ready; interval
/// tasks fire whenever the current frame number modulo their interval is
/// zero. The submission queue is guarded by a mutex, held only across
/// push/pop, so off-thread callers never block the core thread for long.
pub struct TaskService {
    one_shot: Mutex<VecDeque<OneShot>>,
    intervals: Mutex<Vec<IntervalTask>>,
    next_interval_id: AtomicU64,
}

impl Default for TaskService {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskService {
    pub fn new() -> Self {
        Self {
            one_shot: Mutex::new(VecDeque::new()),
            intervals: Mutex::new(Vec::new()),
            next_interval_id: AtomicU64::new(0),
        }
    }

    /// Submit a one-shot task from any thread. `delegate` is the Delegate
    /// this TaskService was wrapped into; its counter is notified so the
    /// Registrar's Sentinel wakes.
    pub fn submit_one_shot(&self, delegate: &Delegate, task: impl FnMut() + Send + 'static) {
        self.one_shot.lock().push_back(Box::new(task));
        delegate.notify(1);
    }

    /// Register a recurring task fired every `interval_frames` cycles.
    /// Requires `delegate.set_always_ready(true)` to have been called once
    /// at least one interval task exists, since interval cadence is driven
    /// by the frame counter rather than the available-task counter.
    pub fn submit_interval(&self, delegate: &Delegate, interval_frames: u64, task: impl FnMut() + Send + 'static) -> u64 {
        let id = self.next_interval_id.fetch_add(1, Ordering::Relaxed);
        self.intervals.lock().push(IntervalTask {
            interval_frames,
            callback: Mutex::new(Box::new(task)),
        });
        delegate.set_always_ready(true);
        id
    }

    pub fn pending_one_shot(&self) -> usize {
        self.one_shot.lock().len()
    }

    pub fn interval_count(&self) -> usize {
        self.intervals.lock().len()
    }

    /// Drains every queued one-shot task, then fires every interval task
    /// whose cadence matches `frame`. Returns the total executed count.
    pub fn execute_cycle(&self, frame: u64) -> usize {
        let mut executed = 0;

        loop {
            let next = self.one_shot.lock().pop_front();
            match next {
                Some(mut task) => {
                    task();
                    executed += 1;
                }
                None => break,
            }
        }

        for task in self.intervals.lock().iter() {
            if task.interval_frames != 0 && frame % task.interval_frames == 0 {
                (task.callback.lock())();
                executed += 1;
            }
        }

        executed
    }

    /// Wrap `self` into a Delegate the Registrar can schedule.
    pub fn into_delegate(self: &Arc<Self>, sentinel: std::sync::Weak<Sentinel>) -> Arc<Delegate> {
        let service = self.clone();
        Arc::new(Delegate::new(
            identifier_for("task_service"),
            ahash::AHashSet::default(),
            sentinel,
            move |frame| service.execute_cycle(frame),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn one_shot_task_runs_exactly_once() {
        let service = Arc::new(TaskService::new());
        let delegate = service.into_delegate(std::sync::Weak::new());

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_closure = ran.clone();
        service.submit_one_shot(&delegate, move || {
            ran_in_closure.fetch_add(1, Ordering::Relaxed);
        });

        assert!(delegate.is_ready());
        assert_eq!(delegate.run(0), 1);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        assert_eq!(service.pending_one_shot(), 0);
    }

    #[test]
    fn interval_task_fires_on_cadence() {
        let service = Arc::new(TaskService::new());
        let delegate = service.into_delegate(std::sync::Weak::new());

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_closure = ran.clone();
        service.submit_interval(&delegate, 4, move || {
            ran_in_closure.fetch_add(1, Ordering::Relaxed);
        });

        assert!(delegate.is_ready());
        assert_eq!(delegate.run(1), 0);
        assert_eq!(delegate.run(4), 1);
        assert_eq!(delegate.run(8), 1);
        assert_eq!(ran.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn submission_from_off_thread_notifies_the_sentinel() {
        let sentinel = Arc::new(Sentinel::new());
        let service = Arc::new(TaskService::new());
        let delegate = service.into_delegate(Arc::downgrade(&sentinel));

        let handle = std::thread::spawn({
            let service = service.clone();
            let delegate = delegate.clone();
            move || service.submit_one_shot(&delegate, || {})
        });
        handle.join().unwrap();

        assert!(sentinel.wait_for_task(std::time::Duration::from_millis(50)));
    }
}
