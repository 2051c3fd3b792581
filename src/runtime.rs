//! Runtime Policy: drives the Registrar's cycle on either the calling
//! thread (`Foreground`) or a spawned worker thread (`Background`).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scheduler::Registrar;

use crate::observer::RuntimeStopCause;

const AWAIT_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionToken {
    Standby,
    Requested,
    ThreadSpawned,
    Running,
    Error(String),
}

/// Implemented by the node core; invoked once the run loop exits.
pub trait RuntimeCore: Send + Sync {
    fn on_runtime_stopped(&self, cause: RuntimeStopCause);
}

/// Cooperative stop flag shared between the policy and its run loop. A
/// plain `AtomicU8` rather than a lock since the only transition the
/// caller drives is "ask it to stop"; the loop itself owns `ExecutionToken`.
struct StopFlag(AtomicU8);

impl StopFlag {
    const RUN: u8 = 0;
    const STOP: u8 = 1;

    fn new() -> Self {
        Self(AtomicU8::new(Self::RUN))
    }

    fn request_stop(&self) {
        self.0.store(Self::STOP, Ordering::Relaxed);
    }

    fn should_stop(&self) -> bool {
        self.0.load(Ordering::Relaxed) == Self::STOP
    }
}

fn run_loop(registrar: &Registrar, stop: &StopFlag) {
    loop {
        registrar.execute();

        if stop.should_stop() {
            break;
        }

        registrar.await_task(AWAIT_TIMEOUT);

        if stop.should_stop() {
            break;
        }
    }
}

/// Runs the scheduler on the calling thread until stopped.
pub struct Foreground {
    registrar: Arc<Registrar>,
    stop: Arc<StopFlag>,
    token: Mutex<ExecutionToken>,
}

impl Foreground {
    pub fn new(registrar: Arc<Registrar>) -> Self {
        Self {
            registrar,
            stop: Arc::new(StopFlag::new()),
            token: Mutex::new(ExecutionToken::Standby),
        }
    }

    pub fn token(&self) -> ExecutionToken {
        self.token.lock().clone()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Blocks the calling thread, running the scheduler until a stop is
    /// requested, then invokes `core.on_runtime_stopped`.
    pub fn start(&self, core: &dyn RuntimeCore) {
        *self.token.lock() = ExecutionToken::Running;
        run_loop(&self.registrar, &self.stop);
        *self.token.lock() = ExecutionToken::Standby;
        core.on_runtime_stopped(RuntimeStopCause::ShutdownRequested);
    }
}

/// Runs the scheduler on a spawned worker thread.
pub struct Background {
    registrar: Arc<Registrar>,
    stop: Arc<StopFlag>,
    token: Arc<Mutex<ExecutionToken>>,
    handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Background {
    pub fn new(registrar: Arc<Registrar>) -> Self {
        Self {
            registrar,
            stop: Arc::new(StopFlag::new()),
            token: Arc::new(Mutex::new(ExecutionToken::Standby)),
            handle: Mutex::new(None),
        }
    }

    pub fn token(&self) -> ExecutionToken {
        self.token.lock().clone()
    }

    pub fn request_stop(&self) {
        self.stop.request_stop();
    }

    /// Spawns the worker thread and returns once it has been spawned,
    /// leaving the token at `ThreadSpawned` as the caller observes it.
    pub fn start(&self, core: Arc<dyn RuntimeCore>) -> ExecutionToken {
        *self.token.lock() = ExecutionToken::ThreadSpawned;

        let registrar = self.registrar.clone();
        let stop = self.stop.clone();
        let token = self.token.clone();

        let handle = std::thread::spawn(move || {
            *token.lock() = ExecutionToken::Running;
            run_loop(&registrar, &stop);
            *token.lock() = ExecutionToken::Standby;
            core.on_runtime_stopped(RuntimeStopCause::ShutdownRequested);
        });

        *self.handle.lock() = Some(handle);
        ExecutionToken::ThreadSpawned
    }

    pub fn join(&self) {
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ahash::AHashSet;
    use scheduler::Delegate;
    use std::sync::atomic::AtomicUsize;

    struct NoopCore(Arc<AtomicUsize>);
    impl RuntimeCore for NoopCore {
        fn on_runtime_stopped(&self, _cause: RuntimeStopCause) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn foreground_invokes_on_runtime_stopped_after_a_stop_request() {
        let registrar = Arc::new(Registrar::new());
        registrar.initialize().unwrap();

        let policy = Foreground::new(registrar);
        policy.request_stop();

        let stopped = Arc::new(AtomicUsize::new(0));
        policy.start(&NoopCore(stopped.clone()));

        assert_eq!(stopped.load(Ordering::Relaxed), 1);
        assert_eq!(policy.token(), ExecutionToken::Standby);
    }

    #[test]
    fn background_runs_on_a_worker_thread_and_joins_cleanly() {
        let registrar = Arc::new(Registrar::new());
        let delegate = Arc::new(Delegate::new(1, AHashSet::default(), Arc::downgrade(&registrar.sentinel()), |_| 0));
        registrar.register(delegate);
        registrar.initialize().unwrap();

        let policy = Background::new(registrar);
        let stopped = Arc::new(AtomicUsize::new(0));

        let token = policy.start(Arc::new(NoopCore(stopped.clone())));
        assert_eq!(token, ExecutionToken::ThreadSpawned);

        policy.request_stop();
        policy.join();

        assert_eq!(stopped.load(Ordering::Relaxed), 1);
    }
}
