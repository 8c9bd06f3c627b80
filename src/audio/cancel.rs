use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Lock a mutex, recovering the data if another thread panicked with it held.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Cancelled,
    TimedOut,
}

/// Cancellation signal for timed waits.
///
/// `cancel()` never blocks for longer than the internal lock hand-off, and
/// a cancellation that lands before `wait_timeout()` is still observed: the
/// state is a flag, not an edge.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        *lock(&self.cancelled) = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *lock(&self.cancelled) = false;
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }

    /// Block until cancelled or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        let guard = lock(&self.cancelled);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        if *guard {
            WaitOutcome::Cancelled
        } else {
            WaitOutcome::TimedOut
        }
    }
}
