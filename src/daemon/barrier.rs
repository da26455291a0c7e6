use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Counting barrier tracking outstanding work below a daemon.
///
/// Anything that holds a [`WorkGuard`] counts as outstanding; `wait` blocks
/// until every guard has been dropped.
#[derive(Debug, Default)]
pub struct WorkBarrier {
    count: Mutex<usize>,
    zero: Condvar,
}

impl WorkBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark one unit of outstanding work, released when the guard drops.
    pub fn enter(self: &Arc<Self>) -> WorkGuard {
        *self.lock() += 1;
        WorkGuard {
            barrier: Arc::clone(self),
        }
    }

    pub fn outstanding(&self) -> usize {
        *self.lock()
    }

    /// Block until no work is outstanding.
    pub fn wait(&self) {
        let mut count = self.lock();
        while *count > 0 {
            count = self
                .zero
                .wait(count)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block until no work is outstanding or `timeout` elapses. Returns true on zero.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.lock();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .zero
                .wait_timeout(count, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            count = guard;
        }
        true
    }

    fn leave(&self) {
        let mut count = self.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    // A panicking hook must not wedge every waiter.
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.count
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One unit of outstanding work on a [`WorkBarrier`].
#[derive(Debug)]
#[must_use = "work is released as soon as the guard is dropped"]
pub struct WorkGuard {
    barrier: Arc<WorkBarrier>,
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.barrier.leave();
    }
}
