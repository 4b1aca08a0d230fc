use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::core::lock::lock_mutex;

/// One-shot stop flag that sleeping threads can wait on.
///
/// `wait_timeout` sleeps for the full duration unless `stop` is called,
/// in which case every waiter wakes immediately.
pub struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn stop(&self) {
        let mut stopped = lock_mutex(&self.stopped, "StopSignal::stop");
        *stopped = true;
        self.condvar.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *lock_mutex(&self.stopped, "StopSignal::is_stopped")
    }

    /// Returns `true` if the signal fired before `duration` elapsed.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = lock_mutex(&self.stopped, "StopSignal::wait_timeout");
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stopped = match self.condvar.wait_timeout(stopped, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wait_runs_full_duration() {
        let signal = StopSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_stop_wakes_waiter() {
        let signal = Arc::new(StopSignal::new());
        let waiter = signal.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let stopped = waiter.wait_timeout(Duration::from_secs(10));
            (stopped, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(20));
        signal.stop();

        let (stopped, elapsed) = handle.join().expect("waiter thread");
        assert!(stopped);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_after_stop_returns_immediately() {
        let signal = StopSignal::new();
        signal.stop();
        assert!(signal.is_stopped());
        assert!(signal.wait_timeout(Duration::from_secs(10)));
    }
}
