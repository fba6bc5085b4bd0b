//! Shutdown signalling for the background loops.
//!
//! Both the cache sweep and the rekey schedule sleep in long intervals; the
//! latch lets `stop()` interrupt those waits promptly instead of waiting out
//! the full interval.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// One-way latch: once tripped, every current and future wait returns
/// immediately.
pub(crate) struct ShutdownLatch {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl ShutdownLatch {
    pub(crate) fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    /// Block for `timeout` or until the latch trips, whichever comes first.
    /// Returns `true` while the loop should keep running.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return false;
        }
        self.cv.wait_for(&mut stopped, timeout);
        !*stopped
    }

    pub(crate) fn trip(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.cv.notify_all();
    }

    pub(crate) fn is_tripped(&self) -> bool {
        *self.stopped.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wait_elapses_when_not_tripped() {
        let latch = ShutdownLatch::new();
        let start = Instant::now();
        assert!(latch.wait_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn trip_interrupts_a_waiting_thread() {
        let latch = Arc::new(ShutdownLatch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            std::thread::spawn(move || latch.wait_for(Duration::from_secs(30)))
        };
        std::thread::sleep(Duration::from_millis(10));
        latch.trip();
        assert!(!waiter.join().expect("waiter thread panicked"));
        assert!(latch.is_tripped());
    }
}
