//! Cooperative shutdown signaling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Shutdown flag plus a wake signal.
///
/// Every loop polls with a bounded timeout and re-checks the flag on
/// wake, so no thread stays parked past one poll interval after
/// `trigger` is called.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

struct Inner {
    flag: AtomicBool,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                lock: Mutex::new(()),
                wake: Condvar::new(),
            }),
        }
    }

    /// True once shutdown has been requested.
    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Request shutdown and wake every waiting thread.
    pub fn trigger(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock.lock();
        self.inner.wake.notify_all();
    }

    /// Sleep up to `timeout` or until shutdown is triggered. Returns
    /// true if shutdown was requested.
    pub fn wait(&self, timeout: Duration) -> bool {
        if self.is_triggered() {
            return true;
        }
        let mut guard = self.inner.lock.lock();
        if self.is_triggered() {
            return true;
        }
        self.inner.wake.wait_for(&mut guard, timeout);
        self.is_triggered()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Shutdown::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_wait_times_out_without_trigger() {
        let s = Shutdown::new();
        let start = Instant::now();
        assert!(!s.wait(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_trigger_wakes_waiter() {
        let s = Shutdown::new();
        let s2 = s.clone();
        let handle = thread::spawn(move || s2.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(10));
        s.trigger();
        assert!(handle.join().unwrap());
        // subsequent waits return immediately
        assert!(s.wait(Duration::from_secs(30)));
    }
}
