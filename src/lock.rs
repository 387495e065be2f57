//! Binary lock backing each resource

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Binary semaphore with a bounded-wait `take` and a non-blocking `give`.
///
/// Unlike a guard based mutex it can be released from a different call than the one that took
/// it, which is what the arbiter needs. Waiters are woken in whatever order the parking lot
/// queue provides.
#[derive(Debug, Default)]
pub struct BinaryLock {
    locked: Mutex<bool>,
    available: Condvar,
}

impl BinaryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock, waiting at most `timeout`. `None` waits indefinitely.
    ///
    /// Returns `false` if the lock is still held by someone else when the wait expires.
    pub fn take(&self, timeout: Option<Duration>) -> bool {
        let mut locked = self.locked.lock();

        match timeout {
            None => {
                while *locked {
                    self.available.wait(&mut locked);
                }
            }
            Some(timeout) => {
                // Overflowing deadline is as good as no deadline
                let deadline = Instant::now().checked_add(timeout);
                while *locked {
                    match deadline {
                        Some(deadline) => {
                            if self.available.wait_until(&mut locked, deadline).timed_out() {
                                // May have been freed right at the deadline
                                break;
                            }
                        }
                        None => self.available.wait(&mut locked),
                    }
                }
                if *locked {
                    return false;
                }
            }
        }

        *locked = true;
        true
    }

    /// Releases the lock and wakes one waiter. Never blocks beyond the internal state lock.
    pub fn give(&self) {
        let mut locked = self.locked.lock();
        *locked = false;
        drop(locked);

        self.available.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        *self.locked.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::thread;

    #[test]
    fn take_and_give() {
        let lock = BinaryLock::new();

        assert!(lock.take(None));
        assert!(lock.is_locked());
        assert!(!lock.take(Some(Duration::ZERO)));

        lock.give();
        assert!(!lock.is_locked());
        assert!(lock.take(Some(Duration::ZERO)));
    }

    #[test]
    fn take_times_out_while_held() {
        let lock = BinaryLock::new();
        assert!(lock.take(Some(Duration::ZERO)));

        let start = Instant::now();
        assert!(!lock.take(Some(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(lock.is_locked());
    }

    #[test]
    fn waiter_wakes_on_give() {
        let lock = BinaryLock::new();
        let (tx, rx) = channel::unbounded();
        assert!(lock.take(None));

        thread::scope(|s| {
            s.spawn(|| {
                let taken = lock.take(Some(Duration::from_secs(5)));
                tx.send(taken).unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
            lock.give();
            assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        });

        assert!(lock.is_locked());
    }
}
