// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Condvar as StdCondvar;
use std::sync::MutexGuard;
use std::sync::WaitTimeoutResult;
use std::time::Duration;

const POISONED: &str = "condvar is poisoned";

/// A condition variable paired with `sync::Mutex` guards.
#[derive(Debug, Default)]
pub struct Condvar(StdCondvar);

impl Condvar {
    pub const fn new() -> Condvar {
        Condvar(StdCondvar::new())
    }

    /// Releases `guard` and sleeps until notified.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        self.0.wait(guard).expect(POISONED)
    }

    /// Like `wait` but gives up after `dur`.
    pub fn wait_timeout<'a, T>(
        &self,
        guard: MutexGuard<'a, T>,
        dur: Duration,
    ) -> (MutexGuard<'a, T>, WaitTimeoutResult) {
        self.0.wait_timeout(guard, dur).expect(POISONED)
    }

    pub fn notify_one(&self) {
        self.0.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::Mutex;

    #[test]
    fn wakes_waiter() {
        let pair = Arc::new((Mutex::new(false), Condvar::new()));
        let other = pair.clone();
        let waker = thread::spawn(move || {
            *other.0.lock() = true;
            other.1.notify_one();
        });
        let mut ready = pair.0.lock();
        while !*ready {
            ready = pair.1.wait(ready);
        }
        waker.join().unwrap();
    }

    #[test]
    fn times_out() {
        let mutex = Mutex::new(());
        let cond = Condvar::new();
        let (_guard, result) = cond.wait_timeout(mutex.lock(), Duration::from_millis(1));
        assert!(result.timed_out());
    }
}
