// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use sync::Condvar;
use sync::Mutex;

use super::FakeClock;
use super::Result;

/// Invoked from the timer's context when a one-shot deadline is reached.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A trait for one-shot timers that report expiration through a callback.
pub trait TimerTrait: Send {
    /// Sets the timer to expire after `dur` without repeating. Cancels any existing timer.
    fn reset_oneshot(&mut self, dur: Duration) -> Result<()>;

    /// After the expiration callback was delivered, mark the timer as having been waited for.
    ///
    /// Returns true if the timer has been adjusted (re-armed or cleared) since it fired, in which
    /// case the delivered expiration is stale and must be ignored.
    fn mark_waited(&mut self) -> Result<bool>;

    /// Disarms the timer.
    fn clear(&mut self) -> Result<()>;
}

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    expired: bool,
    exit: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// A host timer backed by a worker thread. The callback runs on that worker thread.
pub struct Timer {
    shared: Arc<TimerShared>,
    worker: Option<JoinHandle<()>>,
}

impl Timer {
    /// Creates a new disarmed timer that calls `callback` on every expiration.
    pub fn new(callback: TimerCallback) -> Result<Timer> {
        let shared = Arc::new(TimerShared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || run_timer(worker_shared, callback))?;
        Ok(Timer {
            shared,
            worker: Some(worker),
        })
    }

    fn update<F: FnOnce(&mut TimerState)>(&self, f: F) {
        let mut state = self.shared.state.lock();
        f(&mut state);
        self.shared.cond.notify_one();
    }
}

fn run_timer(shared: Arc<TimerShared>, callback: TimerCallback) {
    let mut state = shared.state.lock();
    loop {
        if state.exit {
            return;
        }
        match state.deadline {
            None => state = shared.cond.wait(state),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    state.deadline = None;
                    state.expired = true;
                    drop(state);
                    callback();
                    state = shared.state.lock();
                } else {
                    state = shared.cond.wait_timeout(state, deadline - now).0;
                }
            }
        }
    }
}

impl TimerTrait for Timer {
    fn reset_oneshot(&mut self, dur: Duration) -> Result<()> {
        let deadline = Instant::now() + dur;
        self.update(|state| {
            state.deadline = Some(deadline);
            state.expired = false;
        });
        Ok(())
    }

    fn mark_waited(&mut self) -> Result<bool> {
        let mut state = self.shared.state.lock();
        let adjusted = !state.expired;
        state.expired = false;
        Ok(adjusted)
    }

    fn clear(&mut self) -> Result<()> {
        self.update(|state| {
            state.deadline = None;
            state.expired = false;
        });
        Ok(())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.update(|state| state.exit = true);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// FakeTimer: For use in tests.
pub struct FakeTimer {
    clock: Arc<Mutex<FakeClock>>,
    id: u64,
    deadline_ns: Option<u64>,
    callback: TimerCallback,
}

impl FakeTimer {
    /// Creates a new fake Timer.  The timer is initally disarmed and must be armed by calling
    /// `reset_oneshot`.
    pub fn new(clock: Arc<Mutex<FakeClock>>, callback: TimerCallback) -> Self {
        let id = clock.lock().register_timer();
        FakeTimer {
            clock,
            id,
            deadline_ns: None,
            callback,
        }
    }
}

impl TimerTrait for FakeTimer {
    fn reset_oneshot(&mut self, dur: Duration) -> Result<()> {
        let mut guard = self.clock.lock();
        let deadline = guard.nanos() + dur.as_nanos() as u64;
        self.deadline_ns = Some(deadline);
        guard.add_deadline(self.id, deadline, Arc::clone(&self.callback));
        Ok(())
    }

    fn mark_waited(&mut self) -> Result<bool> {
        let now = self.clock.lock().nanos();
        match self.deadline_ns {
            Some(deadline) if deadline <= now => {
                self.deadline_ns = None;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.deadline_ns = None;
        self.clock.lock().remove_deadline(self.id);
        Ok(())
    }
}

impl Drop for FakeTimer {
    fn drop(&mut self) {
        self.clock.lock().remove_deadline(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::mpsc::channel;

    use super::*;

    fn counting_callback() -> (Arc<AtomicUsize>, TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let cb_count = Arc::clone(&count);
        let callback: TimerCallback = Arc::new(move || {
            cb_count.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn one_shot() {
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        let mut tfd = Timer::new(Arc::new(move || {
            let _ = tx.lock().send(Instant::now());
        }))
        .expect("failed to create timer");

        let dur = Duration::from_millis(10);
        let now = Instant::now();
        tfd.reset_oneshot(dur).expect("failed to arm timer");
        let fired = rx.recv().expect("timer never fired");
        assert!(fired.duration_since(now) >= dur);
        assert!(!tfd.mark_waited().unwrap());
    }

    #[test]
    fn cleared_timer_reports_adjusted() {
        let (count, callback) = counting_callback();
        let mut tfd = Timer::new(callback).expect("failed to create timer");
        tfd.reset_oneshot(Duration::from_secs(3600)).unwrap();
        tfd.clear().unwrap();
        assert!(tfd.mark_waited().unwrap());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fake_one_shot() {
        let clock = Arc::new(Mutex::new(FakeClock::new()));
        let (count, callback) = counting_callback();
        let mut tfd = FakeTimer::new(clock.clone(), callback);

        tfd.reset_oneshot(Duration::from_nanos(200)).unwrap();
        clock.lock().add_ns(199);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        clock.lock().add_ns(1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!tfd.mark_waited().unwrap());

        // Fires only once.
        clock.lock().add_ns(1000);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fake_rearm_makes_old_expiry_stale() {
        let clock = Arc::new(Mutex::new(FakeClock::new()));
        let (count, callback) = counting_callback();
        let mut tfd = FakeTimer::new(clock.clone(), callback);

        tfd.reset_oneshot(Duration::from_nanos(10)).unwrap();
        clock.lock().add_ns(10);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        tfd.reset_oneshot(Duration::from_nanos(10)).unwrap();
        assert!(tfd.mark_waited().unwrap());
    }

    #[test]
    fn fake_clear() {
        let clock = Arc::new(Mutex::new(FakeClock::new()));
        let (count, callback) = counting_callback();
        let mut tfd = FakeTimer::new(clock.clone(), callback);

        tfd.reset_oneshot(Duration::from_nanos(10)).unwrap();
        tfd.clear().unwrap();
        assert_eq!(clock.lock().pending_deadlines(), 0);
        clock.lock().add_ns(100);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
