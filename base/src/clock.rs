// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtual time for tests: deadlines registered by `FakeTimer`s fire when the clock is advanced.

use crate::TimerCallback;

struct Deadline {
    timer_id: u64,
    deadline_ns: u64,
    callback: TimerCallback,
}

/// Nanoseconds of pretend time, advanced only by `add_ns`.
pub struct FakeClock {
    ns_since_epoch: u64,
    next_timer_id: u64,
    deadlines: Vec<Deadline>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            ns_since_epoch: 0,
            next_timer_id: 0,
            deadlines: Vec::new(),
        }
    }

    /// Time elapsed since the clock was created.
    pub fn nanos(&self) -> u64 {
        self.ns_since_epoch
    }

    /// Hands out an identifier for a timer driven by this clock.
    pub(crate) fn register_timer(&mut self) -> u64 {
        self.next_timer_id += 1;
        self.next_timer_id
    }

    /// Registers `callback` to run once this clock reaches `deadline_ns`. Replaces any deadline
    /// previously registered for the same timer.
    pub(crate) fn add_deadline(&mut self, timer_id: u64, deadline_ns: u64, callback: TimerCallback) {
        self.remove_deadline(timer_id);
        self.deadlines.push(Deadline {
            timer_id,
            deadline_ns,
            callback,
        });
    }

    pub(crate) fn remove_deadline(&mut self, timer_id: u64) {
        self.deadlines.retain(|d| d.timer_id != timer_id);
    }

    /// Returns the number of deadlines that have not fired yet.
    pub fn pending_deadlines(&self) -> usize {
        self.deadlines.len()
    }

    /// Advances the clock by `ns` and runs the callbacks of every deadline that has been reached.
    ///
    /// Callbacks run while the caller holds the clock, so they must not lock it again.
    pub fn add_ns(&mut self, ns: u64) {
        self.ns_since_epoch += ns;
        let time = self.ns_since_epoch;
        self.deadlines.retain(|d| {
            let expired = d.deadline_ns <= time;
            if expired {
                (d.callback)();
            }
            !expired
        });
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}
