// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Sync primitives whose methods panic on poison instead of returning an error.
//!
//! The VMM runs every emulation path on one thread and only shares small pieces of state (timer
//! deadlines, the fake clock) with helper threads. A panic while one of those locks is held takes
//! the whole process down, so callers never have to handle poisoning themselves.

mod condvar;
mod mutex;

pub use crate::condvar::Condvar;
pub use crate::mutex::Mutex;
