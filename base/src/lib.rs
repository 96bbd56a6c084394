// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Host-side services shared by the VMM crates: logging, clocks, one-shot timers and anonymous
//! memory mappings.

mod clock;
mod errno;
mod mmap;
pub mod syslog;
mod timer;

pub use clock::FakeClock;
pub use errno::Error;
pub use errno::Result;
pub use log::debug;
pub use log::error;
pub use log::info;
pub use log::trace;
pub use log::warn;
pub use mmap::Error as MmapError;
pub use mmap::MemoryMapping;
pub use mmap::Result as MmapResult;
pub use timer::FakeTimer;
pub use timer::Timer;
pub use timer::TimerCallback;
pub use timer::TimerTrait;

/// Returns the page size of the host.
pub fn pagesize() -> usize {
    // SAFETY:
    // Trivially safe, sysconf has no side effects.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}
