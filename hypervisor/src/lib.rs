// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The VM control capability used by the VMM: run, pause and a guest register snapshot.
//!
//! The session layer that actually enters the guest at EL1 lives outside this workspace. The VMM
//! only sees it through `VcpuAArch64`.

pub mod aarch64;
mod fake;

use base::Result;

pub use crate::aarch64::*;
pub use crate::fake::FakeVcpu;

/// A wrapper around a vCPU owned by the hypervisor session layer.
pub trait VcpuAArch64: Send {
    /// Resumes the guest. Returns once the guest is executing again.
    fn run(&mut self) -> Result<()>;

    /// Stops the guest so its state may be inspected and modified.
    fn pause(&mut self) -> Result<()>;

    /// Returns true while the guest is executing.
    fn is_running(&self) -> bool;

    /// The register snapshot saved at the last exit.
    fn state(&self) -> &VcpuState;

    /// Mutable access to the snapshot. Changes are loaded into the CPU on the next `run`.
    fn state_mut(&mut self) -> &mut VcpuState;
}
