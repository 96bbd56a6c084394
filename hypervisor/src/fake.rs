// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use base::Result;

use crate::VcpuAArch64;
use crate::VcpuState;

/// A vCPU that never enters a guest. Tests set up `state` the way an exit would and check what
/// the VMM left in it.
#[derive(Default)]
pub struct FakeVcpu {
    state: VcpuState,
    running: bool,
    /// Number of `run` calls that resumed a paused vCPU.
    pub runs: usize,
    /// Number of `pause` calls that stopped a running vCPU.
    pub pauses: usize,
}

impl FakeVcpu {
    pub fn new(state: VcpuState) -> Self {
        FakeVcpu {
            state,
            ..Default::default()
        }
    }

    /// Simulates the session layer stopping the guest on an exit.
    pub fn exit(&mut self) {
        self.running = false;
    }
}

impl VcpuAArch64 for FakeVcpu {
    fn run(&mut self) -> Result<()> {
        if !self.running {
            self.running = true;
            self.runs += 1;
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        if self.running {
            self.running = false;
            self.pauses += 1;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn state(&self) -> &VcpuState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut VcpuState {
        &mut self.state
    }
}
