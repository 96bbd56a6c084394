// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A single vCPU ARMv8 virtual machine monitor core running on top of an EL2 hypervisor session.
//!
//! The session layer enters the guest and reports exits through `hypervisor::VcpuAArch64`. This
//! crate wires the trap dispatcher, the virtual GIC, the virtual timer and the MMIO devices
//! together and runs every exit and host event through `Vm`.

pub mod config;
mod vm;

use anyhow::Context;
use base::syslog;
use base::syslog::LogConfig;
use remain::sorted;
use thiserror::Error;

pub use crate::config::VmConfig;
pub use crate::vm::ExitReason;
pub use crate::vm::Vm;
pub use crate::vm::VmBackends;
pub use crate::vm::VmEvent;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Cpu(#[from] aarch64::Error),
    #[error("the event channel is closed")]
    EventChannelClosed,
    #[error("the vm is halted after a fatal error")]
    Halted,
    #[error("failed to pause the vcpu: {0}")]
    PauseVcpu(base::Error),
    #[error("failed to resume the vcpu: {0}")]
    RunVcpu(base::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Installs the process logger with the filter of `config`.
pub fn init_logging(config: &VmConfig) -> anyhow::Result<()> {
    syslog::init_with(LogConfig {
        filter: &config.log,
        ..Default::default()
    })
    .context("failed to initialize logging")
}
