// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! ARMv8 CPU emulation for the VMM: the trap dispatcher, the emulated system registers, PSCI and
//! the virtual generic timer.

mod cpu;
pub mod psci;
mod sysreg;
mod vtimer;

use remain::sorted;
use thiserror::Error;

pub use crate::cpu::Cpu;
pub use crate::cpu::DefaultHypercallHandler;
pub use crate::cpu::ExitContext;
pub use crate::cpu::HypercallHandler;
pub use crate::cpu::TrapOutcome;
pub use crate::psci::PowerEvent;
pub use crate::sysreg::SystemRegister;
pub use crate::vtimer::VirtualTimer;
pub use crate::vtimer::TIMER_CTL_ENABLE;
pub use crate::vtimer::TIMER_CTL_IMASK;
pub use crate::vtimer::TIMER_CTL_ISTATUS;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("hypercall handler failed: {0}")]
    Hypercall(String),
    #[error("emulated mmio access failed: {0}")]
    Mmio(#[from] devices::BusError),
    #[error("write to read-only system register {name}")]
    NonWriteableRegister { name: &'static str },
    #[error("failed to program the host timer: {0}")]
    Timer(base::Error),
    #[error("timer frequency of {0} Hz is too low, at least 1 kHz is needed")]
    TimerFrequency(u64),
    #[error("unimplemented trap: esr {esr:#x}, exception vector {vector:#x}")]
    UnimplementedTrap { esr: u64, vector: u32 },
    #[error("no emulated system register is named {0}")]
    UnknownRegisterName(String),
    #[error("unknown system register op0={op0} op1={op1} CRn={crn} CRm={crm} op2={op2}")]
    UnknownSystemRegister {
        op0: u8,
        op1: u8,
        crn: u8,
        crm: u8,
        op2: u8,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
