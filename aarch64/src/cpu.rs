// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeMap;

use aarch64_sys_reg::AArch64SysRegId;
use base::debug;
use base::trace;
use base::warn;
use devices::irqchip::MAINTENANCE_PPI;
use devices::irqchip::VIRTUAL_TIMER_PPI;
use devices::AccessWidth;
use devices::Bus;
use devices::DeviceContext;
use devices::Vgic;
use hypervisor::DataAbort;
use hypervisor::ExceptionClass;
use hypervisor::ExceptionType;
use hypervisor::SysRegAccess;
use hypervisor::VcpuState;
use vm_memory::GuestMemory;

use crate::psci;
use crate::psci::PowerEvent;
use crate::psci::PsciResult;
use crate::sysreg::system_registers;
use crate::sysreg::SystemRegister;
use crate::sysreg::DEFAULT_CCSIDR;
use crate::Error;
use crate::Result;
use crate::VirtualTimer;

/// ESR ISS bit telling WFE from WFI.
const ISS_WFX_IS_WFE: u32 = 1 << 0;

/// What the VMM does with the vCPU after an exit was handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// Resume the guest.
    Resume,
    /// The guest waits for an interrupt. Resume once one is presented.
    Idle,
    /// The guest asked to stop the machine.
    Shutdown(PowerEvent),
}

/// Handles the hypercalls that are not PSCI.
pub trait HypercallHandler: Send {
    /// Called with the vCPU state of an HVC exit. The function ID is in x0, results go back into
    /// the general purpose registers.
    fn handle_hypercall(&mut self, state: &mut VcpuState) -> Result<()>;
}

/// Answers every unknown hypercall with NOT_SUPPORTED.
#[derive(Default)]
pub struct DefaultHypercallHandler;

impl HypercallHandler for DefaultHypercallHandler {
    fn handle_hypercall(&mut self, state: &mut VcpuState) -> Result<()> {
        warn!("unknown hypercall {:#x}", state.reg(0));
        state.set_reg(0, psci::PSCI_NOT_SUPPORTED as u64);
        Ok(())
    }
}

/// The VM objects an exit may touch.
pub struct ExitContext<'a> {
    pub gic: &'a mut Vgic,
    pub bus: &'a mut Bus,
    pub mem: &'a GuestMemory,
    pub timer: &'a mut VirtualTimer,
    pub hypercalls: &'a mut dyn HypercallHandler,
}

/// The trap dispatcher of one vCPU.
pub struct Cpu {
    /// Sorted by ISS key.
    sys_regs: Vec<SystemRegister>,
}

impl Cpu {
    /// Builds the register table and loads the initial register values into `state`.
    ///
    /// `overrides` replaces initial values, keyed by register name such as `"MIDR_EL1"`.
    pub fn new(state: &mut VcpuState, overrides: &BTreeMap<String, u64>) -> Result<Cpu> {
        let cpu = Cpu {
            sys_regs: system_registers(),
        };
        state.id.ccsidr = DEFAULT_CCSIDR;
        for reg in &cpu.sys_regs {
            if let Some(value) = reg.init_value() {
                reg.write(state, value);
            }
        }
        for (name, value) in overrides {
            let reg = cpu
                .sys_regs
                .iter()
                .find(|r| r.name() == name)
                .ok_or_else(|| Error::UnknownRegisterName(name.clone()))?;
            debug!("cpu: {} overridden to {:#x}", name, value);
            reg.write(state, *value);
        }
        Ok(cpu)
    }

    /// Looks up the emulated register `id`.
    pub fn system_register(&self, id: AArch64SysRegId) -> Option<&SystemRegister> {
        let key = id.iss_key();
        self.sys_regs
            .binary_search_by_key(&key, |r| r.id().iss_key())
            .ok()
            .map(|i| &self.sys_regs[i])
    }

    /// Handles the exit described by `state`. Fatal conditions are returned as errors and leave
    /// `state` as it was at the exit.
    pub fn handle_exit(
        &mut self,
        state: &mut VcpuState,
        ctx: &mut ExitContext,
    ) -> Result<TrapOutcome> {
        match state.exception() {
            Some(ExceptionType::Synchronous) => self.handle_sync(state, ctx),
            Some(ExceptionType::Irq) | Some(ExceptionType::Fiq) => {
                self.handle_irq(state, ctx);
                Ok(TrapOutcome::Resume)
            }
            Some(ExceptionType::None) => Ok(TrapOutcome::Resume),
            Some(ExceptionType::SError) | None => Err(unimplemented_trap(state)),
        }
    }

    fn handle_sync(&mut self, state: &mut VcpuState, ctx: &mut ExitContext) -> Result<TrapOutcome> {
        let esr = state.esr();
        match esr.class() {
            Some(ExceptionClass::MsrMrs) => {
                self.handle_sys_reg(state, SysRegAccess::from_iss(esr.iss()))?;
                Ok(TrapOutcome::Resume)
            }
            Some(ExceptionClass::Hvc64) => self.handle_hvc(state, ctx),
            Some(ExceptionClass::DataAbortLower) => {
                self.handle_data_abort(state, ctx)?;
                Ok(TrapOutcome::Resume)
            }
            Some(ExceptionClass::WfiWfe) => {
                if esr.iss() & ISS_WFX_IS_WFE != 0 {
                    return Err(unimplemented_trap(state));
                }
                trace!("cpu: wfi at {:#x}", state.pc);
                state.advance_pc();
                ctx.timer.schedule_timeout(&mut state.timer, ctx.gic)?;
                Ok(TrapOutcome::Idle)
            }
            None => Err(unimplemented_trap(state)),
        }
    }

    fn handle_sys_reg(&self, state: &mut VcpuState, access: SysRegAccess) -> Result<()> {
        let id = access.reg;
        let reg = self
            .system_register(id)
            .ok_or(Error::UnknownSystemRegister {
                op0: id.op0(),
                op1: id.op1(),
                crn: id.crn(),
                crm: id.crm(),
                op2: id.op2(),
            })?;
        if access.is_read {
            let value = reg.read(state);
            trace!("cpu: mrs {} = {:#x}", reg.name(), value);
            state.set_reg(access.rt, value);
        } else {
            if !reg.writeable() {
                return Err(Error::NonWriteableRegister { name: reg.name() });
            }
            let value = state.reg(access.rt);
            trace!("cpu: msr {} = {:#x}", reg.name(), value);
            reg.write(state, value);
        }
        state.advance_pc();
        Ok(())
    }

    // The preferred return address of an HVC exit is already past the instruction.
    fn handle_hvc(&mut self, state: &mut VcpuState, ctx: &mut ExitContext) -> Result<TrapOutcome> {
        let function = state.reg(0) as u32;
        if !psci::is_psci_function(function) {
            ctx.hypercalls.handle_hypercall(state)?;
            return Ok(TrapOutcome::Resume);
        }
        match psci::handle_psci(function, state.reg(1), state.reg(2)) {
            PsciResult::Return(value) => {
                state.set_reg(0, value as u64);
                Ok(TrapOutcome::Resume)
            }
            PsciResult::Power(event) => Ok(TrapOutcome::Shutdown(event)),
        }
    }

    fn handle_data_abort(&mut self, state: &mut VcpuState, ctx: &mut ExitContext) -> Result<()> {
        let abort = DataAbort::from_iss(state.esr().iss());
        if !abort.isv {
            return Err(unimplemented_trap(state));
        }
        let width = AccessWidth::from_bytes(abort.size).ok_or_else(|| unimplemented_trap(state))?;
        let address = state.fault_ipa().offset();
        let mut dev_ctx = DeviceContext {
            gic: &mut *ctx.gic,
            mem: ctx.mem,
        };
        if abort.is_write {
            let value = state.reg(abort.srt) & width.mask();
            trace!("cpu: mmio write {} {:#x} = {:#x}", width, address, value);
            ctx.bus.write(&mut dev_ctx, address, width, value)?;
        } else {
            let raw = ctx.bus.read(&mut dev_ctx, address, width)?;
            let mut value = raw;
            if abort.sign_extend {
                let shift = 64 - width.bytes() * 8;
                value = (((raw << shift) as i64) >> shift) as u64;
            }
            if !abort.sixty_four {
                value &= 0xffff_ffff;
            }
            trace!("cpu: mmio read {} {:#x} = {:#x}", width, address, value);
            state.set_reg(abort.srt, value);
        }
        state.advance_pc();
        Ok(())
    }

    fn handle_irq(&mut self, state: &mut VcpuState, ctx: &mut ExitContext) {
        match state.irqs.last_irq {
            MAINTENANCE_PPI => ctx.gic.complete_presented(),
            VIRTUAL_TIMER_PPI => ctx.timer.handle_irq(&mut state.timer, ctx.gic),
            irq => debug!("cpu: ignoring physical interrupt {}", irq),
        }
    }
}

fn unimplemented_trap(state: &VcpuState) -> Error {
    Error::UnimplementedTrap {
        esr: state.esr_el2,
        vector: state.exception_type,
    }
}
