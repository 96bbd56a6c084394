// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Guest register snapshot and exception syndrome decoding for AArch64 guests.

use std::fmt;
use std::fmt::Display;

use aarch64_sys_reg::AArch64SysRegId;
use base::Error;
use base::Result;
use enumn::N;
use vm_memory::GuestAddress;

/// Represents a version of Power State Coordination Interface (PSCI).
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct PsciVersion {
    pub major: u16,
    pub minor: u16,
}

impl PsciVersion {
    pub fn new(major: u16, minor: u16) -> Result<Self> {
        if (major as i16) < 0 {
            Err(Error::new(libc::EINVAL))
        } else {
            Ok(Self { major, minor })
        }
    }

    /// The value returned to the guest by PSCI_VERSION.
    pub fn encoded(&self) -> u32 {
        (self.major as u32) << 16 | self.minor as u32
    }
}

impl TryFrom<u32> for PsciVersion {
    type Error = base::Error;

    fn try_from(item: u32) -> Result<Self> {
        Self::new((item >> 16) as u16, item as u16)
    }
}

pub const PSCI_0_2: PsciVersion = PsciVersion { major: 0, minor: 2 };

/// Vector offset of the exception that ended the last guest run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ExceptionType {
    Synchronous = 0x400,
    Irq = 0x480,
    Fiq = 0x500,
    SError = 0x580,
    /// No exception yet: the vCPU has not run.
    None = 0xffff,
}

impl ExceptionType {
    pub fn name(&self) -> &'static str {
        match self {
            ExceptionType::Synchronous => "synchronous",
            ExceptionType::Irq => "irq",
            ExceptionType::Fiq => "fiq",
            ExceptionType::SError => "serror",
            ExceptionType::None => "none",
        }
    }
}

/// ESR_EL2 exception classes the VMM handles.
#[derive(Copy, Clone, Debug, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ExceptionClass {
    WfiWfe = 0x01,
    Hvc64 = 0x16,
    MsrMrs = 0x18,
    DataAbortLower = 0x24,
}

/// A raw ESR_EL2 value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Esr(pub u64);

impl Esr {
    /// Exception class, bits [31:26].
    pub fn ec(&self) -> u32 {
        ((self.0 >> 26) & 0x3f) as u32
    }

    /// Instruction specific syndrome, bits [24:0].
    pub fn iss(&self) -> u32 {
        (self.0 & 0x1ff_ffff) as u32
    }

    pub fn class(&self) -> Option<ExceptionClass> {
        ExceptionClass::n(self.ec())
    }
}

/// A trapped MSR or MRS, decoded from the ISS of an EC 0x18 syndrome.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SysRegAccess {
    pub reg: AArch64SysRegId,
    /// General purpose register transferred. 31 is XZR.
    pub rt: usize,
    pub is_read: bool,
}

impl SysRegAccess {
    pub fn from_iss(iss: u32) -> Self {
        SysRegAccess {
            reg: AArch64SysRegId::from_iss(iss),
            rt: ((iss >> 5) & 0x1f) as usize,
            is_read: iss & 1 != 0,
        }
    }
}

/// A trapped load or store, decoded from the ISS of an EC 0x24 syndrome.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DataAbort {
    /// Instruction syndrome valid. The other fields are meaningless when clear.
    pub isv: bool,
    /// Access size in bytes.
    pub size: usize,
    /// Loads sign-extend the value.
    pub sign_extend: bool,
    /// Register transferred. 31 is XZR.
    pub srt: usize,
    /// Loads write a 64-bit register.
    pub sixty_four: bool,
    pub is_write: bool,
}

impl DataAbort {
    pub fn from_iss(iss: u32) -> Self {
        DataAbort {
            isv: iss & (1 << 24) != 0,
            size: 1 << ((iss >> 22) & 0x3),
            sign_extend: iss & (1 << 21) != 0,
            srt: ((iss >> 16) & 0x1f) as usize,
            sixty_four: iss & (1 << 15) != 0,
            is_write: iss & (1 << 6) != 0,
        }
    }
}

/// Identification registers presented to the guest. They never change after construction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdRegisters {
    pub midr: u64,
    pub mpidr: u64,
    pub id_pfr0: u64,
    pub id_pfr1: u64,
    pub id_dfr0: u64,
    pub id_afr0: u64,
    pub id_mmfr0: u64,
    pub id_mmfr1: u64,
    pub id_mmfr2: u64,
    pub id_mmfr3: u64,
    pub id_isar0: u64,
    pub id_isar1: u64,
    pub id_isar2: u64,
    pub id_isar3: u64,
    pub id_isar4: u64,
    pub id_isar5: u64,
    pub mvfr0: u64,
    pub mvfr1: u64,
    pub mvfr2: u64,
    pub id_aa64pfr0: u64,
    pub id_aa64pfr1: u64,
    pub id_aa64dfr0: u64,
    pub id_aa64dfr1: u64,
    pub id_aa64afr0: u64,
    pub id_aa64afr1: u64,
    pub id_aa64isar0: u64,
    pub id_aa64isar1: u64,
    pub id_aa64isar2: u64,
    pub id_aa64mmfr0: u64,
    pub id_aa64mmfr1: u64,
    pub id_aa64mmfr2: u64,
    pub clidr: u64,
    pub ctr: u64,
    /// Cache size IDs, indexed by CSSELR_EL1 (level << 1 | InD).
    pub ccsidr: [u64; 16],
}

/// Emulated EL1 system registers that the guest may write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SysRegisters {
    pub csselr: u64,
    pub actlr: u64,
    pub mdscr: u64,
    pub oslsr: u64,
    pub osdlr: u64,
}

/// Virtual timer registers, CNTV_CTL_EL0, CNTV_CVAL_EL0 and the virtual count.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimerRegisters {
    pub control: u64,
    pub compare: u64,
    pub count: u64,
    /// CNTFRQ_EL0 in Hz.
    pub frequency: u64,
}

/// Interrupt bookkeeping shared between the session layer and the VMM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrqState {
    /// Physical interrupt that caused the last IRQ/FIQ exit.
    pub last_irq: u32,
    /// Virtual interrupt presented to the guest, 1023 if none.
    pub virtual_irq: u32,
}

impl Default for IrqState {
    fn default() -> Self {
        IrqState {
            last_irq: SPURIOUS_IRQ,
            virtual_irq: SPURIOUS_IRQ,
        }
    }
}

/// The interrupt ID that means "no interrupt".
pub const SPURIOUS_IRQ: u32 = 1023;

/// Snapshot of the guest vCPU saved on every exit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VcpuState {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub exception_type: u32,
    pub esr_el2: u64,
    pub far_el2: u64,
    pub hpfar_el2: u64,
    pub id: IdRegisters,
    pub sys: SysRegisters,
    pub timer: TimerRegisters,
    pub irqs: IrqState,
}

impl Default for VcpuState {
    fn default() -> Self {
        VcpuState {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
            exception_type: ExceptionType::None as u32,
            esr_el2: 0,
            far_el2: 0,
            hpfar_el2: 0,
            id: IdRegisters::default(),
            sys: SysRegisters::default(),
            timer: TimerRegisters::default(),
            irqs: IrqState::default(),
        }
    }
}

impl VcpuState {
    /// Reads general purpose register `n`. Register 31 reads as zero.
    pub fn reg(&self, n: usize) -> u64 {
        self.regs.get(n).copied().unwrap_or(0)
    }

    /// Writes general purpose register `n`. Writes to register 31 are discarded.
    pub fn set_reg(&mut self, n: usize, value: u64) {
        if let Some(reg) = self.regs.get_mut(n) {
            *reg = value;
        }
    }

    pub fn esr(&self) -> Esr {
        Esr(self.esr_el2)
    }

    pub fn exception(&self) -> Option<ExceptionType> {
        ExceptionType::n(self.exception_type)
    }

    /// The intermediate physical address of the last stage 2 fault.
    pub fn fault_ipa(&self) -> GuestAddress {
        GuestAddress(((self.hpfar_el2 & 0xffff_ffff_fff0) << 8) | (self.far_el2 & 0xfff))
    }

    /// Skips the trapped 32-bit instruction.
    pub fn advance_pc(&mut self) {
        self.pc = self.pc.wrapping_add(4);
    }
}

impl Display for VcpuState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let vector = self.exception().map_or("unknown", |e| e.name());
        writeln!(
            f,
            "vcpu state (exception vector {:#x}, {}):",
            self.exception_type, vector
        )?;
        for (i, pair) in self.regs.chunks(2).enumerate() {
            match pair {
                [a, b] => writeln!(
                    f,
                    "  x{:<2} = {:#018x}  x{:<2} = {:#018x}",
                    i * 2,
                    a,
                    i * 2 + 1,
                    b
                )?,
                [a] => writeln!(f, "  x{:<2} = {:#018x}", i * 2, a)?,
                _ => {}
            }
        }
        writeln!(
            f,
            "  sp  = {:#018x}  pc  = {:#018x}  pstate = {:#x}",
            self.sp, self.pc, self.pstate
        )?;
        write!(
            f,
            "  esr_el2 = {:#x}  far_el2 = {:#x}  hpfar_el2 = {:#x}",
            self.esr_el2, self.far_el2, self.hpfar_el2
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esr_fields() {
        // MRS x5, ID_AA64PFR0_EL1
        let esr = Esr(0x18 << 26 | 1 << 25 | 3 << 20 | 4 << 1 | 5 << 5 | 1);
        assert_eq!(esr.class(), Some(ExceptionClass::MsrMrs));
        let access = SysRegAccess::from_iss(esr.iss());
        assert_eq!(access.reg, aarch64_sys_reg::ID_AA64PFR0_EL1);
        assert_eq!(access.rt, 5);
        assert!(access.is_read);
        assert_eq!(Esr(0x3f << 26).class(), None);
    }

    #[test]
    fn data_abort_fields() {
        // STR w3 with a valid syndrome: ISV, SAS=2 (word), SRT=3, WnR.
        let da = DataAbort::from_iss(1 << 24 | 2 << 22 | 3 << 16 | 1 << 6);
        assert!(da.isv);
        assert_eq!(da.size, 4);
        assert_eq!(da.srt, 3);
        assert!(da.is_write);
        assert!(!da.sign_extend);
        assert!(!da.sixty_four);
        assert!(!DataAbort::from_iss(0).isv);
    }

    #[test]
    fn fault_ipa_combines_hpfar_and_far() {
        let state = VcpuState {
            hpfar_el2: 0x0900_0000 >> 8,
            far_el2: 0xffff_0000_1234_5018,
            ..Default::default()
        };
        assert_eq!(state.fault_ipa(), GuestAddress(0x0900_0018));
    }

    #[test]
    fn xzr_reads_zero_and_ignores_writes() {
        let mut state = VcpuState::default();
        state.set_reg(31, 7);
        assert_eq!(state.reg(31), 0);
        state.set_reg(30, 7);
        assert_eq!(state.reg(30), 7);
    }

    #[test]
    fn dump_names_vector() {
        let state = VcpuState {
            exception_type: ExceptionType::SError as u32,
            pc: 0x4008_0000,
            ..Default::default()
        };
        let dump = state.to_string();
        assert!(dump.contains("serror"));
        assert!(dump.contains("x30 = 0x0000000000000000"));
        assert!(dump.contains("pc  = 0x0000000040080000"));
    }

    #[test]
    fn psci_version_encoding() {
        assert_eq!(PSCI_0_2.encoded(), 2);
        assert_eq!(PsciVersion::try_from(0x1_0000).unwrap(), PsciVersion::new(1, 0).unwrap());
        assert!(PsciVersion::new(0x8000, 0).is_err());
    }
}
