// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The table of system registers emulated for the guest.

use aarch64_sys_reg::*;
use hypervisor::VcpuState;

use crate::vtimer::TIMER_CTL_ENABLE;
use crate::vtimer::TIMER_CTL_IMASK;
use crate::vtimer::TIMER_CTL_ISTATUS;

/// OS Lock status bit in OSLSR_EL1.
const OSLSR_OSLK: u64 = 1 << 1;
/// OSLSR_EL1.OSLM reports the OS Lock as implemented.
const OSLSR_INIT: u64 = 0x8;

/// An emulated system register bound to a field of the vCPU state.
pub struct SystemRegister {
    id: AArch64SysRegId,
    name: &'static str,
    writeable: bool,
    get: fn(&VcpuState) -> u64,
    set: fn(&mut VcpuState, u64),
    init_value: Option<u64>,
}

impl SystemRegister {
    pub fn id(&self) -> AArch64SysRegId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn writeable(&self) -> bool {
        self.writeable
    }

    /// Value the register is loaded with when the CPU model is built, if it has its own storage.
    pub fn init_value(&self) -> Option<u64> {
        self.init_value
    }

    pub fn read(&self, state: &VcpuState) -> u64 {
        (self.get)(state)
    }

    /// Stores `value` without checking `writeable`. The dispatcher checks before guest writes.
    pub fn write(&self, state: &mut VcpuState, value: u64) {
        (self.set)(state, value)
    }
}

macro_rules! id_register {
    ($id:ident, $field:ident, $init:expr) => {
        SystemRegister {
            id: $id,
            name: stringify!($id),
            writeable: false,
            get: |s| s.id.$field,
            set: |s, v| s.id.$field = v,
            init_value: Some($init),
        }
    };
}

macro_rules! sys_register {
    ($id:ident, $field:ident, $init:expr) => {
        SystemRegister {
            id: $id,
            name: stringify!($id),
            writeable: true,
            get: |s| s.sys.$field,
            set: |s, v| s.sys.$field = v,
            init_value: Some($init),
        }
    };
}

// Cortex-A53 r0p4 cache geometry, indexed by CSSELR_EL1.
pub(crate) const DEFAULT_CCSIDR: [u64; 16] = [
    0x700f_e01a, // L1 data, 32KiB
    0x201f_e01a, // L1 instruction, 32KiB
    0x703f_e07a, // L2 unified, 1MiB
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Builds the emulated register table sorted by ISS key.
pub(crate) fn system_registers() -> Vec<SystemRegister> {
    let mut regs = vec![
        id_register!(MIDR_EL1, midr, 0x410f_d034),
        id_register!(MPIDR_EL1, mpidr, 1 << 31),
        id_register!(ID_PFR0_EL1, id_pfr0, 0x131),
        id_register!(ID_PFR1_EL1, id_pfr1, 0x1_1011),
        id_register!(ID_DFR0_EL1, id_dfr0, 0x0301_0066),
        id_register!(ID_AFR0_EL1, id_afr0, 0),
        id_register!(ID_MMFR0_EL1, id_mmfr0, 0x1010_1105),
        id_register!(ID_MMFR1_EL1, id_mmfr1, 0x4000_0000),
        id_register!(ID_MMFR2_EL1, id_mmfr2, 0x0126_0000),
        id_register!(ID_MMFR3_EL1, id_mmfr3, 0x0210_2211),
        id_register!(ID_ISAR0_EL1, id_isar0, 0x0210_1110),
        id_register!(ID_ISAR1_EL1, id_isar1, 0x1311_2111),
        id_register!(ID_ISAR2_EL1, id_isar2, 0x2123_2042),
        id_register!(ID_ISAR3_EL1, id_isar3, 0x0111_2131),
        id_register!(ID_ISAR4_EL1, id_isar4, 0x0001_1142),
        id_register!(ID_ISAR5_EL1, id_isar5, 0x0001_1121),
        id_register!(MVFR0_EL1, mvfr0, 0x1011_0222),
        id_register!(MVFR1_EL1, mvfr1, 0x1211_1111),
        id_register!(MVFR2_EL1, mvfr2, 0x43),
        // AArch64 only at EL0 and EL1, no EL2 or EL3 for the guest.
        id_register!(ID_AA64PFR0_EL1, id_aa64pfr0, 0x11),
        id_register!(ID_AA64PFR1_EL1, id_aa64pfr1, 0),
        id_register!(ID_AA64DFR0_EL1, id_aa64dfr0, 0x6),
        id_register!(ID_AA64DFR1_EL1, id_aa64dfr1, 0),
        id_register!(ID_AA64AFR0_EL1, id_aa64afr0, 0),
        id_register!(ID_AA64AFR1_EL1, id_aa64afr1, 0),
        id_register!(ID_AA64ISAR0_EL1, id_aa64isar0, 0x1_1120),
        id_register!(ID_AA64ISAR1_EL1, id_aa64isar1, 0),
        id_register!(ID_AA64ISAR2_EL1, id_aa64isar2, 0),
        id_register!(ID_AA64MMFR0_EL1, id_aa64mmfr0, 0x1122),
        id_register!(ID_AA64MMFR1_EL1, id_aa64mmfr1, 0),
        id_register!(ID_AA64MMFR2_EL1, id_aa64mmfr2, 0),
        id_register!(CLIDR_EL1, clidr, 0x0a20_0023),
        id_register!(CTR_EL0, ctr, 0x8444_8004),
        SystemRegister {
            id: CCSIDR_EL1,
            name: "CCSIDR_EL1",
            writeable: false,
            get: |s| s.id.ccsidr[(s.sys.csselr & 0xf) as usize],
            set: |s, v| s.id.ccsidr[(s.sys.csselr & 0xf) as usize] = v,
            init_value: None,
        },
        sys_register!(CSSELR_EL1, csselr, 0),
        sys_register!(ACTLR_EL1, actlr, 0),
        sys_register!(MDSCR_EL1, mdscr, 0),
        sys_register!(OSDLR_EL1, osdlr, 0),
        SystemRegister {
            id: OSLAR_EL1,
            name: "OSLAR_EL1",
            writeable: true,
            get: |_| 0,
            set: |s, v| {
                if v & 1 != 0 {
                    s.sys.oslsr |= OSLSR_OSLK;
                } else {
                    s.sys.oslsr &= !OSLSR_OSLK;
                }
            },
            init_value: None,
        },
        SystemRegister {
            id: OSLSR_EL1,
            name: "OSLSR_EL1",
            writeable: false,
            get: |s| s.sys.oslsr,
            set: |s, v| s.sys.oslsr = v,
            init_value: Some(OSLSR_INIT),
        },
        SystemRegister {
            id: CNTFRQ_EL0,
            name: "CNTFRQ_EL0",
            writeable: false,
            get: |s| s.timer.frequency,
            set: |s, v| s.timer.frequency = v,
            init_value: None,
        },
        SystemRegister {
            id: CNTVCT_EL0,
            name: "CNTVCT_EL0",
            writeable: false,
            get: |s| s.timer.count,
            set: |s, v| s.timer.count = v,
            init_value: None,
        },
        SystemRegister {
            id: CNTV_CTL_EL0,
            name: "CNTV_CTL_EL0",
            writeable: true,
            get: |s| s.timer.control,
            // ISTATUS is read-only for the guest.
            set: |s, v| {
                s.timer.control = (s.timer.control & TIMER_CTL_ISTATUS)
                    | (v & (TIMER_CTL_ENABLE | TIMER_CTL_IMASK))
            },
            init_value: Some(0),
        },
        SystemRegister {
            id: CNTV_CVAL_EL0,
            name: "CNTV_CVAL_EL0",
            writeable: true,
            get: |s| s.timer.compare,
            set: |s, v| s.timer.compare = v,
            init_value: Some(0),
        },
    ];
    regs.sort_by_key(|r| r.id.iss_key());
    regs
}
