// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! AArch64 system register encodings.
//!
//! An `AArch64SysRegId` packs the five fields that name a system register in MRS/MSR instructions
//! (Op0, Op1, CRn, CRm, Op2). The crate also knows how those fields are laid out in the ISS of an
//! EC 0x18 trap syndrome, so trapped accesses can be matched against the constants below.

#![allow(non_upper_case_globals)]

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;


#[derive(Error, Debug, PartialEq, Eq)]
#[error("system register field {field} out of range: {value}")]
pub struct Error {
    field: &'static str,
    value: u8,
}

/// An AArch64 system register identifier in the 16-bit `op0:op1:CRn:CRm:op2` encoding.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AArch64SysRegId(u16);

// Field positions inside an ISS of a trapped MSR/MRS (ESR_EL2.EC == 0x18).
const ISS_CRM_SHIFT: u32 = 1;
const ISS_CRN_SHIFT: u32 = 10;
const ISS_OP1_SHIFT: u32 = 14;
const ISS_OP2_SHIFT: u32 = 17;
const ISS_OP0_SHIFT: u32 = 20;

impl AArch64SysRegId {
    /// Construct a system register ID from Op0, Op1, CRn, CRm, Op2.
    ///
    /// Returns an error if any field is out of range.
    pub fn new(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> Result<Self, Error> {
        for (field, value, max) in [
            ("Op0", op0, 0b11),
            ("Op1", op1, 0b111),
            ("CRn", crn, 0b1111),
            ("CRm", crm, 0b1111),
            ("Op2", op2, 0b111),
        ] {
            if value > max {
                return Err(Error { field, value });
            }
        }
        Ok(Self::new_unchecked(op0, op1, crn, crm, op2))
    }

    /// Construct a system register ID from Op0, Op1, CRn, CRm, Op2.
    ///
    /// Out-of-range values are masked to the width of their field.
    pub const fn new_unchecked(op0: u8, op1: u8, crn: u8, crm: u8, op2: u8) -> Self {
        let op0 = (op0 as u16 & 0b11) << 14;
        let op1 = (op1 as u16 & 0b111) << 11;
        let crn = (crn as u16 & 0b1111) << 7;
        let crm = (crm as u16 & 0b1111) << 3;
        let op2 = op2 as u16 & 0b111;
        Self(op0 | op1 | crn | crm | op2)
    }

    #[inline]
    pub const fn from_encoded(v: u16) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn op0(&self) -> u8 {
        ((self.0 >> 14) & 0b11) as u8
    }

    #[inline]
    pub const fn op1(&self) -> u8 {
        ((self.0 >> 11) & 0b111) as u8
    }

    #[inline]
    pub const fn crn(&self) -> u8 {
        ((self.0 >> 7) & 0b1111) as u8
    }

    #[inline]
    pub const fn crm(&self) -> u8 {
        ((self.0 >> 3) & 0b1111) as u8
    }

    #[inline]
    pub const fn op2(&self) -> u8 {
        (self.0 & 0b111) as u8
    }

    /// Returns the system register as encoded in bits 5-20 of MRS and MSR instructions.
    pub const fn encoded(&self) -> u16 {
        self.0
    }

    /// Extracts the register named by the ISS of a trapped MSR/MRS syndrome.
    ///
    /// The direction bit and the transfer register field are ignored.
    pub const fn from_iss(iss: u32) -> Self {
        Self::new_unchecked(
            ((iss >> ISS_OP0_SHIFT) & 0b11) as u8,
            ((iss >> ISS_OP1_SHIFT) & 0b111) as u8,
            ((iss >> ISS_CRN_SHIFT) & 0b1111) as u8,
            ((iss >> ISS_CRM_SHIFT) & 0b1111) as u8,
            ((iss >> ISS_OP2_SHIFT) & 0b111) as u8,
        )
    }

    /// Returns the register fields laid out the way a trap syndrome ISS carries them, with the
    /// direction bit and the transfer register cleared.
    pub const fn iss_key(&self) -> u32 {
        (self.op0() as u32) << ISS_OP0_SHIFT
            | (self.op2() as u32) << ISS_OP2_SHIFT
            | (self.op1() as u32) << ISS_OP1_SHIFT
            | (self.crn() as u32) << ISS_CRN_SHIFT
            | (self.crm() as u32) << ISS_CRM_SHIFT
    }
}

impl fmt::Debug for AArch64SysRegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AArch64SysRegId")
            .field("Op0", &self.op0())
            .field("Op1", &self.op1())
            .field("CRn", &self.crn())
            .field("CRm", &self.crm())
            .field("Op2", &self.op2())
            .finish()
    }
}

impl fmt::Display for AArch64SysRegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "S{}_{}_C{}_C{}_{}",
            self.op0(),
            self.op1(),
            self.crn(),
            self.crm(),
            self.op2()
        )
    }
}

// Identification registers.
pub const MIDR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 0, 0);
pub const MPIDR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 0, 5);
pub const REVIDR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 0, 6);

// AArch32 feature registers, readable from AArch64 state.
pub const ID_PFR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 1, 0);
pub const ID_PFR1_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 1, 1);
pub const ID_DFR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 1, 2);
pub const ID_AFR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 1, 3);
pub const ID_MMFR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 1, 4);
pub const ID_MMFR1_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 1, 5);
pub const ID_MMFR2_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 1, 6);
pub const ID_MMFR3_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 1, 7);
pub const ID_ISAR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 2, 0);
pub const ID_ISAR1_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 2, 1);
pub const ID_ISAR2_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 2, 2);
pub const ID_ISAR3_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 2, 3);
pub const ID_ISAR4_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 2, 4);
pub const ID_ISAR5_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 2, 5);
pub const MVFR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 3, 0);
pub const MVFR1_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 3, 1);
pub const MVFR2_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 3, 2);

// AArch64 feature registers.
pub const ID_AA64PFR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 4, 0);
pub const ID_AA64PFR1_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 4, 1);
pub const ID_AA64DFR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 5, 0);
pub const ID_AA64DFR1_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 5, 1);
pub const ID_AA64AFR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 5, 4);
pub const ID_AA64AFR1_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 5, 5);
pub const ID_AA64ISAR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 6, 0);
pub const ID_AA64ISAR1_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 6, 1);
pub const ID_AA64ISAR2_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 6, 2);
pub const ID_AA64MMFR0_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 7, 0);
pub const ID_AA64MMFR1_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 7, 1);
pub const ID_AA64MMFR2_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 0, 7, 2);

// Cache identification.
pub const CCSIDR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 1, 0, 0, 0);
pub const CLIDR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 1, 0, 0, 1);
pub const CSSELR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 2, 0, 0, 0);
pub const CTR_EL0: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 3, 0, 0, 1);

pub const ACTLR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 0, 1, 0, 1);

// Debug and OS lock.
pub const MDSCR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(2, 0, 0, 2, 2);
pub const OSLAR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(2, 0, 1, 0, 4);
pub const OSLSR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(2, 0, 1, 1, 4);
pub const OSDLR_EL1: AArch64SysRegId = AArch64SysRegId::new_unchecked(2, 0, 1, 3, 4);

// Generic timer.
pub const CNTFRQ_EL0: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 3, 14, 0, 0);
pub const CNTVCT_EL0: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 3, 14, 0, 2);
pub const CNTV_CTL_EL0: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 3, 14, 3, 1);
pub const CNTV_CVAL_EL0: AArch64SysRegId = AArch64SysRegId::new_unchecked(3, 3, 14, 3, 2);
