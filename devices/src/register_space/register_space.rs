// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::btree_map::BTreeMap;

use super::register::Error;
use super::register::Register;
use super::register::RegisterOffset;
use super::register::RegisterRange;
use super::register::Result;
use crate::bus::AccessWidth;

/// Register space repesents a set of registers. It can handle read/write operations.
#[derive(Default)]
pub struct RegisterSpace {
    regs: BTreeMap<RegisterRange, Register>,
}

impl RegisterSpace {
    /// Creates a new empty RegisterSpace.
    pub fn new() -> RegisterSpace {
        RegisterSpace::default()
    }

    /// Add a register to register space.
    pub fn add_register(&mut self, reg: Register) {
        let range = reg.range();
        debug_assert!(
            !self.regs.keys().any(|r| r.overlap_with(&range)),
            "register {} overlaps an existing register",
            reg.name()
        );
        self.regs.insert(range, reg);
    }

    /// Add an array of registers.
    pub fn add_registers<I: IntoIterator<Item = Register>>(&mut self, regs: I) {
        for r in regs {
            self.add_register(r);
        }
    }

    /// Get register at this addr.
    pub fn get_register(&self, addr: RegisterOffset) -> Option<&Register> {
        let (range, reg) = self
            .regs
            .range(..=RegisterRange {
                from: addr,
                to: addr,
            })
            .next_back()?;
        if addr <= range.to {
            Some(reg)
        } else {
            None
        }
    }

    fn get_register_mut(&mut self, addr: RegisterOffset) -> Option<&mut Register> {
        let (range, reg) = self
            .regs
            .range_mut(
                ..=RegisterRange {
                    from: addr,
                    to: addr,
                },
            )
            .next_back()?;
        if addr <= range.to {
            Some(reg)
        } else {
            None
        }
    }

    /// Reads `width` bytes at `addr`. The access must fall inside one register.
    pub fn read(&self, addr: RegisterOffset, width: AccessWidth) -> Result<u64> {
        self.get_register(addr)
            .ok_or(Error::NoRegister(addr))?
            .read(addr, width)
    }

    /// Writes `width` bytes at `addr`. Returns the offset of the register that was written so
    /// the device can apply side effects.
    pub fn write(
        &mut self,
        addr: RegisterOffset,
        width: AccessWidth,
        value: u64,
    ) -> Result<RegisterOffset> {
        let reg = self
            .get_register_mut(addr)
            .ok_or(Error::NoRegister(addr))?;
        reg.write(addr, width, value)?;
        Ok(reg.range().from)
    }

    /// Value of the register at `offset`, or 0 when there is none.
    pub fn value(&self, offset: RegisterOffset) -> u64 {
        self.get_register(offset).map_or(0, Register::value)
    }

    /// Set value from device side.
    pub fn set_value(&mut self, offset: RegisterOffset, val: u64) {
        if let Some(r) = self.get_register_mut(offset) {
            r.set_value(val);
        }
    }

    pub fn set_bits(&mut self, offset: RegisterOffset, mask: u64) {
        if let Some(r) = self.get_register_mut(offset) {
            r.set_bits(mask);
        }
    }

    pub fn clear_bits(&mut self, offset: RegisterOffset, mask: u64) {
        if let Some(r) = self.get_register_mut(offset) {
            r.clear_bits(mask);
        }
    }

    /// Returns every register to its reset value.
    pub fn reset(&mut self) {
        for r in self.regs.values_mut() {
            r.reset();
        }
    }
}
