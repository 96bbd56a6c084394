// Copyright 2018 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cmp::max;
use std::cmp::min;
use std::cmp::Ord;
use std::cmp::Ordering;
use std::cmp::PartialOrd;

use remain::sorted;
use thiserror::Error;

use crate::bus::AccessWidth;

#[sorted]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("no register at offset {0:#x}")]
    NoRegister(RegisterOffset),
    #[error("{width} access at {offset:#x} does not fit in register {name}")]
    PartialAccess {
        name: &'static str,
        offset: RegisterOffset,
        width: AccessWidth,
    },
    #[error("read of write-only register {name} at {offset:#x}")]
    ReadFromWriteOnly {
        name: &'static str,
        offset: RegisterOffset,
    },
    #[error("write of read-only register {name} at {offset:#x}")]
    WriteToReadOnly {
        name: &'static str,
        offset: RegisterOffset,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Type of offset in the register space.
pub type RegisterOffset = u64;

/// This represents a range of memory in the register space starting.
/// Both from and to are inclusive.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct RegisterRange {
    pub from: RegisterOffset,
    pub to: RegisterOffset,
}

impl Ord for RegisterRange {
    fn cmp(&self, other: &RegisterRange) -> Ordering {
        self.from.cmp(&other.from)
    }
}

impl PartialOrd for RegisterRange {
    fn partial_cmp(&self, other: &RegisterRange) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl RegisterRange {
    /// Return true if those range overlaps.
    pub fn overlap_with(&self, other: &RegisterRange) -> bool {
        !(self.from > other.to || self.to < other.from)
    }

    /// Get the overlapping part of two RegisterRange.
    /// Return is Option(overlap_from, overlap_to).
    /// For example, (4,7).overlap_range(5, 8) will be Some(5, 7).
    pub fn overlap_range(&self, other: &RegisterRange) -> Option<RegisterRange> {
        if !self.overlap_with(other) {
            return None;
        }
        Some(RegisterRange {
            from: max(self.from, other.from),
            to: min(self.to, other.to),
        })
    }

    /// Return true if `other` lies entirely inside this range.
    pub fn covers(&self, other: &RegisterRange) -> bool {
        self.from <= other.from && other.to <= self.to
    }
}

/// Who may access a register from the guest side. The device itself can always update it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl RegisterAccess {
    pub fn readable(self) -> bool {
        self != RegisterAccess::WriteOnly
    }

    pub fn writeable(self) -> bool {
        self != RegisterAccess::ReadOnly
    }
}

/// Spec for a register. It specifies it's location on register space, size in bytes, the value
/// it holds after reset and guest writable mask.
#[derive(Clone, Debug)]
pub struct RegisterSpec {
    pub name: &'static str,
    pub access: RegisterAccess,
    pub offset: RegisterOffset,
    /// Size in bytes: 1, 2, 4 or 8.
    pub size: u64,
    pub reset_value: u64,
    /// Only masked bits could be written by guest.
    pub guest_writeable_mask: u64,
}

/// A register backed by a single 64-bit value. Byte, halfword and word accesses are views of
/// the same storage at the access offset.
#[derive(Clone, Debug)]
pub struct Register {
    spec: RegisterSpec,
    value: u64,
}

impl Register {
    pub fn new(spec: RegisterSpec) -> Self {
        let value = spec.reset_value & size_mask(spec.size);
        Register { spec, value }
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn access(&self) -> RegisterAccess {
        self.spec.access
    }

    /// Range of this register.
    pub fn range(&self) -> RegisterRange {
        RegisterRange {
            from: self.spec.offset,
            to: self.spec.offset + self.spec.size - 1,
        }
    }

    // Returns the bit position of an access of `width` at `addr` inside this register.
    fn shift_for(&self, addr: RegisterOffset, width: AccessWidth) -> Result<u64> {
        let access = RegisterRange {
            from: addr,
            to: addr + width.bytes() - 1,
        };
        if !self.range().covers(&access) {
            return Err(Error::PartialAccess {
                name: self.spec.name,
                offset: addr,
                width,
            });
        }
        Ok((addr - self.spec.offset) * 8)
    }

    /// Handles a guest read of `width` bytes at absolute offset `addr`.
    pub fn read(&self, addr: RegisterOffset, width: AccessWidth) -> Result<u64> {
        if !self.spec.access.readable() {
            return Err(Error::ReadFromWriteOnly {
                name: self.spec.name,
                offset: addr,
            });
        }
        let shift = self.shift_for(addr, width)?;
        Ok((self.value >> shift) & width.mask())
    }

    /// Handles a guest write of the low `width` bytes of `value` at absolute offset `addr`.
    /// Bits outside the guest writeable mask keep their value.
    pub fn write(&mut self, addr: RegisterOffset, width: AccessWidth, value: u64) -> Result<()> {
        if !self.spec.access.writeable() {
            return Err(Error::WriteToReadOnly {
                name: self.spec.name,
                offset: addr,
            });
        }
        let shift = self.shift_for(addr, width)?;
        let writeable = (width.mask() << shift) & self.spec.guest_writeable_mask;
        self.value = (self.value & !writeable) | ((value << shift) & writeable);
        Ok(())
    }

    /// Get current value of this register.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Set value from device side. Masks are not applied.
    pub fn set_value(&mut self, val: u64) {
        self.value = val & size_mask(self.spec.size);
    }

    /// Set masked bits.
    pub fn set_bits(&mut self, mask: u64) {
        self.set_value(self.value | mask);
    }

    /// Clear masked bits.
    pub fn clear_bits(&mut self, mask: u64) {
        self.value &= !mask;
    }

    /// Reset this register to default value.
    pub fn reset(&mut self) {
        self.value = self.spec.reset_value & size_mask(self.spec.size);
    }
}

fn size_mask(size: u64) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

/// Macro helps to build a static register: read only, the value won't change in it's lifetime.
#[macro_export]
macro_rules! static_register {
    (ty: $ty:ty, offset: $offset:expr, value: $value:expr $(,)?) => {
        $crate::static_register!(name: "static", ty: $ty, offset: $offset, value: $value)
    };
    (name: $name:expr, ty: $ty:ty, offset: $offset:expr, value: $value:expr $(,)?) => {
        $crate::register_space::Register::new($crate::register_space::RegisterSpec {
            name: $name,
            access: $crate::register_space::RegisterAccess::ReadOnly,
            offset: $offset,
            size: ::std::mem::size_of::<$ty>() as u64,
            reset_value: ($value) as u64,
            guest_writeable_mask: 0,
        })
    };
}

/// Macro helps to build a register. Without a `guest_writeable_mask` every bit is writeable.
#[macro_export]
macro_rules! register {
    (
        name: $name:expr,
        access: $access:ident,
        ty: $ty:ty,
        offset: $offset:expr,
        reset_value: $rv:expr,
        guest_writeable_mask: $mask:expr $(,)?
    ) => {
        $crate::register_space::Register::new($crate::register_space::RegisterSpec {
            name: $name,
            access: $crate::register_space::RegisterAccess::$access,
            offset: $offset,
            size: ::std::mem::size_of::<$ty>() as u64,
            reset_value: ($rv) as u64,
            guest_writeable_mask: ($mask) as u64,
        })
    };
    (
        name: $name:expr,
        access: $access:ident,
        ty: $ty:ty,
        offset: $offset:expr,
        reset_value: $rv:expr $(,)?
    ) => {
        $crate::register!(
            name: $name,
            access: $access,
            ty: $ty,
            offset: $offset,
            reset_value: $rv,
            guest_writeable_mask: u64::MAX,
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_reg() {
        let r = static_register!(ty: u8, offset: 3, value: 32,);
        assert_eq!(r.range(), RegisterRange { from: 3, to: 3 });
        assert_eq!(r.read(3, AccessWidth::Byte), Ok(32));
        assert!(matches!(
            r.clone().write(3, AccessWidth::Byte, 0),
            Err(Error::WriteToReadOnly { offset: 3, .. })
        ));
    }

    #[test]
    fn static_reg_halfword_views() {
        let r = static_register!(ty: u32, offset: 8, value: 0xdead_beef_u32);
        assert_eq!(r.read(8, AccessWidth::Word), Ok(0xdead_beef));
        assert_eq!(r.read(8, AccessWidth::HalfWord), Ok(0xbeef));
        assert_eq!(r.read(10, AccessWidth::HalfWord), Ok(0xdead));
        assert_eq!(r.read(11, AccessWidth::Byte), Ok(0xde));
        assert!(matches!(
            r.read(10, AccessWidth::Word),
            Err(Error::PartialAccess { offset: 10, .. })
        ));
    }

    #[test]
    fn reg_read_write() {
        let mut r = register!(
            name: "",
            access: ReadWrite,
            ty: u32,
            offset: 0,
            reset_value: 0xffff_ffff_u32,
            guest_writeable_mask: 0x00ff_00ff_u32,
        );
        assert_eq!(r.read(0, AccessWidth::Word), Ok(0xffff_ffff));
        r.write(0, AccessWidth::Word, 0).unwrap();
        assert_eq!(r.value(), 0xff00_ff00);
        r.write(2, AccessWidth::Byte, 0x12).unwrap();
        assert_eq!(r.value(), 0xff12_ff00);
        r.reset();
        assert_eq!(r.value(), 0xffff_ffff);
    }

    #[test]
    fn write_only_reg() {
        let mut r = register!(
            name: "ICR",
            access: WriteOnly,
            ty: u16,
            offset: 0x44,
            reset_value: 0,
        );
        r.write(0x44, AccessWidth::HalfWord, 0x1234).unwrap();
        assert_eq!(r.value(), 0x1234);
        assert_eq!(
            r.read(0x44, AccessWidth::HalfWord),
            Err(Error::ReadFromWriteOnly {
                name: "ICR",
                offset: 0x44
            })
        );
    }

    #[test]
    fn device_side_updates() {
        let mut r = register!(
            name: "RIS",
            access: ReadOnly,
            ty: u16,
            offset: 0,
            reset_value: 0,
        );
        r.set_bits(0x30);
        r.set_bits(0x1_0000);
        assert_eq!(r.value(), 0x30);
        r.clear_bits(0x10);
        assert_eq!(r.read(0, AccessWidth::HalfWord), Ok(0x20));
        r.set_value(0xffff_ffff);
        assert_eq!(r.value(), 0xffff);
    }

    #[test]
    fn doubleword_reg() {
        let mut r = register!(
            name: "Q",
            access: ReadWrite,
            ty: u64,
            offset: 0x10,
            reset_value: 0,
        );
        r.write(0x14, AccessWidth::Word, 0xaabb_ccdd).unwrap();
        r.write(0x10, AccessWidth::Word, 0x1122_3344).unwrap();
        assert_eq!(r.value(), 0xaabb_ccdd_1122_3344);
        assert_eq!(
            r.read(0x10, AccessWidth::DoubleWord),
            Ok(0xaabb_ccdd_1122_3344)
        );
    }

    #[test]
    fn range_overlap() {
        let a = RegisterRange { from: 4, to: 7 };
        let b = RegisterRange { from: 5, to: 8 };
        assert_eq!(a.overlap_range(&b), Some(RegisterRange { from: 5, to: 7 }));
        assert!(!a.overlap_with(&RegisterRange { from: 8, to: 9 }));
        assert!(a.covers(&RegisterRange { from: 5, to: 6 }));
        assert!(!a.covers(&b));
    }
}
