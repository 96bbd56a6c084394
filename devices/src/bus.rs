// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Handles routing to devices in an address space.

use std::cmp::Ord;
use std::cmp::Ordering;
use std::cmp::PartialEq;
use std::cmp::PartialOrd;
use std::collections::BTreeMap;
use std::fmt;
use std::result;

use base::trace;
use base::warn;
use enumn::N;
use remain::sorted;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use vm_memory::GuestMemory;

use crate::irqchip::Vgic;

/// Size of a single guest load or store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, N, Serialize, Deserialize)]
#[repr(u8)]
pub enum AccessWidth {
    Byte = 1,
    HalfWord = 2,
    Word = 4,
    DoubleWord = 8,
}

impl AccessWidth {
    /// Returns the width of an access of `bytes` bytes, if it is a width the bus can route.
    pub fn from_bytes(bytes: usize) -> Option<AccessWidth> {
        u8::try_from(bytes).ok().and_then(AccessWidth::n)
    }

    pub fn bytes(self) -> u64 {
        self as u64
    }

    /// Mask covering the bits of a value of this width.
    pub fn mask(self) -> u64 {
        match self {
            AccessWidth::DoubleWord => !0,
            w => (1u64 << (w.bytes() * 8)) - 1,
        }
    }
}

impl fmt::Display for AccessWidth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-bit", self.bytes() * 8)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// Information about how a device was accessed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct BusAccessInfo {
    /// Offset from base address that the device was accessed at.
    pub offset: u64,
    /// Absolute address of the device's access in its address space.
    pub address: u64,
}

impl BusAccessInfo {
    /// The error a device returns for an access it does not implement.
    pub fn unsupported(&self, width: AccessWidth, direction: Direction) -> Error {
        Error::UnsupportedAccess {
            address: self.address,
            width,
            direction,
        }
    }
}

impl std::fmt::Display for BusAccessInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// What a device may touch while it handles an access: the interrupt controller and guest
/// memory. It is only lent for the duration of one call.
pub struct DeviceContext<'a> {
    pub gic: &'a mut Vgic,
    pub mem: &'a GuestMemory,
}

/// Trait for devices that respond to reads or writes in an arbitrary address space.
///
/// The device does not care where it exists in address space as each method is only given an
/// offset into its allocated portion of address space.
#[allow(unused_variables)]
pub trait BusDevice: Send {
    /// Returns a label suitable for debug output.
    fn debug_label(&self) -> String;

    /// Reads `width` bytes at `info.offset` from this device.
    fn read(
        &mut self,
        ctx: &mut DeviceContext,
        info: BusAccessInfo,
        width: AccessWidth,
    ) -> Result<u64> {
        Err(info.unsupported(width, Direction::Read))
    }

    /// Writes the low `width` bytes of `value` at `info.offset` into this device.
    fn write(
        &mut self,
        ctx: &mut DeviceContext,
        info: BusAccessInfo,
        width: AccessWidth,
        value: u64,
    ) -> Result<()> {
        Err(info.unsupported(width, Direction::Write))
    }

    /// The guest completed interrupt `irq`, which this device registered for.
    fn irq_eoi(&mut self, ctx: &mut DeviceContext, irq: u32) {}

    /// The line level of interrupt `irq`, which this device registered for, was changed.
    fn irq_level_changed(&mut self, ctx: &mut DeviceContext, irq: u32, level: bool) {}

    /// Host side data for the device arrived, e.g. terminal keystrokes or a network frame.
    fn backend_input(&mut self, ctx: &mut DeviceContext, data: &[u8]) -> Result<()> {
        warn!(
            "{}: dropping {} bytes of backend input",
            self.debug_label(),
            data.len()
        );
        Ok(())
    }

    /// Returns the device to its power-on state.
    fn reset(&mut self) {}
}

#[sorted]
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("{direction} of {width} at {address:#x} is not aligned to its width")]
    MisalignedAccess {
        address: u64,
        width: AccessWidth,
        direction: Direction,
    },
    #[error("new device {base:#x},{len:#x} overlaps with an old device {other_base:#x},{other_len:#x}")]
    Overlap {
        base: u64,
        len: u64,
        other_base: u64,
        other_len: u64,
    },
    #[error("unsupported {direction} of {width} at {address:#x}")]
    UnsupportedAccess {
        address: u64,
        width: AccessWidth,
        direction: Direction,
    },
}

pub type Result<T> = result::Result<T, Error>;

/// Holds a base and length representing the address space occupied by a `BusDevice`.
///
/// * base - The address at which the range start.
/// * len - The length of the range in bytes.
#[derive(Copy, Clone, Serialize, Deserialize)]
pub struct BusRange {
    pub base: u64,
    pub len: u64,
}

impl BusRange {
    /// Returns true if `addr` is within the range.
    pub fn contains(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.base.saturating_add(self.len)
    }

    /// Returns true if there is overlap with the given range.
    pub fn overlaps(&self, base: u64, len: u64) -> bool {
        self.base < base.saturating_add(len) && base < self.base.saturating_add(self.len)
    }
}

impl Eq for BusRange {}

impl PartialEq for BusRange {
    fn eq(&self, other: &BusRange) -> bool {
        self.base == other.base
    }
}

impl Ord for BusRange {
    fn cmp(&self, other: &BusRange) -> Ordering {
        self.base.cmp(&other.base)
    }
}

impl PartialOrd for BusRange {
    fn partial_cmp(&self, other: &BusRange) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for BusRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}..+{:#x}", self.base, self.len)
    }
}

/// A device container for routing reads and writes over some address space.
///
/// Devices are owned by the bus and registered once, when the VM is built.
#[derive(Default)]
pub struct Bus {
    devices: BTreeMap<BusRange, Box<dyn BusDevice>>,
}

impl Bus {
    /// Constructs an a bus with an empty address space.
    pub fn new() -> Bus {
        Bus::default()
    }

    /// Returns the range of the device that owns `addr`, if any.
    pub fn find(&self, addr: u64) -> Option<BusRange> {
        let (range, _) = self
            .devices
            .range(..=BusRange { base: addr, len: 1 })
            .next_back()?;
        if range.contains(addr) {
            Some(*range)
        } else {
            None
        }
    }

    /// Puts the given device at the given address space.
    pub fn insert(&mut self, device: Box<dyn BusDevice>, base: u64, len: u64) -> Result<()> {
        if len == 0 {
            return Err(Error::Overlap {
                base,
                len,
                other_base: 0,
                other_len: 0,
            });
        }

        // Reject all cases where the new device's range overlaps with an existing device.
        if let Some(range) = self.devices.keys().find(|range| range.overlaps(base, len)) {
            return Err(Error::Overlap {
                base,
                len,
                other_base: range.base,
                other_len: range.len,
            });
        }

        self.devices.insert(BusRange { base, len }, device);
        Ok(())
    }

    // Finds the device for an access of `width` at `addr` and the access info to hand it.
    fn route(
        &mut self,
        addr: u64,
        width: AccessWidth,
        direction: Direction,
    ) -> Result<(&mut Box<dyn BusDevice>, BusAccessInfo)> {
        if addr % width.bytes() != 0 {
            return Err(Error::MisalignedAccess {
                address: addr,
                width,
                direction,
            });
        }
        let unsupported = Error::UnsupportedAccess {
            address: addr,
            width,
            direction,
        };
        let range = self.find(addr).ok_or_else(|| unsupported.clone())?;
        let offset = addr - range.base;
        if offset + width.bytes() > range.len {
            return Err(unsupported);
        }
        let info = BusAccessInfo {
            offset,
            address: addr,
        };
        let device = self.devices.get_mut(&range).ok_or(unsupported)?;
        Ok((device, info))
    }

    /// Reads `width` bytes at `addr` from the device that owns it.
    pub fn read(&mut self, ctx: &mut DeviceContext, addr: u64, width: AccessWidth) -> Result<u64> {
        let (device, info) = self.route(addr, width, Direction::Read)?;
        let value = device.read(ctx, info, width)? & width.mask();
        trace!("{}: read {} {} -> {:#x}", device.debug_label(), width, info, value);
        Ok(value)
    }

    /// Writes the low `width` bytes of `value` at `addr` to the device that owns it.
    pub fn write(
        &mut self,
        ctx: &mut DeviceContext,
        addr: u64,
        width: AccessWidth,
        value: u64,
    ) -> Result<()> {
        let (device, info) = self.route(addr, width, Direction::Write)?;
        trace!("{}: write {} {} <- {:#x}", device.debug_label(), width, info, value);
        device.write(ctx, info, width, value & width.mask())
    }

    /// Delivers an end-of-interrupt for `irq` to the device registered at `base`.
    ///
    /// Returns false if there is no device at `base`.
    pub fn irq_eoi(&mut self, ctx: &mut DeviceContext, base: u64, irq: u32) -> bool {
        match self.devices.get_mut(&BusRange { base, len: 1 }) {
            Some(device) => {
                device.irq_eoi(ctx, irq);
                true
            }
            None => false,
        }
    }

    /// Delivers a level change of `irq` to the device registered at `base`.
    ///
    /// Returns false if there is no device at `base`.
    pub fn irq_level_changed(
        &mut self,
        ctx: &mut DeviceContext,
        base: u64,
        irq: u32,
        level: bool,
    ) -> bool {
        match self.devices.get_mut(&BusRange { base, len: 1 }) {
            Some(device) => {
                device.irq_level_changed(ctx, irq, level);
                true
            }
            None => false,
        }
    }

    /// Hands host side input to the device registered at `base`.
    pub fn backend_input(&mut self, ctx: &mut DeviceContext, base: u64, data: &[u8]) -> Result<()> {
        match self.devices.get_mut(&BusRange { base, len: 1 }) {
            Some(device) => device.backend_input(ctx, data),
            None => Err(Error::UnsupportedAccess {
                address: base,
                width: AccessWidth::Byte,
                direction: Direction::Write,
            }),
        }
    }

    /// Resets every device on the bus.
    pub fn reset_devices(&mut self) {
        for device in self.devices.values_mut() {
            device.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sync::Mutex;
    use vm_memory::GuestAddress;

    use super::*;

    struct DummyDevice;

    impl BusDevice for DummyDevice {
        fn debug_label(&self) -> String {
            "dummy device".to_owned()
        }
    }

    // What a `ConstantDevice` saw, shared so tests can inspect it after the bus owns the device.
    #[derive(Default)]
    struct Seen {
        last_write: Option<(u64, AccessWidth, u64)>,
        eois: Vec<u32>,
    }

    struct ConstantDevice {
        uses_full_addr: bool,
        seen: Arc<Mutex<Seen>>,
    }

    impl ConstantDevice {
        fn new(uses_full_addr: bool) -> Self {
            ConstantDevice {
                uses_full_addr,
                seen: Arc::new(Mutex::new(Seen::default())),
            }
        }
    }

    impl BusDevice for ConstantDevice {
        fn debug_label(&self) -> String {
            "constant device".to_owned()
        }

        fn read(
            &mut self,
            _ctx: &mut DeviceContext,
            info: BusAccessInfo,
            _width: AccessWidth,
        ) -> Result<u64> {
            let addr = if self.uses_full_addr {
                info.address
            } else {
                info.offset
            };
            Ok(0x0807_0605_0403_0201u64.wrapping_add(addr))
        }

        fn write(
            &mut self,
            _ctx: &mut DeviceContext,
            info: BusAccessInfo,
            width: AccessWidth,
            value: u64,
        ) -> Result<()> {
            self.seen.lock().last_write = Some((info.offset, width, value));
            Ok(())
        }

        fn irq_eoi(&mut self, _ctx: &mut DeviceContext, irq: u32) {
            self.seen.lock().eois.push(irq);
        }
    }

    fn test_context() -> (Vgic, GuestMemory) {
        (
            Vgic::new(),
            GuestMemory::new(&[(GuestAddress(0), 0x10000)]).unwrap(),
        )
    }

    #[test]
    fn bus_insert() {
        let mut bus = Bus::new();
        assert!(bus.insert(Box::new(DummyDevice), 0x10, 0).is_err());
        assert!(bus.insert(Box::new(DummyDevice), 0x10, 0x10).is_ok());
        assert!(bus.insert(Box::new(DummyDevice), 0x0f, 0x10).is_err());
        assert!(bus.insert(Box::new(DummyDevice), 0x10, 0x10).is_err());
        assert!(bus.insert(Box::new(DummyDevice), 0x10, 0x15).is_err());
        assert!(bus.insert(Box::new(DummyDevice), 0x12, 0x15).is_err());
        assert!(bus.insert(Box::new(DummyDevice), 0x12, 0x01).is_err());
        assert!(bus.insert(Box::new(DummyDevice), 0x0, 0x20).is_err());
        assert!(bus.insert(Box::new(DummyDevice), 0x20, 0x05).is_ok());
        assert!(bus.insert(Box::new(DummyDevice), 0x25, 0x05).is_ok());
        assert!(bus.insert(Box::new(DummyDevice), 0x0, 0x10).is_ok());
    }

    #[test]
    fn bus_overlap_reports_other_device() {
        let mut bus = Bus::new();
        bus.insert(Box::new(DummyDevice), 0x1000, 0x100).unwrap();
        assert_eq!(
            bus.insert(Box::new(DummyDevice), 0x10f0, 0x100),
            Err(Error::Overlap {
                base: 0x10f0,
                len: 0x100,
                other_base: 0x1000,
                other_len: 0x100
            })
        );
    }

    #[test]
    fn bus_find() {
        let mut bus = Bus::new();
        bus.insert(Box::new(DummyDevice), 0x10, 0x10).unwrap();
        bus.insert(Box::new(DummyDevice), 0x40, 0x10).unwrap();
        assert_eq!(bus.find(0x10).map(|r| r.base), Some(0x10));
        assert_eq!(bus.find(0x1f).map(|r| r.base), Some(0x10));
        assert!(bus.find(0x20).is_none());
        assert!(bus.find(0x0f).is_none());
        assert_eq!(bus.find(0x4f).map(|r| r.len), Some(0x10));
    }

    #[test]
    fn default_accessors_are_unsupported() {
        let (mut gic, mem) = test_context();
        let mut ctx = DeviceContext {
            gic: &mut gic,
            mem: &mem,
        };
        let mut bus = Bus::new();
        bus.insert(Box::new(DummyDevice), 0x10, 0x10).unwrap();
        assert_eq!(
            bus.read(&mut ctx, 0x14, AccessWidth::Word),
            Err(Error::UnsupportedAccess {
                address: 0x14,
                width: AccessWidth::Word,
                direction: Direction::Read
            })
        );
        assert!(matches!(
            bus.write(&mut ctx, 0x14, AccessWidth::Word, 0),
            Err(Error::UnsupportedAccess {
                direction: Direction::Write,
                ..
            })
        ));
    }

    #[test]
    fn bus_read_write_offsets() {
        let (mut gic, mem) = test_context();
        let mut ctx = DeviceContext {
            gic: &mut gic,
            mem: &mem,
        };
        let mut bus = Bus::new();
        let offset_dev = ConstantDevice::new(false);
        let seen = offset_dev.seen.clone();
        bus.insert(Box::new(offset_dev), 0x100, 0x20).unwrap();
        bus.insert(Box::new(ConstantDevice::new(true)), 0x200, 0x20)
            .unwrap();

        assert_eq!(bus.read(&mut ctx, 0x100, AccessWidth::Byte), Ok(0x01));
        assert_eq!(bus.read(&mut ctx, 0x104, AccessWidth::Word), Ok(0x0403_0205));
        assert_eq!(bus.read(&mut ctx, 0x204, AccessWidth::HalfWord), Ok(0x0405));
        assert_eq!(
            bus.read(&mut ctx, 0x108, AccessWidth::DoubleWord),
            Ok(0x0807_0605_0403_0209)
        );
        bus.write(&mut ctx, 0x110, AccessWidth::HalfWord, 0xdead_beef)
            .unwrap();
        // The device sees its own offset and the value truncated to the access width.
        assert_eq!(
            seen.lock().last_write,
            Some((0x10, AccessWidth::HalfWord, 0xbeef))
        );
    }

    #[test]
    fn bus_boundaries() {
        let (mut gic, mem) = test_context();
        let mut ctx = DeviceContext {
            gic: &mut gic,
            mem: &mem,
        };
        let mut bus = Bus::new();
        bus.insert(Box::new(ConstantDevice::new(false)), 0x1000, 0x100)
            .unwrap();

        assert!(bus.read(&mut ctx, 0x1000, AccessWidth::Byte).is_ok());
        assert!(bus.read(&mut ctx, 0x1000 + 0x100 - 1, AccessWidth::Byte).is_ok());
        assert!(matches!(
            bus.read(&mut ctx, 0x1000 + 0x100, AccessWidth::Byte),
            Err(Error::UnsupportedAccess { .. })
        ));
        assert!(matches!(
            bus.write(&mut ctx, 0x0fff, AccessWidth::Byte, 0),
            Err(Error::UnsupportedAccess { .. })
        ));
        // A word at the last word slot fits, a doubleword straddling the end does not.
        assert!(bus.read(&mut ctx, 0x10fc, AccessWidth::Word).is_ok());
        assert!(matches!(
            bus.read(&mut ctx, 0x10f8 + 8, AccessWidth::DoubleWord),
            Err(Error::UnsupportedAccess { .. })
        ));
    }

    #[test]
    fn misaligned_access() {
        let (mut gic, mem) = test_context();
        let mut ctx = DeviceContext {
            gic: &mut gic,
            mem: &mem,
        };
        let mut bus = Bus::new();
        bus.insert(Box::new(ConstantDevice::new(false)), 0x1000, 0x100)
            .unwrap();
        assert_eq!(
            bus.read(&mut ctx, 0x1002, AccessWidth::Word),
            Err(Error::MisalignedAccess {
                address: 0x1002,
                width: AccessWidth::Word,
                direction: Direction::Read
            })
        );
        assert!(matches!(
            bus.write(&mut ctx, 0x1001, AccessWidth::HalfWord, 0),
            Err(Error::MisalignedAccess { .. })
        ));
    }

    #[test]
    fn eoi_routed_by_base() {
        let (mut gic, mem) = test_context();
        let mut ctx = DeviceContext {
            gic: &mut gic,
            mem: &mem,
        };
        let mut bus = Bus::new();
        let dev = ConstantDevice::new(false);
        let seen = dev.seen.clone();
        bus.insert(Box::new(dev), 0x1000, 0x100).unwrap();
        assert!(bus.irq_eoi(&mut ctx, 0x1000, 33));
        assert!(!bus.irq_eoi(&mut ctx, 0x1004, 33));
        assert_eq!(seen.lock().eois, vec![33]);
        assert!(!bus.irq_level_changed(&mut ctx, 0x2000, 33, true));
        assert!(bus.backend_input(&mut ctx, 0x2000, b"x").is_err());
        assert!(bus.backend_input(&mut ctx, 0x1000, b"x").is_ok());
    }

    #[test]
    fn access_width() {
        assert_eq!(AccessWidth::from_bytes(4), Some(AccessWidth::Word));
        assert_eq!(AccessWidth::from_bytes(3), None);
        assert_eq!(AccessWidth::from_bytes(256), None);
        assert_eq!(AccessWidth::HalfWord.mask(), 0xffff);
        assert_eq!(AccessWidth::DoubleWord.mask(), u64::MAX);
        assert_eq!(AccessWidth::Byte.to_string(), "8-bit");
    }

    #[test]
    fn bus_range_contains() {
        let a = BusRange {
            base: 0x1000,
            len: 0x400,
        };
        assert!(a.contains(0x1000));
        assert!(a.contains(0x13ff));
        assert!(!a.contains(0xfff));
        assert!(!a.contains(0x1400));
        assert!(a.contains(0x1200));
    }

    #[test]
    fn bus_range_overlap() {
        let a = BusRange {
            base: 0x1000,
            len: 0x400,
        };
        assert!(a.overlaps(0x1000, 0x400));
        assert!(a.overlaps(0xf00, 0x400));
        assert!(a.overlaps(0x1000, 0x01));
        assert!(a.overlaps(0xfff, 0x02));
        assert!(a.overlaps(0x1100, 0x100));
        assert!(a.overlaps(0x13ff, 0x100));
        assert!(!a.overlaps(0x1400, 0x100));
        assert!(!a.overlaps(0xf00, 0x100));
    }
}
