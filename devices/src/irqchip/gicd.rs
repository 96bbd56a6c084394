// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GICv2 distributor register block, the guest's view of the vGIC.

use base::debug;
use base::warn;

use super::irq::Irq;
use super::irq::IrqConfig;
use super::irq::IrqKind;
use super::irq::NUM_IRQS;
use super::irq::NUM_PRIVATE_IRQS;
use super::vgic::Vgic;
use crate::bus::AccessWidth;
use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::bus::DeviceContext;
use crate::bus::Direction;
use crate::bus::Result;
use crate::register;
use crate::register_space::RegisterSpace;
use crate::static_register;

/// Size of the distributor MMIO window.
pub const GICD_SIZE: u64 = 0x1000;

const GICD_CTLR: u64 = 0x0;
const GICD_TYPER: u64 = 0x4;
const GICD_IIDR: u64 = 0x8;
const GICD_IGROUPR: u64 = 0x80;
const GICD_ISENABLER: u64 = 0x100;
const GICD_ICENABLER: u64 = 0x180;
const GICD_ISPENDR: u64 = 0x200;
const GICD_ICPENDR: u64 = 0x280;
const GICD_ISACTIVER: u64 = 0x300;
const GICD_ICACTIVER: u64 = 0x380;
const GICD_IPRIORITYR: u64 = 0x400;
const GICD_ITARGETSR: u64 = 0x800;
const GICD_ICFGR: u64 = 0xc00;
const GICD_SGIR: u64 = 0xf00;
const GICD_CPENDSGIR: u64 = 0xf10;
const GICD_SPENDSGIR: u64 = 0xf20;
const GICD_ID_START: u64 = 0xfd0;

// One bit per interrupt.
const BITMAP_LEN: u64 = 0x80;
// One byte per interrupt.
const BYTEMAP_LEN: u64 = 0x400;
// Two bits per interrupt.
const ICFGR_LEN: u64 = 0x100;
const SGI_REGS_LEN: u64 = 0x10;

const CTLR_ENABLE: u64 = 1;
// ITLinesNumber = 31 covers 1024 interrupt IDs, CPUNumber = 0.
const TYPER_VALUE: u32 = (NUM_IRQS + 4) / 32 - 1;
// ARM as implementer.
const IIDR_VALUE: u32 = 0x0200_043b;
// Edge configuration for all 16 SGIs.
const ICFGR_SGI_VALUE: u64 = 0xaaaa_aaaa;

// PIDR4..PIDR7, PIDR0..PIDR3 and CIDR0..CIDR3.
const ID_REGS: [u32; 12] = [
    0x04, 0x00, 0x00, 0x00, 0x90, 0xb4, 0x2b, 0x00, 0x0d, 0xf0, 0x05, 0xb1,
];

/// The part of a distributor access that names a bank of per-interrupt registers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum GicdRegister {
    /// Registers kept in the register space.
    Plain,
    Group,
    SetEnable(u32),
    ClearEnable(u32),
    SetPending(u32),
    ClearPending(u32),
    SetActive(u32),
    ClearActive(u32),
    Priority(u32),
    Target(u32),
    Config(u32),
    Sgi,
    Unknown,
}

impl GicdRegister {
    fn decode(offset: u64) -> GicdRegister {
        // First interrupt covered by a register at `offset` in a bank where each interrupt takes
        // `bits` bits.
        let first = |base: u64, bits: u64| ((offset - base) * 8 / bits) as u32;
        match offset {
            GICD_CTLR | GICD_TYPER | GICD_IIDR => GicdRegister::Plain,
            GICD_ID_START..=0xfff => GicdRegister::Plain,
            o if (GICD_IGROUPR..GICD_IGROUPR + BITMAP_LEN).contains(&o) => GicdRegister::Group,
            o if (GICD_ISENABLER..GICD_ISENABLER + BITMAP_LEN).contains(&o) => {
                GicdRegister::SetEnable(first(GICD_ISENABLER, 1))
            }
            o if (GICD_ICENABLER..GICD_ICENABLER + BITMAP_LEN).contains(&o) => {
                GicdRegister::ClearEnable(first(GICD_ICENABLER, 1))
            }
            o if (GICD_ISPENDR..GICD_ISPENDR + BITMAP_LEN).contains(&o) => {
                GicdRegister::SetPending(first(GICD_ISPENDR, 1))
            }
            o if (GICD_ICPENDR..GICD_ICPENDR + BITMAP_LEN).contains(&o) => {
                GicdRegister::ClearPending(first(GICD_ICPENDR, 1))
            }
            o if (GICD_ISACTIVER..GICD_ISACTIVER + BITMAP_LEN).contains(&o) => {
                GicdRegister::SetActive(first(GICD_ISACTIVER, 1))
            }
            o if (GICD_ICACTIVER..GICD_ICACTIVER + BITMAP_LEN).contains(&o) => {
                GicdRegister::ClearActive(first(GICD_ICACTIVER, 1))
            }
            o if (GICD_IPRIORITYR..GICD_IPRIORITYR + BYTEMAP_LEN).contains(&o) => {
                GicdRegister::Priority(first(GICD_IPRIORITYR, 8))
            }
            o if (GICD_ITARGETSR..GICD_ITARGETSR + BYTEMAP_LEN).contains(&o) => {
                GicdRegister::Target(first(GICD_ITARGETSR, 8))
            }
            o if (GICD_ICFGR..GICD_ICFGR + ICFGR_LEN).contains(&o) => {
                GicdRegister::Config(first(GICD_ICFGR, 2))
            }
            GICD_SGIR => GicdRegister::Sgi,
            o if (GICD_CPENDSGIR..GICD_CPENDSGIR + SGI_REGS_LEN).contains(&o) => {
                GicdRegister::Sgi
            }
            o if (GICD_SPENDSGIR..GICD_SPENDSGIR + SGI_REGS_LEN).contains(&o) => {
                GicdRegister::Sgi
            }
            _ => GicdRegister::Unknown,
        }
    }

    // Byte accesses are allowed for the byte-per-interrupt banks and unknown offsets take any
    // width, everything else is word only.
    fn allows(self, width: AccessWidth) -> bool {
        match self {
            GicdRegister::Unknown => true,
            GicdRegister::Priority(_) | GicdRegister::Target(_) | GicdRegister::Sgi => {
                width == AccessWidth::Word || width == AccessWidth::Byte
            }
            _ => width == AccessWidth::Word,
        }
    }
}

/// Front end of the distributor. All state lives in the `Vgic` handed over with each access,
/// only the static identification registers and CTLR are kept here.
pub struct GicDistributor {
    regs: RegisterSpace,
}

impl Default for GicDistributor {
    fn default() -> Self {
        GicDistributor::new()
    }
}

impl GicDistributor {
    pub fn new() -> GicDistributor {
        let mut regs = RegisterSpace::new();
        regs.add_register(register!(
            name: "GICD_CTLR",
            access: ReadWrite,
            ty: u32,
            offset: GICD_CTLR,
            reset_value: 0,
            guest_writeable_mask: CTLR_ENABLE,
        ));
        regs.add_register(static_register!(
            name: "GICD_TYPER",
            ty: u32,
            offset: GICD_TYPER,
            value: TYPER_VALUE,
        ));
        regs.add_register(static_register!(
            name: "GICD_IIDR",
            ty: u32,
            offset: GICD_IIDR,
            value: IIDR_VALUE,
        ));
        for (i, value) in ID_REGS.iter().enumerate() {
            regs.add_register(static_register!(
                name: "GICD_ID",
                ty: u32,
                offset: GICD_ID_START + 4 * i as u64,
                value: *value,
            ));
        }
        GicDistributor { regs }
    }

    fn read_bitmap(gic: &Vgic, first: u32, bit: impl Fn(&Irq) -> bool) -> u64 {
        (0..32)
            .filter(|i| gic.irq(first + i).map_or(false, &bit))
            .fold(0, |acc, i| acc | 1 << i)
    }

    fn write_bitmap(gic: &mut Vgic, first: u32, value: u64, op: fn(&mut Vgic, u32)) {
        for i in (0..32).filter(|i| value & (1 << i) != 0) {
            if first + i < NUM_IRQS {
                op(gic, first + i);
            }
        }
    }

    fn read_bytes(
        gic: &Vgic,
        first: u32,
        width: AccessWidth,
        byte: impl Fn(&Irq) -> u8,
    ) -> u64 {
        (0..width.bytes() as u32)
            .map(|i| gic.irq(first + i).map_or(0, &byte) as u64)
            .enumerate()
            .fold(0, |acc, (i, b)| acc | b << (8 * i))
    }

    fn read_config(gic: &Vgic, first: u32) -> u64 {
        if first < NUM_PRIVATE_IRQS && IrqKind::of(first) == IrqKind::Sgi {
            return ICFGR_SGI_VALUE;
        }
        (0..16)
            .filter(|i| {
                gic.irq(first + i)
                    .map_or(false, |irq| irq.config() == IrqConfig::Edge)
            })
            .fold(0, |acc, i| acc | 2 << (2 * i))
    }

    fn write_config(gic: &mut Vgic, first: u32, value: u64) {
        if IrqKind::of(first) == IrqKind::Sgi {
            debug!("gicd: ignoring write to SGI configuration");
            return;
        }
        for i in 0..16 {
            let config = if value & (2 << (2 * i)) != 0 {
                IrqConfig::Edge
            } else {
                IrqConfig::Level
            };
            if first + i < NUM_IRQS {
                gic.set_config(first + i, config);
            }
        }
    }
}

impl BusDevice for GicDistributor {
    fn debug_label(&self) -> String {
        "gic distributor".to_owned()
    }

    fn read(
        &mut self,
        ctx: &mut DeviceContext,
        info: BusAccessInfo,
        width: AccessWidth,
    ) -> Result<u64> {
        let reg = GicdRegister::decode(info.offset);
        if !reg.allows(width) {
            return Err(info.unsupported(width, Direction::Read));
        }
        let gic = &*ctx.gic;
        let value = match reg {
            GicdRegister::Plain => match self.regs.read(info.offset, width) {
                Ok(v) => v,
                Err(e) => {
                    warn!("gicd: {}", e);
                    0
                }
            },
            GicdRegister::Group => 0,
            GicdRegister::SetEnable(first) | GicdRegister::ClearEnable(first) => {
                Self::read_bitmap(gic, first, |irq| irq.enabled())
            }
            GicdRegister::SetPending(first) | GicdRegister::ClearPending(first) => {
                Self::read_bitmap(gic, first, |irq| irq.pending())
            }
            GicdRegister::SetActive(first) | GicdRegister::ClearActive(first) => {
                Self::read_bitmap(gic, first, |irq| irq.active())
            }
            GicdRegister::Priority(first) => {
                Self::read_bytes(gic, first, width, |irq| irq.priority())
            }
            GicdRegister::Target(first) => Self::read_bytes(gic, first, width, |irq| {
                if irq.kind() == IrqKind::Spi {
                    irq.target()
                } else {
                    1
                }
            }),
            GicdRegister::Config(first) => Self::read_config(gic, first),
            GicdRegister::Sgi => {
                warn!("gicd: SGI register {:#x} read as zero", info.offset);
                0
            }
            GicdRegister::Unknown => {
                warn!("gicd: read of unknown offset {:#x}", info.offset);
                0
            }
        };
        Ok(value)
    }

    fn write(
        &mut self,
        ctx: &mut DeviceContext,
        info: BusAccessInfo,
        width: AccessWidth,
        value: u64,
    ) -> Result<()> {
        let reg = GicdRegister::decode(info.offset);
        if !reg.allows(width) {
            return Err(info.unsupported(width, Direction::Write));
        }
        let gic = &mut *ctx.gic;
        match reg {
            GicdRegister::Plain => match self.regs.write(info.offset, width, value) {
                Ok(GICD_CTLR) => {
                    if self.regs.value(GICD_CTLR) & CTLR_ENABLE != 0 {
                        gic.enable_distributor();
                    } else {
                        gic.disable_distributor();
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("gicd: {}", e),
            },
            GicdRegister::Group => {}
            GicdRegister::SetEnable(first) => Self::write_bitmap(gic, first, value, Vgic::enable),
            GicdRegister::ClearEnable(first) => {
                Self::write_bitmap(gic, first, value, Vgic::disable)
            }
            GicdRegister::SetPending(first) => Self::write_bitmap(gic, first, value, Vgic::assert),
            GicdRegister::ClearPending(first) => {
                Self::write_bitmap(gic, first, value, Vgic::clear_pending)
            }
            GicdRegister::SetActive(first) => {
                Self::write_bitmap(gic, first, value, Vgic::activate)
            }
            GicdRegister::ClearActive(first) => {
                Self::write_bitmap(gic, first, value, Vgic::deactivate)
            }
            GicdRegister::Priority(first) => {
                for i in 0..width.bytes() as u32 {
                    if first + i < NUM_IRQS {
                        gic.set_priority(first + i, (value >> (8 * i)) as u8);
                    }
                }
            }
            GicdRegister::Target(first) => {
                for i in 0..width.bytes() as u32 {
                    let n = first + i;
                    // Private targets are read-only.
                    if n >= NUM_PRIVATE_IRQS && n < NUM_IRQS {
                        gic.set_target(n, (value >> (8 * i)) as u8);
                    }
                }
            }
            GicdRegister::Config(first) => Self::write_config(gic, first, value),
            GicdRegister::Sgi => {
                warn!(
                    "gicd: ignoring SGI register write {:#x} <- {:#x}",
                    info.offset, value
                );
            }
            GicdRegister::Unknown => {
                warn!(
                    "gicd: write of unknown offset {:#x} <- {:#x}",
                    info.offset, value
                );
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.reset();
    }
}
