// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Userspace GICv2 model for a single vCPU.
//!
//! `Vgic` owns the interrupt state: a distributor with the SPIs and a bank with the private
//! interrupts of the CPU. `GicDistributor` is the MMIO front end that sits on the bus.

mod gicd;
mod irq;
mod vgic;

pub use self::gicd::GicDistributor;
pub use self::gicd::GICD_SIZE;
pub use self::irq::Irq;
pub use self::irq::IrqConfig;
pub use self::irq::IrqHandler;
pub use self::irq::IrqKind;
pub use self::irq::IrqState;
pub use self::irq::PendingList;
pub use self::irq::NUM_IRQS;
pub use self::irq::NUM_PRIVATE_IRQS;
pub use self::irq::NUM_SGIS;
pub use self::irq::SPURIOUS_IRQ;
pub use self::vgic::IrqNotification;
pub use self::vgic::IrqNotificationKind;
pub use self::vgic::Vgic;
pub use self::vgic::MAINTENANCE_PPI;
pub use self::vgic::VIRTUAL_TIMER_PPI;
