// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulates the virtual devices of the guest platform.

mod bus;
pub mod irqchip;
mod pl011;
mod register_space;
pub mod virtio;

pub use self::bus::AccessWidth;
pub use self::bus::Bus;
pub use self::bus::BusAccessInfo;
pub use self::bus::BusDevice;
pub use self::bus::BusRange;
pub use self::bus::DeviceContext;
pub use self::bus::Direction;
pub use self::bus::Error as BusError;
pub use self::bus::Result as BusResult;
pub use self::irqchip::GicDistributor;
pub use self::irqchip::Vgic;
pub use self::pl011::Pl011;
pub use self::pl011::PL011_AMBA_IOMEM_SIZE;
pub use self::register_space::Register;
pub use self::register_space::RegisterAccess;
pub use self::register_space::RegisterSpace;
pub use self::register_space::RegisterSpec;
