// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Implements virtio devices, queues, and the MMIO transport.

mod descriptor_chain;
mod queue;
mod virtio_device;
mod virtio_mmio_device;

pub mod console;
pub mod net;

pub use self::console::Console;
pub use self::descriptor_chain::DescriptorChain;
pub use self::descriptor_chain::VIRTQ_DESC_F_NEXT;
pub use self::descriptor_chain::VIRTQ_DESC_F_WRITE;
pub use self::net::Net;
pub use self::net::NetBackend;
pub use self::queue::QueueConfig;
pub use self::queue::SplitQueue;
pub use self::virtio_device::VirtioDevice;
pub use self::virtio_mmio_device::VirtioMmioDevice;
pub use self::virtio_mmio_device::VIRTIO_MMIO_REGION_SZ;

const DEVICE_RESET: u32 = 0x0;

const INTERRUPT_STATUS_USED_RING: u32 = 0x1;

const VIRTIO_F_VERSION_1: u32 = 32;

/// Offsets of the virtio MMIO register block, version 2.
pub mod mmio {
    pub const VIRTIO_MMIO_MAGIC_VALUE: u64 = 0x000;
    pub const VIRTIO_MMIO_VERSION: u64 = 0x004;
    pub const VIRTIO_MMIO_DEVICE_ID: u64 = 0x008;
    pub const VIRTIO_MMIO_VENDOR_ID: u64 = 0x00c;
    pub const VIRTIO_MMIO_DEVICE_FEATURES: u64 = 0x010;
    pub const VIRTIO_MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;
    pub const VIRTIO_MMIO_DRIVER_FEATURES: u64 = 0x020;
    pub const VIRTIO_MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;
    pub const VIRTIO_MMIO_QUEUE_SEL: u64 = 0x030;
    pub const VIRTIO_MMIO_QUEUE_NUM_MAX: u64 = 0x034;
    pub const VIRTIO_MMIO_QUEUE_NUM: u64 = 0x038;
    pub const VIRTIO_MMIO_QUEUE_READY: u64 = 0x044;
    pub const VIRTIO_MMIO_QUEUE_NOTIFY: u64 = 0x050;
    pub const VIRTIO_MMIO_INTERRUPT_STATUS: u64 = 0x060;
    pub const VIRTIO_MMIO_INTERRUPT_ACK: u64 = 0x064;
    pub const VIRTIO_MMIO_STATUS: u64 = 0x070;
    pub const VIRTIO_MMIO_QUEUE_DESC_LOW: u64 = 0x080;
    pub const VIRTIO_MMIO_QUEUE_DESC_HIGH: u64 = 0x084;
    pub const VIRTIO_MMIO_QUEUE_AVAIL_LOW: u64 = 0x090;
    pub const VIRTIO_MMIO_QUEUE_AVAIL_HIGH: u64 = 0x094;
    pub const VIRTIO_MMIO_QUEUE_USED_LOW: u64 = 0x0a0;
    pub const VIRTIO_MMIO_QUEUE_USED_HIGH: u64 = 0x0a4;
    pub const VIRTIO_MMIO_CONFIG_GENERATION: u64 = 0x0fc;
    pub const VIRTIO_MMIO_CONFIG: u64 = 0x100;
}

/// Device status bits written by the driver.
pub mod device_status {
    pub const ACKNOWLEDGE: u32 = 0x01;
    pub const DRIVER: u32 = 0x02;
    pub const DRIVER_OK: u32 = 0x04;
    pub const FEATURES_OK: u32 = 0x08;
    pub const FAILED: u32 = 0x80;
}

/// Virtio device IDs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum DeviceType {
    Net = 1,
    Console = 3,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DeviceType::Net => write!(f, "net"),
            DeviceType::Console => write!(f, "console"),
        }
    }
}

/// Returns the feature bits every modern device offers.
pub fn base_features() -> u64 {
    1 << VIRTIO_F_VERSION_1
}
