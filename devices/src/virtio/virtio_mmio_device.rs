// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use base::debug;
use base::warn;
use vm_memory::GuestAddress;

use super::device_status;
use super::mmio::*;
use super::QueueConfig;
use super::SplitQueue;
use super::VirtioDevice;
use super::DEVICE_RESET;
use super::INTERRUPT_STATUS_USED_RING;
use crate::bus::AccessWidth;
use crate::bus::BusAccessInfo;
use crate::bus::BusDevice;
use crate::bus::DeviceContext;
use crate::bus::Direction;
use crate::bus::Result;
use crate::register_space::RegisterSpace;
use crate::static_register;

const VIRT_MAGIC: u32 = 0x74726976; /* 'virt' */
const VIRT_VERSION: u32 = 2;
const VIRT_VENDOR: u32 = 0x4D565243; /* 'CRVM' */

/// Size of the MMIO window of one virtio device: registers plus configuration space.
pub const VIRTIO_MMIO_REGION_SZ: u64 = 0x200;

/// Implements the
/// [MMIO](http://docs.oasis-open.org/virtio/virtio/v1.1/csprd01/virtio-v1.1-csprd01.html#x1-1090002)
/// transport for virtio devices.
pub struct VirtioMmioDevice {
    device: Box<dyn VirtioDevice>,
    irq: u32,
    id_regs: RegisterSpace,

    queues: Vec<QueueConfig>,
    active: Vec<Option<SplitQueue>>,
    queue_select: u32,

    device_feature_select: u32,
    driver_feature_select: u32,
    acked_features: u64,

    interrupt_status: u32,
    driver_status: u32,
    config_generation: u32,
}

impl VirtioMmioDevice {
    /// Constructs a virtio mmio transport for `device`, interrupting through SPI `irq`.
    pub fn new(device: Box<dyn VirtioDevice>, irq: u32) -> Self {
        let queues: Vec<QueueConfig> = device
            .queue_max_sizes()
            .iter()
            .map(|&s| QueueConfig::new(s))
            .collect();
        let active = queues.iter().map(|_| None).collect();

        let mut id_regs = RegisterSpace::new();
        id_regs.add_registers([
            static_register!(name: "MagicValue", ty: u32, offset: VIRTIO_MMIO_MAGIC_VALUE,
                             value: VIRT_MAGIC),
            static_register!(name: "Version", ty: u32, offset: VIRTIO_MMIO_VERSION,
                             value: VIRT_VERSION),
            static_register!(name: "DeviceID", ty: u32, offset: VIRTIO_MMIO_DEVICE_ID,
                             value: device.device_type() as u32),
            static_register!(name: "VendorID", ty: u32, offset: VIRTIO_MMIO_VENDOR_ID,
                             value: VIRT_VENDOR),
        ]);

        VirtioMmioDevice {
            device,
            irq,
            id_regs,
            queues,
            active,
            queue_select: 0,
            device_feature_select: 0,
            driver_feature_select: 0,
            acked_features: 0,
            interrupt_status: 0,
            driver_status: DEVICE_RESET,
            config_generation: 0,
        }
    }

    /// The SPI this transport raises.
    pub fn irq(&self) -> u32 {
        self.irq
    }

    fn with_queue<U, F>(&self, f: F) -> Option<U>
    where
        F: FnOnce(&QueueConfig) -> U,
    {
        self.queues.get(self.queue_select as usize).map(f)
    }

    fn with_queue_mut<F>(&mut self, f: F)
    where
        F: FnOnce(&mut QueueConfig),
    {
        match self.queues.get_mut(self.queue_select as usize) {
            Some(queue) => f(queue),
            None => warn!(
                "{}: queue {} does not exist",
                self.device.debug_label(),
                self.queue_select
            ),
        }
    }

    // Flags progress on the used rings and raises the interrupt line.
    fn signal_used(&mut self, ctx: &mut DeviceContext) {
        self.interrupt_status |= INTERRUPT_STATUS_USED_RING;
        ctx.gic.assert(self.irq);
    }

    fn set_queue_ready(&mut self, ready: bool) {
        let index = self.queue_select as usize;
        let Some(config) = self.queues.get_mut(index) else {
            warn!(
                "{}: QueueReady for missing queue {}",
                self.device.debug_label(),
                index
            );
            return;
        };
        if !ready {
            config.deactivate();
            self.active[index] = None;
            return;
        }
        if config.ready() {
            return;
        }
        match config.activate() {
            Ok(queue) => self.active[index] = Some(queue),
            Err(e) => warn!(
                "{}: refusing to make queue {} ready: {:#}",
                self.device.debug_label(),
                index,
                e
            ),
        }
    }

    fn notify_queue(&mut self, ctx: &mut DeviceContext, index: u32) {
        let index = index as usize;
        if self.active.get(index).map_or(true, Option::is_none) {
            warn!(
                "{}: notify of queue {} that is not ready",
                self.device.debug_label(),
                index
            );
            return;
        }
        if self.device.notify(ctx.mem, &mut self.active, index) {
            self.signal_used(ctx);
        }
    }

    fn reset(&mut self) {
        debug!("{}: reset by driver", self.device.debug_label());
        self.device.reset();
        self.queues.iter_mut().for_each(QueueConfig::reset);
        self.active.iter_mut().for_each(|q| *q = None);
        self.queue_select = 0;
        self.device_feature_select = 0;
        self.driver_feature_select = 0;
        self.acked_features = 0;
        self.interrupt_status = 0;
        self.driver_status = DEVICE_RESET;
    }

    fn read_mmio(&self, info: BusAccessInfo) -> u32 {
        match info.offset {
            VIRTIO_MMIO_MAGIC_VALUE
            | VIRTIO_MMIO_VERSION
            | VIRTIO_MMIO_DEVICE_ID
            | VIRTIO_MMIO_VENDOR_ID => self
                .id_regs
                .read(info.offset, AccessWidth::Word)
                .unwrap_or(0) as u32,
            VIRTIO_MMIO_DEVICE_FEATURES => {
                if self.device_feature_select < 2 {
                    (self.device.features() >> (self.device_feature_select * 32)) as u32
                } else {
                    0
                }
            }
            VIRTIO_MMIO_QUEUE_NUM_MAX => self.with_queue(|q| q.max_size()).unwrap_or(0).into(),
            VIRTIO_MMIO_QUEUE_READY => self.with_queue(|q| q.ready()).unwrap_or(false).into(),
            VIRTIO_MMIO_INTERRUPT_STATUS => self.interrupt_status,
            VIRTIO_MMIO_STATUS => self.driver_status,
            VIRTIO_MMIO_CONFIG_GENERATION => self.config_generation,
            _ => {
                warn!(
                    "{}: unsupported read address {}",
                    self.device.debug_label(),
                    info
                );
                0
            }
        }
    }

    fn write_mmio(&mut self, ctx: &mut DeviceContext, info: BusAccessInfo, val: u32) {
        macro_rules! hi {
            ($q:expr, $get:ident, $set:ident, $x:expr) => {
                $q.$set(GuestAddress(
                    ($q.$get().offset() & 0xffffffff) | (($x as u64) << 32),
                ))
            };
        }
        macro_rules! lo {
            ($q:expr, $get:ident, $set:ident, $x:expr) => {
                $q.$set(GuestAddress(
                    ($q.$get().offset() & !0xffffffff) | ($x as u64),
                ))
            };
        }

        match info.offset {
            VIRTIO_MMIO_DEVICE_FEATURES_SEL => self.device_feature_select = val,
            VIRTIO_MMIO_DRIVER_FEATURES_SEL => self.driver_feature_select = val,
            VIRTIO_MMIO_DRIVER_FEATURES => {
                if self.driver_feature_select < 2 {
                    let shift = self.driver_feature_select * 32;
                    let page_mask = 0xffff_ffffu64 << shift;
                    let offered = self.device.features();
                    let requested = (val as u64) << shift;
                    if requested & !offered != 0 {
                        warn!(
                            "{}: driver acked unoffered features {:#x}",
                            self.device.debug_label(),
                            requested & !offered
                        );
                    }
                    self.acked_features =
                        (self.acked_features & !page_mask) | (requested & offered);
                    self.device.ack_features(self.acked_features);
                } else {
                    warn!(
                        "invalid ack_features (page {}, value 0x{:x})",
                        self.driver_feature_select, val
                    );
                }
            }
            VIRTIO_MMIO_QUEUE_SEL => self.queue_select = val,
            VIRTIO_MMIO_QUEUE_NUM => self.with_queue_mut(|q| q.set_size(val as u16)),
            VIRTIO_MMIO_QUEUE_READY => self.set_queue_ready(val == 1),
            VIRTIO_MMIO_QUEUE_NOTIFY => self.notify_queue(ctx, val),
            VIRTIO_MMIO_INTERRUPT_ACK => self.interrupt_status &= !val,
            VIRTIO_MMIO_STATUS => {
                if val == DEVICE_RESET {
                    self.reset();
                } else {
                    if val & device_status::FAILED != 0 {
                        warn!("{}: driver reported failure", self.device.debug_label());
                    }
                    self.driver_status = val;
                }
            }
            VIRTIO_MMIO_QUEUE_DESC_LOW => {
                self.with_queue_mut(|q| lo!(q, desc_table, set_desc_table, val))
            }
            VIRTIO_MMIO_QUEUE_DESC_HIGH => {
                self.with_queue_mut(|q| hi!(q, desc_table, set_desc_table, val))
            }
            VIRTIO_MMIO_QUEUE_AVAIL_LOW => {
                self.with_queue_mut(|q| lo!(q, avail_ring, set_avail_ring, val))
            }
            VIRTIO_MMIO_QUEUE_AVAIL_HIGH => {
                self.with_queue_mut(|q| hi!(q, avail_ring, set_avail_ring, val))
            }
            VIRTIO_MMIO_QUEUE_USED_LOW => {
                self.with_queue_mut(|q| lo!(q, used_ring, set_used_ring, val))
            }
            VIRTIO_MMIO_QUEUE_USED_HIGH => {
                self.with_queue_mut(|q| hi!(q, used_ring, set_used_ring, val))
            }
            _ => {
                warn!(
                    "{}: unsupported write address {}",
                    self.device.debug_label(),
                    info
                );
            }
        }
    }
}

impl BusDevice for VirtioMmioDevice {
    fn debug_label(&self) -> String {
        format!("virtio-mmio ({})", self.device.debug_label())
    }

    fn read(
        &mut self,
        _ctx: &mut DeviceContext,
        info: BusAccessInfo,
        width: AccessWidth,
    ) -> Result<u64> {
        if info.offset >= VIRTIO_MMIO_CONFIG {
            if width == AccessWidth::DoubleWord {
                return Err(info.unsupported(width, Direction::Read));
            }
            let mut data = [0u8; 8];
            self.device.read_config(
                info.offset - VIRTIO_MMIO_CONFIG,
                &mut data[..width.bytes() as usize],
            );
            return Ok(u64::from_le_bytes(data));
        }
        if width != AccessWidth::Word {
            return Err(info.unsupported(width, Direction::Read));
        }
        Ok(self.read_mmio(info).into())
    }

    fn write(
        &mut self,
        ctx: &mut DeviceContext,
        info: BusAccessInfo,
        width: AccessWidth,
        value: u64,
    ) -> Result<()> {
        if info.offset >= VIRTIO_MMIO_CONFIG {
            if width == AccessWidth::DoubleWord {
                return Err(info.unsupported(width, Direction::Write));
            }
            let data = value.to_le_bytes();
            self.device.write_config(
                info.offset - VIRTIO_MMIO_CONFIG,
                &data[..width.bytes() as usize],
            );
            self.config_generation = self.config_generation.wrapping_add(1);
            return Ok(());
        }
        if width != AccessWidth::Word {
            return Err(info.unsupported(width, Direction::Write));
        }
        self.write_mmio(ctx, info, value as u32);
        Ok(())
    }

    fn irq_eoi(&mut self, ctx: &mut DeviceContext, _irq: u32) {
        // The driver has not acknowledged everything yet.
        if self.interrupt_status != 0 {
            ctx.gic.assert(self.irq);
        }
    }

    fn backend_input(&mut self, ctx: &mut DeviceContext, data: &[u8]) -> Result<()> {
        if self.device.backend_input(ctx.mem, &mut self.active, data) {
            self.signal_used(ctx);
        }
        Ok(())
    }

    fn reset(&mut self) {
        VirtioMmioDevice::reset(self);
    }
}
