// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::num::Wrapping;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use base::warn;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::virtio::DescriptorChain;

/// The queue registers as the driver programs them through the transport.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Whether the driver has marked the queue ready.
    ready: bool,

    /// The maximal size in elements offered by the device
    max_size: u16,

    /// The queue size in elements the driver selected
    size: u16,

    /// Guest physical address of the descriptor table
    desc_table: GuestAddress,

    /// Guest physical address of the available ring (driver area)
    avail_ring: GuestAddress,

    /// Guest physical address of the used ring (device area)
    used_ring: GuestAddress,
}

impl QueueConfig {
    /// Constructs a virtio queue configuration with the given `max_size`.
    ///
    /// A `max_size` of zero describes a queue that is not available and can never be activated.
    pub fn new(max_size: u16) -> Self {
        QueueConfig {
            ready: false,
            max_size,
            size: max_size,
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
        }
    }

    /// Return the maximum size of this queue.
    pub fn max_size(&self) -> u16 {
        self.max_size
    }

    /// Return the actual size of the queue, as the driver may not set up a
    /// queue as big as the device allows.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Set the queue size requested by the driver, which may be smaller than the maximum size.
    pub fn set_size(&mut self, val: u16) {
        if self.frozen("size") {
            return;
        }
        self.size = val;
    }

    pub fn desc_table(&self) -> GuestAddress {
        self.desc_table
    }

    pub fn set_desc_table(&mut self, val: GuestAddress) {
        if self.frozen("desc_table") {
            return;
        }
        self.desc_table = val;
    }

    pub fn avail_ring(&self) -> GuestAddress {
        self.avail_ring
    }

    pub fn set_avail_ring(&mut self, val: GuestAddress) {
        if self.frozen("avail_ring") {
            return;
        }
        self.avail_ring = val;
    }

    pub fn used_ring(&self) -> GuestAddress {
        self.used_ring
    }

    pub fn set_used_ring(&mut self, val: GuestAddress) {
        if self.frozen("used_ring") {
            return;
        }
        self.used_ring = val;
    }

    // Registers are read-only while the queue is live.
    fn frozen(&self, register: &str) -> bool {
        if self.ready {
            warn!("ignoring write to {register} on ready queue");
        }
        self.ready
    }

    /// Whether the driver has marked the queue ready.
    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Marks the queue ready after checking the configuration and returns the activated queue.
    pub fn activate(&mut self) -> Result<SplitQueue> {
        if self.size == 0 || !self.size.is_power_of_two() || self.size > self.max_size {
            bail!(
                "invalid queue size {} (max {}), must be a power of 2",
                self.size,
                self.max_size
            );
        }
        let queue = SplitQueue::new(self)?;
        self.ready = true;
        Ok(queue)
    }

    /// Marks the queue not ready. The activated queue must be dropped by the caller.
    pub fn deactivate(&mut self) {
        self.ready = false;
    }

    /// Reset queue to a clear state
    pub fn reset(&mut self) {
        *self = QueueConfig::new(self.max_size);
    }
}

#[repr(C)]
#[derive(IntoBytes, Immutable)]
#[allow(non_camel_case_types)]
struct virtq_used_elem {
    id: u32,
    len: u32,
}

/// An activated virtio queue with split queue layout.
///
/// Only guest addresses are kept; every access resolves them through the `GuestMemory` passed
/// in.
#[derive(Debug)]
pub struct SplitQueue {
    /// The queue size in elements the driver selected. This is always guaranteed to be a power of
    /// two, as required for split virtqueues.
    size: u16,

    /// Guest physical address of the descriptor table
    desc_table: GuestAddress,

    /// Guest physical address of the available ring
    avail_ring: GuestAddress,

    /// Guest physical address of the used ring
    used_ring: GuestAddress,

    next_avail: Wrapping<u16>,
    next_used: Wrapping<u16>,
}

impl SplitQueue {
    /// Constructs an activated split virtio queue with the given configuration.
    pub fn new(config: &QueueConfig) -> Result<SplitQueue> {
        let size = config.size();
        if !size.is_power_of_two() {
            bail!("split queue size {size} is not a power of 2");
        }

        // Validate addresses and queue size to ensure that address calculation won't overflow.
        let ring_sizes = Self::ring_sizes(
            size,
            config.desc_table(),
            config.avail_ring(),
            config.used_ring(),
        );
        let rings = ring_sizes
            .iter()
            .zip(["descriptor table", "available ring", "used ring"]);

        for ((addr, size), name) in rings {
            if addr.checked_add(*size as u64).is_none() {
                bail!(
                    "virtio queue {} goes out of bounds: start:0x{:08x} size:0x{:08x}",
                    name,
                    addr.offset(),
                    size,
                );
            }
        }

        Ok(SplitQueue {
            size,
            desc_table: config.desc_table(),
            avail_ring: config.avail_ring(),
            used_ring: config.used_ring(),
            next_avail: Wrapping(0),
            next_used: Wrapping(0),
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    // Return `index` modulo the currently configured queue size.
    fn wrap_queue_index(&self, index: Wrapping<u16>) -> u16 {
        // We know that `self.size` is a power of two (enforced by `new()`), so the modulus can
        // be calculated with a bitmask rather than actual division.
        debug_assert!(self.size.is_power_of_two());
        index.0 & self.size.wrapping_sub(1)
    }

    fn ring_sizes(
        queue_size: u16,
        desc_table: GuestAddress,
        avail_ring: GuestAddress,
        used_ring: GuestAddress,
    ) -> [(GuestAddress, usize); 3] {
        let queue_size = queue_size as usize;
        [
            (desc_table, 16 * queue_size),
            (avail_ring, 6 + 2 * queue_size),
            (used_ring, 6 + 8 * queue_size),
        ]
    }

    // Get the index of the first available descriptor chain in the available ring
    // (the next one that the driver will fill).
    //
    // All available ring entries between `self.next_avail` and `get_avail_index()` are available
    // to be processed by the device.
    fn get_avail_index(&self, mem: &GuestMemory) -> Result<Wrapping<u16>> {
        fence(Ordering::SeqCst);

        let avail_index_addr = self.avail_ring.unchecked_add(2);
        let avail_index: u16 = mem
            .read_obj_from_addr(avail_index_addr)
            .context("failed to read avail ring index")?;

        Ok(Wrapping(u16::from_le(avail_index)))
    }

    // Set the `idx` field in the used ring.
    //
    // This indicates to the driver that all entries up to (but not including) `used_index` have
    // been used by the device and may be processed by the driver.
    fn set_used_index(&mut self, mem: &GuestMemory, used_index: Wrapping<u16>) -> Result<()> {
        fence(Ordering::SeqCst);

        let used_index_addr = self.used_ring.unchecked_add(2);
        mem.write_obj_at_addr(used_index.0.to_le(), used_index_addr)
            .context("failed to write used ring index")
    }

    /// Returns true if the driver has made chains available that were not popped yet.
    pub fn has_available(&self, mem: &GuestMemory) -> Result<bool> {
        Ok(self.get_avail_index(mem)? != self.next_avail)
    }

    /// If a new DescriptorChain is available, returns it and removes it from the queue.
    pub fn pop(&mut self, mem: &GuestMemory) -> Result<Option<DescriptorChain>> {
        if !self.has_available(mem)? {
            return Ok(None);
        }

        let desc_idx_addr_offset = 4 + (u64::from(self.wrap_queue_index(self.next_avail)) * 2);
        let desc_idx_addr = self.avail_ring.unchecked_add(desc_idx_addr_offset);

        // This index is checked below in checked_new.
        let descriptor_index: u16 = mem
            .read_obj_from_addr(desc_idx_addr)
            .context("failed to read avail ring entry")?;

        self.next_avail += Wrapping(1);

        let chain = DescriptorChain::new(
            mem,
            self.desc_table,
            self.size,
            u16::from_le(descriptor_index),
        )?;
        Ok(Some(chain))
    }

    /// Puts an available descriptor head into the used ring for use by the guest.
    pub fn add_used(&mut self, mem: &GuestMemory, chain: &DescriptorChain, len: u32) -> Result<()> {
        let used_ring = self.used_ring;
        let next_used = self.wrap_queue_index(self.next_used) as usize;
        let used_elem = used_ring.unchecked_add((4 + next_used * 8) as u64);

        let elem = virtq_used_elem {
            id: u32::from(chain.index()).to_le(),
            len: len.to_le(),
        };

        mem.write_obj_at_addr(elem, used_elem)
            .context("failed to write used ring entry")?;

        self.next_used += Wrapping(1);
        self.set_used_index(mem, self.next_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::descriptor_chain::Desc;

    const QUEUE_SIZE: u16 = 4;
    const DESC_TABLE: GuestAddress = GuestAddress(0x1000);
    const AVAIL_RING: GuestAddress = GuestAddress(0x2000);
    const USED_RING: GuestAddress = GuestAddress(0x3000);

    fn setup() -> (GuestMemory, SplitQueue) {
        let mem = GuestMemory::new(&[(GuestAddress(0), 0x10000)]).unwrap();
        let mut config = QueueConfig::new(QUEUE_SIZE);
        config.set_desc_table(DESC_TABLE);
        config.set_avail_ring(AVAIL_RING);
        config.set_used_ring(USED_RING);
        let queue = config.activate().unwrap();
        assert!(config.ready());
        (mem, queue)
    }

    fn make_available(mem: &GuestMemory, slot: u16, desc: u16, avail_idx: u16) {
        mem.write_obj_at_addr(
            Desc {
                addr: 0x8000 + u64::from(desc) * 0x100,
                len: 0x100,
                flags: 0,
                next: 0,
            },
            DESC_TABLE.unchecked_add(u64::from(desc) * 16),
        )
        .unwrap();
        mem.write_obj_at_addr(desc, AVAIL_RING.unchecked_add(4 + 2 * u64::from(slot)))
            .unwrap();
        mem.write_obj_at_addr(avail_idx, AVAIL_RING.unchecked_add(2))
            .unwrap();
    }

    #[test]
    fn pop_and_add_used() {
        let (mem, mut queue) = setup();
        assert!(queue.pop(&mem).unwrap().is_none());

        make_available(&mem, 0, 2, 1);
        let chain = queue.pop(&mem).unwrap().unwrap();
        assert_eq!(chain.index(), 2);
        assert!(queue.pop(&mem).unwrap().is_none());

        queue.add_used(&mem, &chain, 7).unwrap();
        let used_idx: u16 = mem.read_obj_from_addr(USED_RING.unchecked_add(2)).unwrap();
        let id: u32 = mem.read_obj_from_addr(USED_RING.unchecked_add(4)).unwrap();
        let len: u32 = mem.read_obj_from_addr(USED_RING.unchecked_add(8)).unwrap();
        assert_eq!((used_idx, id, len), (1, 2, 7));
    }

    #[test]
    fn ring_index_wraps() {
        let (mem, mut queue) = setup();
        for i in 0..6u16 {
            make_available(&mem, i % QUEUE_SIZE, i % QUEUE_SIZE, i + 1);
            let chain = queue.pop(&mem).unwrap().unwrap();
            assert_eq!(chain.index(), i % QUEUE_SIZE);
            queue.add_used(&mem, &chain, 0).unwrap();
        }
        let used_idx: u16 = mem.read_obj_from_addr(USED_RING.unchecked_add(2)).unwrap();
        assert_eq!(used_idx, 6);
    }

    #[test]
    fn activation_checks_size() {
        let mut config = QueueConfig::new(16);
        config.set_size(3);
        assert!(config.activate().is_err());
        config.set_size(32);
        assert!(config.activate().is_err());
        config.set_size(0);
        assert!(config.activate().is_err());
        assert!(!config.ready());
        config.set_size(8);
        assert_eq!(config.activate().unwrap().size(), 8);
        // Configuration is frozen while ready.
        config.set_size(4);
        assert_eq!(config.size(), 8);
        config.reset();
        assert!(!config.ready());
        assert_eq!(config.size(), 16);
    }

    #[test]
    fn unavailable_queue_never_activates() {
        let mut config = QueueConfig::new(0);
        assert_eq!(config.max_size(), 0);
        assert!(config.activate().is_err());
        config.set_size(1);
        assert!(config.activate().is_err());
        assert!(!config.ready());
    }

    #[test]
    fn out_of_bounds_rings_are_rejected() {
        let mut config = QueueConfig::new(4);
        config.set_used_ring(GuestAddress(u64::MAX - 8));
        assert!(config.activate().is_err());
    }
}
