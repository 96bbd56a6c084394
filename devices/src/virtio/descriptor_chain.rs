// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Virtqueue descriptor chain abstraction

#![deny(missing_docs)]

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use base::trace;
use vm_memory::GuestAddress;
use vm_memory::GuestMemory;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Virtio flag indicating there is a next descriptor in descriptor chain
pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;
/// Virtio flag indicating descriptor is write-only
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;

// Lengths reported in the used ring are 32 bits wide.
const MAX_CHAIN_BYTES: u64 = u32::MAX as u64;

// Buffer size used by `read_chunks`.
const READ_CHUNK_SIZE: usize = 4096;

/// A descriptor table entry as laid out in guest memory. Fields are little endian.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Desc {
    /// Guest physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// `VIRTQ_DESC_F_*` flags.
    pub flags: u16,
    /// Index of the next descriptor when `VIRTQ_DESC_F_NEXT` is set.
    pub next: u16,
}

/// Type of access allowed for a single virtio descriptor within a descriptor chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DescriptorAccess {
    /// Descriptor is readable by the device (written by the driver before putting the descriptor
    /// chain on the available queue).
    DeviceRead,
    /// Descriptor is writable by the device (read by the driver after the device puts the
    /// descriptor chain on the used queue).
    DeviceWrite,
}

/// One guest buffer of a descriptor chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    /// Start of the buffer.
    pub addr: GuestAddress,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Whether the device reads or writes the buffer.
    pub access: DescriptorAccess,
}

/// A virtio descriptor chain.
///
/// The chain is walked once when it is popped from the available ring. It keeps guest addresses
/// only; reads and writes go through the `GuestMemory` passed to them.
#[derive(Clone, Debug)]
pub struct DescriptorChain {
    /// Index into the descriptor table of the head descriptor.
    index: u16,
    descriptors: Vec<Descriptor>,
}

impl DescriptorChain {
    /// Walks the chain starting at descriptor `index` of the table at `desc_table`.
    ///
    /// Readable descriptors must come before writable ones and the chain may not be longer than
    /// the queue, which also catches loops. Every buffer must lie inside guest memory and the
    /// readable and writable parts may each hold at most `u32::MAX` bytes, so a chain that is
    /// returned can be accessed without touching unmapped memory.
    pub fn new(
        mem: &GuestMemory,
        desc_table: GuestAddress,
        queue_size: u16,
        index: u16,
    ) -> Result<DescriptorChain> {
        let mut descriptors = Vec::new();
        let mut totals = [0u64; 2];
        let mut next = Some(index);
        while let Some(i) = next {
            if i >= queue_size {
                bail!("descriptor index {} out of bounds of queue size {}", i, queue_size);
            }
            if descriptors.len() >= queue_size as usize {
                bail!("descriptor chain at {} is longer than the queue", index);
            }
            let addr = desc_table.unchecked_add(u64::from(i) * 16);
            let desc: Desc = mem
                .read_obj_from_addr(addr)
                .with_context(|| format!("failed to read descriptor {}", i))?;
            let flags = u16::from_le(desc.flags);
            let access = if flags & VIRTQ_DESC_F_WRITE != 0 {
                DescriptorAccess::DeviceWrite
            } else {
                DescriptorAccess::DeviceRead
            };
            if access == DescriptorAccess::DeviceRead
                && descriptors
                    .iter()
                    .any(|d: &Descriptor| d.access == DescriptorAccess::DeviceWrite)
            {
                bail!("readable descriptor {} follows a writable one", i);
            }
            let buf_addr = GuestAddress(u64::from_le(desc.addr));
            let len = u32::from_le(desc.len);
            if !mem.is_valid_range(buf_addr, len.into()) {
                bail!(
                    "descriptor {} buffer at {} of {} bytes is outside guest memory",
                    i,
                    buf_addr,
                    len
                );
            }
            let total = &mut totals[(access == DescriptorAccess::DeviceWrite) as usize];
            *total += u64::from(len);
            if *total > MAX_CHAIN_BYTES {
                bail!("descriptor chain at {} holds more than {} bytes", index, MAX_CHAIN_BYTES);
            }
            descriptors.push(Descriptor {
                addr: buf_addr,
                len,
                access,
            });
            next = if flags & VIRTQ_DESC_F_NEXT != 0 {
                Some(u16::from_le(desc.next))
            } else {
                None
            };
        }
        trace!("descriptor chain {}: {:?}", index, descriptors);
        Ok(DescriptorChain { index, descriptors })
    }

    /// Index of the head descriptor, reported back in the used ring.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// All descriptors in chain order.
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    fn with_access(&self, access: DescriptorAccess) -> impl Iterator<Item = &Descriptor> {
        self.descriptors.iter().filter(move |d| d.access == access)
    }

    /// Total bytes the device may read.
    pub fn readable_len(&self) -> usize {
        self.with_access(DescriptorAccess::DeviceRead)
            .map(|d| d.len as usize)
            .sum()
    }

    /// Total bytes the device may write.
    pub fn writable_len(&self) -> usize {
        self.with_access(DescriptorAccess::DeviceWrite)
            .map(|d| d.len as usize)
            .sum()
    }

    /// Reads the contents of every readable descriptor. Fails without reading anything when the
    /// chain holds more than `max_len` readable bytes.
    pub fn read_all(&self, mem: &GuestMemory, max_len: usize) -> Result<Vec<u8>> {
        let len = self.readable_len();
        if len > max_len {
            bail!("chain of {} readable bytes exceeds the limit of {}", len, max_len);
        }
        let mut data = vec![0u8; len];
        let mut offset = 0;
        for desc in self.with_access(DescriptorAccess::DeviceRead) {
            let len = desc.len as usize;
            mem.read_exact_at_addr(&mut data[offset..offset + len], desc.addr)
                .with_context(|| format!("failed to read buffer at {}", desc.addr))?;
            offset += len;
        }
        Ok(data)
    }

    /// Passes the readable bytes to `f` in order, at most `READ_CHUNK_SIZE` of them per call.
    pub fn read_chunks<F>(&self, mem: &GuestMemory, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        for desc in self.with_access(DescriptorAccess::DeviceRead) {
            let mut done = 0;
            while done < desc.len as usize {
                let len = std::cmp::min(READ_CHUNK_SIZE, desc.len as usize - done);
                let addr = desc.addr.unchecked_add(done as u64);
                mem.read_exact_at_addr(&mut buf[..len], addr)
                    .with_context(|| format!("failed to read buffer at {}", addr))?;
                f(&buf[..len])?;
                done += len;
            }
        }
        Ok(())
    }

    /// Fills the writable descriptors with `data` in order. Returns the number of bytes written,
    /// which is short when the buffers are too small.
    pub fn write_all(&self, mem: &GuestMemory, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        for desc in self.with_access(DescriptorAccess::DeviceWrite) {
            if written == data.len() {
                break;
            }
            let len = std::cmp::min(desc.len as usize, data.len() - written);
            mem.write_all_at_addr(&data[written..written + len], desc.addr)
                .with_context(|| format!("failed to write buffer at {}", desc.addr))?;
            written += len;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESC_TABLE: GuestAddress = GuestAddress(0x1000);

    fn set_desc(mem: &GuestMemory, i: u16, addr: u64, len: u32, flags: u16, next: u16) {
        mem.write_obj_at_addr(
            Desc {
                addr: addr.to_le(),
                len: len.to_le(),
                flags: flags.to_le(),
                next: next.to_le(),
            },
            DESC_TABLE.unchecked_add(u64::from(i) * 16),
        )
        .unwrap();
    }

    fn memory() -> GuestMemory {
        GuestMemory::new(&[(GuestAddress(0), 0x10000)]).unwrap()
    }

    #[test]
    fn single_readable() {
        let mem = memory();
        mem.write_all_at_addr(b"hello", GuestAddress(0x4000)).unwrap();
        set_desc(&mem, 0, 0x4000, 5, 0, 0);
        let chain = DescriptorChain::new(&mem, DESC_TABLE, 4, 0).unwrap();
        assert_eq!(chain.index(), 0);
        assert_eq!(chain.readable_len(), 5);
        assert_eq!(chain.writable_len(), 0);
        assert_eq!(chain.read_all(&mem, 16).unwrap(), b"hello");
    }

    #[test]
    fn readable_then_writable() {
        let mem = memory();
        mem.write_all_at_addr(b"ab", GuestAddress(0x4000)).unwrap();
        mem.write_all_at_addr(b"cd", GuestAddress(0x5000)).unwrap();
        set_desc(&mem, 2, 0x4000, 2, VIRTQ_DESC_F_NEXT, 3);
        set_desc(&mem, 3, 0x5000, 2, VIRTQ_DESC_F_NEXT, 1);
        set_desc(&mem, 1, 0x6000, 4, VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT, 0);
        set_desc(&mem, 0, 0x7000, 4, VIRTQ_DESC_F_WRITE, 0);
        let chain = DescriptorChain::new(&mem, DESC_TABLE, 4, 2).unwrap();
        assert_eq!(chain.descriptors().len(), 4);
        assert_eq!(chain.read_all(&mem, 16).unwrap(), b"abcd");
        assert_eq!(chain.writable_len(), 8);

        assert_eq!(chain.write_all(&mem, b"0123456789").unwrap(), 8);
        let mut buf = [0u8; 4];
        mem.read_exact_at_addr(&mut buf, GuestAddress(0x7000)).unwrap();
        assert_eq!(&buf, b"4567");
    }

    #[test]
    fn short_write() {
        let mem = memory();
        set_desc(&mem, 0, 0x6000, 16, VIRTQ_DESC_F_WRITE, 0);
        let chain = DescriptorChain::new(&mem, DESC_TABLE, 2, 0).unwrap();
        assert_eq!(chain.write_all(&mem, b"xyz").unwrap(), 3);
    }

    #[test]
    fn loop_is_rejected() {
        let mem = memory();
        set_desc(&mem, 0, 0x4000, 1, VIRTQ_DESC_F_NEXT, 1);
        set_desc(&mem, 1, 0x4000, 1, VIRTQ_DESC_F_NEXT, 0);
        assert!(DescriptorChain::new(&mem, DESC_TABLE, 2, 0).is_err());
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mem = memory();
        set_desc(&mem, 0, 0x4000, 1, VIRTQ_DESC_F_NEXT, 7);
        assert!(DescriptorChain::new(&mem, DESC_TABLE, 4, 0).is_err());
        assert!(DescriptorChain::new(&mem, DESC_TABLE, 4, 4).is_err());
    }

    #[test]
    fn buffer_outside_memory_is_rejected() {
        let mem = memory();
        set_desc(&mem, 0, 0xfff0, 0x20, 0, 0);
        assert!(DescriptorChain::new(&mem, DESC_TABLE, 2, 0).is_err());
        set_desc(&mem, 0, 0x2_0000, 1, 0, 0);
        assert!(DescriptorChain::new(&mem, DESC_TABLE, 2, 0).is_err());

        // The bad buffer is caught while walking, before anything is written.
        set_desc(&mem, 0, 0x6000, 4, VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT, 1);
        set_desc(&mem, 1, u64::MAX - 1, 4, VIRTQ_DESC_F_WRITE, 0);
        assert!(DescriptorChain::new(&mem, DESC_TABLE, 2, 0).is_err());
    }

    #[test]
    fn huge_chain_is_rejected_before_allocation() {
        let mem = memory();
        // Every descriptor covers all of memory; together they exceed the used ring length.
        for i in 0..64 {
            set_desc(&mem, i, 0, 0x10000, VIRTQ_DESC_F_NEXT, i + 1);
        }
        set_desc(&mem, 64, 0, 0x10000, 0, 0);
        let chain = DescriptorChain::new(&mem, DESC_TABLE, 128, 0).unwrap();
        assert_eq!(chain.readable_len(), 65 * 0x10000);
        assert!(chain.read_all(&mem, 0x10000).is_err());

        for i in 0..64 {
            set_desc(&mem, i, 0, 0xffff_ffff, VIRTQ_DESC_F_NEXT, i + 1);
        }
        assert!(DescriptorChain::new(&mem, DESC_TABLE, 128, 0).is_err());
    }

    #[test]
    fn read_in_chunks() {
        let mem = memory();
        let data: Vec<u8> = (0..10000u32).map(|i| i as u8).collect();
        mem.write_all_at_addr(&data, GuestAddress(0x4000)).unwrap();
        set_desc(&mem, 0, 0x4000, 6000, VIRTQ_DESC_F_NEXT, 1);
        set_desc(&mem, 1, 0x4000 + 6000, 4000, 0, 0);
        let chain = DescriptorChain::new(&mem, DESC_TABLE, 2, 0).unwrap();
        let mut sizes = Vec::new();
        let mut out = Vec::new();
        chain
            .read_chunks(&mem, |chunk| {
                sizes.push(chunk.len());
                out.extend_from_slice(chunk);
                Ok(())
            })
            .unwrap();
        assert_eq!(sizes, [4096, 1904, 4000]);
        assert_eq!(out, data);
    }

    #[test]
    fn readable_after_writable_is_rejected() {
        let mem = memory();
        set_desc(&mem, 0, 0x4000, 1, VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT, 1);
        set_desc(&mem, 1, 0x5000, 1, 0, 0);
        assert!(DescriptorChain::new(&mem, DESC_TABLE, 2, 0).is_err());
    }
}
