// Copyright 2017 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Track memory regions that are mapped to the guest VM.

use std::result;
use std::sync::Arc;

use base::pagesize;
use base::MemoryMapping;
use base::MmapError;
use remain::sorted;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::guest_address::GuestAddress;

#[sorted]
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid guest address {0}")]
    InvalidGuestAddress(GuestAddress),
    #[error("invalid guest memory access at addr={0}: {1}")]
    MemoryAccess(GuestAddress, #[source] MmapError),
    #[error("failed to map guest memory: {0}")]
    MemoryMappingFailed(#[source] MmapError),
    #[error("memory regions must be page aligned")]
    MemoryNotAligned,
    #[error("memory regions overlap")]
    MemoryRegionOverlap,
    #[error("memory region size {0} is too large")]
    MemoryRegionTooLarge(u128),
    #[error("incomplete read of {completed} instead of {expected} bytes")]
    ShortRead { expected: usize, completed: usize },
    #[error("incomplete write of {completed} instead of {expected} bytes")]
    ShortWrite { expected: usize, completed: usize },
}
pub type Result<T> = result::Result<T, Error>;

// One contiguous block of guest physical memory and the host mapping behind it.
struct MemoryRegion {
    mapping: MemoryMapping,
    guest_base: GuestAddress,
}

impl MemoryRegion {
    fn new(guest_base: GuestAddress, size: u64) -> Result<Self> {
        if size % pagesize() as u64 != 0 {
            return Err(Error::MemoryNotAligned);
        }
        let len = usize::try_from(size).map_err(|_| Error::MemoryRegionTooLarge(size.into()))?;
        if guest_base.checked_add(size).is_none() {
            return Err(Error::MemoryRegionTooLarge(
                u128::from(guest_base.offset()) + u128::from(size),
            ));
        }
        Ok(MemoryRegion {
            mapping: MemoryMapping::new(len).map_err(Error::MemoryMappingFailed)?,
            guest_base,
        })
    }

    fn end(&self) -> GuestAddress {
        // Cannot overflow, `new` checked the sum.
        self.guest_base.unchecked_add(self.mapping.size() as u64)
    }

    fn contains(&self, addr: GuestAddress) -> bool {
        (self.guest_base..self.end()).contains(&addr)
    }
}

fn exact(expected: usize, completed: usize, short: fn(usize, usize) -> Error) -> Result<()> {
    if expected == completed {
        Ok(())
    } else {
        Err(short(expected, completed))
    }
}

/// Guest physical memory as seen by the VMM.
///
/// Accesses never straddle two regions. Clones share the same backing regions, so devices hold
/// their own handle and see every guest store.
#[derive(Clone)]
pub struct GuestMemory {
    regions: Arc<[MemoryRegion]>,
}

impl GuestMemory {
    /// Maps one region per `(base, size)` pair. Pairs must be sorted by base, page aligned and
    /// disjoint.
    pub fn new(ranges: &[(GuestAddress, u64)]) -> Result<GuestMemory> {
        let mut regions: Vec<MemoryRegion> = Vec::with_capacity(ranges.len());
        for &(base, size) in ranges {
            if regions.last().is_some_and(|last| last.end() > base) {
                return Err(Error::MemoryRegionOverlap);
            }
            regions.push(MemoryRegion::new(base, size)?);
        }
        Ok(GuestMemory {
            regions: regions.into(),
        })
    }

    /// Total size of all regions in bytes.
    pub fn memory_size(&self) -> u64 {
        self.regions
            .iter()
            .map(|region| region.mapping.size() as u64)
            .sum()
    }

    /// Returns true if all `len` bytes starting at `addr` lie inside a single region. An empty
    /// range is always valid.
    pub fn is_valid_range(&self, addr: GuestAddress, len: u64) -> bool {
        if len == 0 {
            return true;
        }
        let Some(last) = addr.checked_add(len - 1) else {
            return false;
        };
        self.regions
            .iter()
            .any(|region| region.contains(addr) && region.contains(last))
    }

    /// Copies as much of `buf` as fits in the region holding `guest_addr` and returns the count.
    pub fn write_at_addr(&self, buf: &[u8], guest_addr: GuestAddress) -> Result<usize> {
        let (mapping, offset) = self.region_of(guest_addr)?;
        mapping
            .write_slice(buf, offset)
            .map_err(|e| Error::MemoryAccess(guest_addr, e))
    }

    /// Writes all of `buf` at `guest_addr`. A write running off the end of its region fails
    /// with `ShortWrite` after storing what fit.
    pub fn write_all_at_addr(&self, buf: &[u8], guest_addr: GuestAddress) -> Result<()> {
        let completed = self.write_at_addr(buf, guest_addr)?;
        exact(buf.len(), completed, |expected, completed| Error::ShortWrite {
            expected,
            completed,
        })
    }

    /// Fills as much of `buf` as the region holding `guest_addr` allows and returns the count.
    pub fn read_at_addr(&self, buf: &mut [u8], guest_addr: GuestAddress) -> Result<usize> {
        let (mapping, offset) = self.region_of(guest_addr)?;
        mapping
            .read_slice(buf, offset)
            .map_err(|e| Error::MemoryAccess(guest_addr, e))
    }

    /// Fills all of `buf`, or fails with `ShortRead`.
    pub fn read_exact_at_addr(&self, buf: &mut [u8], guest_addr: GuestAddress) -> Result<()> {
        let completed = self.read_at_addr(buf, guest_addr)?;
        exact(buf.len(), completed, |expected, completed| Error::ShortRead {
            expected,
            completed,
        })
    }

    /// Reads a `T` stored at `guest_addr`.
    pub fn read_obj_from_addr<T: FromBytes>(&self, guest_addr: GuestAddress) -> Result<T> {
        let (mapping, offset) = self.region_of(guest_addr)?;
        mapping
            .read_obj(offset)
            .map_err(|e| Error::MemoryAccess(guest_addr, e))
    }

    pub fn write_obj_at_addr<T: IntoBytes + Immutable>(
        &self,
        val: T,
        guest_addr: GuestAddress,
    ) -> Result<()> {
        let (mapping, offset) = self.region_of(guest_addr)?;
        mapping
            .write_obj(val, offset)
            .map_err(|e| Error::MemoryAccess(guest_addr, e))
    }

    // The mapping holding `addr` and the offset of `addr` inside it.
    fn region_of(&self, addr: GuestAddress) -> Result<(&MemoryMapping, usize)> {
        let region = self
            .regions
            .iter()
            .find(|region| region.contains(addr))
            .ok_or(Error::InvalidGuestAddress(addr))?;
        Ok((&region.mapping, addr.offset_from(region.guest_base) as usize))
    }
}
