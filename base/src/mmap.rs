// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cmp::min;
use std::mem::size_of;
use std::ptr::copy_nonoverlapping;
use std::ptr::null_mut;
use std::ptr::read_unaligned;
use std::ptr::write_unaligned;

use remain::sorted;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use crate::pagesize;

#[sorted]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("requested memory out of range")]
    InvalidAddress,
    #[error("requested memory range spans past the end of the region: offset={0} count={1} region_size={2}")]
    InvalidRange(usize, usize, usize),
    #[error("mapping size must be a non-zero multiple of the page size: {0:#x}")]
    NotPageAligned(usize),
    #[error("mmap related system call failed: {0}")]
    SystemCallFailed(#[source] crate::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

/// An anonymous, private, read/write mapping of host memory. The mapping is unmapped on drop.
#[derive(Debug)]
pub struct MemoryMapping {
    addr: *mut u8,
    size: usize,
}

// SAFETY:
// The mapping is owned by this object and only touched through its methods, which bounds check
// every access.
unsafe impl Send for MemoryMapping {}
// SAFETY:
// See above. Concurrent access is plain memory access, same as guest RAM.
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    /// Creates an anonymous mapping of `size` bytes, zero filled.
    pub fn new(size: usize) -> Result<MemoryMapping> {
        if size == 0 || size % pagesize() != 0 {
            return Err(Error::NotPageAligned(size));
        }
        // SAFETY:
        // Creating a new anonymous mapping cannot alias existing memory. The result is checked.
        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(Error::SystemCallFailed(crate::Error::last()));
        }
        Ok(MemoryMapping {
            addr: addr as *mut u8,
            size,
        })
    }

    /// Returns the size of the mapping in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    // Number of bytes of a `len` byte access at `offset` that stay inside the mapping.
    fn clamped(&self, offset: usize, len: usize) -> Result<usize> {
        self.size
            .checked_sub(offset)
            .map(|room| min(room, len))
            .ok_or(Error::InvalidAddress)
    }

    // Fails unless all `count` bytes at `offset` are inside the mapping.
    fn check_range(&self, offset: usize, count: usize) -> Result<()> {
        match offset.checked_add(count) {
            None => Err(Error::InvalidAddress),
            Some(end) if end > self.size => Err(Error::InvalidRange(offset, count, self.size)),
            Some(_) => Ok(()),
        }
    }

    /// Writes as much of `buf` as fits starting at `offset`. Returns the number of bytes written.
    pub fn write_slice(&self, buf: &[u8], offset: usize) -> Result<usize> {
        let count = self.clamped(offset, buf.len())?;
        // SAFETY:
        // `count` bytes fit in both `buf` and the mapping past `offset`. A borrowed slice cannot
        // live inside an mmap region we own exclusively.
        unsafe { copy_nonoverlapping(buf.as_ptr(), self.addr.add(offset), count) };
        Ok(count)
    }

    /// Fills as much of `buf` as the mapping holds past `offset`. Returns the number of bytes
    /// read.
    pub fn read_slice(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let count = self.clamped(offset, buf.len())?;
        // SAFETY:
        // Same bounds as `write_slice`, in the other direction.
        unsafe { copy_nonoverlapping(self.addr.add(offset), buf.as_mut_ptr(), count) };
        Ok(count)
    }

    /// Stores `val` at `offset`, which need not be aligned.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, val: T, offset: usize) -> Result<()> {
        self.check_range(offset, size_of::<T>())?;
        // SAFETY:
        // The whole object is inside the mapping and the store is unaligned.
        unsafe { write_unaligned(self.addr.add(offset) as *mut T, val) };
        Ok(())
    }

    /// Loads a `T` from `offset`. The guest may change the bytes at any time, which `FromBytes`
    /// tolerates.
    pub fn read_obj<T: FromBytes>(&self, offset: usize) -> Result<T> {
        self.check_range(offset, size_of::<T>())?;
        // SAFETY:
        // In bounds, unaligned, and any bit pattern is a valid `T`.
        Ok(unsafe { read_unaligned(self.addr.add(offset) as *const T) })
    }
}

impl Drop for MemoryMapping {
    fn drop(&mut self) {
        // SAFETY:
        // The region was mapped in `new` and no borrow of it outlives `self`.
        unsafe { libc::munmap(self.addr as *mut libc::c_void, self.size) };
    }
}
