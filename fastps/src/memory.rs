/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Registered memory.
//!
//! A [`RegisteredBuffer`] is a zeroed, page-aligned allocation together with
//! its registration in a protection domain. The fabric may read and write
//! the buffer at any time while it is registered, so the process only ever
//! touches it through per-byte atomics: stores are `Release`, loads are
//! `Acquire`. A reader that observes a byte written after a range of other
//! bytes therefore also observes that range.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use anyhow::anyhow;
use anyhow::ensure;

use crate::fabric::AccessFlags;
use crate::fabric::Fabric;
use crate::fabric::MemoryRegistration;
use crate::fabric::ProtectionDomain;
use crate::fabric::RemoteRegion;
use crate::fabric::Sge;

/// Copies `len` bytes starting at `addr` out of shared memory.
///
/// # Safety
///
/// `addr..addr + len` must be valid for reads for the duration of the call.
pub(crate) unsafe fn load_bytes(addr: u64, len: usize) -> Vec<u8> {
    let base = addr as usize as *const AtomicU8;
    (0..len)
        .map(|i| (*base.add(i)).load(Ordering::Acquire))
        .collect()
}

/// Copies `data` into shared memory starting at `addr`.
///
/// # Safety
///
/// `addr..addr + data.len()` must be valid for writes for the duration of
/// the call.
pub(crate) unsafe fn store_bytes(addr: u64, data: &[u8]) {
    let base = addr as usize as *const AtomicU8;
    for (i, byte) in data.iter().enumerate() {
        (*base.add(i)).store(*byte, Ordering::Release);
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

/// The size of the allocation backing a buffer of `len` bytes.
pub fn padded_len(len: usize) -> usize {
    len.next_multiple_of(page_size())
}

/// A zeroed allocation aligned to, and padded to a multiple of, the page
/// size.
#[derive(Debug)]
pub struct PageAlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is only accessed through atomics (see module docs).
unsafe impl Send for PageAlignedBuffer {}
// SAFETY: as above.
unsafe impl Sync for PageAlignedBuffer {}

impl PageAlignedBuffer {
    pub fn new(len: usize) -> Result<Self, anyhow::Error> {
        ensure!(len > 0, "cannot allocate an empty buffer");
        let layout = Layout::from_size_align(padded_len(len), page_size())?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| anyhow!("failed to allocate {} bytes", len))?;
        Ok(Self { ptr, layout })
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for PageAlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A memory registration, deregistered on drop.
#[derive(Debug)]
pub struct MemoryRegion {
    fabric: Arc<dyn Fabric>,
    registration: MemoryRegistration,
}

impl MemoryRegion {
    /// Registers `length` bytes at `addr` with `pd`.
    ///
    /// # Safety
    ///
    /// The memory must outlive the returned region.
    pub unsafe fn register(
        fabric: Arc<dyn Fabric>,
        pd: ProtectionDomain,
        addr: usize,
        length: usize,
        access: AccessFlags,
    ) -> Result<Self, anyhow::Error> {
        let registration = fabric.reg_mr(pd, addr, length, access)?;
        tracing::debug!(
            "registered {} bytes at 0x{:x} (lkey: {}, rkey: {}, access: {:?})",
            length,
            addr,
            registration.lkey,
            registration.rkey,
            access
        );
        Ok(Self {
            fabric,
            registration,
        })
    }

    pub fn registration(&self) -> &MemoryRegistration {
        &self.registration
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Err(err) = self.fabric.dereg_mr(self.registration.handle) {
            tracing::error!(
                "failed to deregister memory at 0x{:x}: {:#}",
                self.registration.addr,
                err
            );
        }
    }
}

/// A page-aligned buffer registered with a protection domain.
#[derive(Debug)]
pub struct RegisteredBuffer {
    // Deregistered before the memory is freed.
    region: MemoryRegion,
    buffer: PageAlignedBuffer,
}

impl RegisteredBuffer {
    /// Allocates at least `len` zeroed bytes and registers them with
    /// `access`.
    pub fn new(
        fabric: Arc<dyn Fabric>,
        pd: ProtectionDomain,
        len: usize,
        access: AccessFlags,
    ) -> Result<Self, anyhow::Error> {
        let buffer = PageAlignedBuffer::new(len)?;
        // SAFETY: the region is dropped before the buffer.
        let region =
            unsafe { MemoryRegion::register(fabric, pd, buffer.addr(), buffer.len(), access)? };
        Ok(Self { region, buffer })
    }

    pub fn addr(&self) -> u64 {
        self.buffer.addr() as u64
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn lkey(&self) -> u32 {
        self.region.registration().lkey
    }

    pub fn rkey(&self) -> u32 {
        self.region.registration().rkey
    }

    /// The address/key pair a peer needs for one-sided access.
    pub fn remote(&self) -> RemoteRegion {
        RemoteRegion {
            addr: self.addr(),
            rkey: self.rkey(),
        }
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<(), anyhow::Error> {
        ensure!(
            offset.checked_add(len).is_some_and(|end| end <= self.len()),
            "range {}..{} out of bounds for a {} byte buffer",
            offset,
            offset.saturating_add(len),
            self.len()
        );
        Ok(())
    }

    /// A scatter/gather entry covering `offset..offset + len`.
    pub fn sge(&self, offset: usize, len: usize) -> Result<Sge, anyhow::Error> {
        self.check_range(offset, len)?;
        Ok(Sge {
            addr: self.addr() + offset as u64,
            length: len as u32,
            lkey: self.lkey(),
        })
    }

    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), anyhow::Error> {
        self.check_range(offset, data.len())?;
        // SAFETY: the range was checked against the allocation.
        unsafe { store_bytes(self.addr() + offset as u64, data) };
        Ok(())
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>, anyhow::Error> {
        self.check_range(offset, len)?;
        // SAFETY: the range was checked against the allocation.
        Ok(unsafe { load_bytes(self.addr() + offset as u64, len) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::local::LOCAL_DEVICE;
    use crate::fabric::local::LocalFabric;

    #[test]
    fn test_page_aligned_buffer() -> Result<(), anyhow::Error> {
        let buffer = PageAlignedBuffer::new(100)?;
        assert_eq!(buffer.addr() % page_size(), 0);
        assert_eq!(buffer.len(), page_size());
        assert!(PageAlignedBuffer::new(0).is_err());
        Ok(())
    }

    #[test]
    fn test_registered_buffer_access() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let pd = fabric.alloc_pd(LOCAL_DEVICE)?;
        let buffer = RegisteredBuffer::new(
            fabric.clone(),
            pd,
            64,
            AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_READ,
        )?;
        assert_eq!(buffer.read_at(0, 4)?, vec![0; 4]);

        buffer.write_at(8, b"0005")?;
        assert_eq!(buffer.read_at(8, 4)?, b"0005");
        assert_eq!(buffer.remote().addr, buffer.addr());
        assert_eq!(buffer.remote().rkey, buffer.rkey());

        let sge = buffer.sge(8, 4)?;
        assert_eq!(sge.addr, buffer.addr() + 8);
        assert_eq!(sge.lkey, buffer.lkey());

        let len = buffer.len();
        assert!(buffer.write_at(len - 1, b"ab").is_err());
        assert!(buffer.read_at(usize::MAX, 2).is_err());
        assert!(buffer.sge(len, 1).is_err());
        Ok(())
    }

    #[test]
    fn test_drop_deregisters() -> Result<(), anyhow::Error> {
        let fabric: Arc<dyn Fabric> = Arc::new(LocalFabric::new());
        let pd = fabric.alloc_pd(LOCAL_DEVICE)?;
        let buffer = RegisteredBuffer::new(fabric.clone(), pd, 16, AccessFlags::empty())?;
        let handle = buffer.region.registration().handle;
        drop(buffer);
        assert!(fabric.dereg_mr(handle).is_err());
        Ok(())
    }
}
