// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Address ranges owned by the root complex itself.

use crate::tree::AddressWindow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Backs a root complex owned address range.
///
/// Offsets are relative to the start of the region.
#[async_trait]
pub trait RegionHandler: Send + Sync {
    /// Reads `data.len()` bytes at `offset`.
    async fn read(&self, offset: u64, data: &mut [u8]);
    /// Writes `data` at `offset`.
    async fn write(&self, offset: u64, data: &[u8]);
}

/// Plain memory backing for a region.
#[derive(Clone)]
pub struct RegionMemory(Arc<Mutex<Vec<u8>>>);

impl RegionMemory {
    /// Allocates `size` zeroed bytes.
    pub fn new(size: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; size])))
    }

    /// Size of the backing buffer.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Copies bytes out of the buffer.
    pub(crate) fn read_at(&self, offset: usize, data: &mut [u8]) {
        data.copy_from_slice(&self.0.lock()[offset..offset + data.len()]);
    }

    /// Copies bytes into the buffer.
    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) {
        self.0.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Returns a copy of the whole buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

#[async_trait]
impl RegionHandler for RegionMemory {
    async fn read(&self, offset: u64, data: &mut [u8]) {
        self.read_at(offset as usize, data);
    }

    async fn write(&self, offset: u64, data: &[u8]) {
        self.write_at(offset as usize, data);
    }
}

/// Errors accessing a region table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegionError {
    /// The access starts inside a region but runs past its end.
    #[error("access of {len} bytes at {addr:#x} runs past the end of its region")]
    OutOfBounds {
        /// Start of the access.
        addr: u64,
        /// Length of the access.
        len: usize,
    },
}

/// One registered range.
#[derive(Clone)]
pub struct Region {
    /// First address.
    pub base: u64,
    /// Size in bytes.
    pub size: u64,
    handler: Arc<dyn RegionHandler>,
}

impl Region {
    fn offset_of(&self, addr: u64, len: usize) -> Result<u64, RegionError> {
        let offset = addr - self.base;
        if offset + len as u64 > self.size {
            return Err(RegionError::OutOfBounds { addr, len });
        }
        Ok(offset)
    }

    /// Reads `data.len()` bytes at the absolute address `addr`.
    pub async fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), RegionError> {
        let offset = self.offset_of(addr, data.len())?;
        self.handler.read(offset, data).await;
        Ok(())
    }

    /// Writes `data` at the absolute address `addr`.
    pub async fn write(&self, addr: u64, data: &[u8]) -> Result<(), RegionError> {
        let offset = self.offset_of(addr, data.len())?;
        self.handler.write(offset, data).await;
        Ok(())
    }
}

/// Regions allocated from one address space.
///
/// Each region is naturally aligned to its size rounded up to a power of
/// two, and regions never overlap.
pub struct RegionTable {
    window: AddressWindow,
    regions: Vec<Region>,
}

impl RegionTable {
    /// Creates an empty table allocating upwards from `base`.
    pub fn new(base: u64) -> Self {
        Self {
            window: AddressWindow::new(base),
            regions: Vec::new(),
        }
    }

    /// Registers a region of `size` bytes and returns its address.
    pub fn alloc(&mut self, size: u64, handler: Arc<dyn RegionHandler>) -> u64 {
        let size = size.max(1);
        let mask = size.next_power_of_two() - 1;
        let base = self.window.alloc(mask, size);
        self.regions.push(Region {
            base,
            size,
            handler,
        });
        base
    }

    /// Returns the region containing `addr`.
    pub fn find(&self, addr: u64) -> Option<Region> {
        self.regions
            .iter()
            .find(|r| r.base <= addr && addr - r.base < r.size)
            .cloned()
    }

    /// First address not yet handed out.
    pub fn limit(&self) -> u64 {
        self.window.limit
    }

    /// Number of registered regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn regions_are_aligned_and_disjoint() {
        let mut table = RegionTable::new(0);
        let a = table.alloc(0x10, Arc::new(RegionMemory::new(0x10)));
        let b = table.alloc(0x100, Arc::new(RegionMemory::new(0x100)));
        let c = table.alloc(4, Arc::new(RegionMemory::new(4)));
        let d = table.alloc(0x300, Arc::new(RegionMemory::new(0x300)));
        assert_eq!([a, b, c, d], [0x0, 0x100, 0x200, 0x400]);
        assert_eq!(table.limit(), 0x700);
        assert_eq!(table.len(), 4);
    }

    #[test]
    fn find_uses_half_open_ranges() {
        let mut table = RegionTable::new(0x1000);
        let base = table.alloc(0x20, Arc::new(RegionMemory::new(0x20)));
        assert_eq!(base, 0x1000);
        assert!(table.find(0xfff).is_none());
        assert_eq!(table.find(0x1000).unwrap().base, 0x1000);
        assert_eq!(table.find(0x101f).unwrap().base, 0x1000);
        assert!(table.find(0x1020).is_none());
    }

    #[test]
    fn memory_region_access() {
        let mut table = RegionTable::new(0x1000);
        let mem = RegionMemory::new(8);
        let base = table.alloc(8, Arc::new(mem.clone()));
        let region = table.find(base + 2).unwrap();

        block_on(async {
            region.write(base + 2, &[1, 2, 3]).await.unwrap();
            let mut buf = [0; 4];
            region.read(base + 1, &mut buf).await.unwrap();
            assert_eq!(buf, [0, 1, 2, 3]);
            assert_eq!(
                region.write(base + 6, &[0; 4]).await,
                Err(RegionError::OutOfBounds {
                    addr: base + 6,
                    len: 4
                })
            );
        });
        assert_eq!(mem.to_vec(), [0, 0, 1, 2, 3, 0, 0, 0]);
    }
}
