// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory shared with the device.

use std::fmt::Debug;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// A region of memory the device can reach by bus address.
pub trait DmaRegion: Send + Sync {
    /// The length of the region in bytes.
    fn len(&self) -> usize;
    /// The address the device uses for the first byte of the region.
    fn bus_address(&self) -> u64;
    /// Reads `data.len()` bytes starting at `offset`.
    fn read_at(&self, offset: usize, data: &mut [u8]);
    /// Writes `data` starting at `offset`.
    fn write_at(&self, offset: usize, data: &[u8]);
}

/// An allocator of device-visible memory.
pub trait DmaClient: Send + Sync {
    /// Allocates a zeroed buffer of at least `len` bytes.
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<DmaBuffer>;
}

/// An owned DMA allocation.
///
/// A buffer belongs to exactly one ring slot or in-flight packet at a time.
/// Dropping it returns the memory to the allocator it came from.
pub struct DmaBuffer {
    region: Box<dyn DmaRegion>,
}

impl Debug for DmaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("bus_address", &format_args!("{:#x}", self.bus_address()))
            .field("len", &self.len())
            .finish()
    }
}

impl DmaBuffer {
    /// Wraps an allocated region.
    pub fn new(region: Box<dyn DmaRegion>) -> Self {
        Self { region }
    }

    /// The length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// The bus address of the first byte.
    pub fn bus_address(&self) -> u64 {
        self.region.bus_address()
    }

    /// Reads bytes starting at `offset`.
    pub fn read_at(&self, offset: usize, data: &mut [u8]) {
        self.region.read_at(offset, data)
    }

    /// Writes bytes starting at `offset`.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        self.region.write_at(offset, data)
    }

    /// Reads a plain-old-data object at `offset`.
    pub fn read_obj<T: FromBytes + IntoBytes>(&self, offset: usize) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(offset, obj.as_mut_bytes());
        obj
    }

    /// Writes a plain-old-data object at `offset`.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, offset: usize, obj: &T) {
        self.write_at(offset, obj.as_bytes())
    }

    /// Zeroes the whole buffer.
    pub fn fill_zero(&self) {
        self.write_at(0, &vec![0; self.len()]);
    }
}
