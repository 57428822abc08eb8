// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Descriptor ring memory and index arithmetic.

use crate::dma::DmaBuffer;
use crate::dma::DmaClient;
use anyhow::Context;
use i40e_defs::MAX_RING_LEN;
use i40e_defs::MIN_RING_LEN;
use std::marker::PhantomData;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

/// An unsupported ring length.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingSizeError {
    /// The length is not a power of two.
    #[error("ring length {0} is not a power of two")]
    NotPowerOfTwo(u16),
    /// The length is outside the range the hardware accepts.
    #[error("ring length {0} is outside {MIN_RING_LEN}..={MAX_RING_LEN}")]
    OutOfRange(u16),
}

/// Checks that `len` is usable as a TX or RX ring length.
pub fn validate_ring_len(len: u16) -> Result<(), RingSizeError> {
    if !(MIN_RING_LEN..=MAX_RING_LEN).contains(&len) {
        return Err(RingSizeError::OutOfRange(len));
    }
    if !len.is_power_of_two() {
        return Err(RingSizeError::NotPowerOfTwo(len));
    }
    Ok(())
}

/// Ring memory holding `len` descriptors of type `D`, optionally followed by
/// `extra` bytes that the device writes back to.
pub(crate) struct DescriptorRing<D> {
    mem: DmaBuffer,
    len: u16,
    _desc: PhantomData<fn() -> D>,
}

impl<D: FromBytes + IntoBytes + Immutable> DescriptorRing<D> {
    pub fn new(dma: &dyn DmaClient, len: u16, extra: usize) -> anyhow::Result<Self> {
        let size = len as usize * size_of::<D>() + extra;
        let mem = dma
            .allocate_dma_buffer(size)
            .with_context(|| format!("failed to allocate {size} bytes of ring memory"))?;
        mem.fill_zero();
        Ok(Self {
            mem,
            len,
            _desc: PhantomData,
        })
    }

    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn base(&self) -> u64 {
        self.mem.bus_address()
    }

    pub fn read(&self, index: u16) -> D {
        self.mem.read_obj(self.offset(index))
    }

    pub fn write(&self, index: u16, desc: &D) {
        self.mem.write_obj(self.offset(index), desc)
    }

    /// Writes a descriptor of another format that shares the slot size.
    pub fn write_as<T: IntoBytes + Immutable>(&self, index: u16, desc: &T) {
        const { assert!(size_of::<T>() == size_of::<D>()) };
        self.mem.write_obj(self.offset(index), desc)
    }

    /// Offset of the area following the last descriptor.
    pub fn end(&self) -> usize {
        self.len as usize * size_of::<D>()
    }

    pub fn mem(&self) -> &DmaBuffer {
        &self.mem
    }

    pub fn advance(&self, index: u16, n: u16) -> u16 {
        advance(index, n, self.len)
    }

    fn offset(&self, index: u16) -> usize {
        debug_assert!(index < self.len);
        index as usize * size_of::<D>()
    }
}

pub(crate) fn advance(index: u16, n: u16, len: u16) -> u16 {
    ((index as u32 + n as u32) % len as u32) as u16
}

/// The number of steps from `from` forward to `to` on a ring of `len`.
pub(crate) fn distance(from: u16, to: u16, len: u16) -> u16 {
    ((to as u32 + len as u32 - from as u32) % len as u32) as u16
}
