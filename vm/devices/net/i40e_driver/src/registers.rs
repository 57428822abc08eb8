// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device register access.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;

/// 32-bit access to the device's register BAR.
pub trait RegisterIo: Send + Sync {
    /// Reads the register at `offset`.
    fn read_u32(&self, offset: usize) -> u32;
    /// Writes the register at `offset`.
    fn write_u32(&self, offset: usize, data: u32);
}

/// A tail register through which software hands descriptors to the device.
pub(crate) struct Doorbell {
    regs: Arc<dyn RegisterIo>,
    offset: usize,
}

impl Doorbell {
    pub fn new(regs: Arc<dyn RegisterIo>, offset: usize) -> Self {
        Self { regs, offset }
    }

    /// Writes `tail`. All prior stores to descriptor memory are made visible
    /// to the device first.
    pub fn ring(&self, tail: u32) {
        fence(Ordering::SeqCst);
        tracing::trace!(offset = self.offset, tail, "doorbell");
        self.regs.write_u32(self.offset, tail);
    }
}
