// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A software model of the device's memory, registers and admin queue
//! firmware, for running the driver without hardware.

use crate::adminq::AdminQueueRegisters;
use crate::dma::DmaBuffer;
use crate::dma::DmaClient;
use crate::dma::DmaRegion;
use crate::registers::RegisterIo;
use anyhow::Context;
use bitvec::vec::BitVec;
use i40e_defs::aq::AqDesc;
use i40e_defs::aq::AqRetval;
use i40e_defs::regs::AQ_HEAD_TAIL_MASK;
use i40e_defs::regs::AqLen;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

const PAGE_SIZE: usize = 4096;
/// Bus address of the first byte of shared memory. Nonzero so that a zero
/// address in a descriptor never points at a real allocation.
const BASE_ADDRESS: u64 = 0x1_0000_0000;

/// Memory visible to both the driver and the emulated device.
#[derive(Clone)]
pub struct DeviceSharedMemory {
    inner: Arc<SharedMemoryInner>,
}

struct SharedMemoryInner {
    mem: Mutex<Vec<u8>>,
    pages: Mutex<BitVec>,
}

impl DeviceSharedMemory {
    /// Creates `size` bytes of shared memory. `size` must be page aligned.
    pub fn new(size: usize) -> Self {
        assert_eq!(size % PAGE_SIZE, 0);
        Self {
            inner: Arc::new(SharedMemoryInner {
                mem: Mutex::new(vec![0; size]),
                pages: Mutex::new(BitVec::repeat(false, size / PAGE_SIZE)),
            }),
        }
    }

    /// Returns an allocator handing out this memory.
    pub fn dma_client(&self) -> Arc<EmulatedDmaClient> {
        Arc::new(EmulatedDmaClient { mem: self.clone() })
    }

    /// Allocates whole pages covering `len` bytes, or returns `None` if no
    /// contiguous run is free.
    pub fn alloc(&self, len: usize) -> Option<DmaBuffer> {
        let count = len.div_ceil(PAGE_SIZE).max(1);
        let start = {
            let mut pages = self.inner.pages.lock();
            let start = (0..=pages.len().checked_sub(count)?)
                .find(|&start| pages[start..start + count].not_any())?;
            pages[start..start + count].fill(true);
            start
        };
        let region = EmulatedRegion {
            mem: self.inner.clone(),
            offset: start * PAGE_SIZE,
            len,
        };
        region.write_at(0, &vec![0; len]);
        Some(DmaBuffer::new(Box::new(region)))
    }

    /// The number of pages currently allocated.
    pub fn allocated_pages(&self) -> usize {
        self.inner.pages.lock().count_ones()
    }

    /// Reads device memory by bus address.
    pub fn read_at(&self, address: u64, data: &mut [u8]) {
        let offset = (address - BASE_ADDRESS) as usize;
        data.copy_from_slice(&self.inner.mem.lock()[offset..offset + data.len()]);
    }

    /// Writes device memory by bus address.
    pub fn write_at(&self, address: u64, data: &[u8]) {
        let offset = (address - BASE_ADDRESS) as usize;
        self.inner.mem.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Reads an object by bus address.
    pub fn read_obj<T: FromBytes + IntoBytes>(&self, address: u64) -> T {
        let mut obj = T::new_zeroed();
        self.read_at(address, obj.as_mut_bytes());
        obj
    }

    /// Writes an object by bus address.
    pub fn write_obj<T: IntoBytes + Immutable>(&self, address: u64, obj: &T) {
        self.write_at(address, obj.as_bytes())
    }
}

struct EmulatedRegion {
    mem: Arc<SharedMemoryInner>,
    offset: usize,
    len: usize,
}

impl DmaRegion for EmulatedRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn bus_address(&self) -> u64 {
        BASE_ADDRESS + self.offset as u64
    }

    fn read_at(&self, offset: usize, data: &mut [u8]) {
        assert!(offset + data.len() <= self.len);
        let start = self.offset + offset;
        data.copy_from_slice(&self.mem.mem.lock()[start..start + data.len()]);
    }

    fn write_at(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len);
        let start = self.offset + offset;
        self.mem.mem.lock()[start..start + data.len()].copy_from_slice(data);
    }
}

impl Drop for EmulatedRegion {
    fn drop(&mut self) {
        let first = self.offset / PAGE_SIZE;
        let count = self.len.div_ceil(PAGE_SIZE).max(1);
        self.mem.pages.lock()[first..first + count].fill(false);
    }
}

/// A [`DmaClient`] backed by [`DeviceSharedMemory`].
pub struct EmulatedDmaClient {
    mem: DeviceSharedMemory,
}

impl DmaClient for EmulatedDmaClient {
    fn allocate_dma_buffer(&self, len: usize) -> anyhow::Result<DmaBuffer> {
        self.mem.alloc(len).context("out of emulated device memory")
    }
}

/// A register file that remembers every value written to it.
#[derive(Default)]
pub struct EmulatedRegisters {
    state: Mutex<RegisterState>,
}

#[derive(Default)]
struct RegisterState {
    values: BTreeMap<usize, u32>,
    writes: Vec<(usize, u32)>,
}

impl EmulatedRegisters {
    /// Creates a register file with every register reading zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current value of a register.
    pub fn get(&self, offset: usize) -> u32 {
        self.state.lock().values.get(&offset).copied().unwrap_or(0)
    }

    /// Sets a register from the device side. Not recorded as a driver write.
    pub fn set(&self, offset: usize, value: u32) {
        self.state.lock().values.insert(offset, value);
    }

    /// Every value the driver has written to `offset`, oldest first.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|&&(o, _)| o == offset)
            .map(|&(_, v)| v)
            .collect()
    }
}

impl RegisterIo for EmulatedRegisters {
    fn read_u32(&self, offset: usize) -> u32 {
        self.get(offset)
    }

    fn write_u32(&self, offset: usize, data: u32) {
        let mut state = self.state.lock();
        state.values.insert(offset, data);
        state.writes.push((offset, data));
    }
}

/// A request taken off an emulated admin send queue.
#[derive(Debug, Clone)]
pub struct FirmwareRequest {
    /// The descriptor as the driver wrote it.
    pub desc: AqDesc,
    /// The indirect buffer contents, if the descriptor carried one.
    pub payload: Vec<u8>,
}

/// The firmware side of one admin queue pair.
pub struct EmulatedAdminQueue {
    mem: DeviceSharedMemory,
    regs: Arc<EmulatedRegisters>,
    offsets: AdminQueueRegisters,
    asq_head: u16,
    arq_head: u16,
}

impl EmulatedAdminQueue {
    /// Attaches to the admin queue registers at `offsets`.
    pub fn new(
        mem: DeviceSharedMemory,
        regs: Arc<EmulatedRegisters>,
        offsets: AdminQueueRegisters,
    ) -> Self {
        Self {
            mem,
            regs,
            offsets,
            asq_head: 0,
            arq_head: 0,
        }
    }

    fn ring(&self, len_reg: usize, bal: usize, bah: usize) -> Option<(u64, u16)> {
        let len = AqLen::from_bits(self.regs.get(len_reg));
        if !len.enable() || len.len() == 0 {
            return None;
        }
        let base = ((self.regs.get(bah) as u64) << 32) | self.regs.get(bal) as u64;
        Some((base, len.len()))
    }

    /// Completes every request the driver has posted, with status `OK`.
    pub fn take_requests(&mut self) -> Vec<FirmwareRequest> {
        self.take_requests_with(|_| AqRetval::OK)
    }

    /// Completes every request the driver has posted, with the status chosen
    /// by `status`.
    pub fn take_requests_with(
        &mut self,
        mut status: impl FnMut(&FirmwareRequest) -> AqRetval,
    ) -> Vec<FirmwareRequest> {
        let o = self.offsets;
        let Some((base, len)) = self.ring(o.atq_len, o.atq_bal, o.atq_bah) else {
            return Vec::new();
        };
        let tail = (self.regs.get(o.atq_tail) & AQ_HEAD_TAIL_MASK) as u16;
        let mut requests = Vec::new();
        while self.asq_head != tail {
            let address = base + self.asq_head as u64 * size_of::<AqDesc>() as u64;
            let mut desc: AqDesc = self.mem.read_obj(address);
            let mut payload = Vec::new();
            if desc.flags.buf() {
                payload = vec![0; desc.datalen as usize];
                self.mem.read_at(desc.buffer_address(), &mut payload);
            }
            let request = FirmwareRequest { desc, payload };
            let retval = status(&request);
            desc.retval = retval.0;
            desc.flags = desc
                .flags
                .with_dd(true)
                .with_cmp(true)
                .with_err(retval != AqRetval::OK);
            self.mem.write_obj(address, &desc);
            requests.push(request);
            self.asq_head = (self.asq_head + 1) % len;
        }
        self.regs.set(o.atq_head, self.asq_head.into());
        requests
    }

    /// Writes an event into the next posted receive buffer. Returns false if
    /// the driver has no buffer posted.
    pub fn post_event(&mut self, mut desc: AqDesc, payload: &[u8]) -> bool {
        let o = self.offsets;
        let Some((base, len)) = self.ring(o.arq_len, o.arq_bal, o.arq_bah) else {
            return false;
        };
        let tail = (self.regs.get(o.arq_tail) & AQ_HEAD_TAIL_MASK) as u16;
        if self.arq_head == tail {
            return false;
        }
        let address = base + self.arq_head as u64 * size_of::<AqDesc>() as u64;
        let posted: AqDesc = self.mem.read_obj(address);
        assert!(payload.len() <= posted.datalen as usize);
        self.mem.write_at(posted.buffer_address(), payload);
        desc.datalen = payload.len() as u16;
        desc.flags = desc.flags.with_dd(true).with_cmp(true).with_buf(!payload.is_empty());
        desc.set_buffer_address(posted.buffer_address());
        self.mem.write_obj(address, &desc);
        self.arq_head = (self.arq_head + 1) % len;
        self.regs.set(o.arq_head, self.arq_head.into());
        true
    }

    /// Raises fault bits in the receive queue length register.
    pub fn inject_fault(&self, fault: AqLen) {
        let o = self.offsets;
        let len = self.regs.get(o.arq_len) | fault.into_bits();
        self.regs.set(o.arq_len, len);
    }
}
