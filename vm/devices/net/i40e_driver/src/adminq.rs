// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The admin queue: a pair of descriptor rings for exchanging commands and
//! events with device firmware.
//!
//! The send queue (ASQ) carries requests from the driver. The receive queue
//! (ARQ) carries events from firmware, including virtual channel messages
//! from the peer function. Each ARQ slot owns a posted buffer that is
//! re-posted as soon as its event has been copied out.

use crate::dma::DmaBuffer;
use crate::dma::DmaClient;
use crate::registers::Doorbell;
use crate::registers::RegisterIo;
use crate::ring::DescriptorRing;
use anyhow::Context;
use i40e_defs::aq::AQ_LARGE_BUF;
use i40e_defs::aq::AQ_MAX_BUF_SIZE;
use i40e_defs::aq::AqDesc;
use i40e_defs::aq::AqFlags;
use i40e_defs::aq::AqOpcode;
use i40e_defs::aq::AqRetval;
use i40e_defs::regs;
use i40e_defs::regs::AQ_HEAD_TAIL_MASK;
use i40e_defs::regs::AqLen;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Register offsets for one admin queue pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[expect(missing_docs)]
pub struct AdminQueueRegisters {
    pub atq_bal: usize,
    pub atq_bah: usize,
    pub atq_len: usize,
    pub atq_head: usize,
    pub atq_tail: usize,
    pub arq_bal: usize,
    pub arq_bah: usize,
    pub arq_len: usize,
    pub arq_head: usize,
    pub arq_tail: usize,
}

impl AdminQueueRegisters {
    /// The physical function's admin queue.
    pub const PF: Self = Self {
        atq_bal: regs::PF_ATQBAL,
        atq_bah: regs::PF_ATQBAH,
        atq_len: regs::PF_ATQLEN,
        atq_head: regs::PF_ATQH,
        atq_tail: regs::PF_ATQT,
        arq_bal: regs::PF_ARQBAL,
        arq_bah: regs::PF_ARQBAH,
        arq_len: regs::PF_ARQLEN,
        arq_head: regs::PF_ARQH,
        arq_tail: regs::PF_ARQT,
    };

    /// A virtual function's mailbox to its PF.
    pub const VF: Self = Self {
        atq_bal: regs::VF_ATQBAL1,
        atq_bah: regs::VF_ATQBAH1,
        atq_len: regs::VF_ATQLEN1,
        atq_head: regs::VF_ATQH1,
        atq_tail: regs::VF_ATQT1,
        arq_bal: regs::VF_ARQBAL1,
        arq_bah: regs::VF_ARQBAH1,
        arq_len: regs::VF_ARQLEN1,
        arq_head: regs::VF_ARQH1,
        arq_tail: regs::VF_ARQT1,
    };
}

/// Admin queue sizing and bring-up polling parameters.
#[derive(Debug, Clone)]
pub struct AdminQueueConfig {
    /// Send queue depth.
    pub asq_len: u16,
    /// Receive queue depth.
    pub arq_len: u16,
    /// Size of each indirect and receive buffer.
    pub buffer_size: usize,
    /// Polls made while waiting for a bring-up event, by
    /// [`AdminQueue::drain_sync`] or a caller pacing its own polls, before
    /// giving up.
    pub drain_retries: u32,
    /// Delay between those polls.
    pub drain_delay: Duration,
}

impl Default for AdminQueueConfig {
    fn default() -> Self {
        Self {
            asq_len: 32,
            arq_len: 32,
            buffer_size: AQ_MAX_BUF_SIZE,
            drain_retries: 200,
            drain_delay: Duration::from_millis(10),
        }
    }
}

/// Which ring of the pair reported a fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AqQueue {
    /// The send queue.
    Send,
    /// The receive queue.
    Receive,
}

/// Admin queue failures.
#[derive(Debug, Error)]
pub enum AdminQueueError {
    /// Every send slot is in use until firmware completes one.
    #[error("admin send queue is full")]
    Full,
    /// The payload does not fit in an indirect buffer.
    #[error("payload of {len} bytes exceeds the {max} byte admin buffer")]
    PayloadTooLarge {
        /// Requested payload length.
        len: usize,
        /// Buffer size.
        max: usize,
    },
    /// The device flagged the queue as broken; a function reset is needed.
    #[error("{queue:?} admin queue fault {fault:?}")]
    Fatal {
        /// The faulting ring.
        queue: AqQueue,
        /// The length register as read, with its fault bits.
        fault: AqLen,
    },
    /// The queue was shut down.
    #[error("admin queue is shut down")]
    ShutDown,
    /// [`AdminQueue::drain_sync`] found no event.
    #[error("no admin queue event after {0} polls")]
    Timeout(u32),
}

/// A send queue descriptor that firmware has completed.
#[derive(Debug, Copy, Clone)]
pub struct AqCompletion {
    /// The descriptor as firmware wrote it back.
    pub desc: AqDesc,
}

impl AqCompletion {
    /// The cookie the request was sent with.
    pub fn cookie(&self) -> u64 {
        self.desc.cookie()
    }

    /// The firmware return code.
    pub fn status(&self) -> AqRetval {
        self.desc.status()
    }
}

/// An event received from firmware.
#[derive(Debug, Clone)]
pub struct AdminQueueMessage {
    /// The receive descriptor.
    pub desc: AqDesc,
    /// The contents of the event buffer, `desc.datalen` bytes long.
    pub payload: Vec<u8>,
}

impl AdminQueueMessage {
    /// The event opcode.
    pub fn opcode(&self) -> AqOpcode {
        self.desc.opcode
    }

    /// The firmware return code, or for mailbox messages the source function.
    pub fn retval(&self) -> u16 {
        self.desc.retval
    }
}

struct SendQueue {
    ring: DescriptorRing<AqDesc>,
    buffers: Vec<DmaBuffer>,
    tail: Doorbell,
    next_to_use: u16,
    next_to_clean: u16,
    completed: VecDeque<AqCompletion>,
}

struct ReceiveQueue {
    ring: DescriptorRing<AqDesc>,
    buffers: Vec<DmaBuffer>,
    tail: Doorbell,
    next_to_clean: u16,
}

struct Rings {
    asq: SendQueue,
    arq: ReceiveQueue,
}

/// An initialized admin queue pair.
pub struct AdminQueue {
    regs: Arc<dyn RegisterIo>,
    offsets: AdminQueueRegisters,
    config: AdminQueueConfig,
    rings: Option<Rings>,
}

fn posted_desc(buffer: &DmaBuffer) -> AqDesc {
    let mut desc = AqDesc {
        flags: AqFlags::new()
            .with_buf(true)
            .with_lb(buffer.len() > AQ_LARGE_BUF),
        datalen: buffer.len() as u16,
        ..Default::default()
    };
    desc.set_buffer_address(buffer.bus_address());
    desc
}

impl AdminQueue {
    /// Allocates both rings and their buffers and programs the queue
    /// registers.
    pub fn new(
        regs: Arc<dyn RegisterIo>,
        dma: &dyn DmaClient,
        offsets: AdminQueueRegisters,
        config: AdminQueueConfig,
    ) -> anyhow::Result<Self> {
        for len in [config.asq_len, config.arq_len] {
            if len < 2 || len as u32 > AQ_HEAD_TAIL_MASK {
                anyhow::bail!("invalid admin queue length {len}");
            }
        }
        if config.buffer_size == 0 || config.buffer_size > AQ_MAX_BUF_SIZE {
            anyhow::bail!("invalid admin buffer size {}", config.buffer_size);
        }

        let alloc_buffers = |count: u16| -> anyhow::Result<Vec<DmaBuffer>> {
            (0..count)
                .map(|_| {
                    dma.allocate_dma_buffer(config.buffer_size)
                        .context("failed to allocate admin queue buffer")
                })
                .collect()
        };

        let asq = SendQueue {
            ring: DescriptorRing::new(dma, config.asq_len, 0)?,
            buffers: alloc_buffers(config.asq_len)?,
            tail: Doorbell::new(regs.clone(), offsets.atq_tail),
            next_to_use: 0,
            next_to_clean: 0,
            completed: VecDeque::new(),
        };
        let arq = ReceiveQueue {
            ring: DescriptorRing::new(dma, config.arq_len, 0)?,
            buffers: alloc_buffers(config.arq_len)?,
            tail: Doorbell::new(regs.clone(), offsets.arq_tail),
            next_to_clean: 0,
        };
        for (i, buffer) in arq.buffers.iter().enumerate() {
            arq.ring.write(i as u16, &posted_desc(buffer));
        }

        let program = |len_reg: usize, head: usize, tail: usize, bal: usize, bah: usize, ring: &DescriptorRing<AqDesc>| {
            regs.write_u32(head, 0);
            regs.write_u32(tail, 0);
            regs.write_u32(
                len_reg,
                AqLen::new().with_len(ring.len()).with_enable(true).into_bits(),
            );
            regs.write_u32(bal, ring.base() as u32);
            regs.write_u32(bah, (ring.base() >> 32) as u32);
            if regs.read_u32(bal) != ring.base() as u32 {
                anyhow::bail!("admin queue base address did not stick");
            }
            Ok(())
        };
        program(
            offsets.atq_len,
            offsets.atq_head,
            offsets.atq_tail,
            offsets.atq_bal,
            offsets.atq_bah,
            &asq.ring,
        )?;
        program(
            offsets.arq_len,
            offsets.arq_head,
            offsets.arq_tail,
            offsets.arq_bal,
            offsets.arq_bah,
            &arq.ring,
        )?;
        arq.tail.ring((config.arq_len - 1).into());

        tracing::debug!(
            asq_len = config.asq_len,
            arq_len = config.arq_len,
            buffer_size = config.buffer_size,
            "admin queue initialized"
        );

        Ok(Self {
            regs,
            offsets,
            config,
            rings: Some(Rings { asq, arq }),
        })
    }

    /// Checks both length registers for fault bits, clearing any that are
    /// set.
    fn check_faults(&self) -> Result<(), AdminQueueError> {
        for (queue, offset) in [
            (AqQueue::Send, self.offsets.atq_len),
            (AqQueue::Receive, self.offsets.arq_len),
        ] {
            let fault = AqLen::from_bits(self.regs.read_u32(offset));
            if fault.has_fault() {
                tracing::error!(
                    ?queue,
                    vf_error = fault.vfe(),
                    overflow = fault.ovfl(),
                    critical = fault.crit(),
                    "admin queue fault"
                );
                self.regs.write_u32(
                    offset,
                    fault
                        .with_vfe(false)
                        .with_ovfl(false)
                        .with_crit(false)
                        .into_bits(),
                );
                return Err(AdminQueueError::Fatal { queue, fault });
            }
        }
        Ok(())
    }

    fn clean_send_queue(regs: &dyn RegisterIo, offsets: &AdminQueueRegisters, asq: &mut SendQueue) {
        let head = (regs.read_u32(offsets.atq_head) & AQ_HEAD_TAIL_MASK) as u16;
        while asq.next_to_clean != head && asq.next_to_clean != asq.next_to_use {
            let desc = asq.ring.read(asq.next_to_clean);
            if desc.status() != AqRetval::OK {
                tracing::debug!(opcode = ?desc.opcode, status = ?desc.status(), "admin command failed");
            }
            asq.completed.push_back(AqCompletion { desc });
            asq.ring.write(asq.next_to_clean, &AqDesc::default());
            asq.next_to_clean = asq.ring.advance(asq.next_to_clean, 1);
        }
    }

    /// Posts a command. When `payload` is not empty it is copied into the
    /// slot's indirect buffer for firmware to read.
    ///
    /// Returns the cookie the command carries, which its completion echoes.
    pub fn send(&mut self, mut desc: AqDesc, payload: &[u8]) -> Result<u64, AdminQueueError> {
        self.check_faults()?;
        let rings = self.rings.as_mut().ok_or(AdminQueueError::ShutDown)?;
        if payload.len() > self.config.buffer_size {
            return Err(AdminQueueError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.buffer_size,
            });
        }

        let asq = &mut rings.asq;
        let index = asq.next_to_use;
        let next = asq.ring.advance(index, 1);
        if next == asq.next_to_clean {
            Self::clean_send_queue(self.regs.as_ref(), &self.offsets, asq);
            if next == asq.next_to_clean {
                return Err(AdminQueueError::Full);
            }
        }

        desc.datalen = payload.len() as u16;
        if !payload.is_empty() {
            let buffer = &asq.buffers[index as usize];
            buffer.write_at(0, payload);
            desc.flags = desc
                .flags
                .with_buf(true)
                .with_rd(true)
                .with_lb(payload.len() > AQ_LARGE_BUF);
            desc.set_buffer_address(buffer.bus_address());
        }
        asq.ring.write(index, &desc);
        asq.next_to_use = next;
        asq.tail.ring(next.into());

        tracing::trace!(opcode = ?desc.opcode, cookie = desc.cookie(), index, "admin command posted");
        Ok(desc.cookie())
    }

    /// Returns the commands firmware has completed since the last call, in
    /// submission order.
    pub fn complete_sends(&mut self) -> Result<Vec<AqCompletion>, AdminQueueError> {
        self.check_faults()?;
        let rings = self.rings.as_mut().ok_or(AdminQueueError::ShutDown)?;
        Self::clean_send_queue(self.regs.as_ref(), &self.offsets, &mut rings.asq);
        Ok(rings.asq.completed.drain(..).collect())
    }

    /// Takes the next event off the receive queue, if any, and re-posts its
    /// buffer.
    pub fn next_event(&mut self) -> Result<Option<AdminQueueMessage>, AdminQueueError> {
        self.check_faults()?;
        let rings = self.rings.as_mut().ok_or(AdminQueueError::ShutDown)?;
        let arq = &mut rings.arq;
        let head = (self.regs.read_u32(self.offsets.arq_head) & AQ_HEAD_TAIL_MASK) as u16;
        let index = arq.next_to_clean;
        if head == index {
            return Ok(None);
        }

        let desc = arq.ring.read(index);
        let buffer = &arq.buffers[index as usize];
        let len = (desc.datalen as usize).min(buffer.len());
        let mut payload = vec![0; len];
        buffer.read_at(0, &mut payload);
        if desc.flags.err() {
            tracing::debug!(opcode = ?desc.opcode, retval = desc.retval, "admin event with error");
        }

        arq.ring.write(index, &posted_desc(buffer));
        arq.tail.ring(index.into());
        arq.next_to_clean = arq.ring.advance(index, 1);

        tracing::trace!(opcode = ?desc.opcode, len, index, "admin event received");
        Ok(Some(AdminQueueMessage { desc, payload }))
    }

    /// Takes up to `limit` events off the receive queue.
    pub fn poll_events(&mut self, limit: usize) -> Result<Vec<AdminQueueMessage>, AdminQueueError> {
        let mut events = Vec::new();
        while events.len() < limit {
            match self.next_event()? {
                Some(event) => events.push(event),
                None => break,
            }
        }
        Ok(events)
    }

    /// Waits for one event during bring-up, when interrupts are not yet
    /// available, polling with a fixed delay.
    pub fn drain_sync(&mut self) -> Result<AdminQueueMessage, AdminQueueError> {
        for _ in 0..self.config.drain_retries {
            if let Some(event) = self.next_event()? {
                return Ok(event);
            }
            std::thread::sleep(self.config.drain_delay);
        }
        Err(AdminQueueError::Timeout(self.config.drain_retries))
    }

    /// Disables both rings and frees their memory. Every later operation
    /// fails with [`AdminQueueError::ShutDown`].
    pub fn shutdown(&mut self) {
        if self.rings.take().is_none() {
            return;
        }
        let o = &self.offsets;
        for offset in [
            o.atq_head, o.atq_tail, o.atq_len, o.atq_bal, o.atq_bah, o.arq_head, o.arq_tail,
            o.arq_len, o.arq_bal, o.arq_bah,
        ] {
            self.regs.write_u32(offset, 0);
        }
        tracing::debug!("admin queue shut down");
    }

    /// Returns true once [`Self::shutdown`] has run.
    pub fn is_shut_down(&self) -> bool {
        self.rings.is_none()
    }

    /// The sizing and polling parameters.
    pub fn config(&self) -> &AdminQueueConfig {
        &self.config
    }
}
