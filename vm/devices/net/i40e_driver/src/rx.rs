// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Receive ring.

use crate::dma::DmaBuffer;
use crate::dma::DmaClient;
use crate::ratelimit::warn_ratelimited;
use crate::registers::Doorbell;
use crate::registers::RegisterIo;
use crate::ring::DescriptorRing;
use crate::ring::validate_ring_len;
use i40e_defs::RX_FLTSTAT_RSS_HASH;
use i40e_defs::RxReadDesc;
use i40e_defs::RxWbDesc;
use i40e_defs::virtchnl::RxqInfo;
use std::sync::Arc;
use zerocopy::FromZeros;

/// Receive ring parameters.
#[derive(Debug, Clone)]
pub struct RxConfig {
    /// Number of descriptors.
    pub ring_len: u16,
    /// Size of each posted buffer.
    pub buffer_size: usize,
    /// Largest frame the device should accept.
    pub max_frame_size: u32,
    /// Descriptors consumed between proactive refills during a poll.
    pub refill_interval: usize,
    /// Report RSS hashes.
    pub rss: bool,
    /// Report checksum validation results.
    pub checksum: bool,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self {
            ring_len: 1024,
            buffer_size: 2048,
            max_frame_size: 1522,
            refill_interval: 8,
            rss: true,
            checksum: true,
        }
    }
}

/// The device's verdict on a received packet's checksums.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RxChecksum {
    /// Not checked, or not checkable.
    Unknown,
    /// IP and transport checksums are correct.
    Good,
    /// A checksum was wrong.
    Bad,
}

/// One buffer of a received packet.
#[derive(Debug)]
pub struct RxFragment {
    /// The buffer, now owned by the packet.
    pub buffer: DmaBuffer,
    /// Bytes of packet data at the start of the buffer.
    pub len: usize,
}

/// A received packet and its metadata.
#[derive(Debug)]
pub struct RxPacket {
    /// The packet's buffers, in order.
    pub fragments: Vec<RxFragment>,
    /// Total length in bytes.
    pub len: usize,
    /// The RSS hash, when the device computed one.
    pub rss_hash: Option<u32>,
    /// Checksum validation result.
    pub checksum: RxChecksum,
    /// The stripped VLAN tag.
    pub vlan: Option<u16>,
    /// The device's packet type classification.
    pub ptype: u8,
}

impl RxPacket {
    /// Returns true if the device validated the packet's checksums.
    pub fn checksum_valid(&self) -> bool {
        self.checksum == RxChecksum::Good
    }

    /// Copies the packet data into a contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = vec![0; self.len];
        let mut offset = 0;
        for fragment in &self.fragments {
            fragment
                .buffer
                .read_at(0, &mut data[offset..offset + fragment.len]);
            offset += fragment.len;
        }
        data
    }
}

/// Consumer of received packets.
pub trait RxSink {
    /// Takes ownership of a packet.
    fn deliver(&mut self, packet: RxPacket);
}

impl<F: FnMut(RxPacket)> RxSink for F {
    fn deliver(&mut self, packet: RxPacket) {
        self(packet)
    }
}

/// Receive ring counters.
#[derive(Debug, Clone, Default)]
#[expect(missing_docs)]
pub struct RxStats {
    pub packets: u64,
    pub bytes: u64,
    pub discarded: u64,
    pub split: u64,
    pub alloc_failures: u64,
}

#[derive(Default)]
struct RxChain {
    fragments: Vec<RxFragment>,
    len: usize,
}

struct RxSlot {
    buffer: Option<DmaBuffer>,
    /// The packet whose earlier fragments ended at the previous slot.
    fmp: Option<RxChain>,
}

/// A receive ring.
pub struct RxRing {
    queue_id: u16,
    ring: DescriptorRing<RxWbDesc>,
    slots: Vec<RxSlot>,
    dma: Arc<dyn DmaClient>,
    tail: Doorbell,
    config: RxConfig,
    next_to_check: u16,
    next_refresh: u16,
    unrefreshed: u16,
    stats: RxStats,
}

impl RxRing {
    /// Allocates the ring and posts a buffer to every slot but one.
    pub fn new(
        dma: Arc<dyn DmaClient>,
        regs: Arc<dyn RegisterIo>,
        queue_id: u16,
        tail_offset: usize,
        config: RxConfig,
    ) -> anyhow::Result<Self> {
        validate_ring_len(config.ring_len)?;
        if config.buffer_size == 0 || config.refill_interval == 0 {
            anyhow::bail!("invalid receive ring config {config:?}");
        }
        let ring = DescriptorRing::new(dma.as_ref(), config.ring_len, 0)?;
        let slots = (0..config.ring_len)
            .map(|_| RxSlot {
                buffer: None,
                fmp: None,
            })
            .collect();
        let mut this = Self {
            queue_id,
            ring,
            slots,
            dma,
            tail: Doorbell::new(regs, tail_offset),
            unrefreshed: config.ring_len,
            config,
            next_to_check: 0,
            next_refresh: 0,
            stats: RxStats::default(),
        };
        this.refill(usize::MAX);
        Ok(this)
    }

    /// The queue index this ring serves.
    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    /// Ring counters.
    pub fn stats(&self) -> &RxStats {
        &self.stats
    }

    /// Bus address of the first descriptor.
    pub fn ring_address(&self) -> u64 {
        self.ring.base()
    }

    /// The queue's entry in a CONFIG_VSI_QUEUES request.
    pub fn rxq_info(&self, vsi_id: u16) -> RxqInfo {
        RxqInfo {
            vsi_id,
            queue_id: self.queue_id,
            ring_len: self.ring.len().into(),
            databuffer_size: self.config.buffer_size as u32,
            max_pkt_size: self.config.max_frame_size,
            dma_ring_addr: self.ring.base(),
            ..Default::default()
        }
    }

    /// Posts fresh buffers to up to `limit` slots that lack one and tells
    /// the device about them. One slot is always left unposted so that a
    /// full ring is distinguishable from an empty one.
    ///
    /// Returns the number of slots posted.
    pub fn refill(&mut self, limit: usize) -> usize {
        let mut refreshed = 0;
        while refreshed < limit && self.unrefreshed > 1 {
            let index = self.next_refresh;
            let slot = &mut self.slots[index as usize];
            let buffer = match &mut slot.buffer {
                Some(buffer) => buffer,
                None => match self.dma.allocate_dma_buffer(self.config.buffer_size) {
                    Ok(buffer) => slot.buffer.insert(buffer),
                    Err(err) => {
                        self.stats.alloc_failures += 1;
                        tracing::trace!(
                            queue = self.queue_id,
                            error = err.as_ref() as &dyn std::error::Error,
                            "receive buffer allocation failed"
                        );
                        break;
                    }
                },
            };
            self.ring.write_as(
                index,
                &RxReadDesc {
                    pkt_addr: buffer.bus_address(),
                    hdr_addr: 0,
                },
            );
            self.next_refresh = self.ring.advance(index, 1);
            self.unrefreshed -= 1;
            refreshed += 1;
        }
        if refreshed > 0 {
            self.tail.ring(self.next_refresh.into());
        }
        refreshed
    }

    /// Consumes up to `budget` completed descriptors, delivering finished
    /// packets to `sink`. Returns the number of descriptors consumed.
    pub fn poll(&mut self, budget: usize, sink: &mut dyn RxSink) -> usize {
        let mut consumed = 0;
        let mut since_refill = 0;
        while consumed < budget {
            let index = self.next_to_check;
            if self.slots[index as usize].buffer.is_none() {
                break;
            }
            let desc = self.ring.read(index);
            let status = desc.status_error_len;
            if !status.dd() {
                break;
            }

            let slot = &mut self.slots[index as usize];
            let Some(buffer) = slot.buffer.take() else {
                break;
            };
            let mut chain = slot.fmp.take().unwrap_or_default();
            let len = status.length_pbuf() as usize;
            chain.len += len;
            chain.fragments.push(RxFragment { buffer, len });
            self.unrefreshed += 1;

            let next = self.ring.advance(index, 1);
            if !status.eof() {
                self.slots[next as usize].fmp = Some(chain);
            } else if status.has_frame_error() {
                self.stats.discarded += 1;
                warn_ratelimited!(
                    queue = self.queue_id,
                    fragments = chain.fragments.len(),
                    rxe = status.rxe(),
                    oversize = status.oversize(),
                    "discarding errored receive packet"
                );
            } else {
                let packet = self.finish(chain, &desc);
                sink.deliver(packet);
            }

            self.next_to_check = next;
            consumed += 1;
            since_refill += 1;
            if since_refill == self.config.refill_interval {
                self.refill(usize::MAX);
                since_refill = 0;
            }
        }
        if self.unrefreshed > 1 {
            self.refill(usize::MAX);
        }
        consumed
    }

    fn finish(&mut self, chain: RxChain, eop: &RxWbDesc) -> RxPacket {
        let status = eop.status_error_len;
        let checksum = if !self.config.checksum {
            RxChecksum::Unknown
        } else if status.ipe() || status.l4e() {
            RxChecksum::Bad
        } else if status.ipv6exadd() || !status.l3l4p() {
            RxChecksum::Unknown
        } else {
            RxChecksum::Good
        };
        let rss_hash =
            (self.config.rss && status.fltstat() == RX_FLTSTAT_RSS_HASH).then_some(eop.rss);
        let vlan = status.l2tag1p().then_some(eop.l2tag1);

        self.stats.packets += 1;
        self.stats.bytes += chain.len as u64;
        if chain.fragments.len() > 1 {
            self.stats.split += 1;
        }
        RxPacket {
            fragments: chain.fragments,
            len: chain.len,
            rss_hash,
            checksum,
            vlan,
            ptype: status.ptype(),
        }
    }

    /// Frees every buffer and partial packet and leaves the ring empty. Only
    /// valid once the device has stopped the queue.
    pub fn drain(&mut self) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.buffer = None;
            slot.fmp = None;
            self.ring.write(i as u16, &RxWbDesc::new_zeroed());
        }
        self.next_to_check = 0;
        self.next_refresh = 0;
        self.unrefreshed = self.ring.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulated::DeviceSharedMemory;
    use crate::emulated::EmulatedRegisters;
    use i40e_defs::RxWbQword1;
    use i40e_defs::regs::qrx_tail;

    struct Harness {
        mem: DeviceSharedMemory,
        regs: Arc<EmulatedRegisters>,
        ring: RxRing,
        device_index: u16,
    }

    fn harness_with(mem: DeviceSharedMemory) -> Harness {
        let regs = Arc::new(EmulatedRegisters::new());
        let ring = RxRing::new(
            mem.dma_client(),
            regs.clone(),
            0,
            qrx_tail(0),
            RxConfig {
                ring_len: 32,
                ..Default::default()
            },
        )
        .unwrap();
        Harness {
            mem,
            regs,
            ring,
            device_index: 0,
        }
    }

    fn harness() -> Harness {
        harness_with(DeviceSharedMemory::new(0x100000))
    }

    impl Harness {
        /// Plays the device: fills the next posted buffer and writes back its
        /// descriptor.
        fn receive(&mut self, data: &[u8], status: RxWbQword1) {
            let address = self.ring.ring_address() + self.device_index as u64 * 16;
            let posted: RxReadDesc = self.mem.read_obj(address);
            self.mem.write_at(posted.pkt_addr, data);
            let desc = RxWbDesc {
                mirroring_status: 0,
                l2tag1: 100,
                rss: 0xabcd,
                status_error_len: status
                    .with_dd(true)
                    .with_length_pbuf(data.len() as u16),
            };
            self.mem.write_obj(address, &desc);
            self.device_index = (self.device_index + 1) % 32;
        }

        /// Receives a packet split into `n` descriptors.
        fn receive_chain(&mut self, n: usize, eop_status: RxWbQword1) {
            for i in 0..n {
                let status = if i == n - 1 {
                    eop_status.with_eof(true)
                } else {
                    RxWbQword1::new()
                };
                self.receive(&[i as u8; 64], status);
            }
        }

        fn poll(&mut self, budget: usize) -> (usize, Vec<RxPacket>) {
            let mut packets = Vec::new();
            let n = self.ring.poll(budget, &mut |p: RxPacket| packets.push(p));
            (n, packets)
        }
    }

    #[test]
    fn init_posts_all_but_one() {
        let h = harness();
        assert_eq!(h.regs.writes_to(qrx_tail(0)), vec![31]);
        assert_eq!(h.ring.unrefreshed, 1);
    }

    #[test]
    fn single_descriptor_packet() {
        let mut h = harness();
        h.receive(
            b"hello",
            RxWbQword1::new()
                .with_eof(true)
                .with_l3l4p(true)
                .with_l2tag1p(true)
                .with_fltstat(RX_FLTSTAT_RSS_HASH)
                .with_ptype(26),
        );
        let (n, packets) = h.poll(64);
        assert_eq!(n, 1);
        assert_eq!(packets.len(), 1);
        let p = &packets[0];
        assert_eq!(p.to_vec(), b"hello");
        assert!(p.checksum_valid());
        assert_eq!(p.rss_hash, Some(0xabcd));
        assert_eq!(p.vlan, Some(100));
        assert_eq!(p.ptype, 26);
        assert_eq!(h.regs.writes_to(qrx_tail(0)), vec![31, 0]);
    }

    #[test]
    fn checksum_errors_are_reported() {
        let mut h = harness();
        h.receive(b"x", RxWbQword1::new().with_eof(true).with_l3l4p(true).with_l4e(true));
        h.receive(b"y", RxWbQword1::new().with_eof(true));
        let (_, packets) = h.poll(64);
        assert_eq!(packets[0].checksum, RxChecksum::Bad);
        assert_eq!(packets[1].checksum, RxChecksum::Unknown);
        assert_eq!(packets[1].rss_hash, None);
        assert_eq!(packets[1].vlan, None);
    }

    #[test]
    fn chained_packet_is_assembled() {
        let mut h = harness();
        h.receive_chain(3, RxWbQword1::new());
        let (n, packets) = h.poll(64);
        assert_eq!(n, 3);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].fragments.len(), 3);
        assert_eq!(packets[0].len, 192);
        let data = packets[0].to_vec();
        assert_eq!(&data[..64], &[0; 64]);
        assert_eq!(&data[128..], &[2; 64]);
        assert_eq!(h.ring.stats().split, 1);
    }

    #[test]
    fn chain_survives_budget_boundary() {
        let mut h = harness();
        h.receive_chain(3, RxWbQword1::new());
        let (n, packets) = h.poll(2);
        assert_eq!(n, 2);
        assert!(packets.is_empty());
        let (n, packets) = h.poll(2);
        assert_eq!(n, 1);
        assert_eq!(packets[0].fragments.len(), 3);
    }

    #[test]
    fn errored_chains_are_never_delivered() {
        for n in [1, 2, 5] {
            let mem = DeviceSharedMemory::new(0x100000);
            let mut h = harness_with(mem.clone());
            let pages = mem.allocated_pages();
            h.receive_chain(n, RxWbQword1::new().with_rxe(true));
            h.receive(b"good", RxWbQword1::new().with_eof(true));
            let (consumed, packets) = h.poll(64);
            assert_eq!(consumed, n + 1);
            assert_eq!(packets.len(), 1, "chain of {n}");
            assert_eq!(packets[0].to_vec(), b"good");
            assert_eq!(h.ring.stats().discarded, 1);
            drop(packets);
            assert_eq!(mem.allocated_pages(), pages);
        }
    }

    #[test]
    fn refill_runs_every_interval() {
        let mut h = harness();
        for _ in 0..20 {
            h.receive(b"p", RxWbQword1::new().with_eof(true));
        }
        let (n, packets) = h.poll(64);
        assert_eq!(n, 20);
        assert_eq!(packets.len(), 20);
        assert_eq!(h.regs.writes_to(qrx_tail(0)), vec![31, 7, 15, 19]);
    }

    #[test]
    fn allocation_failure_is_counted_and_retried() {
        // One page of ring memory plus one page per posted buffer.
        let mut h = harness_with(DeviceSharedMemory::new(32 * 4096));
        h.receive(b"p", RxWbQword1::new().with_eof(true));
        let (_, packets) = h.poll(64);
        assert_eq!(packets.len(), 1);
        assert_eq!(h.ring.stats().alloc_failures, 1);
        assert_eq!(h.regs.writes_to(qrx_tail(0)), vec![31]);

        drop(packets);
        assert_eq!(h.ring.refill(usize::MAX), 1);
        assert_eq!(h.regs.writes_to(qrx_tail(0)), vec![31, 0]);
    }
}
