// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transmit ring.
//!
//! Packets are mapped onto one data descriptor per segment, preceded by a
//! context descriptor for TSO. The last descriptor of a packet requests a
//! status report, and the first slot of the packet records where that last
//! descriptor is so that [`TxRing::reclaim`] can release the whole packet
//! at once.

use crate::dma::DmaClient;
use crate::ratelimit::error_ratelimited;
use crate::registers::Doorbell;
use crate::registers::RegisterIo;
use crate::ring::DescriptorRing;
use crate::ring::distance;
use crate::ring::validate_ring_len;
use i40e_defs::TX_CTX_DESC_CMD_TSO;
use i40e_defs::TX_DESC_CMD_EOP;
use i40e_defs::TX_DESC_CMD_ICRC;
use i40e_defs::TX_DESC_CMD_IIPT_IPV4;
use i40e_defs::TX_DESC_CMD_IIPT_IPV4_CSUM;
use i40e_defs::TX_DESC_CMD_IIPT_IPV6;
use i40e_defs::TX_DESC_CMD_IL2TAG1;
use i40e_defs::TX_DESC_CMD_L4T_EOFT_SCTP;
use i40e_defs::TX_DESC_CMD_L4T_EOFT_TCP;
use i40e_defs::TX_DESC_CMD_L4T_EOFT_UDP;
use i40e_defs::TX_DESC_CMD_RS;
use i40e_defs::TX_MAX_BUFFER_SIZE;
use i40e_defs::TX_MAX_TSO_LEN;
use i40e_defs::TX_MAX_TSO_MSS;
use i40e_defs::TX_MIN_TSO_MSS;
use i40e_defs::TxContextDesc;
use i40e_defs::TxContextQword1;
use i40e_defs::TxDataDesc;
use i40e_defs::TxDataQword1;
use i40e_defs::TxDescOffset;
use i40e_defs::TxDescType;
use i40e_defs::virtchnl::TxqInfo;
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromZeros;

const IPPROTO_TCP: u8 = 6;
const UDP_HEADER_LEN: u16 = 8;
const SCTP_HEADER_LEN: u16 = 12;

/// Transmit ring parameters.
#[derive(Debug, Clone)]
pub struct TxConfig {
    /// Number of descriptors.
    pub ring_len: u16,
    /// Most segments a normal packet may use before it is coalesced.
    pub max_segments: usize,
    /// Most segments a TSO packet may use before it is coalesced.
    pub max_tso_segments: usize,
    /// A TSO packet whose first MSS of payload spans more than this many
    /// segments is coalesced.
    pub sparse_chain: usize,
    /// Have the device write its head index after the ring instead of
    /// marking descriptors done.
    pub head_writeback: bool,
    /// Reclaim calls that free nothing before the queue is considered hung.
    pub max_busy: u32,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            ring_len: 1024,
            max_segments: 8,
            max_tso_segments: 64,
            sparse_chain: 6,
            head_writeback: true,
            max_busy: 10,
        }
    }
}

/// A physically contiguous piece of a packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TxSegment {
    /// Bus address of the data.
    pub address: u64,
    /// Length in bytes.
    pub len: u32,
}

/// The network-layer protocol of a packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[expect(missing_docs)]
pub enum L3Protocol {
    #[default]
    Other,
    Ipv4,
    Ipv6,
}

/// The transport-layer protocol of a packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[expect(missing_docs)]
pub enum L4Protocol {
    #[default]
    Other,
    Tcp,
    Udp,
    Sctp,
}

/// Offloads requested for a packet, along with the header layout needed to
/// perform them.
#[derive(Debug, Clone, Default)]
pub struct TxOffload {
    /// Network-layer protocol.
    pub l3: L3Protocol,
    /// Transport-layer protocol.
    pub l4: L4Protocol,
    /// Length of the Ethernet header, including any VLAN tag.
    pub l2_len: u16,
    /// Length of the IP header.
    pub l3_len: u16,
    /// Length of the transport header.
    pub l4_len: u16,
    /// Insert the IPv4 header checksum.
    pub ip_checksum: bool,
    /// Insert the transport checksum.
    pub l4_checksum: bool,
    /// Segment the TCP payload.
    pub tso: Option<TsoRequest>,
    /// Insert this VLAN tag.
    pub vlan: Option<u16>,
}

/// TCP segmentation parameters.
#[derive(Debug, Copy, Clone)]
pub struct TsoRequest {
    /// Maximum segment size.
    pub mss: u16,
    /// IP source address, for the pseudo-header checksum.
    pub source: IpAddr,
    /// IP destination address, for the pseudo-header checksum.
    pub destination: IpAddr,
}

/// A packet handed to the transmit ring.
pub trait TxBuffer: Send {
    /// The packet's segments, in order.
    fn segments(&self) -> &[TxSegment];
    /// The offloads requested for the packet.
    fn offload(&self) -> &TxOffload;
    /// Copies the packet into at most `max_segments` segments.
    fn coalesce(&mut self, max_segments: usize) -> anyhow::Result<()>;
    /// Stores `checksum` in the packet's transport checksum field.
    fn write_l4_checksum(&mut self, checksum: u16);
}

/// Why a packet was not queued.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum TxError {
    /// Not enough free descriptors. Retry after reclaiming.
    #[error("not enough free transmit descriptors")]
    OutOfDescriptors,
    /// The packet has too many segments, even after coalescing.
    #[error("packet has too many segments")]
    TooManySegments,
    /// The packet or its offload request cannot be expressed in descriptors.
    #[error("malformed transmit request")]
    Malformed,
    /// The queue was disabled after a malicious driver detection event.
    #[error("transmit queue is disabled")]
    Disabled,
}

/// A packet returned to the caller because it could not be queued.
pub struct TxRejected<B> {
    /// The reason.
    pub error: TxError,
    /// The packet, unmodified unless it was coalesced.
    pub packet: B,
}

impl<B> std::fmt::Debug for TxRejected<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxRejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Transmit ring counters.
#[derive(Debug, Clone, Default)]
#[expect(missing_docs)]
pub struct TxStats {
    pub packets: u64,
    pub bytes: u64,
    pub tso: u64,
    pub no_descriptors: u64,
    pub coalesced: u64,
    pub too_many_segments: u64,
    pub malformed: u64,
    pub mss_too_small: u64,
    pub mdd_events: u64,
}

struct TxSlot<B> {
    packet: Option<B>,
    /// Set on a packet's first slot: the slot holding its last descriptor.
    eop_index: Option<u16>,
}

/// Descriptor fields computed for one packet before anything is written.
struct TxPlan {
    cmd: u16,
    offset: u32,
    l2tag1: u16,
    total_len: u32,
    tso: Option<TsoPlan>,
}

struct TsoPlan {
    ctx: TxContextDesc,
    checksum: u16,
}

/// A transmit ring.
pub struct TxRing<B> {
    queue_id: u16,
    ring: DescriptorRing<TxDataDesc>,
    slots: Vec<TxSlot<B>>,
    tail: Doorbell,
    config: TxConfig,
    next_avail: u16,
    next_to_clean: u16,
    available: u16,
    busy: u32,
    disabled: bool,
    stats: TxStats,
}

impl<B: TxBuffer> TxRing<B> {
    /// Allocates the ring. `tail_offset` is the queue's tail register.
    pub fn new(
        dma: &dyn DmaClient,
        regs: Arc<dyn RegisterIo>,
        queue_id: u16,
        tail_offset: usize,
        config: TxConfig,
    ) -> anyhow::Result<Self> {
        validate_ring_len(config.ring_len)?;
        if config.max_segments == 0 || config.max_tso_segments < config.max_segments {
            anyhow::bail!(
                "invalid segment limits {}/{}",
                config.max_segments,
                config.max_tso_segments
            );
        }
        let ring = DescriptorRing::new(dma, config.ring_len, size_of::<u32>())?;
        let slots = (0..config.ring_len)
            .map(|_| TxSlot {
                packet: None,
                eop_index: None,
            })
            .collect();
        Ok(Self {
            queue_id,
            ring,
            slots,
            tail: Doorbell::new(regs, tail_offset),
            available: config.ring_len,
            config,
            next_avail: 0,
            next_to_clean: 0,
            busy: 0,
            disabled: false,
            stats: TxStats::default(),
        })
    }

    /// The queue index this ring serves.
    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    /// Number of descriptors.
    pub fn len(&self) -> u16 {
        self.ring.len()
    }

    /// Number of free descriptors.
    pub fn available(&self) -> u16 {
        self.available
    }

    /// Ring counters.
    pub fn stats(&self) -> &TxStats {
        &self.stats
    }

    /// Bus address of the first descriptor.
    pub fn ring_address(&self) -> u64 {
        self.ring.base()
    }

    /// Bus address the device writes its head index to, if enabled.
    pub fn head_writeback_address(&self) -> Option<u64> {
        self.config
            .head_writeback
            .then(|| self.ring.base() + self.ring.end() as u64)
    }

    /// The queue's entry in a CONFIG_VSI_QUEUES request.
    pub fn txq_info(&self, vsi_id: u16) -> TxqInfo {
        TxqInfo {
            vsi_id,
            queue_id: self.queue_id,
            ring_len: self.ring.len(),
            headwb_enabled: self.config.head_writeback.into(),
            dma_ring_addr: self.ring.base(),
            dma_headwb_addr: self.head_writeback_address().unwrap_or(0),
        }
    }

    fn reject(&mut self, error: TxError, packet: B) -> Result<(), TxRejected<B>> {
        match error {
            TxError::OutOfDescriptors => self.stats.no_descriptors += 1,
            TxError::TooManySegments => self.stats.too_many_segments += 1,
            TxError::Malformed => self.stats.malformed += 1,
            TxError::Disabled => {}
        }
        tracing::trace!(queue = self.queue_id, %error, "transmit rejected");
        Err(TxRejected { error, packet })
    }

    /// Queues a packet and rings the doorbell.
    ///
    /// A packet needs one descriptor per segment, one more for TSO, and the
    /// ring always keeps a spare, so this fails with
    /// [`TxError::OutOfDescriptors`] unless `segments + 2` descriptors are
    /// free.
    pub fn enqueue(&mut self, mut packet: B) -> Result<(), TxRejected<B>> {
        if self.disabled {
            return self.reject(TxError::Disabled, packet);
        }

        let offload = packet.offload().clone();
        let max_segments = if offload.tso.is_some() {
            self.config.max_tso_segments
        } else {
            self.config.max_segments
        };
        let sparse = offload
            .tso
            .is_some_and(|tso| is_sparse(packet.segments(), tso.mss, self.config.sparse_chain));
        if sparse || packet.segments().len() > max_segments {
            self.stats.coalesced += 1;
            if let Err(err) = packet.coalesce(max_segments) {
                tracing::debug!(
                    queue = self.queue_id,
                    error = err.as_ref() as &dyn std::error::Error,
                    "failed to coalesce packet"
                );
                return self.reject(TxError::TooManySegments, packet);
            }
            if packet.segments().len() > max_segments {
                return self.reject(TxError::TooManySegments, packet);
            }
        }

        let plan = match plan_packet(&offload, packet.segments()) {
            Ok(plan) => plan,
            Err(error) => return self.reject(error, packet),
        };

        let nsegs = packet.segments().len();
        if nsegs + 2 > self.available as usize {
            return self.reject(TxError::OutOfDescriptors, packet);
        }

        let first = self.next_avail;
        let mut index = first;
        if let Some(tso) = &plan.tso {
            if offload.tso.is_some_and(|t| t.mss < TX_MIN_TSO_MSS) {
                self.stats.mss_too_small += 1;
            }
            packet.write_l4_checksum(tso.checksum);
            self.ring.write_as(index, &tso.ctx);
            index = self.ring.advance(index, 1);
            self.stats.tso += 1;
        }

        let mut last = index;
        for (i, segment) in packet.segments().iter().enumerate() {
            let mut cmd = plan.cmd;
            if i == nsegs - 1 {
                cmd |= TX_DESC_CMD_EOP | TX_DESC_CMD_RS;
            }
            let desc = TxDataDesc {
                buffer_addr: segment.address,
                cmd_type_offset_bsz: TxDataQword1::new()
                    .with_dtype(TxDescType::DATA.0)
                    .with_cmd(cmd)
                    .with_offset(plan.offset)
                    .with_buf_sz(segment.len as u16)
                    .with_l2tag1(plan.l2tag1),
            };
            self.ring.write(index, &desc);
            last = index;
            index = self.ring.advance(index, 1);
        }

        let used = distance(first, index, self.ring.len());
        self.slots[first as usize].eop_index = Some(last);
        self.slots[last as usize].packet = Some(packet);
        self.available -= used;
        self.next_avail = index;
        self.stats.packets += 1;
        self.stats.bytes += plan.total_len as u64;

        tracing::trace!(queue = self.queue_id, first, last, used, "packet queued");
        self.tail.ring(index.into());
        Ok(())
    }

    fn device_head(&self) -> u16 {
        let head: u32 = self.ring.mem().read_obj(self.ring.end());
        (head % self.ring.len() as u32) as u16
    }

    fn is_done(&self, first: u16, eop: u16, head: Option<u16>) -> bool {
        match head {
            Some(head) => distance(first, eop, self.ring.len()) < distance(first, head, self.ring.len()),
            None => {
                TxDescType(self.ring.read(eop).cmd_type_offset_bsz.dtype()) == TxDescType::DESC_DONE
            }
        }
    }

    /// Releases every packet the device has finished with into `completed`,
    /// returning how many there were.
    ///
    /// Calls that find nothing to release while packets are outstanding
    /// count toward [`Self::is_hung`].
    pub fn reclaim(&mut self, completed: &mut Vec<B>) -> usize {
        let len = self.ring.len();
        if self.available == len {
            self.busy = 0;
            return 0;
        }

        let head = self.config.head_writeback.then(|| self.device_head());
        let mut freed = 0;
        let mut packets = 0;
        loop {
            let first = self.next_to_clean;
            let Some(eop) = self.slots[first as usize].eop_index else {
                break;
            };
            if !self.is_done(first, eop, head) {
                break;
            }
            self.slots[first as usize].eop_index = None;
            let mut index = first;
            loop {
                if let Some(packet) = self.slots[index as usize].packet.take() {
                    completed.push(packet);
                    packets += 1;
                }
                freed += 1;
                let was_last = index == eop;
                index = self.ring.advance(index, 1);
                if was_last {
                    break;
                }
            }
            self.next_to_clean = index;
        }
        self.available += freed;

        if freed > 0 || self.available == len {
            self.busy = 0;
        } else {
            self.busy += 1;
            if self.busy == self.config.max_busy + 1 {
                tracing::warn!(
                    queue = self.queue_id,
                    outstanding = len - self.available,
                    "transmit queue hung"
                );
            }
        }
        packets
    }

    /// Returns true if reclaim has repeatedly found no progress while
    /// packets were outstanding.
    pub fn is_hung(&self) -> bool {
        self.busy > self.config.max_busy
    }

    /// Records a malicious driver detection event against this queue and
    /// stops accepting packets until [`Self::drain`].
    pub fn report_mdd_event(&mut self) {
        self.disabled = true;
        self.stats.mdd_events += 1;
        error_ratelimited!(queue = self.queue_id, "malicious driver detection event");
    }

    /// Returns true if the queue was disabled by an MDD event.
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Releases every outstanding packet regardless of completion status and
    /// resets the ring to empty. Only valid once the device has stopped the
    /// queue.
    pub fn drain(&mut self, completed: &mut Vec<B>) {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.eop_index = None;
            if let Some(packet) = slot.packet.take() {
                completed.push(packet);
            }
            self.ring.write(i as u16, &TxDataDesc::new_zeroed());
        }
        self.ring.mem().write_obj(self.ring.end(), &0u32);
        self.next_avail = 0;
        self.next_to_clean = 0;
        self.available = self.ring.len();
        self.busy = 0;
        self.disabled = false;
    }
}

/// Returns true if the first MSS worth of payload after the header segment
/// is spread over more than `limit` segments, which the device cannot
/// segment.
fn is_sparse(segments: &[TxSegment], mss: u16, limit: usize) -> bool {
    let mut remaining = mss as i64;
    let mut count = 0;
    for segment in segments.iter().skip(1) {
        count += 1;
        remaining -= segment.len as i64;
        if remaining < 1 {
            break;
        }
    }
    count > limit
}

/// Folded one's-complement sum of the TCP pseudo header with a zero length,
/// as the device expects in the checksum field of a TSO packet.
fn pseudo_header_checksum(source: IpAddr, destination: IpAddr) -> Option<u16> {
    let mut sum: u32 = IPPROTO_TCP.into();
    let mut add = |bytes: &[u8]| {
        for pair in bytes.chunks_exact(2) {
            sum += u16::from_be_bytes([pair[0], pair[1]]) as u32;
        }
    };
    match (source, destination) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            add(&s.octets());
            add(&d.octets());
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            add(&s.octets());
            add(&d.octets());
        }
        _ => return None,
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    Some(sum as u16)
}

fn plan_packet(offload: &TxOffload, segments: &[TxSegment]) -> Result<TxPlan, TxError> {
    if segments.is_empty()
        || segments
            .iter()
            .any(|s| s.len == 0 || s.len > TX_MAX_BUFFER_SIZE)
    {
        return Err(TxError::Malformed);
    }
    let total_len: u32 = segments.iter().map(|s| s.len).sum();

    let mut cmd = TX_DESC_CMD_ICRC;
    let mut l2tag1 = 0;
    if let Some(vlan) = offload.vlan {
        cmd |= TX_DESC_CMD_IL2TAG1;
        l2tag1 = vlan;
    }

    let tso = offload.tso.is_some();
    if !(tso || offload.ip_checksum || offload.l4_checksum) {
        return Ok(TxPlan {
            cmd,
            offset: 0,
            l2tag1,
            total_len,
            tso: None,
        });
    }

    match offload.l3 {
        L3Protocol::Ipv4 if tso || offload.ip_checksum => cmd |= TX_DESC_CMD_IIPT_IPV4_CSUM,
        L3Protocol::Ipv4 => cmd |= TX_DESC_CMD_IIPT_IPV4,
        L3Protocol::Ipv6 => cmd |= TX_DESC_CMD_IIPT_IPV6,
        L3Protocol::Other => return Err(TxError::Malformed),
    }
    if offload.l2_len > 0x7f * 2 || offload.l3_len > 0x7f * 4 || offload.l4_len > 0xf * 4 {
        return Err(TxError::Malformed);
    }
    let mut offset = TxDescOffset::new()
        .with_maclen((offload.l2_len / 2) as u8)
        .with_iplen((offload.l3_len / 4) as u8);

    let l4_len = match (offload.l4, tso || offload.l4_checksum) {
        (L4Protocol::Tcp, true) => {
            cmd |= TX_DESC_CMD_L4T_EOFT_TCP;
            Some(offload.l4_len)
        }
        (_, _) if tso => return Err(TxError::Malformed),
        (L4Protocol::Udp, true) => {
            cmd |= TX_DESC_CMD_L4T_EOFT_UDP;
            Some(UDP_HEADER_LEN)
        }
        (L4Protocol::Sctp, true) => {
            cmd |= TX_DESC_CMD_L4T_EOFT_SCTP;
            Some(SCTP_HEADER_LEN)
        }
        _ => None,
    };
    if let Some(l4_len) = l4_len {
        offset.set_l4len((l4_len / 4) as u8);
    }

    let tso = match offload.tso {
        Some(request) => {
            let header_len = (offload.l2_len + offload.l3_len + offload.l4_len) as u32;
            if header_len >= total_len || total_len - header_len > TX_MAX_TSO_LEN {
                return Err(TxError::Malformed);
            }
            let checksum = pseudo_header_checksum(request.source, request.destination)
                .ok_or(TxError::Malformed)?;
            let mss = request.mss.clamp(TX_MIN_TSO_MSS, TX_MAX_TSO_MSS);
            Some(TsoPlan {
                ctx: TxContextDesc {
                    tunneling_params: 0,
                    l2tag2: 0,
                    reserved: 0,
                    type_cmd_tso_mss: TxContextQword1::new()
                        .with_dtype(TxDescType::CONTEXT.0)
                        .with_cmd(TX_CTX_DESC_CMD_TSO)
                        .with_tso_len(total_len - header_len)
                        .with_mss(mss),
                },
                checksum,
            })
        }
        None => None,
    };

    Ok(TxPlan {
        cmd,
        offset: offset.into_bits(),
        l2tag1,
        total_len,
        tso,
    })
}
