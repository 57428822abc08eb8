// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The PF side of the virtual channel: validates requests arriving from VFs
//! on the PF admin receive queue, hands out queue ranges, and replies.

use crate::adminq::AdminQueue;
use crate::adminq::AdminQueueError;
use crate::adminq::AdminQueueMessage;
use crate::queue_alloc::QueueManager;
use crate::queue_alloc::QueueOwner;
use crate::queue_alloc::QueueTag;
use crate::ratelimit::warn_ratelimited;
use crate::ring::validate_ring_len;
use crate::virtchnl::VcDecodeError;
use crate::virtchnl::VcRequest;
use crate::virtchnl::VfResources;
use i40e_defs::aq::AqDesc;
use i40e_defs::aq::AqOpcode;
use i40e_defs::virtchnl;
use i40e_defs::virtchnl::EthStats;
use i40e_defs::virtchnl::LinkSpeed;
use i40e_defs::virtchnl::PfEvent;
use i40e_defs::virtchnl::PfEventType;
use i40e_defs::virtchnl::QueuePairInfo;
use i40e_defs::virtchnl::QueueSelect;
use i40e_defs::virtchnl::RssHena;
use i40e_defs::virtchnl::VectorMap;
use i40e_defs::virtchnl::VersionInfo;
use i40e_defs::virtchnl::VfResourceHeader;
use i40e_defs::virtchnl::VirtchnlOp;
use i40e_defs::virtchnl::VirtchnlStatus;
use i40e_defs::virtchnl::VsiResource;
use i40e_defs::virtchnl::VsiType;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::IntoBytes;

/// Largest VLAN ID a VF may filter on.
const MAX_VLAN_ID: u16 = 4095;

/// PF responder failures.
#[derive(Debug, Error)]
pub enum PfError {
    /// The message came from a function this PF does not manage.
    #[error("message from unknown function {0}")]
    UnknownVf(u16),
    /// The event is not a VF mailbox message.
    #[error("admin event {0:?} is not a VF message")]
    NotVirtchnl(AqOpcode),
    /// The reply could not be sent.
    #[error("failed to reply to vf {vf}")]
    Reply {
        /// The VF number.
        vf: u16,
        /// The admin queue failure.
        #[source]
        source: AdminQueueError,
    },
}

/// The path replies take to a VF.
pub trait PfTransport {
    /// Sends one message to the VF with absolute function number `vf_id`.
    fn send_to_vf(
        &mut self,
        vf_id: u16,
        opcode: VirtchnlOp,
        status: VirtchnlStatus,
        payload: &[u8],
    ) -> Result<(), AdminQueueError>;
}

impl PfTransport for AdminQueue {
    fn send_to_vf(
        &mut self,
        vf_id: u16,
        opcode: VirtchnlOp,
        status: VirtchnlStatus,
        payload: &[u8],
    ) -> Result<(), AdminQueueError> {
        let mut desc = AqDesc::direct(AqOpcode::SEND_MSG_TO_VF);
        desc.param0 = vf_id.into();
        desc.cookie_high = opcode.0;
        desc.cookie_low = status.0 as u32;
        self.send(desc, payload)?;
        Ok(())
    }
}

/// Supplies per-VSI Ethernet counters for GET_STATS.
pub trait VfStatsSource: Send {
    /// Returns the counters of `vsi_id`.
    fn eth_stats(&self, vsi_id: u16) -> EthStats;
}

impl<F: Fn(u16) -> EthStats + Send> VfStatsSource for F {
    fn eth_stats(&self, vsi_id: u16) -> EthStats {
        self(vsi_id)
    }
}

/// What the PF grants each VF.
#[derive(Debug, Clone)]
pub struct PfConfig {
    /// Number of VFs enabled.
    pub num_vfs: u16,
    /// Absolute function number of VF 0, as reported in mailbox events.
    pub vf_base_id: u16,
    /// VSI number of VF 0's VSI.
    pub first_vsi_id: u16,
    /// Queue pairs given to each VF.
    pub queues_per_vf: u16,
    /// Interrupt vectors available to each VF.
    pub max_vectors_per_vf: u16,
    /// Largest MTU a VF may use.
    pub max_mtu: u16,
    /// Offloads a VF may be granted.
    pub offloads: u32,
    /// Packet types a VF may enable for RSS.
    pub rss_hena_caps: u64,
}

impl Default for PfConfig {
    fn default() -> Self {
        Self {
            num_vfs: 0,
            vf_base_id: 64,
            first_vsi_id: 16,
            queues_per_vf: 4,
            max_vectors_per_vf: 5,
            max_mtu: 9706,
            offloads: virtchnl::VF_OFFLOAD_L2
                | virtchnl::VF_OFFLOAD_VLAN
                | virtchnl::VF_OFFLOAD_RSS_PF
                | virtchnl::VF_OFFLOAD_WB_ON_ITR,
            rss_hena_caps: 0x0000_0001_8000_7ef8,
        }
    }
}

#[derive(Debug, Default)]
struct VfRecord {
    active: bool,
    version: Option<VersionInfo>,
    queues: Option<QueueTag>,
    mac: [u8; 6],
    configured_pairs: u16,
    rx_enabled: u32,
    tx_enabled: u32,
    promisc_flags: u16,
    rss_hena: u64,
}

/// Per-VF state as seen by the PF.
#[derive(Debug, Clone)]
#[expect(missing_docs)]
pub struct VfInfo {
    pub active: bool,
    pub version: Option<VersionInfo>,
    pub queue_pairs: u16,
    pub configured_pairs: u16,
    pub rx_enabled: u32,
    pub tx_enabled: u32,
    pub promisc_flags: u16,
    pub rss_hena: u64,
}

type Reply = (VirtchnlStatus, Vec<u8>);

fn nack(status: VirtchnlStatus) -> Reply {
    (status, Vec::new())
}

fn ack() -> Reply {
    (VirtchnlStatus::SUCCESS, Vec::new())
}

fn valid_unicast(mac: &[u8; 6]) -> bool {
    *mac != [0; 6] && *mac != [0xff; 6]
}

/// The PF's virtual channel responder.
pub struct PfVirtchnl {
    config: PfConfig,
    queues: Arc<Mutex<QueueManager>>,
    stats: Box<dyn VfStatsSource>,
    vfs: Vec<VfRecord>,
}

impl PfVirtchnl {
    /// Creates a responder that draws VF queues from `queues`.
    pub fn new(
        config: PfConfig,
        queues: Arc<Mutex<QueueManager>>,
        stats: Box<dyn VfStatsSource>,
    ) -> Self {
        let vfs = (0..config.num_vfs).map(|_| VfRecord::default()).collect();
        Self {
            config,
            queues,
            stats,
            vfs,
        }
    }

    fn vsi_id(&self, vf: u16) -> u16 {
        self.config.first_vsi_id + vf
    }

    /// Sets the MAC address offered to a VF in its resources reply.
    pub fn set_vf_mac(&mut self, vf: u16, mac: [u8; 6]) -> Result<(), PfError> {
        self.vfs
            .get_mut(vf as usize)
            .ok_or(PfError::UnknownVf(vf))?
            .mac = mac;
        Ok(())
    }

    /// Returns true once the VF has obtained its resources.
    pub fn is_active(&self, vf: u16) -> bool {
        self.vfs.get(vf as usize).is_some_and(|r| r.active)
    }

    /// The VF's global queue range, as `(first, count)`.
    pub fn vf_queues(&self, vf: u16) -> Option<(u16, u16)> {
        let tag = self.vfs.get(vf as usize)?.queues.as_ref()?;
        Some((tag.first(), tag.count()))
    }

    /// The VF's enabled RX and TX queue masks.
    pub fn enabled_queues(&self, vf: u16) -> Option<(u32, u32)> {
        self.vf_info(vf).map(|info| (info.rx_enabled, info.tx_enabled))
    }

    /// A snapshot of what the VF has configured.
    pub fn vf_info(&self, vf: u16) -> Option<VfInfo> {
        let r = self.vfs.get(vf as usize)?;
        Some(VfInfo {
            active: r.active,
            version: r.version,
            queue_pairs: r.queues.as_ref().map_or(0, |tag| tag.count()),
            configured_pairs: r.configured_pairs,
            rx_enabled: r.rx_enabled,
            tx_enabled: r.tx_enabled,
            promisc_flags: r.promisc_flags,
            rss_hena: r.rss_hena,
        })
    }

    /// Handles one event from the PF admin receive queue.
    pub fn handle_message(
        &mut self,
        transport: &mut dyn PfTransport,
        message: &AdminQueueMessage,
    ) -> Result<(), PfError> {
        if message.opcode() != AqOpcode::SEND_MSG_TO_PF {
            return Err(PfError::NotVirtchnl(message.opcode()));
        }
        let source = message.retval();
        let vf = source
            .checked_sub(self.config.vf_base_id)
            .filter(|&vf| vf < self.config.num_vfs)
            .ok_or(PfError::UnknownVf(source))?;
        let op = VirtchnlOp(message.desc.cookie_high);
        tracing::trace!(vf, ?op, len = message.payload.len(), "virtchnl request");

        let (status, payload) = match VcRequest::decode(op, &message.payload) {
            Ok(request) => self.handle_request(vf, request),
            Err(VcDecodeError::Unsupported(op)) => {
                tracing::debug!(vf, ?op, "unsupported virtchnl request");
                nack(VirtchnlStatus::ERR_NOT_IMPLEMENTED)
            }
            Err(err) => {
                warn_ratelimited!(
                    vf,
                    error = &err as &dyn std::error::Error,
                    "malformed virtchnl request"
                );
                nack(VirtchnlStatus::ERR_PARAM)
            }
        };
        if op == VirtchnlOp::RESET_VF {
            // The VF watches its reset status register instead.
            return Ok(());
        }
        if status != VirtchnlStatus::SUCCESS {
            tracing::debug!(vf, ?op, ?status, "rejecting virtchnl request");
        }
        transport
            .send_to_vf(self.config.vf_base_id + vf, op, status, &payload)
            .map_err(|source| PfError::Reply { vf, source })
    }

    fn handle_request(&mut self, vf: u16, request: VcRequest) -> Reply {
        match request {
            VcRequest::ResetVf => {
                self.reset_vf(vf);
                ack()
            }
            VcRequest::Version(version) => {
                tracing::debug!(vf, major = version.major, minor = version.minor, "vf version");
                self.vfs[vf as usize].version = Some(version);
                let ours = VersionInfo {
                    major: virtchnl::VERSION_MAJOR,
                    minor: virtchnl::VERSION_MINOR,
                };
                (VirtchnlStatus::SUCCESS, ours.as_bytes().to_vec())
            }
            VcRequest::GetVfResources { caps } => self.get_resources(vf, caps),
            request if !self.vfs[vf as usize].active => {
                tracing::debug!(vf, opcode = ?request.opcode(), "request from inactive vf");
                nack(VirtchnlStatus::ERR_PARAM)
            }
            VcRequest::ConfigVsiQueues {
                vsi_id,
                queue_pairs,
            } => self.config_vsi_queues(vf, vsi_id, &queue_pairs),
            VcRequest::ConfigIrqMap(maps) => self.config_irq_map(vf, &maps),
            VcRequest::EnableQueues(select) => self.select_queues(vf, &select, true),
            VcRequest::DisableQueues(select) => self.select_queues(vf, &select, false),
            VcRequest::AddEthAddr { vsi_id, addrs } | VcRequest::DelEthAddr { vsi_id, addrs } => {
                if vsi_id != self.vsi_id(vf) {
                    nack(VirtchnlStatus::ERR_PARAM)
                } else if !addrs.iter().all(valid_unicast) {
                    nack(VirtchnlStatus::ERR_INVALID_MAC_ADDR)
                } else {
                    ack()
                }
            }
            VcRequest::AddVlan { vsi_id, vlans } | VcRequest::DelVlan { vsi_id, vlans } => {
                if vsi_id != self.vsi_id(vf) || vlans.iter().any(|&v| v > MAX_VLAN_ID) {
                    nack(VirtchnlStatus::ERR_PARAM)
                } else {
                    ack()
                }
            }
            VcRequest::ConfigPromiscuous(info) => {
                let known = virtchnl::FLAG_VF_UNICAST_PROMISC | virtchnl::FLAG_VF_MULTICAST_PROMISC;
                if info.vsi_id != self.vsi_id(vf) || info.flags & !known != 0 {
                    return nack(VirtchnlStatus::ERR_PARAM);
                }
                self.vfs[vf as usize].promisc_flags = info.flags;
                ack()
            }
            VcRequest::GetStats(select) => {
                if select.vsi_id != self.vsi_id(vf) {
                    return nack(VirtchnlStatus::ERR_PARAM);
                }
                let stats = self.stats.eth_stats(select.vsi_id);
                (VirtchnlStatus::SUCCESS, stats.as_bytes().to_vec())
            }
            VcRequest::ConfigRssKey { vsi_id, key } => {
                if vsi_id != self.vsi_id(vf) || key.len() != virtchnl::RSS_KEY_SIZE as usize {
                    return nack(VirtchnlStatus::ERR_PARAM);
                }
                ack()
            }
            VcRequest::ConfigRssLut { vsi_id, lut } => {
                let count = self.queue_count(vf);
                if vsi_id != self.vsi_id(vf)
                    || lut.len() != virtchnl::RSS_LUT_SIZE as usize
                    || lut.iter().any(|&q| u16::from(q) >= count)
                {
                    return nack(VirtchnlStatus::ERR_PARAM);
                }
                ack()
            }
            VcRequest::GetRssHenaCaps => {
                let caps = RssHena {
                    hena: self.config.rss_hena_caps,
                };
                (VirtchnlStatus::SUCCESS, caps.as_bytes().to_vec())
            }
            VcRequest::SetRssHena(hena) => {
                if hena & !self.config.rss_hena_caps != 0 {
                    return nack(VirtchnlStatus::ERR_PARAM);
                }
                self.vfs[vf as usize].rss_hena = hena;
                ack()
            }
        }
    }

    fn queue_count(&self, vf: u16) -> u16 {
        self.vfs[vf as usize]
            .queues
            .as_ref()
            .map_or(0, |tag| tag.count())
    }

    fn get_resources(&mut self, vf: u16, caps: u32) -> Reply {
        let record = &mut self.vfs[vf as usize];
        if record.queues.is_none() {
            let reserved = self
                .queues
                .lock()
                .reserve_contiguous(self.config.queues_per_vf, QueueOwner::Vf(vf));
            match reserved {
                Ok(tag) => record.queues = Some(tag),
                Err(err) => {
                    tracing::warn!(vf, error = &err as &dyn std::error::Error, "no queues for vf");
                    return nack(VirtchnlStatus::ERR_NO_MEMORY);
                }
            }
        }
        let num_queue_pairs = record.queues.as_ref().map_or(0, |tag| tag.count());
        record.active = true;

        // Version 1.0 VFs do not request offloads; they get the basics.
        let requested = if record.version.is_some_and(|v| v.minor == 0) || caps == 0 {
            virtchnl::VF_OFFLOAD_L2 | virtchnl::VF_OFFLOAD_RSS_REG | virtchnl::VF_OFFLOAD_VLAN
        } else {
            caps
        };
        let offloads = requested & self.config.offloads;

        let vsi_id = self.config.first_vsi_id + vf;
        let resources = VfResources {
            header: VfResourceHeader {
                num_vsis: 1,
                num_queue_pairs,
                max_vectors: self.config.max_vectors_per_vf,
                max_mtu: self.config.max_mtu,
                vf_offload_flags: offloads,
                rss_key_size: virtchnl::RSS_KEY_SIZE.into(),
                rss_lut_size: virtchnl::RSS_LUT_SIZE.into(),
            },
            vsis: vec![VsiResource {
                vsi_id,
                num_queue_pairs,
                vsi_type: VsiType::SRIOV,
                qset_handle: vf,
                default_mac_addr: record.mac,
            }],
        };
        tracing::debug!(vf, vsi_id, num_queue_pairs, offloads, "vf resources granted");
        (VirtchnlStatus::SUCCESS, resources.encode())
    }

    fn config_vsi_queues(&mut self, vf: u16, vsi_id: u16, pairs: &[QueuePairInfo]) -> Reply {
        let count = self.queue_count(vf);
        let valid = vsi_id == self.vsi_id(vf)
            && !pairs.is_empty()
            && pairs.len() <= count as usize
            && pairs.iter().all(|pair| {
                pair.txq.vsi_id == vsi_id
                    && pair.rxq.vsi_id == vsi_id
                    && pair.txq.queue_id < count
                    && pair.rxq.queue_id < count
                    && validate_ring_len(pair.txq.ring_len).is_ok()
                    && u16::try_from(pair.rxq.ring_len).is_ok_and(|len| validate_ring_len(len).is_ok())
                    && pair.txq.dma_ring_addr != 0
                    && pair.rxq.dma_ring_addr != 0
            });
        if !valid {
            return nack(VirtchnlStatus::ERR_PARAM);
        }
        self.vfs[vf as usize].configured_pairs = pairs.len() as u16;
        ack()
    }

    fn config_irq_map(&mut self, vf: u16, maps: &[VectorMap]) -> Reply {
        let Some(tag) = self.vfs[vf as usize].queues.as_ref() else {
            return nack(VirtchnlStatus::ERR_PARAM);
        };
        let valid = maps.iter().all(|map| {
            map.vsi_id == self.vsi_id(vf)
                && map.vector_id < self.config.max_vectors_per_vf
                && tag.contains_mask(map.rxq_map.into())
                && tag.contains_mask(map.txq_map.into())
        });
        if !valid {
            return nack(VirtchnlStatus::ERR_PARAM);
        }
        ack()
    }

    fn select_queues(&mut self, vf: u16, select: &QueueSelect, enable: bool) -> Reply {
        let vsi_id = self.vsi_id(vf);
        let record = &mut self.vfs[vf as usize];
        let Some(tag) = record.queues.as_ref() else {
            return nack(VirtchnlStatus::ERR_PARAM);
        };
        if select.vsi_id != vsi_id
            || (select.rx_queues == 0 && select.tx_queues == 0)
            || !tag.contains_mask(select.rx_queues)
            || !tag.contains_mask(select.tx_queues)
        {
            return nack(VirtchnlStatus::ERR_PARAM);
        }
        if enable {
            record.rx_enabled |= select.rx_queues;
            record.tx_enabled |= select.tx_queues;
        } else {
            record.rx_enabled &= !select.rx_queues;
            record.tx_enabled &= !select.tx_queues;
        }
        tracing::debug!(
            vf,
            enable,
            rx = select.rx_queues,
            tx = select.tx_queues,
            "vf queues changed"
        );
        ack()
    }

    /// Returns a VF to its initial state and frees its queues.
    pub fn reset_vf(&mut self, vf: u16) {
        let Some(record) = self.vfs.get_mut(vf as usize) else {
            return;
        };
        let mac = record.mac;
        let old = std::mem::take(record);
        record.mac = mac;
        if let Some(tag) = old.queues {
            if let Err(err) = self.queues.lock().release(tag) {
                tracing::error!(vf, error = &err as &dyn std::error::Error, "vf queue release failed");
            }
        }
        tracing::info!(vf, "vf reset");
    }

    fn broadcast_event(&self, transport: &mut dyn PfTransport, event: &PfEvent) -> Result<(), PfError> {
        for (vf, _) in self.vfs.iter().enumerate().filter(|(_, r)| r.active) {
            let vf = vf as u16;
            transport
                .send_to_vf(
                    self.config.vf_base_id + vf,
                    VirtchnlOp::EVENT,
                    VirtchnlStatus::SUCCESS,
                    event.as_bytes(),
                )
                .map_err(|source| PfError::Reply { vf, source })?;
        }
        Ok(())
    }

    /// Tells every active VF about a link state change.
    pub fn notify_link(
        &self,
        transport: &mut dyn PfTransport,
        up: bool,
        speed: LinkSpeed,
    ) -> Result<(), PfError> {
        self.broadcast_event(
            transport,
            &PfEvent {
                event: PfEventType::LINK_CHANGE,
                link_speed: speed,
                link_status: up.into(),
                pad: [0; 3],
                severity: virtchnl::PF_EVENT_SEVERITY_INFO,
            },
        )
    }

    /// Warns every active VF that the PF is about to reset.
    pub fn notify_reset_impending(&self, transport: &mut dyn PfTransport) -> Result<(), PfError> {
        self.broadcast_event(
            transport,
            &PfEvent {
                event: PfEventType::RESET_IMPENDING,
                link_speed: LinkSpeed::UNKNOWN,
                link_status: 0,
                pad: [0; 3],
                severity: virtchnl::PF_EVENT_SEVERITY_CERTAIN_DOOM,
            },
        )
    }

    /// Shuts down the PF admin queue, then releases every VF's queues.
    pub fn shutdown(&mut self, aq: &mut AdminQueue) {
        aq.shutdown();
        for vf in 0..self.config.num_vfs {
            self.reset_vf(vf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtchnl::decode_reply;

    #[derive(Default)]
    struct Sent {
        messages: Vec<(u16, VirtchnlOp, VirtchnlStatus, Vec<u8>)>,
    }

    impl PfTransport for Sent {
        fn send_to_vf(
            &mut self,
            vf_id: u16,
            opcode: VirtchnlOp,
            status: VirtchnlStatus,
            payload: &[u8],
        ) -> Result<(), AdminQueueError> {
            self.messages.push((vf_id, opcode, status, payload.to_vec()));
            Ok(())
        }
    }

    impl Sent {
        fn last(&self) -> (VirtchnlOp, VirtchnlStatus, &[u8]) {
            let (_, op, status, payload) = self.messages.last().unwrap();
            (*op, *status, payload.as_slice())
        }
    }

    struct Harness {
        pf: PfVirtchnl,
        queues: Arc<Mutex<QueueManager>>,
        sent: Sent,
    }

    fn harness(total_queues: u16) -> Harness {
        let queues = Arc::new(Mutex::new(QueueManager::new(total_queues)));
        let pf = PfVirtchnl::new(
            PfConfig {
                num_vfs: 2,
                ..Default::default()
            },
            queues.clone(),
            Box::new(|vsi_id: u16| EthStats {
                rx_bytes: vsi_id.into(),
                ..Default::default()
            }),
        );
        Harness {
            pf,
            queues,
            sent: Sent::default(),
        }
    }

    fn message(vf: u16, request: &VcRequest) -> AdminQueueMessage {
        raw_message(vf, request.opcode(), request.encode())
    }

    fn raw_message(vf: u16, op: VirtchnlOp, payload: Vec<u8>) -> AdminQueueMessage {
        let mut desc = AqDesc::direct(AqOpcode::SEND_MSG_TO_PF);
        desc.retval = 64 + vf;
        desc.cookie_high = op.0;
        desc.datalen = payload.len() as u16;
        AdminQueueMessage { desc, payload }
    }

    impl Harness {
        fn request(&mut self, vf: u16, request: &VcRequest) -> VirtchnlStatus {
            self.pf
                .handle_message(&mut self.sent, &message(vf, request))
                .unwrap();
            self.sent.last().1
        }

        fn activate(&mut self, vf: u16) -> VfResources {
            assert_eq!(
                self.request(vf, &VcRequest::GetVfResources { caps: u32::MAX }),
                VirtchnlStatus::SUCCESS
            );
            VfResources::decode(self.sent.last().2).unwrap()
        }
    }

    fn select(vsi_id: u16, mask: u32) -> QueueSelect {
        QueueSelect {
            vsi_id,
            pad: 0,
            rx_queues: mask,
            tx_queues: mask,
        }
    }

    #[test]
    fn resources_reserve_distinct_queues() {
        let mut h = harness(12);
        let r0 = h.activate(0);
        let r1 = h.activate(1);
        assert_eq!(r0.header.num_queue_pairs, 4);
        assert_eq!(r0.sriov_vsi().unwrap().vsi_id, 16);
        assert_eq!(r1.sriov_vsi().unwrap().vsi_id, 17);
        assert_eq!(h.pf.vf_queues(0), Some((0, 4)));
        assert_eq!(h.pf.vf_queues(1), Some((4, 4)));
        assert_eq!(h.sent.messages[1].0, 65);

        // Asking again does not reserve more.
        h.activate(0);
        assert_eq!(h.queues.lock().num_used(), 8);
        assert_eq!(r0.header.vf_offload_flags, PfConfig::default().offloads);
    }

    #[test]
    fn queue_exhaustion_is_reported() {
        let mut h = harness(6);
        h.activate(0);
        assert_eq!(
            h.request(1, &VcRequest::GetVfResources { caps: 0 }),
            VirtchnlStatus::ERR_NO_MEMORY
        );
        assert!(!h.pf.is_active(1));
    }

    #[test]
    fn inactive_vf_is_rejected() {
        let mut h = harness(8);
        assert_eq!(
            h.request(0, &VcRequest::EnableQueues(select(16, 1))),
            VirtchnlStatus::ERR_PARAM
        );
    }

    #[test]
    fn queue_masks_are_checked() {
        let mut h = harness(8);
        h.activate(0);
        assert_eq!(
            h.request(0, &VcRequest::EnableQueues(select(16, 0b1111))),
            VirtchnlStatus::SUCCESS
        );
        assert_eq!(h.pf.enabled_queues(0), Some((0b1111, 0b1111)));
        for bad in [select(16, 0b1_0000), select(16, 0), select(17, 1)] {
            assert_eq!(
                h.request(0, &VcRequest::DisableQueues(bad)),
                VirtchnlStatus::ERR_PARAM
            );
        }
        assert_eq!(
            h.request(0, &VcRequest::DisableQueues(select(16, 0b0101))),
            VirtchnlStatus::SUCCESS
        );
        assert_eq!(h.pf.enabled_queues(0), Some((0b1010, 0b1010)));
    }

    #[test]
    fn filters_are_validated() {
        let mut h = harness(8);
        h.activate(0);
        let add = |addr| VcRequest::AddEthAddr {
            vsi_id: 16,
            addrs: vec![[2, 0, 0, 0, 0, 1], addr],
        };
        assert_eq!(h.request(0, &add([2, 0, 0, 0, 0, 2])), VirtchnlStatus::SUCCESS);
        assert_eq!(h.request(0, &add([0; 6])), VirtchnlStatus::ERR_INVALID_MAC_ADDR);
        assert_eq!(h.request(0, &add([0xff; 6])), VirtchnlStatus::ERR_INVALID_MAC_ADDR);
        let vlan = |vlan| VcRequest::AddVlan {
            vsi_id: 16,
            vlans: vec![vlan],
        };
        assert_eq!(h.request(0, &vlan(4095)), VirtchnlStatus::SUCCESS);
        assert_eq!(h.request(0, &vlan(4096)), VirtchnlStatus::ERR_PARAM);
    }

    #[test]
    fn malformed_and_unsupported_requests() {
        let mut h = harness(8);
        h.activate(0);
        h.pf
            .handle_message(&mut h.sent, &raw_message(0, VirtchnlOp::ENABLE_QUEUES, vec![0; 3]))
            .unwrap();
        assert_eq!(h.sent.last().0, VirtchnlOp::ENABLE_QUEUES);
        assert_eq!(h.sent.last().1, VirtchnlStatus::ERR_PARAM);
        h.pf
            .handle_message(&mut h.sent, &raw_message(0, VirtchnlOp::CONFIG_TX_QUEUE, vec![0; 24]))
            .unwrap();
        assert_eq!(h.sent.last().1, VirtchnlStatus::ERR_NOT_IMPLEMENTED);
    }

    #[test]
    fn unknown_source_is_an_error() {
        let mut h = harness(8);
        let mut msg = message(0, &VcRequest::ResetVf);
        msg.desc.retval = 66;
        assert!(matches!(
            h.pf.handle_message(&mut h.sent, &msg),
            Err(PfError::UnknownVf(66))
        ));
        msg.desc.retval = 3;
        assert!(matches!(
            h.pf.handle_message(&mut h.sent, &msg),
            Err(PfError::UnknownVf(3))
        ));
        assert!(h.sent.messages.is_empty());
    }

    #[test]
    fn reset_releases_queues_without_reply() {
        let mut h = harness(8);
        h.pf.set_vf_mac(0, [2, 0, 0, 0, 0, 9]).unwrap();
        h.activate(0);
        let replies = h.sent.messages.len();
        h.pf
            .handle_message(&mut h.sent, &message(0, &VcRequest::ResetVf))
            .unwrap();
        assert_eq!(h.sent.messages.len(), replies);
        assert!(!h.pf.is_active(0));
        assert_eq!(h.queues.lock().num_used(), 0);
        let resources = h.activate(0);
        assert_eq!(resources.vsis[0].default_mac_addr, [2, 0, 0, 0, 0, 9]);
    }

    #[test]
    fn stats_and_rss() {
        let mut h = harness(8);
        h.activate(0);
        assert_eq!(
            h.request(0, &VcRequest::GetStats(select(16, 0))),
            VirtchnlStatus::SUCCESS
        );
        let stats: EthStats = decode_reply(VirtchnlOp::GET_STATS, h.sent.last().2).unwrap();
        assert_eq!(stats.rx_bytes, 16);

        let key = |len| VcRequest::ConfigRssKey {
            vsi_id: 16,
            key: vec![0; len],
        };
        assert_eq!(h.request(0, &key(52)), VirtchnlStatus::SUCCESS);
        assert_eq!(h.request(0, &key(40)), VirtchnlStatus::ERR_PARAM);
        let lut = |entry| VcRequest::ConfigRssLut {
            vsi_id: 16,
            lut: vec![entry; 64],
        };
        assert_eq!(h.request(0, &lut(3)), VirtchnlStatus::SUCCESS);
        assert_eq!(h.request(0, &lut(4)), VirtchnlStatus::ERR_PARAM);
        assert_eq!(h.request(0, &VcRequest::SetRssHena(1 << 63)), VirtchnlStatus::ERR_PARAM);
        assert_eq!(h.request(0, &VcRequest::SetRssHena(0x18)), VirtchnlStatus::SUCCESS);
        assert_eq!(h.pf.vf_info(0).unwrap().rss_hena, 0x18);
    }

    #[test]
    fn events_reach_active_vfs_only() {
        let mut h = harness(8);
        h.activate(1);
        let before = h.sent.messages.len();
        h.pf
            .notify_link(&mut h.sent, true, LinkSpeed::SPEED_40GB)
            .unwrap();
        assert_eq!(h.sent.messages.len(), before + 1);
        let (vf_id, op, _, payload) = h.sent.messages.last().unwrap();
        assert_eq!((*vf_id, *op), (65, VirtchnlOp::EVENT));
        let event: PfEvent = decode_reply(VirtchnlOp::EVENT, payload).unwrap();
        assert_eq!(event.event, PfEventType::LINK_CHANGE);
        assert_eq!(event.link_status, 1);
    }
}
