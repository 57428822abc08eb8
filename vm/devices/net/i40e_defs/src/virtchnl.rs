// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtual channel message definitions (protocol version 1.1).
//!
//! Virtual channel messages ride inside admin queue SEND_MSG_TO_PF and
//! SEND_MSG_TO_VF descriptors. The opcode is carried in `cookie_high` and the
//! status in `cookie_low`; the message body is the indirect buffer.

use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const VERSION_MAJOR: u32 = 1;
pub const VERSION_MINOR: u32 = 1;

open_enum! {
    pub enum VirtchnlOp: u32 {
        UNKNOWN = 0,
        VERSION = 1,
        RESET_VF = 2,
        GET_VF_RESOURCES = 3,
        CONFIG_TX_QUEUE = 4,
        CONFIG_RX_QUEUE = 5,
        CONFIG_VSI_QUEUES = 6,
        CONFIG_IRQ_MAP = 7,
        ENABLE_QUEUES = 8,
        DISABLE_QUEUES = 9,
        ADD_ETH_ADDR = 10,
        DEL_ETH_ADDR = 11,
        ADD_VLAN = 12,
        DEL_VLAN = 13,
        CONFIG_PROMISCUOUS_MODE = 14,
        GET_STATS = 15,
        EVENT = 17,
        CONFIG_RSS_KEY = 23,
        CONFIG_RSS_LUT = 24,
        GET_RSS_HENA_CAPS = 25,
        SET_RSS_HENA = 26,
    }
}

open_enum! {
    /// Status codes returned in a reply's `cookie_low`.
    pub enum VirtchnlStatus: i32 {
        SUCCESS = 0,
        ERR_CONFIG = -4,
        ERR_PARAM = -5,
        ERR_ADAPTER_STOPPED = -9,
        ERR_INVALID_MAC_ADDR = -10,
        ERR_NO_MEMORY = -18,
        ERR_TIMEOUT = -37,
        ERR_OPCODE_MISMATCH = -38,
        ERR_ADMIN_QUEUE_ERROR = -53,
        ERR_NOT_IMPLEMENTED = -60,
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VersionInfo {
    pub major: u32,
    pub minor: u32,
}

pub const VF_OFFLOAD_L2: u32 = 0x0000_0001;
pub const VF_OFFLOAD_RSS_AQ: u32 = 0x0000_0008;
pub const VF_OFFLOAD_RSS_REG: u32 = 0x0000_0010;
pub const VF_OFFLOAD_WB_ON_ITR: u32 = 0x0000_0020;
pub const VF_OFFLOAD_VLAN: u32 = 0x0001_0000;
pub const VF_OFFLOAD_RX_POLLING: u32 = 0x0002_0000;
pub const VF_OFFLOAD_RSS_PF: u32 = 0x0008_0000;

open_enum! {
    pub enum VsiType: u32 {
        MAIN = 0,
        VMDQ2 = 2,
        SRIOV = 6,
    }
}

/// Fixed part of the GET_VF_RESOURCES reply, followed by `num_vsis`
/// [`VsiResource`] entries.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VfResourceHeader {
    pub num_vsis: u16,
    pub num_queue_pairs: u16,
    pub max_vectors: u16,
    pub max_mtu: u16,
    pub vf_offload_flags: u32,
    pub rss_key_size: u32,
    pub rss_lut_size: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VsiResource {
    pub vsi_id: u16,
    pub num_queue_pairs: u16,
    pub vsi_type: VsiType,
    pub qset_handle: u16,
    pub default_mac_addr: [u8; 6],
}

const_assert_eq!(size_of::<VfResourceHeader>(), 20);
const_assert_eq!(size_of::<VsiResource>(), 16);

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxqInfo {
    pub vsi_id: u16,
    pub queue_id: u16,
    pub ring_len: u16,
    pub headwb_enabled: u16,
    pub dma_ring_addr: u64,
    pub dma_headwb_addr: u64,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxqInfo {
    pub vsi_id: u16,
    pub queue_id: u16,
    pub ring_len: u32,
    pub hdr_size: u16,
    pub splithdr_enabled: u16,
    pub databuffer_size: u32,
    pub max_pkt_size: u32,
    pub pad1: u32,
    pub dma_ring_addr: u64,
    pub rx_split_pos: u32,
    pub pad2: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueuePairInfo {
    pub txq: TxqInfo,
    pub rxq: RxqInfo,
}

const_assert_eq!(size_of::<TxqInfo>(), 24);
const_assert_eq!(size_of::<RxqInfo>(), 40);
const_assert_eq!(size_of::<QueuePairInfo>(), 64);

/// Header of CONFIG_VSI_QUEUES, followed by `num_queue_pairs`
/// [`QueuePairInfo`] entries.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VsiQueueConfigHeader {
    pub vsi_id: u16,
    pub num_queue_pairs: u16,
    pub pad: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VectorMap {
    pub vsi_id: u16,
    pub vector_id: u16,
    pub rxq_map: u16,
    pub txq_map: u16,
    pub rxitr_idx: u16,
    pub txitr_idx: u16,
}

const_assert_eq!(size_of::<VectorMap>(), 12);

/// Header of CONFIG_IRQ_MAP, followed by `num_vectors` [`VectorMap`]
/// entries.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IrqMapHeader {
    pub num_vectors: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct QueueSelect {
    pub vsi_id: u16,
    pub pad: u16,
    pub rx_queues: u32,
    pub tx_queues: u32,
}

const_assert_eq!(size_of::<QueueSelect>(), 12);

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EtherAddr {
    pub addr: [u8; 6],
    pub pad: [u8; 2],
}

/// Header shared by the address and VLAN filter lists, followed by
/// `num_elements` entries.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FilterListHeader {
    pub vsi_id: u16,
    pub num_elements: u16,
}

pub const FLAG_VF_UNICAST_PROMISC: u16 = 0x0001;
pub const FLAG_VF_MULTICAST_PROMISC: u16 = 0x0002;

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PromiscInfo {
    pub vsi_id: u16,
    pub flags: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EthStats {
    pub rx_bytes: u64,
    pub rx_unicast: u64,
    pub rx_multicast: u64,
    pub rx_broadcast: u64,
    pub rx_discards: u64,
    pub rx_unknown_protocol: u64,
    pub tx_bytes: u64,
    pub tx_unicast: u64,
    pub tx_multicast: u64,
    pub tx_broadcast: u64,
    pub tx_discards: u64,
    pub tx_errors: u64,
}

const_assert_eq!(size_of::<EthStats>(), 96);

/// Header of CONFIG_RSS_KEY and CONFIG_RSS_LUT, followed by the key or
/// table bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RssHeader {
    pub vsi_id: u16,
    pub len: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RssHena {
    pub hena: u64,
}

pub const RSS_KEY_SIZE: u16 = 52;
pub const RSS_LUT_SIZE: u16 = 64;

open_enum! {
    pub enum PfEventType: u32 {
        UNKNOWN = 0,
        LINK_CHANGE = 1,
        RESET_IMPENDING = 2,
        PF_DRIVER_CLOSE = 3,
    }
}

open_enum! {
    pub enum LinkSpeed: u32 {
        UNKNOWN = 0,
        SPEED_100MB = 0x2,
        SPEED_1GB = 0x4,
        SPEED_10GB = 0x8,
        SPEED_40GB = 0x10,
        SPEED_20GB = 0x20,
        SPEED_25GB = 0x40,
    }
}

/// Body of an unsolicited EVENT message from the PF.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PfEvent {
    pub event: PfEventType,
    pub link_speed: LinkSpeed,
    pub link_status: u8,
    pub pad: [u8; 3],
    pub severity: i32,
}

const_assert_eq!(size_of::<PfEvent>(), 16);

pub const PF_EVENT_SEVERITY_INFO: i32 = 0;
pub const PF_EVENT_SEVERITY_CERTAIN_DOOM: i32 = 255;
