// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hardware definitions for Intel 700-series (i40e) Ethernet controllers:
//! LAN descriptor formats, register offsets, the admin queue, and the virtual
//! channel spoken between PF and VF drivers.

#![expect(missing_docs)]
#![forbid(unsafe_code)]

/// Defines a transparent newtype over an integer with named constants, so
/// that unknown values received from hardware or a peer can still be held
/// and printed.
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $ty:ty {
            $(
                $(#[$va:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        $(#[$a])*
        #[derive(
            Copy,
            Clone,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::zerocopy::IntoBytes,
            ::zerocopy::FromBytes,
            ::zerocopy::Immutable,
            ::zerocopy::KnownLayout,
        )]
        #[repr(transparent)]
        $v struct $name(pub $ty);

        impl $name {
            $(
                $(#[$va])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                match *self {
                    $(Self::$variant => f.pad(stringify!($variant)),)*
                    _ => ::core::fmt::Debug::fmt(&self.0, f),
                }
            }
        }
    };
}

pub mod aq;
pub mod regs;
pub mod virtchnl;

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use std::fmt::Debug;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const VENDOR_ID: u16 = 0x8086;
pub const DEVICE_ID_XL710_SFP: u16 = 0x1572;
pub const DEVICE_ID_XL710_QSFP_A: u16 = 0x1583;
pub const DEVICE_ID_X710_10G_T: u16 = 0x15FF;
pub const DEVICE_ID_XL710_VF: u16 = 0x154C;

/// Ring base addresses must be aligned to this many bytes.
pub const DESC_RING_ALIGN: usize = 128;
/// Ring lengths are programmed in multiples of this many descriptors.
pub const RING_INCREMENT: u16 = 32;
pub const MIN_RING_LEN: u16 = 32;
pub const MAX_RING_LEN: u16 = 8160;

/// Largest buffer a single TX data descriptor can describe.
pub const TX_MAX_BUFFER_SIZE: u32 = (1 << 14) - 1;
/// Largest TSO payload the context descriptor can describe.
pub const TX_MAX_TSO_LEN: u32 = (1 << 18) - 1;
pub const TX_MIN_TSO_MSS: u16 = 64;
pub const TX_MAX_TSO_MSS: u16 = 9668;

open_enum! {
    pub enum TxDescType: u8 {
        DATA = 0x0,
        CONTEXT = 0x1,
        FILTER_PROG = 0x8,
        DESC_DONE = 0xF,
    }
}

// Data descriptor command flags, as stored in the CMD field.
pub const TX_DESC_CMD_EOP: u16 = 0x0001;
pub const TX_DESC_CMD_RS: u16 = 0x0002;
pub const TX_DESC_CMD_ICRC: u16 = 0x0004;
pub const TX_DESC_CMD_IL2TAG1: u16 = 0x0008;
pub const TX_DESC_CMD_DUMMY: u16 = 0x0010;
pub const TX_DESC_CMD_IIPT_NONIP: u16 = 0x0000;
pub const TX_DESC_CMD_IIPT_IPV6: u16 = 0x0020;
pub const TX_DESC_CMD_IIPT_IPV4: u16 = 0x0040;
pub const TX_DESC_CMD_IIPT_IPV4_CSUM: u16 = 0x0060;
pub const TX_DESC_CMD_L4T_EOFT_UNK: u16 = 0x0000;
pub const TX_DESC_CMD_L4T_EOFT_TCP: u16 = 0x0100;
pub const TX_DESC_CMD_L4T_EOFT_SCTP: u16 = 0x0200;
pub const TX_DESC_CMD_L4T_EOFT_UDP: u16 = 0x0300;

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxDataDesc {
    pub buffer_addr: u64,
    pub cmd_type_offset_bsz: TxDataQword1,
}

const_assert_eq!(size_of::<TxDataDesc>(), 16);

#[bitfield(u64)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxDataQword1 {
    #[bits(4)]
    pub dtype: u8,
    #[bits(12)]
    pub cmd: u16,
    #[bits(18)]
    pub offset: u32,
    #[bits(14)]
    pub buf_sz: u16,
    pub l2tag1: u16,
}

/// Header lengths carried in the OFFSET field of a data descriptor.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct TxDescOffset {
    /// MAC header length in 2-byte words.
    #[bits(7)]
    pub maclen: u8,
    /// IP header length in 4-byte words.
    #[bits(7)]
    pub iplen: u8,
    /// L4 header length in 4-byte words.
    #[bits(4)]
    pub l4len: u8,
    #[bits(14)]
    pub reserved: u16,
}

pub const TX_CTX_DESC_CMD_TSO: u16 = 0x0001;
pub const TX_CTX_DESC_CMD_TSYN: u16 = 0x0002;
pub const TX_CTX_DESC_CMD_IL2TAG2: u16 = 0x0004;

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxContextDesc {
    pub tunneling_params: u32,
    pub l2tag2: u16,
    pub reserved: u16,
    pub type_cmd_tso_mss: TxContextQword1,
}

const_assert_eq!(size_of::<TxContextDesc>(), 16);

#[bitfield(u64)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct TxContextQword1 {
    #[bits(4)]
    pub dtype: u8,
    #[bits(14)]
    pub cmd: u16,
    #[bits(12)]
    pub reserved: u16,
    #[bits(18)]
    pub tso_len: u32,
    #[bits(2)]
    pub reserved2: u8,
    #[bits(14)]
    pub mss: u16,
}

/// The 16-byte receive descriptor in the format software posts.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxReadDesc {
    pub pkt_addr: u64,
    pub hdr_addr: u64,
}

/// The same 16 bytes after hardware writes the completion back.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxWbDesc {
    pub mirroring_status: u16,
    pub l2tag1: u16,
    pub rss: u32,
    pub status_error_len: RxWbQword1,
}

const_assert_eq!(size_of::<RxReadDesc>(), 16);
const_assert_eq!(size_of::<RxWbDesc>(), 16);

#[bitfield(u64)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct RxWbQword1 {
    // status
    pub dd: bool,
    pub eof: bool,
    pub l2tag1p: bool,
    pub l3l4p: bool,
    pub crcp: bool,
    #[bits(2)]
    pub tsynindx: u8,
    pub tsynvalid: bool,
    pub ext_udp_0: bool,
    #[bits(2)]
    pub umbcast: u8,
    pub flm: bool,
    #[bits(2)]
    pub fltstat: u8,
    pub lpbk: bool,
    pub ipv6exadd: bool,
    #[bits(2)]
    pub reserved: u8,
    pub int_udp_0: bool,
    // error
    pub rxe: bool,
    pub recipe: bool,
    pub hbo: bool,
    pub ipe: bool,
    pub l4e: bool,
    pub eipe: bool,
    pub oversize: bool,
    pub pprs: bool,
    #[bits(3)]
    pub reserved2: u8,
    pub ptype: u8,
    #[bits(14)]
    pub length_pbuf: u16,
    #[bits(11)]
    pub length_hbuf: u16,
    pub sph: bool,
}

impl RxWbQword1 {
    /// Errors that make the frame unusable, as opposed to checksum
    /// failures, which are reported with the frame.
    pub fn has_frame_error(&self) -> bool {
        self.rxe() || self.hbo() || self.oversize() || self.pprs()
    }
}

/// FLTSTAT value indicating that the `rss` field holds a valid hash.
pub const RX_FLTSTAT_RSS_HASH: u8 = 3;
