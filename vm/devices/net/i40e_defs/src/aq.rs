// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Admin queue descriptor and opcode definitions.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Indirect buffers larger than this must set the LB flag.
pub const AQ_LARGE_BUF: usize = 512;
pub const AQ_MAX_BUF_SIZE: usize = 4096;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AqDesc {
    pub flags: AqFlags,
    pub opcode: AqOpcode,
    pub datalen: u16,
    pub retval: u16,
    pub cookie_high: u32,
    pub cookie_low: u32,
    pub param0: u32,
    pub param1: u32,
    pub addr_high: u32,
    pub addr_low: u32,
}

const_assert_eq!(size_of::<AqDesc>(), 32);

impl AqDesc {
    /// A descriptor for a command that carries no indirect buffer yet.
    pub fn direct(opcode: AqOpcode) -> Self {
        Self {
            flags: AqFlags::new().with_si(true),
            opcode,
            ..Default::default()
        }
    }

    pub fn cookie(&self) -> u64 {
        ((self.cookie_high as u64) << 32) | self.cookie_low as u64
    }

    pub fn buffer_address(&self) -> u64 {
        ((self.addr_high as u64) << 32) | self.addr_low as u64
    }

    pub fn set_buffer_address(&mut self, address: u64) {
        self.addr_high = (address >> 32) as u32;
        self.addr_low = address as u32;
    }

    pub fn status(&self) -> AqRetval {
        AqRetval(self.retval)
    }
}

#[bitfield(u16)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct AqFlags {
    /// Descriptor done.
    pub dd: bool,
    /// Command completed.
    pub cmp: bool,
    pub err: bool,
    /// VF-to-PF message.
    pub vfe: bool,
    #[bits(5)]
    pub reserved: u8,
    /// Large buffer.
    pub lb: bool,
    /// The indirect buffer is read by firmware.
    pub rd: bool,
    pub vfc: bool,
    /// The descriptor carries an indirect buffer.
    pub buf: bool,
    /// Do not interrupt on completion.
    pub si: bool,
    /// Interrupt on error.
    pub ei: bool,
    pub fe: bool,
}

open_enum! {
    #[derive(Default)]
    pub enum AqOpcode: u16 {
        GET_VERSION = 0x0001,
        DRIVER_VERSION = 0x0002,
        QUEUE_SHUTDOWN = 0x0003,
        SET_PF_CONTEXT = 0x0004,
        GET_LINK_STATUS = 0x0607,
        SEND_MSG_TO_PF = 0x0801,
        SEND_MSG_TO_VF = 0x0802,
        EVENT_LAN_OVERFLOW = 0x1001,
    }
}

open_enum! {
    pub enum AqRetval: u16 {
        OK = 0,
        EPERM = 1,
        ENOENT = 2,
        ESRCH = 3,
        EINTR = 4,
        EIO = 5,
        ENXIO = 6,
        E2BIG = 7,
        EAGAIN = 8,
        ENOMEM = 9,
        EACCES = 10,
        EFAULT = 11,
        EBUSY = 12,
        EEXIST = 13,
        EINVAL = 14,
        ENOTTY = 15,
        ENOSPC = 16,
        ENOSYS = 17,
        ERANGE = 18,
        EFLUSHED = 19,
        BAD_ADDR = 20,
        EMODE = 21,
        EFBIG = 22,
    }
}
