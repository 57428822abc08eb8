// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Register offsets in BAR0 for the physical and virtual functions.

use bitfield_struct::bitfield;

pub const fn qtx_tail(queue: u16) -> usize {
    0x0010_8000 + 4 * queue as usize
}

pub const fn qrx_tail(queue: u16) -> usize {
    0x0012_8000 + 4 * queue as usize
}

pub const fn qtx_ena(queue: u16) -> usize {
    0x0010_0000 + 4 * queue as usize
}

pub const fn qrx_ena(queue: u16) -> usize {
    0x0012_0000 + 4 * queue as usize
}

pub const fn vf_qtx_tail1(queue: u16) -> usize {
    4 * queue as usize
}

pub const fn vf_qrx_tail1(queue: u16) -> usize {
    0x2000 + 4 * queue as usize
}

pub const QENA_REQ: u32 = 1 << 0;
pub const QENA_STAT: u32 = 1 << 2;

pub const PF_ATQBAL: usize = 0x0008_0000;
pub const PF_ATQBAH: usize = 0x0008_0100;
pub const PF_ATQLEN: usize = 0x0008_0200;
pub const PF_ATQH: usize = 0x0008_0300;
pub const PF_ATQT: usize = 0x0008_0400;
pub const PF_ARQBAL: usize = 0x0008_0080;
pub const PF_ARQBAH: usize = 0x0008_0180;
pub const PF_ARQLEN: usize = 0x0008_0280;
pub const PF_ARQH: usize = 0x0008_0380;
pub const PF_ARQT: usize = 0x0008_0480;

pub const VF_ATQBAL1: usize = 0x7C00;
pub const VF_ATQBAH1: usize = 0x7800;
pub const VF_ATQLEN1: usize = 0x6800;
pub const VF_ATQH1: usize = 0x6400;
pub const VF_ATQT1: usize = 0x8400;
pub const VF_ARQBAL1: usize = 0x6C00;
pub const VF_ARQBAH1: usize = 0x7400;
pub const VF_ARQLEN1: usize = 0x8000;
pub const VF_ARQH1: usize = 0x7000;
pub const VF_ARQT1: usize = 0x4400;

/// Head and tail registers hold a 10-bit ring index.
pub const AQ_HEAD_TAIL_MASK: u32 = 0x3FF;

/// Layout shared by the ATQLEN and ARQLEN registers.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct AqLen {
    #[bits(10)]
    pub len: u16,
    #[bits(18)]
    pub reserved: u32,
    /// The function was reset while the queue was enabled.
    pub vfe: bool,
    /// Firmware dropped a message because no receive buffer was posted.
    pub ovfl: bool,
    /// Critical error; the queue is unusable until reinitialized.
    pub crit: bool,
    pub enable: bool,
}

impl AqLen {
    pub fn has_fault(&self) -> bool {
        self.vfe() || self.ovfl() || self.crit()
    }
}
