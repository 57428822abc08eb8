// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver core for Intel 700-series (i40e) Ethernet controllers.
//!
//! This crate implements the queue-pair data plane (TX and RX descriptor
//! rings), the admin queue used to talk to device firmware, and both ends of
//! the virtual channel that SR-IOV virtual functions use to ask the physical
//! function for resources. Bus enumeration and interrupt wiring are left to
//! the caller, which supplies register and DMA access through the
//! [`registers::RegisterIo`] and [`dma::DmaClient`] traits.

#![forbid(unsafe_code)]

pub mod adminq;
pub mod deferred;
pub mod dma;
pub mod emulated;
pub mod pf;
pub mod queue;
pub mod queue_alloc;
mod ratelimit;
pub mod registers;
pub mod ring;
pub mod rx;
pub mod tx;
pub mod vf;
pub mod virtchnl;
