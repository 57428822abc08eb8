// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A transmit and receive ring sharing one queue index.

use crate::dma::DmaClient;
use crate::registers::RegisterIo;
use crate::rx::RxConfig;
use crate::rx::RxRing;
use crate::rx::RxSink;
use crate::tx::TxBuffer;
use crate::tx::TxConfig;
use crate::tx::TxRing;
use i40e_defs::regs;
use i40e_defs::virtchnl::QueuePairInfo;
use parking_lot::Mutex;
use std::sync::Arc;

/// Which register block the queue's doorbells live in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum QueueFunction {
    /// PF queue, indexed by global queue number.
    Pf,
    /// VF queue, indexed relative to the VF's range.
    Vf,
}

/// What one call to [`QueuePair::service`] did.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ServiceResult {
    /// Transmitted packets released.
    pub tx_completed: usize,
    /// Receive descriptors consumed.
    pub rx_consumed: usize,
    /// The transmit ring looks stuck.
    pub tx_hung: bool,
}

/// A queue pair. Each ring has its own lock so that transmit and receive
/// can be serviced from different contexts.
pub struct QueuePair<B> {
    index: u16,
    tx: Mutex<TxRing<B>>,
    rx: Mutex<RxRing>,
}

impl<B: TxBuffer> QueuePair<B> {
    /// Allocates both rings and posts the receive buffers.
    pub fn new(
        dma: Arc<dyn DmaClient>,
        regs: Arc<dyn RegisterIo>,
        function: QueueFunction,
        index: u16,
        tx_config: TxConfig,
        rx_config: RxConfig,
    ) -> anyhow::Result<Self> {
        let (tx_tail, rx_tail) = match function {
            QueueFunction::Pf => (regs::qtx_tail(index), regs::qrx_tail(index)),
            QueueFunction::Vf => (regs::vf_qtx_tail1(index), regs::vf_qrx_tail1(index)),
        };
        let tx = TxRing::new(dma.as_ref(), regs.clone(), index, tx_tail, tx_config)?;
        let rx = RxRing::new(dma, regs, index, rx_tail, rx_config)?;
        Ok(Self {
            index,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        })
    }

    /// The queue index.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// The transmit ring.
    pub fn tx(&self) -> &Mutex<TxRing<B>> {
        &self.tx
    }

    /// The receive ring.
    pub fn rx(&self) -> &Mutex<RxRing> {
        &self.rx
    }

    /// The pair's entry in a CONFIG_VSI_QUEUES request.
    pub fn queue_pair_info(&self, vsi_id: u16) -> QueuePairInfo {
        QueuePairInfo {
            txq: self.tx.lock().txq_info(vsi_id),
            rxq: self.rx.lock().rxq_info(vsi_id),
        }
    }

    /// Reclaims finished transmits and polls for received packets, taking
    /// each ring's lock in turn.
    pub fn service(
        &self,
        rx_budget: usize,
        sink: &mut dyn RxSink,
        completed: &mut Vec<B>,
    ) -> ServiceResult {
        let (tx_completed, tx_hung) = {
            let mut tx = self.tx.lock();
            (tx.reclaim(completed), tx.is_hung())
        };
        let rx_consumed = self.rx.lock().poll(rx_budget, sink);
        ServiceResult {
            tx_completed,
            rx_consumed,
            tx_hung,
        }
    }

    /// Releases everything the rings hold. The device must have stopped
    /// both queues.
    pub fn drain(&self, completed: &mut Vec<B>) {
        self.tx.lock().drain(completed);
        self.rx.lock().drain();
    }
}
