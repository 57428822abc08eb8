// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtual channel messages and the VF's command manager.
//!
//! The VF has at most one request outstanding with its PF. Further requests
//! wait in FIFO order and are sent as soon as the previous one is answered or
//! times out. Each request carries a callback that is invoked exactly once
//! with the outcome.

use crate::adminq::AdminQueue;
use crate::adminq::AdminQueueError;
use crate::adminq::AdminQueueMessage;
use futures::channel::oneshot;
use i40e_defs::aq::AqDesc;
use i40e_defs::aq::AqOpcode;
use i40e_defs::virtchnl::EtherAddr;
use i40e_defs::virtchnl::FilterListHeader;
use i40e_defs::virtchnl::IrqMapHeader;
use i40e_defs::virtchnl::PromiscInfo;
use i40e_defs::virtchnl::QueuePairInfo;
use i40e_defs::virtchnl::QueueSelect;
use i40e_defs::virtchnl::RssHeader;
use i40e_defs::virtchnl::RssHena;
use i40e_defs::virtchnl::VectorMap;
use i40e_defs::virtchnl::VersionInfo;
use i40e_defs::virtchnl::VfResourceHeader;
use i40e_defs::virtchnl::VirtchnlOp;
use i40e_defs::virtchnl::VirtchnlStatus;
use i40e_defs::virtchnl::VsiQueueConfigHeader;
use i40e_defs::virtchnl::VsiResource;
use i40e_defs::virtchnl::VsiType;
use std::collections::VecDeque;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A malformed virtual channel message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VcDecodeError {
    /// Shorter than its fixed header.
    #[error("{op:?} message of {len} bytes is too short")]
    TooShort {
        /// The message opcode.
        op: VirtchnlOp,
        /// The payload length.
        len: usize,
    },
    /// The variable part does not match the element count in the header.
    #[error("{op:?} message has {len} bytes for {count} entries")]
    LengthMismatch {
        /// The message opcode.
        op: VirtchnlOp,
        /// Length of the variable part.
        len: usize,
        /// Entry count from the header.
        count: usize,
    },
    /// Not a request this implementation accepts.
    #[error("unsupported request {0:?}")]
    Unsupported(VirtchnlOp),
}

fn read_header<T: FromBytes + KnownLayout>(
    op: VirtchnlOp,
    payload: &[u8],
) -> Result<(T, &[u8]), VcDecodeError> {
    T::read_from_prefix(payload).map_err(|_| VcDecodeError::TooShort {
        op,
        len: payload.len(),
    })
}

fn read_exact<T: FromBytes + KnownLayout>(op: VirtchnlOp, payload: &[u8]) -> Result<T, VcDecodeError> {
    let (obj, rest) = read_header(op, payload)?;
    if !rest.is_empty() {
        return Err(VcDecodeError::LengthMismatch {
            op,
            len: rest.len(),
            count: 0,
        });
    }
    Ok(obj)
}

fn read_entries<T: FromBytes + KnownLayout>(
    op: VirtchnlOp,
    rest: &[u8],
    count: usize,
) -> Result<Vec<T>, VcDecodeError> {
    let mismatch = VcDecodeError::LengthMismatch {
        op,
        len: rest.len(),
        count,
    };
    if rest.len() != count * size_of::<T>() {
        return Err(mismatch);
    }
    rest.chunks_exact(size_of::<T>())
        .map(|chunk| T::read_from_bytes(chunk).map_err(|_| mismatch.clone()))
        .collect()
}

fn encode_list<H: IntoBytes + Immutable, T: IntoBytes + Immutable>(header: &H, entries: &[T]) -> Vec<u8> {
    let mut buf = header.as_bytes().to_vec();
    for entry in entries {
        buf.extend_from_slice(entry.as_bytes());
    }
    buf
}

/// A VF-to-PF request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[expect(missing_docs)]
pub enum VcRequest {
    Version(VersionInfo),
    ResetVf,
    /// Requested offload capabilities. Version 1.0 VFs send none.
    GetVfResources { caps: u32 },
    ConfigVsiQueues {
        vsi_id: u16,
        queue_pairs: Vec<QueuePairInfo>,
    },
    ConfigIrqMap(Vec<VectorMap>),
    EnableQueues(QueueSelect),
    DisableQueues(QueueSelect),
    AddEthAddr { vsi_id: u16, addrs: Vec<[u8; 6]> },
    DelEthAddr { vsi_id: u16, addrs: Vec<[u8; 6]> },
    AddVlan { vsi_id: u16, vlans: Vec<u16> },
    DelVlan { vsi_id: u16, vlans: Vec<u16> },
    ConfigPromiscuous(PromiscInfo),
    GetStats(QueueSelect),
    ConfigRssKey { vsi_id: u16, key: Vec<u8> },
    ConfigRssLut { vsi_id: u16, lut: Vec<u8> },
    GetRssHenaCaps,
    SetRssHena(u64),
}

impl VcRequest {
    /// The opcode the request travels under.
    pub fn opcode(&self) -> VirtchnlOp {
        match self {
            VcRequest::Version(_) => VirtchnlOp::VERSION,
            VcRequest::ResetVf => VirtchnlOp::RESET_VF,
            VcRequest::GetVfResources { .. } => VirtchnlOp::GET_VF_RESOURCES,
            VcRequest::ConfigVsiQueues { .. } => VirtchnlOp::CONFIG_VSI_QUEUES,
            VcRequest::ConfigIrqMap(_) => VirtchnlOp::CONFIG_IRQ_MAP,
            VcRequest::EnableQueues(_) => VirtchnlOp::ENABLE_QUEUES,
            VcRequest::DisableQueues(_) => VirtchnlOp::DISABLE_QUEUES,
            VcRequest::AddEthAddr { .. } => VirtchnlOp::ADD_ETH_ADDR,
            VcRequest::DelEthAddr { .. } => VirtchnlOp::DEL_ETH_ADDR,
            VcRequest::AddVlan { .. } => VirtchnlOp::ADD_VLAN,
            VcRequest::DelVlan { .. } => VirtchnlOp::DEL_VLAN,
            VcRequest::ConfigPromiscuous(_) => VirtchnlOp::CONFIG_PROMISCUOUS_MODE,
            VcRequest::GetStats(_) => VirtchnlOp::GET_STATS,
            VcRequest::ConfigRssKey { .. } => VirtchnlOp::CONFIG_RSS_KEY,
            VcRequest::ConfigRssLut { .. } => VirtchnlOp::CONFIG_RSS_LUT,
            VcRequest::GetRssHenaCaps => VirtchnlOp::GET_RSS_HENA_CAPS,
            VcRequest::SetRssHena(_) => VirtchnlOp::SET_RSS_HENA,
        }
    }

    /// Serializes the message body.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            VcRequest::Version(info) => info.as_bytes().to_vec(),
            VcRequest::ResetVf | VcRequest::GetRssHenaCaps => Vec::new(),
            VcRequest::GetVfResources { caps } => caps.as_bytes().to_vec(),
            VcRequest::ConfigVsiQueues {
                vsi_id,
                queue_pairs,
            } => encode_list(
                &VsiQueueConfigHeader {
                    vsi_id: *vsi_id,
                    num_queue_pairs: queue_pairs.len() as u16,
                    pad: 0,
                },
                queue_pairs,
            ),
            VcRequest::ConfigIrqMap(maps) => encode_list(
                &IrqMapHeader {
                    num_vectors: maps.len() as u16,
                },
                maps,
            ),
            VcRequest::EnableQueues(select)
            | VcRequest::DisableQueues(select)
            | VcRequest::GetStats(select) => select.as_bytes().to_vec(),
            VcRequest::AddEthAddr { vsi_id, addrs } | VcRequest::DelEthAddr { vsi_id, addrs } => {
                let entries: Vec<_> = addrs
                    .iter()
                    .map(|&addr| EtherAddr { addr, pad: [0; 2] })
                    .collect();
                encode_list(
                    &FilterListHeader {
                        vsi_id: *vsi_id,
                        num_elements: entries.len() as u16,
                    },
                    &entries,
                )
            }
            VcRequest::AddVlan { vsi_id, vlans } | VcRequest::DelVlan { vsi_id, vlans } => {
                encode_list(
                    &FilterListHeader {
                        vsi_id: *vsi_id,
                        num_elements: vlans.len() as u16,
                    },
                    vlans,
                )
            }
            VcRequest::ConfigPromiscuous(info) => info.as_bytes().to_vec(),
            VcRequest::ConfigRssKey { vsi_id, key: data }
            | VcRequest::ConfigRssLut { vsi_id, lut: data } => encode_list(
                &RssHeader {
                    vsi_id: *vsi_id,
                    len: data.len() as u16,
                },
                data,
            ),
            VcRequest::SetRssHena(hena) => RssHena { hena: *hena }.as_bytes().to_vec(),
        }
    }

    /// Parses a request body received by the PF.
    pub fn decode(op: VirtchnlOp, payload: &[u8]) -> Result<Self, VcDecodeError> {
        let request = match op {
            VirtchnlOp::VERSION => VcRequest::Version(read_exact(op, payload)?),
            VirtchnlOp::RESET_VF => VcRequest::ResetVf,
            VirtchnlOp::GET_VF_RESOURCES => {
                let caps = if payload.is_empty() {
                    0
                } else {
                    read_exact::<u32>(op, payload)?
                };
                VcRequest::GetVfResources { caps }
            }
            VirtchnlOp::CONFIG_VSI_QUEUES => {
                let (header, rest) = read_header::<VsiQueueConfigHeader>(op, payload)?;
                VcRequest::ConfigVsiQueues {
                    vsi_id: header.vsi_id,
                    queue_pairs: read_entries(op, rest, header.num_queue_pairs.into())?,
                }
            }
            VirtchnlOp::CONFIG_IRQ_MAP => {
                let (header, rest) = read_header::<IrqMapHeader>(op, payload)?;
                VcRequest::ConfigIrqMap(read_entries(op, rest, header.num_vectors.into())?)
            }
            VirtchnlOp::ENABLE_QUEUES => VcRequest::EnableQueues(read_exact(op, payload)?),
            VirtchnlOp::DISABLE_QUEUES => VcRequest::DisableQueues(read_exact(op, payload)?),
            VirtchnlOp::GET_STATS => VcRequest::GetStats(read_exact(op, payload)?),
            VirtchnlOp::ADD_ETH_ADDR | VirtchnlOp::DEL_ETH_ADDR => {
                let (header, rest) = read_header::<FilterListHeader>(op, payload)?;
                let addrs = read_entries::<EtherAddr>(op, rest, header.num_elements.into())?
                    .into_iter()
                    .map(|e| e.addr)
                    .collect();
                if op == VirtchnlOp::ADD_ETH_ADDR {
                    VcRequest::AddEthAddr {
                        vsi_id: header.vsi_id,
                        addrs,
                    }
                } else {
                    VcRequest::DelEthAddr {
                        vsi_id: header.vsi_id,
                        addrs,
                    }
                }
            }
            VirtchnlOp::ADD_VLAN | VirtchnlOp::DEL_VLAN => {
                let (header, rest) = read_header::<FilterListHeader>(op, payload)?;
                let vlans = read_entries(op, rest, header.num_elements.into())?;
                if op == VirtchnlOp::ADD_VLAN {
                    VcRequest::AddVlan {
                        vsi_id: header.vsi_id,
                        vlans,
                    }
                } else {
                    VcRequest::DelVlan {
                        vsi_id: header.vsi_id,
                        vlans,
                    }
                }
            }
            VirtchnlOp::CONFIG_PROMISCUOUS_MODE => {
                VcRequest::ConfigPromiscuous(read_exact(op, payload)?)
            }
            VirtchnlOp::CONFIG_RSS_KEY | VirtchnlOp::CONFIG_RSS_LUT => {
                let (header, rest) = read_header::<RssHeader>(op, payload)?;
                let data = read_entries::<u8>(op, rest, header.len.into())?;
                if op == VirtchnlOp::CONFIG_RSS_KEY {
                    VcRequest::ConfigRssKey {
                        vsi_id: header.vsi_id,
                        key: data,
                    }
                } else {
                    VcRequest::ConfigRssLut {
                        vsi_id: header.vsi_id,
                        lut: data,
                    }
                }
            }
            VirtchnlOp::GET_RSS_HENA_CAPS => VcRequest::GetRssHenaCaps,
            VirtchnlOp::SET_RSS_HENA => {
                VcRequest::SetRssHena(read_exact::<RssHena>(op, payload)?.hena)
            }
            op => return Err(VcDecodeError::Unsupported(op)),
        };
        Ok(request)
    }
}

/// The GET_VF_RESOURCES reply.
#[derive(Debug, Clone)]
pub struct VfResources {
    /// Function-wide limits and granted offloads.
    pub header: VfResourceHeader,
    /// The VSIs assigned to the VF.
    pub vsis: Vec<VsiResource>,
}

impl VfResources {
    /// Serializes the reply.
    pub fn encode(&self) -> Vec<u8> {
        encode_list(&self.header, &self.vsis)
    }

    /// Parses the reply.
    pub fn decode(payload: &[u8]) -> Result<Self, VcDecodeError> {
        let op = VirtchnlOp::GET_VF_RESOURCES;
        let (header, rest) = read_header::<VfResourceHeader>(op, payload)?;
        Ok(Self {
            vsis: read_entries(op, rest, header.num_vsis.into())?,
            header,
        })
    }

    /// The VSI the VF sends and receives on.
    pub fn sriov_vsi(&self) -> Option<&VsiResource> {
        self.vsis.iter().find(|vsi| vsi.vsi_type == VsiType::SRIOV)
    }
}

/// Parses a fixed-size reply or event body.
pub fn decode_reply<T: FromBytes + KnownLayout>(
    op: VirtchnlOp,
    payload: &[u8],
) -> Result<T, VcDecodeError> {
    read_exact(op, payload)
}

/// A message from the PF, as seen on the VF's receive queue.
#[derive(Debug, Clone)]
pub struct PfMessage {
    /// The request this answers, or [`VirtchnlOp::EVENT`].
    pub opcode: VirtchnlOp,
    /// The PF's verdict.
    pub status: VirtchnlStatus,
    /// The reply body.
    pub payload: Vec<u8>,
}

impl PfMessage {
    /// Extracts a virtual channel message from an admin queue event, if it
    /// is one.
    pub fn from_event(event: AdminQueueMessage) -> Option<Self> {
        (event.opcode() == AqOpcode::SEND_MSG_TO_VF).then(|| Self {
            opcode: VirtchnlOp(event.desc.cookie_high),
            status: VirtchnlStatus(event.desc.cookie_low as i32),
            payload: event.payload,
        })
    }
}

/// The outcome of a virtual channel command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VcStatus {
    /// The PF accepted the request.
    Success,
    /// The PF rejected the request.
    Failed(VirtchnlStatus),
    /// No reply arrived in time.
    TimedOut,
    /// The command was flushed by a reset or detach.
    AdapterStopped,
    /// The admin queue would not accept the request.
    SendFailed,
}

impl VcStatus {
    fn from_wire(status: VirtchnlStatus) -> Self {
        if status == VirtchnlStatus::SUCCESS {
            VcStatus::Success
        } else {
            VcStatus::Failed(status)
        }
    }

    /// Returns true for [`VcStatus::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, VcStatus::Success)
    }
}

/// Passed to a command's callback when it finishes.
#[derive(Debug, Clone)]
pub struct VcCompletion {
    /// The command's opcode.
    pub opcode: VirtchnlOp,
    /// How it finished.
    pub status: VcStatus,
    /// The reply body, empty unless the PF answered.
    pub payload: Vec<u8>,
}

/// A command completion callback.
pub type VcCallback = Box<dyn FnOnce(VcCompletion) + Send>;

/// The timer guarding the outstanding command. Expiry is reported to the
/// manager by calling [`VcCommandManager::on_timeout`].
pub trait VcTimer: Send {
    /// Starts or restarts the timer.
    fn arm(&mut self, timeout: Duration);
    /// Stops the timer.
    fn cancel(&mut self);
}

/// A [`VcTimer`] that records a deadline for the owner to poll.
#[derive(Debug, Default)]
pub struct DeadlineTimer {
    deadline: Option<Instant>,
}

impl DeadlineTimer {
    /// The armed deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true if armed and `now` is past the deadline.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

impl VcTimer for DeadlineTimer {
    fn arm(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    fn cancel(&mut self) {
        self.deadline = None;
    }
}

/// The path requests take to the PF.
pub trait VcTransport {
    /// Sends one request.
    fn send_to_pf(&mut self, opcode: VirtchnlOp, payload: &[u8]) -> Result<(), AdminQueueError>;
}

impl VcTransport for AdminQueue {
    fn send_to_pf(&mut self, opcode: VirtchnlOp, payload: &[u8]) -> Result<(), AdminQueueError> {
        let mut desc = AqDesc::direct(AqOpcode::SEND_MSG_TO_PF);
        desc.cookie_high = opcode.0;
        self.send(desc, payload)?;
        Ok(())
    }
}

/// Command manager parameters.
#[derive(Debug, Clone)]
pub struct VcConfig {
    /// How long to wait for each reply.
    pub timeout: Duration,
}

impl Default for VcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

struct PendingVcCommand {
    opcode: VirtchnlOp,
    payload: Vec<u8>,
    callback: VcCallback,
}

struct InFlight {
    opcode: VirtchnlOp,
    callback: VcCallback,
}

/// Commands that have finished but whose callbacks have not been invoked.
///
/// The manager never invokes a callback itself. Its owner drops any lock
/// guarding the manager and then calls [`Self::run`], so a callback is free
/// to queue further commands.
#[must_use = "callbacks are only invoked by `run`"]
#[derive(Default)]
pub struct VcCompletions(Vec<(VcCallback, VcCompletion)>);

impl VcCompletions {
    fn push(&mut self, callback: VcCallback, opcode: VirtchnlOp, status: VcStatus, payload: Vec<u8>) {
        self.0.push((
            callback,
            VcCompletion {
                opcode,
                status,
                payload,
            },
        ));
    }

    /// The number of finished commands.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if nothing finished.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends `other`, keeping completion order.
    pub fn extend(&mut self, other: VcCompletions) {
        self.0.extend(other.0);
    }

    /// Invokes the callbacks in completion order.
    pub fn run(self) {
        for (callback, completion) in self.0 {
            callback(completion);
        }
    }
}

/// Serializes a VF's requests to its PF.
pub struct VcCommandManager<T> {
    timer: T,
    config: VcConfig,
    in_flight: Option<InFlight>,
    pending: VecDeque<PendingVcCommand>,
}

impl<T: VcTimer> VcCommandManager<T> {
    /// Creates an idle manager.
    pub fn new(timer: T, config: VcConfig) -> Self {
        Self {
            timer,
            config,
            in_flight: None,
            pending: VecDeque::new(),
        }
    }

    /// The command timer.
    pub fn timer(&self) -> &T {
        &self.timer
    }

    /// Returns true if nothing is outstanding or queued.
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// The opcode awaiting a reply.
    pub fn in_flight(&self) -> Option<VirtchnlOp> {
        self.in_flight.as_ref().map(|f| f.opcode)
    }

    /// The number of commands queued behind the outstanding one.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queues a command, sending it immediately if nothing is outstanding.
    /// The command comes back completed with [`VcStatus::SendFailed`] if the
    /// admin queue refuses it.
    pub fn enqueue(
        &mut self,
        transport: &mut dyn VcTransport,
        opcode: VirtchnlOp,
        payload: Vec<u8>,
        callback: impl FnOnce(VcCompletion) + Send + 'static,
    ) -> VcCompletions {
        self.pending.push_back(PendingVcCommand {
            opcode,
            payload,
            callback: Box::new(callback),
        });
        let mut done = VcCompletions::default();
        self.dispatch(transport, &mut done);
        done
    }

    /// Queues a typed request.
    pub fn enqueue_request(
        &mut self,
        transport: &mut dyn VcTransport,
        request: &VcRequest,
        callback: impl FnOnce(VcCompletion) + Send + 'static,
    ) -> VcCompletions {
        self.enqueue(transport, request.opcode(), request.encode(), callback)
    }

    /// Queues a typed request and returns a receiver for its completion.
    pub fn request(
        &mut self,
        transport: &mut dyn VcTransport,
        request: &VcRequest,
    ) -> oneshot::Receiver<VcCompletion> {
        let (send, recv) = oneshot::channel();
        // Only this request's sender can finish here.
        self.enqueue_request(transport, request, move |completion| {
            let _ = send.send(completion);
        })
        .run();
        recv
    }

    fn dispatch(&mut self, transport: &mut dyn VcTransport, done: &mut VcCompletions) {
        while self.in_flight.is_none() {
            let Some(command) = self.pending.pop_front() else {
                break;
            };
            match transport.send_to_pf(command.opcode, &command.payload) {
                Ok(()) => {
                    tracing::trace!(opcode = ?command.opcode, "virtchnl request sent");
                    self.timer.arm(self.config.timeout);
                    self.in_flight = Some(InFlight {
                        opcode: command.opcode,
                        callback: command.callback,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        opcode = ?command.opcode,
                        error = &err as &dyn std::error::Error,
                        "failed to send virtchnl request"
                    );
                    done.push(command.callback, command.opcode, VcStatus::SendFailed, Vec::new());
                }
            }
        }
    }

    /// Completes the outstanding command with the PF's reply and sends the
    /// next one.
    ///
    /// Returns `None`, dropping the reply, if it does not answer the
    /// outstanding command.
    pub fn handle_response(
        &mut self,
        transport: &mut dyn VcTransport,
        opcode: VirtchnlOp,
        status: VirtchnlStatus,
        payload: &[u8],
    ) -> Option<VcCompletions> {
        let in_flight = match self.in_flight.take() {
            Some(in_flight) if in_flight.opcode == opcode => in_flight,
            other => {
                tracing::warn!(
                    expected = ?other.as_ref().map(|f| f.opcode),
                    received = ?opcode,
                    "dropping unexpected virtchnl reply"
                );
                self.in_flight = other;
                return None;
            }
        };
        self.timer.cancel();
        if status != VirtchnlStatus::SUCCESS {
            tracing::debug!(?opcode, ?status, "virtchnl request failed");
        }
        let mut done = VcCompletions::default();
        done.push(
            in_flight.callback,
            opcode,
            VcStatus::from_wire(status),
            payload.to_vec(),
        );
        self.dispatch(transport, &mut done);
        Some(done)
    }

    /// Fails the outstanding command after its timer expired and moves on
    /// to the next one.
    pub fn on_timeout(&mut self, transport: &mut dyn VcTransport) -> VcCompletions {
        let mut done = VcCompletions::default();
        let Some(in_flight) = self.in_flight.take() else {
            return done;
        };
        self.timer.cancel();
        tracing::warn!(opcode = ?in_flight.opcode, "virtchnl request timed out");
        done.push(in_flight.callback, in_flight.opcode, VcStatus::TimedOut, Vec::new());
        self.dispatch(transport, &mut done);
        done
    }

    /// Completes the outstanding command and every queued one with
    /// [`VcStatus::AdapterStopped`] without sending anything.
    pub fn flush(&mut self) -> VcCompletions {
        self.timer.cancel();
        let in_flight = self.in_flight.take().map(|f| (f.opcode, f.callback));
        let pending = self.pending.drain(..).map(|c| (c.opcode, c.callback));
        let mut done = VcCompletions::default();
        for (opcode, callback) in in_flight.into_iter().chain(pending) {
            done.push(callback, opcode, VcStatus::AdapterStopped, Vec::new());
        }
        if !done.is_empty() {
            tracing::debug!(flushed = done.len(), "flushed virtchnl commands");
        }
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct FakeTransport {
        sent: Vec<(VirtchnlOp, Vec<u8>)>,
        fail: bool,
    }

    impl VcTransport for FakeTransport {
        fn send_to_pf(&mut self, opcode: VirtchnlOp, payload: &[u8]) -> Result<(), AdminQueueError> {
            if self.fail {
                return Err(AdminQueueError::Full);
            }
            self.sent.push((opcode, payload.to_vec()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingTimer {
        armed: bool,
        arms: usize,
    }

    impl VcTimer for CountingTimer {
        fn arm(&mut self, _timeout: Duration) {
            self.armed = true;
            self.arms += 1;
        }

        fn cancel(&mut self) {
            self.armed = false;
        }
    }

    type Log = Arc<Mutex<Vec<(VirtchnlOp, VcStatus)>>>;

    fn recorder(log: &Log) -> impl FnOnce(VcCompletion) + Send + 'static {
        let log = log.clone();
        move |c| log.lock().push((c.opcode, c.status))
    }

    fn manager() -> VcCommandManager<CountingTimer> {
        VcCommandManager::new(CountingTimer::default(), VcConfig::default())
    }

    fn opcodes(transport: &FakeTransport) -> Vec<VirtchnlOp> {
        transport.sent.iter().map(|(op, _)| *op).collect()
    }

    #[test]
    fn single_outstanding_in_fifo_order() {
        let mut t = FakeTransport::default();
        let mut m = manager();
        let log = Log::default();
        for op in [
            VirtchnlOp::ENABLE_QUEUES,
            VirtchnlOp::GET_STATS,
            VirtchnlOp::DISABLE_QUEUES,
        ] {
            m.enqueue(&mut t, op, Vec::new(), recorder(&log)).run();
        }
        assert_eq!(opcodes(&t), [VirtchnlOp::ENABLE_QUEUES]);
        assert_eq!(m.pending_len(), 2);
        assert!(m.timer().armed);

        m.handle_response(&mut t, VirtchnlOp::ENABLE_QUEUES, VirtchnlStatus::SUCCESS, &[])
            .unwrap()
            .run();
        assert_eq!(
            opcodes(&t),
            [VirtchnlOp::ENABLE_QUEUES, VirtchnlOp::GET_STATS]
        );
        m.handle_response(&mut t, VirtchnlOp::GET_STATS, VirtchnlStatus::ERR_PARAM, &[])
            .unwrap()
            .run();
        m.handle_response(&mut t, VirtchnlOp::DISABLE_QUEUES, VirtchnlStatus::SUCCESS, &[])
            .unwrap()
            .run();
        assert!(m.is_idle());
        assert!(!m.timer().armed);
        assert_eq!(
            *log.lock(),
            [
                (VirtchnlOp::ENABLE_QUEUES, VcStatus::Success),
                (VirtchnlOp::GET_STATS, VcStatus::Failed(VirtchnlStatus::ERR_PARAM)),
                (VirtchnlOp::DISABLE_QUEUES, VcStatus::Success),
            ]
        );
    }

    #[test]
    fn address_then_vlan_ordering() {
        let mut t = FakeTransport::default();
        let mut m = manager();
        let log = Log::default();
        m.enqueue_request(
            &mut t,
            &VcRequest::AddEthAddr {
                vsi_id: 3,
                addrs: vec![[2, 0, 0, 0, 0, 1]],
            },
            recorder(&log),
        )
        .run();
        m.enqueue_request(
            &mut t,
            &VcRequest::AddVlan {
                vsi_id: 3,
                vlans: vec![100],
            },
            recorder(&log),
        )
        .run();
        assert_eq!(opcodes(&t), [VirtchnlOp::ADD_ETH_ADDR]);
        assert_eq!(m.in_flight(), Some(VirtchnlOp::ADD_ETH_ADDR));

        m.handle_response(&mut t, VirtchnlOp::ADD_ETH_ADDR, VirtchnlStatus::SUCCESS, &[])
            .unwrap()
            .run();
        assert_eq!(log.lock().as_slice(), [(VirtchnlOp::ADD_ETH_ADDR, VcStatus::Success)]);
        assert_eq!(opcodes(&t), [VirtchnlOp::ADD_ETH_ADDR, VirtchnlOp::ADD_VLAN]);
        assert_eq!(
            VcRequest::decode(VirtchnlOp::ADD_VLAN, &t.sent[1].1).unwrap(),
            VcRequest::AddVlan {
                vsi_id: 3,
                vlans: vec![100]
            }
        );

        m.handle_response(&mut t, VirtchnlOp::ADD_VLAN, VirtchnlStatus::SUCCESS, &[])
            .unwrap()
            .run();
        assert_eq!(log.lock().len(), 2);
        assert!(m.is_idle());
    }

    #[test]
    fn mismatched_reply_is_dropped() {
        let mut t = FakeTransport::default();
        let mut m = manager();
        let log = Log::default();
        m.enqueue(&mut t, VirtchnlOp::GET_STATS, Vec::new(), recorder(&log)).run();
        assert!(m.handle_response(&mut t, VirtchnlOp::VERSION, VirtchnlStatus::SUCCESS, &[]).is_none());
        assert!(log.lock().is_empty());
        assert_eq!(m.in_flight(), Some(VirtchnlOp::GET_STATS));
        assert!(m.timer().armed);

        let mut idle = manager();
        assert!(idle.handle_response(&mut t, VirtchnlOp::VERSION, VirtchnlStatus::SUCCESS, &[]).is_none());
    }

    #[test]
    fn timeout_fails_and_advances() {
        let mut t = FakeTransport::default();
        let mut m = manager();
        let log = Log::default();
        m.enqueue(&mut t, VirtchnlOp::GET_STATS, Vec::new(), recorder(&log)).run();
        m.enqueue(&mut t, VirtchnlOp::ENABLE_QUEUES, Vec::new(), recorder(&log)).run();
        m.on_timeout(&mut t).run();
        assert_eq!(log.lock().as_slice(), [(VirtchnlOp::GET_STATS, VcStatus::TimedOut)]);
        assert_eq!(m.in_flight(), Some(VirtchnlOp::ENABLE_QUEUES));
        assert_eq!(m.timer().arms, 2);
        // A late reply to the timed out request is not matched.
        assert!(m.handle_response(&mut t, VirtchnlOp::GET_STATS, VirtchnlStatus::SUCCESS, &[]).is_none());
    }

    #[test]
    fn flush_resolves_everything() {
        let mut t = FakeTransport::default();
        let mut m = manager();
        let log = Log::default();
        for op in [
            VirtchnlOp::ADD_ETH_ADDR,
            VirtchnlOp::ADD_VLAN,
            VirtchnlOp::CONFIG_PROMISCUOUS_MODE,
        ] {
            m.enqueue(&mut t, op, Vec::new(), recorder(&log)).run();
        }
        let flushed = m.flush();
        assert!(m.is_idle());
        assert!(log.lock().is_empty());
        flushed.run();
        assert!(!m.timer().armed);
        let log = log.lock();
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|(_, s)| *s == VcStatus::AdapterStopped));
        assert_eq!(log[0].0, VirtchnlOp::ADD_ETH_ADDR);
        assert_eq!(t.sent.len(), 1);
    }

    #[test]
    fn send_failure_completes_immediately() {
        let mut t = FakeTransport {
            fail: true,
            ..Default::default()
        };
        let mut m = manager();
        let log = Log::default();
        m.enqueue(&mut t, VirtchnlOp::GET_STATS, Vec::new(), recorder(&log)).run();
        m.enqueue(&mut t, VirtchnlOp::ADD_VLAN, Vec::new(), recorder(&log)).run();
        assert!(m.is_idle());
        assert_eq!(
            log.lock().as_slice(),
            [
                (VirtchnlOp::GET_STATS, VcStatus::SendFailed),
                (VirtchnlOp::ADD_VLAN, VcStatus::SendFailed),
            ]
        );
    }

    #[test]
    fn request_future_resolves() {
        let mut t = FakeTransport::default();
        let mut m = manager();
        let recv = m.request(&mut t, &VcRequest::GetRssHenaCaps);
        let hena = RssHena { hena: 0x3f };
        m.handle_response(
            &mut t,
            VirtchnlOp::GET_RSS_HENA_CAPS,
            VirtchnlStatus::SUCCESS,
            hena.as_bytes(),
        )
        .unwrap()
        .run();
        let completion = futures::executor::block_on(recv).unwrap();
        assert!(completion.status.is_success());
        let reply: RssHena = decode_reply(completion.opcode, &completion.payload).unwrap();
        assert_eq!(reply.hena, 0x3f);
    }

    #[test]
    fn decode_validates_lengths() {
        let op = VirtchnlOp::CONFIG_VSI_QUEUES;
        let request = VcRequest::ConfigVsiQueues {
            vsi_id: 1,
            queue_pairs: vec![QueuePairInfo::default(); 2],
        };
        let mut bytes = request.encode();
        assert_eq!(bytes.len(), 8 + 2 * 64);
        assert_eq!(VcRequest::decode(op, &bytes).unwrap(), request);

        bytes.pop();
        assert!(matches!(
            VcRequest::decode(op, &bytes),
            Err(VcDecodeError::LengthMismatch { count: 2, .. })
        ));
        assert_eq!(
            VcRequest::decode(op, &bytes[..4]),
            Err(VcDecodeError::TooShort { op, len: 4 })
        );
        assert_eq!(
            VcRequest::decode(VirtchnlOp::ENABLE_QUEUES, &[0; 13]),
            Err(VcDecodeError::LengthMismatch {
                op: VirtchnlOp::ENABLE_QUEUES,
                len: 1,
                count: 0
            })
        );
        assert_eq!(
            VcRequest::decode(VirtchnlOp::CONFIG_TX_QUEUE, &[]),
            Err(VcDecodeError::Unsupported(VirtchnlOp::CONFIG_TX_QUEUE))
        );
        assert_eq!(
            VcRequest::decode(VirtchnlOp::GET_VF_RESOURCES, &[]).unwrap(),
            VcRequest::GetVfResources { caps: 0 }
        );
    }
}
