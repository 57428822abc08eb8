// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The VF control plane: version and resource negotiation with the PF,
//! command submission, event dispatch and reset.
//!
//! Command callbacks are invoked after the control plane's lock is released,
//! so a callback may queue further commands or query the VF.

use crate::adminq::AdminQueue;
use crate::adminq::AdminQueueError;
use crate::queue::QueuePair;
use crate::tx::TxBuffer;
use crate::virtchnl::DeadlineTimer;
use crate::virtchnl::PfMessage;
use crate::virtchnl::VcCommandManager;
use crate::virtchnl::VcCompletion;
use crate::virtchnl::VcCompletions;
use crate::virtchnl::VcConfig;
use crate::virtchnl::VcRequest;
use crate::virtchnl::VcTimer;
use crate::virtchnl::VcTransport;
use crate::virtchnl::VfResources;
use crate::virtchnl::decode_reply;
use anyhow::Context;
use futures::channel::oneshot;
use i40e_defs::aq::AqRetval;
use i40e_defs::virtchnl;
use i40e_defs::virtchnl::LinkSpeed;
use i40e_defs::virtchnl::PfEvent;
use i40e_defs::virtchnl::PfEventType;
use i40e_defs::virtchnl::VersionInfo;
use i40e_defs::virtchnl::VirtchnlOp;
use i40e_defs::virtchnl::VirtchnlStatus;
use parking_lot::Mutex;
use std::time::Instant;
use thiserror::Error;

/// Offloads this driver asks for.
const REQUESTED_OFFLOADS: u32 = virtchnl::VF_OFFLOAD_L2
    | virtchnl::VF_OFFLOAD_VLAN
    | virtchnl::VF_OFFLOAD_RSS_PF
    | virtchnl::VF_OFFLOAD_WB_ON_ITR;

/// An unsolicited notification from the PF.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VfEvent {
    /// The physical link changed state.
    LinkChanged {
        /// Link is up.
        up: bool,
        /// The new speed.
        speed: LinkSpeed,
    },
    /// The PF is about to reset; the VF must reset too.
    ResetImpending,
    /// The PF driver is unloading.
    PfDriverClose,
}

/// The admin channel failed and the VF must be reset.
#[derive(Debug, Error)]
#[error("vf reset required")]
pub struct ResetRequest {
    /// What went wrong.
    #[source]
    pub cause: AdminQueueError,
}

impl From<AdminQueueError> for ResetRequest {
    fn from(cause: AdminQueueError) -> Self {
        Self { cause }
    }
}

fn vf_event(event: &PfEvent) -> Option<VfEvent> {
    let vf_event = match event.event {
        PfEventType::LINK_CHANGE => VfEvent::LinkChanged {
            up: event.link_status != 0,
            speed: event.link_speed,
        },
        PfEventType::RESET_IMPENDING => VfEvent::ResetImpending,
        PfEventType::PF_DRIVER_CLOSE => VfEvent::PfDriverClose,
        other => {
            tracing::debug!(event = ?other, "unknown pf event");
            return None;
        }
    };
    tracing::debug!(?vf_event, "pf event");
    Some(vf_event)
}

struct VfState<T> {
    aq: AdminQueue,
    vc: VcCommandManager<T>,
    version: Option<VersionInfo>,
    resources: Option<VfResources>,
    /// Events received but not yet returned by `process_admin_queue`.
    events: Vec<VfEvent>,
}

impl<T: VcTimer> VfState<T> {
    /// Routes a PF message that is not a bring-up reply.
    fn dispatch(&mut self, message: PfMessage, done: &mut VcCompletions) {
        if message.opcode == VirtchnlOp::EVENT {
            match decode_reply::<PfEvent>(VirtchnlOp::EVENT, &message.payload) {
                Ok(event) => self.events.extend(vf_event(&event)),
                Err(err) => tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "malformed pf event"
                ),
            }
            return;
        }
        if let Some(completed) = self.vc.handle_response(
            &mut self.aq,
            message.opcode,
            message.status,
            &message.payload,
        ) {
            done.extend(completed);
        }
    }

    /// Drains the receive queue, stopping at the first reply to `op`.
    fn take_reply(
        &mut self,
        op: VirtchnlOp,
        done: &mut VcCompletions,
    ) -> Result<Option<PfMessage>, AdminQueueError> {
        while let Some(event) = self.aq.next_event()? {
            let Some(message) = PfMessage::from_event(event) else {
                continue;
            };
            if message.opcode == op {
                return Ok(Some(message));
            }
            self.dispatch(message, done);
        }
        Ok(None)
    }

    fn process(&mut self, done: &mut VcCompletions) -> Result<Vec<VfEvent>, ResetRequest> {
        for completion in self.aq.complete_sends()? {
            if completion.status() != AqRetval::OK {
                tracing::warn!(
                    opcode = completion.desc.cookie_high,
                    status = ?completion.status(),
                    "pf mailbox rejected message"
                );
            }
        }
        while let Some(event) = self.aq.next_event()? {
            match PfMessage::from_event(event) {
                Some(message) => self.dispatch(message, done),
                None => tracing::debug!("ignoring non-mailbox admin event"),
            }
        }
        Ok(std::mem::take(&mut self.events))
    }
}

/// A VF's control plane. One lock covers the admin queue and the command
/// manager.
pub struct VfControl<T = DeadlineTimer> {
    state: Mutex<VfState<T>>,
}

impl<T: VcTimer> VfControl<T> {
    /// Takes ownership of an initialized VF admin queue.
    pub fn new(aq: AdminQueue, timer: T, config: VcConfig) -> Self {
        Self {
            state: Mutex::new(VfState {
                aq,
                vc: VcCommandManager::new(timer, config),
                version: None,
                resources: None,
                events: Vec::new(),
            }),
        }
    }

    /// Polls for the PF's reply to `op`, sleeping between polls with the lock
    /// released. Other messages are handled as they arrive.
    fn wait_for_reply(&self, op: VirtchnlOp) -> anyhow::Result<Vec<u8>> {
        let (retries, delay) = {
            let state = self.state.lock();
            let config = state.aq.config();
            (config.drain_retries, config.drain_delay)
        };
        for _ in 0..retries {
            let mut done = VcCompletions::default();
            let reply = self.state.lock().take_reply(op, &mut done);
            done.run();
            let reply =
                reply.with_context(|| format!("admin queue failed waiting for {op:?}"))?;
            if let Some(message) = reply {
                if message.status != VirtchnlStatus::SUCCESS {
                    anyhow::bail!("{op:?} failed with {:?}", message.status);
                }
                return Ok(message.payload);
            }
            std::thread::sleep(delay);
        }
        anyhow::bail!("no {op:?} reply from pf after {retries} polls")
    }

    fn send_sync(&self, request: &VcRequest, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let op = request.opcode();
        self.state
            .lock()
            .aq
            .send_to_pf(op, payload)
            .with_context(|| format!("failed to send {op:?}"))?;
        self.wait_for_reply(op)
    }

    /// Exchanges protocol versions with the PF, before interrupts are
    /// available.
    pub fn negotiate_version(&self) -> anyhow::Result<VersionInfo> {
        let ours = VersionInfo {
            major: virtchnl::VERSION_MAJOR,
            minor: virtchnl::VERSION_MINOR,
        };
        let request = VcRequest::Version(ours);
        let reply = self.send_sync(&request, &request.encode())?;
        let theirs: VersionInfo = decode_reply(VirtchnlOp::VERSION, &reply)?;
        if theirs.major != ours.major || theirs.minor > ours.minor {
            anyhow::bail!(
                "pf virtchnl version {}.{} is not compatible with {}.{}",
                theirs.major,
                theirs.minor,
                ours.major,
                ours.minor
            );
        }
        tracing::info!(major = theirs.major, minor = theirs.minor, "virtchnl version negotiated");
        self.state.lock().version = Some(theirs);
        Ok(theirs)
    }

    /// Asks the PF for the VF's queues, vectors and VSI.
    pub fn get_resources(&self) -> anyhow::Result<VfResources> {
        let version = self.state.lock().version.context("version not negotiated")?;
        // Version 1.0 PFs expect an empty request.
        let caps = if version.minor == 0 { 0 } else { REQUESTED_OFFLOADS };
        let request = VcRequest::GetVfResources { caps };
        let payload = if caps == 0 { Vec::new() } else { request.encode() };
        let reply = self.send_sync(&request, &payload)?;
        let resources = VfResources::decode(&reply)?;
        let vsi = resources
            .sriov_vsi()
            .context("pf granted no sr-iov vsi")?;
        tracing::info!(
            vsi_id = vsi.vsi_id,
            queue_pairs = resources.header.num_queue_pairs,
            offloads = resources.header.vf_offload_flags,
            "vf resources received"
        );
        self.state.lock().resources = Some(resources.clone());
        Ok(resources)
    }

    /// The resources granted by the PF.
    pub fn resources(&self) -> Option<VfResources> {
        self.state.lock().resources.clone()
    }

    /// The VSI to address in requests.
    pub fn vsi_id(&self) -> Option<u16> {
        let state = self.state.lock();
        state
            .resources
            .as_ref()
            .and_then(|r| r.sriov_vsi())
            .map(|vsi| vsi.vsi_id)
    }

    /// Queues a request for the PF. `callback` may run before this returns
    /// if the request cannot be sent.
    pub fn enqueue(
        &self,
        request: &VcRequest,
        callback: impl FnOnce(VcCompletion) + Send + 'static,
    ) {
        let done = {
            let state = &mut *self.state.lock();
            state.vc.enqueue_request(&mut state.aq, request, callback)
        };
        done.run();
    }

    /// Queues a request and returns a receiver for its completion.
    pub fn request(&self, request: &VcRequest) -> oneshot::Receiver<VcCompletion> {
        let state = &mut *self.state.lock();
        state.vc.request(&mut state.aq, request)
    }

    /// Handles everything waiting on the admin queue: send completions,
    /// replies to outstanding commands, and PF events.
    pub fn process_admin_queue(&self) -> Result<Vec<VfEvent>, ResetRequest> {
        let mut done = VcCompletions::default();
        let result = self.state.lock().process(&mut done);
        done.run();
        result
    }

    /// Fails the outstanding command because its timer expired.
    pub fn on_timeout(&self) {
        let done = {
            let state = &mut *self.state.lock();
            state.vc.on_timeout(&mut state.aq)
        };
        done.run();
    }

    /// Returns true if no command is outstanding or queued.
    pub fn is_idle(&self) -> bool {
        self.state.lock().vc.is_idle()
    }

    /// Resets the control plane: flushes every command with
    /// `AdapterStopped`, shuts down the admin queue, and drains the VF's
    /// queue pairs. Packets still held by the transmit rings are returned in
    /// `completed`.
    pub fn reset<B: TxBuffer>(&self, queues: &[QueuePair<B>], completed: &mut Vec<B>) {
        let flushed = {
            let mut state = self.state.lock();
            let flushed = state.vc.flush();
            state.aq.shutdown();
            state.resources = None;
            state.version = None;
            state.events.clear();
            for queue in queues {
                queue.drain(completed);
            }
            flushed
        };
        tracing::info!(queues = queues.len(), flushed = flushed.len(), "vf reset");
        flushed.run();
    }
}

impl VfControl<DeadlineTimer> {
    /// Expires the outstanding command if its deadline has passed. Returns
    /// true if it did.
    pub fn poll_timeout(&self, now: Instant) -> bool {
        let done = {
            let state = &mut *self.state.lock();
            if !state.vc.timer().is_expired(now) {
                return false;
            }
            state.vc.on_timeout(&mut state.aq)
        };
        done.run();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adminq::AdminQueueConfig;
    use crate::adminq::AdminQueueRegisters;
    use crate::emulated::DeviceSharedMemory;
    use crate::emulated::EmulatedAdminQueue;
    use crate::emulated::EmulatedRegisters;
    use crate::virtchnl::VcStatus;
    use i40e_defs::aq::AqDesc;
    use i40e_defs::aq::AqOpcode;
    use i40e_defs::regs;
    use i40e_defs::regs::AqLen;
    use i40e_defs::virtchnl::VfResourceHeader;
    use i40e_defs::virtchnl::VsiResource;
    use i40e_defs::virtchnl::VsiType;
    use std::sync::Arc;
    use std::time::Duration;
    use zerocopy::IntoBytes;

    struct Harness {
        regs: Arc<EmulatedRegisters>,
        pf: EmulatedAdminQueue,
        vf: Arc<VfControl>,
    }

    fn harness(timeout: Duration) -> Harness {
        harness_with(
            timeout,
            AdminQueueConfig {
                drain_retries: 2,
                drain_delay: Duration::ZERO,
                ..Default::default()
            },
        )
    }

    fn harness_with(timeout: Duration, aq_config: AdminQueueConfig) -> Harness {
        let mem = DeviceSharedMemory::new(0x100000);
        let regs = Arc::new(EmulatedRegisters::new());
        let aq = AdminQueue::new(
            regs.clone(),
            mem.dma_client().as_ref(),
            AdminQueueRegisters::VF,
            aq_config,
        )
        .unwrap();
        Harness {
            pf: EmulatedAdminQueue::new(mem, regs.clone(), AdminQueueRegisters::VF),
            regs,
            vf: Arc::new(VfControl::new(
                aq,
                DeadlineTimer::default(),
                VcConfig { timeout },
            )),
        }
    }

    impl Harness {
        fn reply(&mut self, op: VirtchnlOp, status: VirtchnlStatus, payload: &[u8]) {
            let mut desc = AqDesc::direct(AqOpcode::SEND_MSG_TO_VF);
            desc.cookie_high = op.0;
            desc.cookie_low = status.0 as u32;
            assert!(self.pf.post_event(desc, payload));
        }

        fn event(&mut self, event: PfEventType, link_status: u8) {
            let event = PfEvent {
                event,
                link_speed: LinkSpeed::SPEED_40GB,
                link_status,
                pad: [0; 3],
                severity: 0,
            };
            self.reply(VirtchnlOp::EVENT, VirtchnlStatus::SUCCESS, event.as_bytes());
        }

        fn sent_opcodes(&mut self) -> Vec<VirtchnlOp> {
            self.pf
                .take_requests()
                .iter()
                .map(|r| VirtchnlOp(r.desc.cookie_high))
                .collect()
        }

        fn bring_up(&mut self) {
            self.reply(
                VirtchnlOp::VERSION,
                VirtchnlStatus::SUCCESS,
                VersionInfo { major: 1, minor: 1 }.as_bytes(),
            );
            self.vf.negotiate_version().unwrap();
            let resources = VfResources {
                header: VfResourceHeader {
                    num_vsis: 1,
                    num_queue_pairs: 4,
                    max_vectors: 5,
                    max_mtu: 9706,
                    vf_offload_flags: virtchnl::VF_OFFLOAD_L2,
                    rss_key_size: 52,
                    rss_lut_size: 64,
                },
                vsis: vec![VsiResource {
                    vsi_id: 16,
                    num_queue_pairs: 4,
                    vsi_type: VsiType::SRIOV,
                    qset_handle: 0,
                    default_mac_addr: [2, 0, 0, 0, 0, 1],
                }],
            };
            self.reply(
                VirtchnlOp::GET_VF_RESOURCES,
                VirtchnlStatus::SUCCESS,
                &resources.encode(),
            );
            self.vf.get_resources().unwrap();
            self.pf.take_requests();
        }
    }

    type Log = Arc<parking_lot::Mutex<Vec<(VirtchnlOp, VcStatus)>>>;

    fn recorder(log: &Log) -> impl FnOnce(VcCompletion) + Send + 'static {
        let log = log.clone();
        move |c| log.lock().push((c.opcode, c.status))
    }

    #[test]
    fn bring_up_skips_unrelated_messages() {
        let mut h = harness(Duration::from_secs(1));
        h.event(PfEventType::LINK_CHANGE, 1);
        h.reply(
            VirtchnlOp::VERSION,
            VirtchnlStatus::SUCCESS,
            VersionInfo { major: 1, minor: 1 }.as_bytes(),
        );
        let version = h.vf.negotiate_version().unwrap();
        assert_eq!((version.major, version.minor), (1, 1));
        assert_eq!(h.sent_opcodes(), [VirtchnlOp::VERSION]);
        // The event that arrived first is held for the next processing pass.
        assert_eq!(
            h.vf.process_admin_queue().unwrap(),
            [VfEvent::LinkChanged {
                up: true,
                speed: LinkSpeed::SPEED_40GB
            }]
        );
        assert!(h.vf.process_admin_queue().unwrap().is_empty());
    }

    #[test]
    fn bring_up_completes_queued_commands() {
        let mut h = harness(Duration::from_secs(1));
        let log = Log::default();
        h.vf.enqueue(
            &VcRequest::AddVlan {
                vsi_id: 16,
                vlans: vec![7],
            },
            recorder(&log),
        );
        h.reply(VirtchnlOp::ADD_VLAN, VirtchnlStatus::SUCCESS, &[]);
        h.reply(
            VirtchnlOp::VERSION,
            VirtchnlStatus::SUCCESS,
            VersionInfo { major: 1, minor: 1 }.as_bytes(),
        );
        h.vf.negotiate_version().unwrap();
        assert_eq!(log.lock().as_slice(), [(VirtchnlOp::ADD_VLAN, VcStatus::Success)]);
        assert!(h.vf.is_idle());
    }

    #[test]
    fn control_plane_usable_while_bring_up_waits() {
        let mut h = harness_with(
            Duration::from_secs(1),
            AdminQueueConfig {
                drain_retries: 2000,
                drain_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let bring_up = std::thread::spawn({
            let vf = h.vf.clone();
            move || vf.negotiate_version()
        });
        let mut sent = Vec::new();
        while sent.is_empty() {
            std::thread::yield_now();
            sent = h.sent_opcodes();
        }
        assert_eq!(sent, [VirtchnlOp::VERSION]);
        assert!(h.vf.is_idle());
        assert!(h.vf.vsi_id().is_none());
        assert!(!bring_up.is_finished());

        h.reply(
            VirtchnlOp::VERSION,
            VirtchnlStatus::SUCCESS,
            VersionInfo { major: 1, minor: 1 }.as_bytes(),
        );
        let version = bring_up.join().unwrap().unwrap();
        assert_eq!((version.major, version.minor), (1, 1));
    }

    #[test]
    fn incompatible_version_fails() {
        let mut h = harness(Duration::from_secs(1));
        h.reply(
            VirtchnlOp::VERSION,
            VirtchnlStatus::SUCCESS,
            VersionInfo { major: 2, minor: 0 }.as_bytes(),
        );
        assert!(h.vf.negotiate_version().is_err());
        assert!(h.vf.get_resources().is_err());
    }

    #[test]
    fn bring_up_times_out() {
        let h = harness(Duration::from_secs(1));
        assert!(h.vf.negotiate_version().is_err());
    }

    #[test]
    fn resources_are_recorded() {
        let mut h = harness(Duration::from_secs(1));
        h.bring_up();
        assert_eq!(h.vf.vsi_id(), Some(16));
        assert_eq!(h.vf.resources().unwrap().header.num_queue_pairs, 4);
    }

    #[test]
    fn replies_and_events_are_dispatched() {
        let mut h = harness(Duration::from_secs(1));
        h.bring_up();
        let log = Log::default();
        h.vf.enqueue(
            &VcRequest::AddEthAddr {
                vsi_id: 16,
                addrs: vec![[2, 0, 0, 0, 0, 1]],
            },
            recorder(&log),
        );
        h.vf.enqueue(
            &VcRequest::AddVlan {
                vsi_id: 16,
                vlans: vec![5],
            },
            recorder(&log),
        );
        assert_eq!(h.sent_opcodes(), [VirtchnlOp::ADD_ETH_ADDR]);

        h.reply(VirtchnlOp::ADD_ETH_ADDR, VirtchnlStatus::SUCCESS, &[]);
        h.event(PfEventType::LINK_CHANGE, 1);
        let events = h.vf.process_admin_queue().unwrap();
        assert_eq!(
            events,
            [VfEvent::LinkChanged {
                up: true,
                speed: LinkSpeed::SPEED_40GB
            }]
        );
        assert_eq!(log.lock().as_slice(), [(VirtchnlOp::ADD_ETH_ADDR, VcStatus::Success)]);
        assert_eq!(h.sent_opcodes(), [VirtchnlOp::ADD_VLAN]);

        h.reply(VirtchnlOp::ADD_VLAN, VirtchnlStatus::ERR_PARAM, &[]);
        h.event(PfEventType::RESET_IMPENDING, 0);
        assert_eq!(h.vf.process_admin_queue().unwrap(), [VfEvent::ResetImpending]);
        assert_eq!(
            log.lock()[1],
            (VirtchnlOp::ADD_VLAN, VcStatus::Failed(VirtchnlStatus::ERR_PARAM))
        );
        assert!(h.vf.is_idle());
    }

    #[test]
    fn deadline_expiry_times_out_command() {
        let mut h = harness(Duration::ZERO);
        h.bring_up();
        let recv = h.vf.request(&VcRequest::GetRssHenaCaps);
        assert!(h.vf.poll_timeout(Instant::now()));
        let completion = futures::executor::block_on(recv).unwrap();
        assert_eq!(completion.status, VcStatus::TimedOut);
        assert!(!h.vf.poll_timeout(Instant::now()));
    }

    #[test]
    fn timed_out_callback_can_retry() {
        let mut h = harness(Duration::ZERO);
        h.bring_up();
        let log = Log::default();
        h.vf.enqueue(&VcRequest::GetRssHenaCaps, {
            let vf = h.vf.clone();
            let log = log.clone();
            move |c| {
                log.lock().push((c.opcode, c.status));
                if c.status == VcStatus::TimedOut {
                    vf.enqueue(
                        &VcRequest::AddVlan {
                            vsi_id: 16,
                            vlans: vec![3],
                        },
                        recorder(&log),
                    );
                }
            }
        });
        assert!(h.vf.poll_timeout(Instant::now()));
        assert_eq!(
            h.sent_opcodes(),
            [VirtchnlOp::GET_RSS_HENA_CAPS, VirtchnlOp::ADD_VLAN]
        );
        assert!(!h.vf.is_idle());

        h.reply(VirtchnlOp::ADD_VLAN, VirtchnlStatus::SUCCESS, &[]);
        h.vf.process_admin_queue().unwrap();
        assert_eq!(
            log.lock().as_slice(),
            [
                (VirtchnlOp::GET_RSS_HENA_CAPS, VcStatus::TimedOut),
                (VirtchnlOp::ADD_VLAN, VcStatus::Success),
            ]
        );
        assert!(h.vf.is_idle());
    }

    #[test]
    fn reset_callbacks_can_query_the_vf() {
        let mut h = harness(Duration::from_secs(1));
        h.bring_up();
        let idle = Arc::new(parking_lot::Mutex::new(None));
        h.vf.enqueue(&VcRequest::GetRssHenaCaps, {
            let vf = h.vf.clone();
            let idle = idle.clone();
            move |_| *idle.lock() = Some(vf.is_idle())
        });
        let mut completed: Vec<crate::tests::TestPacket> = Vec::new();
        h.vf.reset(&[], &mut completed);
        assert_eq!(*idle.lock(), Some(true));
    }

    #[test]
    fn channel_fault_requests_reset() {
        let mut h = harness(Duration::from_secs(1));
        h.bring_up();
        h.pf.inject_fault(AqLen::new().with_vfe(true));
        let err = h.vf.process_admin_queue().unwrap_err();
        assert!(matches!(err.cause, AdminQueueError::Fatal { .. }));
    }

    #[test]
    fn reset_flushes_and_shuts_down() {
        let mut h = harness(Duration::from_secs(1));
        h.bring_up();
        let log = Log::default();
        for vlan in [1, 2] {
            h.vf.enqueue(
                &VcRequest::AddVlan {
                    vsi_id: 16,
                    vlans: vec![vlan],
                },
                recorder(&log),
            );
        }
        let mut completed: Vec<crate::tests::TestPacket> = Vec::new();
        h.vf.reset(&[], &mut completed);
        assert_eq!(log.lock().len(), 2);
        assert!(log.lock().iter().all(|(_, s)| *s == VcStatus::AdapterStopped));
        assert_eq!(h.regs.get(regs::VF_ATQLEN1), 0);
        assert!(h.vf.vsi_id().is_none());
        assert!(matches!(
            h.vf.process_admin_queue(),
            Err(ResetRequest {
                cause: AdminQueueError::ShutDown
            })
        ));
    }
}
