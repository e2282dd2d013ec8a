//! The root of the control plane: one single-threaded work loop over a
//! kill signal, a command queue, and a response queue.
//!
//! All graph state is owned by this loop; containers run elsewhere and
//! talk back through the response queue, so nothing here needs a lock.
//! Long operations never block the loop: they fan out to containers and
//! re-enter through the response aggregator.

use std::cell::{RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use apm_channel::{Channel, Queue, QueueSender, Signal};
use apm_logging::Registry;

use crate::cmd::ctrl::CmdOrigin;
use crate::cmd::sequencer::{self, SeqCursor, StepOutcome};
use crate::cmd::{CmdTable, DeferredCmds};
use crate::graph::db::GraphDb;
use crate::graph::sort::SortReport;
use crate::graph::ContainerId;
use crate::logging::{ApmEvent, ApmLogger, CommandEvent, CommandEventKind, GraphEvent};
use crate::messages::container::{ContainerFactory, ContainerHost, ContainerMsg, ContainerPayload, ContainerOpcode, CmdToken, Responder};
use crate::messages::payload::{decode_params, from_oob_bytes, CfgPayload, CmdPayload};
use crate::messages::{ClientReply, CmdOpcode, GprPacket, InternalMsg, MsgFamily, SpfMsg, SpfState};
use crate::pwr::{PowerMgr, PowerVotes};
use crate::shmem::SharedMemRegistry;
use crate::status::ApmError;

/// Channel bit of the one-shot kill signal.
pub const KILL_SIG_MASK: u32 = 1 << 0;
/// Channel bit of the command queue.
pub const CMD_Q_MASK: u32 = 1 << 1;
/// Channel bit of the response queue.
pub const RSP_Q_MASK: u32 = 1 << 2;
/// Channel bit of the optional system-utility queue.
pub const SYS_Q_MASK: u32 = 1 << 3;

/// Process-wide configuration. No environment variables, no CLI, no
/// files; everything is decided at construction.
#[derive(Clone, Debug)]
pub struct Config {
    pub cmd_queue_depth: usize,
    /// Typically larger than the command depth: one command can owe many
    /// container responses.
    pub rsp_queue_depth: usize,
    /// Advisory wall-clock ceiling per command, measured from slot
    /// allocation to release.
    pub cmd_time_ceiling: Duration,
    /// Panic instead of logging when the ceiling is exceeded.
    pub fatal_on_cmd_overrun: bool,
    /// Delay of the power-vote release once the vote count reaches zero.
    pub pm_release_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cmd_queue_depth: 16,
            rsp_queue_depth: 32,
            cmd_time_ceiling: Duration::from_millis(800),
            fatal_on_cmd_overrun: false,
            pm_release_delay: Duration::from_millis(40),
        }
    }
}

type QHandler = fn(&mut Apm, SpfMsg) -> Result<(), ApmError>;

/// Dispatch table indexed by `(queue, message family)`.
const PROCESS_Q_TABLE: [[QHandler; 2]; 2] = [
    [Apm::cmdq_external_handler, Apm::cmdq_internal_handler],
    [Apm::rspq_external_handler, Apm::rspq_internal_handler],
];

/// The control plane instance. Create one with [`Apm::create`] and drive
/// it with [`Apm::step_or_park`], or hand it its own thread via
/// [`execute`].
pub struct Apm {
    pub(crate) config: Config,
    channel: Channel,
    kill: Signal,
    queues: [Queue<SpfMsg>; 2],
    sys_queue: Option<Queue<SpfMsg>>,
    pub(crate) curr_wait_mask: u32,
    pub(crate) db: GraphDb,
    pub(crate) cmds: CmdTable,
    pub(crate) deferred: DeferredCmds,
    pub(crate) hosts: BTreeMap<ContainerId, Box<dyn ContainerHost>>,
    pub(crate) factory: Box<dyn ContainerFactory>,
    pub(crate) pwr: PowerVotes,
    pub(crate) shmem: SharedMemRegistry,
    logging: Rc<RefCell<Registry>>,
    pub(crate) logger: Option<ApmLogger>,
    replies: mpsc::Sender<ClientReply>,
    rsp_sender: QueueSender<SpfMsg>,
}

/// The client half: submit commands, read replies, kill the loop.
pub struct ApmClient {
    cmds: QueueSender<SpfMsg>,
    kill: Signal,
    replies: mpsc::Receiver<ClientReply>,
}

impl ApmClient {
    /// Submits an external RPC packet. A full command queue refuses the
    /// packet instead of dropping it.
    pub fn send(&self, packet: GprPacket) -> Result<(), ApmError> {
        self.cmds
            .push(SpfMsg::External(packet))
            .map_err(|_| ApmError::NoResource)
    }

    /// Submits an internal inter-component message.
    pub fn send_internal(&self, msg: InternalMsg) -> Result<(), ApmError> {
        self.cmds
            .push(SpfMsg::Internal(msg))
            .map_err(|_| ApmError::NoResource)
    }

    /// A reply, if one is waiting.
    pub fn try_reply(&self) -> Option<ClientReply> {
        self.replies.try_recv().ok()
    }

    /// Blocks up to `timeout` for the next reply.
    pub fn reply_timeout(&self, timeout: Duration) -> Option<ClientReply> {
        self.replies.recv_timeout(timeout).ok()
    }

    /// Fires the one-shot kill signal. No graceful drain is attempted.
    pub fn kill(&self) {
        self.kill.set();
    }
}

impl Apm {
    /// Creates the control plane and its client handle: channel, kill
    /// signal, both queues, registries, and the power-manager
    /// registration.
    pub fn create(
        config: Config,
        factory: Box<dyn ContainerFactory>,
        pwr_mgr: Box<dyn PowerMgr>,
    ) -> (Apm, ApmClient) {
        let mut channel = Channel::new();
        let kill = channel.signal(KILL_SIG_MASK);
        let cmd_q = channel.queue(CMD_Q_MASK, config.cmd_queue_depth);
        let rsp_q = channel.queue(RSP_Q_MASK, config.rsp_queue_depth);
        let (reply_tx, reply_rx) = mpsc::channel();

        let client = ApmClient {
            cmds: cmd_q.sender(),
            kill: kill.clone(),
            replies: reply_rx,
        };
        let rsp_sender = rsp_q.sender();
        let pm_delay = config.pm_release_delay;

        let apm = Apm {
            config,
            channel,
            kill,
            queues: [cmd_q, rsp_q],
            sys_queue: None,
            curr_wait_mask: KILL_SIG_MASK | CMD_Q_MASK | RSP_Q_MASK,
            db: GraphDb::new(),
            cmds: CmdTable::new(),
            deferred: DeferredCmds::default(),
            hosts: BTreeMap::new(),
            factory,
            pwr: PowerVotes::new(pwr_mgr, pm_delay),
            shmem: SharedMemRegistry::new(),
            logging: Rc::new(RefCell::new(Registry::new(Instant::now()))),
            logger: None,
            replies: reply_tx,
            rsp_sender,
        };
        (apm, client)
    }

    /// Attaches the optional system-utility queue, drained to completion
    /// ahead of everything else on each wake-up.
    pub fn attach_system_queue(&mut self, depth: usize) -> QueueSender<SpfMsg> {
        let queue = self.channel.queue(SYS_Q_MASK, depth);
        let sender = queue.sender();
        self.curr_wait_mask |= SYS_Q_MASK;
        self.sys_queue = Some(queue);
        sender
    }

    /// Access to named loggers; install an "apm" stream of
    /// [`ApmEvent`]s to observe the control plane.
    pub fn log_register(&self) -> RefMut<Registry> {
        self.logging.borrow_mut()
    }

    /// Performs one iteration of the work loop.
    ///
    /// Parks on the current wait mask (optionally up to `timeout`), then,
    /// strictly in order: honours the kill signal, drains the system
    /// queue, exhausts the response queue, and takes one poll of the full
    /// mask. Returns false once killed.
    pub fn step_or_park(&mut self, timeout: Option<Duration>) -> bool {
        if self.logger.is_none() {
            self.logger = self.logging.borrow().get("apm");
        }

        let status = match timeout {
            None => self.channel.wait(self.curr_wait_mask),
            Some(timeout) => self.channel.wait_timeout(self.curr_wait_mask, timeout),
        };

        if status & KILL_SIG_MASK != 0 {
            self.kill.clear();
            return false;
        }

        // System-queue commands are handled before anything else.
        loop {
            let msg = match &self.sys_queue {
                Some(queue) => queue.pop(),
                None => None,
            };
            match msg {
                Some(msg) => {
                    let _ = Self::cmdq_internal_handler(self, msg);
                }
                None => break,
            }
        }

        // Exhaust pending responses so in-flight commands progress before
        // new ones are admitted.
        loop {
            let rsp_status = self.channel.poll(RSP_Q_MASK);
            if rsp_status == 0 {
                break;
            }
            self.process_queues(rsp_status);
        }

        // One poll over whatever remains selected.
        let status = self
            .channel
            .poll(self.curr_wait_mask & !(KILL_SIG_MASK | SYS_Q_MASK));
        self.process_queues(status);

        self.logging.borrow_mut().flush();

        #[cfg(debug_assertions)]
        if self.cmds.pending_count() == 0 {
            if let Err(violation) = self.db.check_invariants() {
                panic!("graph database invariant violated: {violation}");
            }
        }

        true
    }

    /// Pops and dispatches one message per set bit, highest bit first.
    fn process_queues(&mut self, mut status: u32) {
        while status != 0 {
            let bit = 31 - status.leading_zeros();
            // Bit zero is the kill signal; queue indices start above it.
            let q_idx = (bit - 1) as usize;
            if let Some(msg) = self.queues[q_idx].pop() {
                let family = match msg.family() {
                    MsgFamily::External => 0,
                    MsgFamily::Internal => 1,
                };
                let _ = PROCESS_Q_TABLE[q_idx][family](self, msg);
            }
            status &= !(1 << bit);
        }
    }

    fn cmdq_external_handler(apm: &mut Apm, msg: SpfMsg) -> Result<(), ApmError> {
        let SpfMsg::External(pkt) = msg else {
            return Err(ApmError::BadParam);
        };
        let token = pkt.token;

        match pkt.opcode {
            CmdOpcode::GetSpfState => {
                apm.send_reply(ClientReply::SpfState {
                    token,
                    state: SpfState::Ready,
                });
                Ok(())
            }
            CmdOpcode::SharedMemMap | CmdOpcode::GlobalSharedMemMap => {
                let reply = match pkt.payload {
                    CmdPayload::MemMap { bytes } => ClientReply::MemMap {
                        token,
                        status: Ok(()),
                        mem_map_handle: apm.shmem.map(bytes),
                    },
                    _ => ClientReply::MemMap {
                        token,
                        status: Err(ApmError::BadParam),
                        mem_map_handle: 0,
                    },
                };
                apm.send_reply(reply);
                Ok(())
            }
            CmdOpcode::SharedMemUnmap | CmdOpcode::GlobalSharedMemUnmap => {
                let status = match pkt.payload {
                    CmdPayload::MemUnmap { mem_map_handle } => apm.shmem.unmap(mem_map_handle),
                    _ => Err(ApmError::BadParam),
                };
                apm.send_reply(ClientReply::Basic {
                    opcode: pkt.opcode,
                    token,
                    status,
                });
                Ok(())
            }
            CmdOpcode::GraphOpen
            | CmdOpcode::SetCfg
            | CmdOpcode::GetCfg
            | CmdOpcode::RegisterCfg
            | CmdOpcode::DeregisterCfg
            | CmdOpcode::GraphPrepare
            | CmdOpcode::GraphStart
            | CmdOpcode::GraphStop
            | CmdOpcode::GraphFlush
            | CmdOpcode::GraphClose
            | CmdOpcode::CloseAll
            | CmdOpcode::GraphSuspend => {
                apm.admit_cmd(CmdOrigin::External { token }, pkt.opcode, pkt.payload)
            }
            _ => {
                apm.send_reply(ClientReply::Basic {
                    opcode: pkt.opcode,
                    token,
                    status: Err(ApmError::Unsupported),
                });
                Err(ApmError::Unsupported)
            }
        }
    }

    fn cmdq_internal_handler(apm: &mut Apm, msg: SpfMsg) -> Result<(), ApmError> {
        let SpfMsg::Internal(msg) = msg else {
            return Err(ApmError::BadParam);
        };
        match msg.opcode {
            CmdOpcode::ProxyGraphPrepare
            | CmdOpcode::ProxyGraphStart
            | CmdOpcode::ProxyGraphStop
            | CmdOpcode::SetCfg
            | CmdOpcode::GetCfg => apm.admit_cmd(CmdOrigin::Internal, msg.opcode, msg.payload),
            // Path-delay requests belong to the data-path collaborator.
            CmdOpcode::PathDelayEvent => Ok(()),
            _ => {
                apm.send_reply(ClientReply::Basic {
                    opcode: msg.opcode,
                    token: 0,
                    status: Err(ApmError::Unsupported),
                });
                Err(ApmError::Unsupported)
            }
        }
    }

    fn rspq_external_handler(_apm: &mut Apm, _msg: SpfMsg) -> Result<(), ApmError> {
        // External packets on the response queue serve the offload path,
        // which this build does not carry.
        Err(ApmError::Unsupported)
    }

    fn rspq_internal_handler(apm: &mut Apm, msg: SpfMsg) -> Result<(), ApmError> {
        let SpfMsg::Response(rsp) = msg else {
            return Err(ApmError::BadParam);
        };
        apm.handle_container_rsp(rsp)
    }

    /// Admits one command: power vote, slot allocation (with command-queue
    /// flow control), payload caching, the deferral check, and the first
    /// run of the sequencer.
    pub(crate) fn admit_cmd(
        &mut self,
        origin: CmdOrigin,
        opcode: CmdOpcode,
        payload: CmdPayload,
    ) -> Result<(), ApmError> {
        if let Err(error) = self.pwr.vote() {
            self.reply_admission_failure(origin, opcode, error);
            return Err(error);
        }

        let slot = match self.cmds.allocate(origin, opcode) {
            Ok(slot) => slot,
            Err(error) => {
                let _ = self.pwr.devote();
                self.reply_admission_failure(origin, opcode, error);
                return Err(error);
            }
        };
        if self.cmds.is_full() {
            // Stop listening to the command queue until a slot frees up.
            self.curr_wait_mask &= !CMD_Q_MASK;
        }
        self.cmds.ctrl_mut(slot).seq = SeqCursor::new(sequencer::op_list(opcode));
        self.log(CommandEvent {
            slot,
            opcode,
            kind: CommandEventKind::Accepted,
        });

        if let Err(error) = self.cache_cmd_payload(slot, payload) {
            self.cmds.ctrl_mut(slot).record_error(error);
            self.enter_error_path(slot);
            return self.run_sequencer(slot);
        }

        match self.check_and_defer(slot) {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(error) => {
                self.cmds.ctrl_mut(slot).record_error(error);
                self.enter_error_path(slot);
            }
        }
        self.run_sequencer(slot)
    }

    fn reply_admission_failure(&mut self, origin: CmdOrigin, opcode: CmdOpcode, error: ApmError) {
        let token = match origin {
            CmdOrigin::External { token } => token,
            CmdOrigin::Internal => 0,
        };
        self.send_reply(ClientReply::Basic {
            opcode,
            token,
            status: Err(error),
        });
    }

    /// Caches the payload into the opcode's scratch, pulling out-of-band
    /// payloads in from shared memory under a region reference.
    fn cache_cmd_payload(&mut self, slot: usize, payload: CmdPayload) -> Result<(), ApmError> {
        let opcode = self.cmds.ctrl(slot).opcode;

        let payload = match payload {
            CmdPayload::OutOfBand(oob) => {
                self.shmem.incr_refcount(oob.mem_map_handle)?;
                self.cmds.ctrl_mut(slot).cfg.oob = Some(oob);
                let bytes = self
                    .shmem
                    .read(oob.mem_map_handle, oob.offset, oob.payload_size)?
                    .to_vec();
                if opcode == CmdOpcode::GraphOpen {
                    CmdPayload::Open(from_oob_bytes(&bytes)?)
                } else if opcode.is_graph_mgmt() {
                    CmdPayload::GraphMgmt(from_oob_bytes(&bytes)?)
                } else {
                    CmdPayload::Cfg(CfgPayload {
                        params: decode_params(&bytes)?,
                    })
                }
            }
            other => other,
        };

        let ctrl = self.cmds.ctrl_mut(slot);
        match payload {
            CmdPayload::Open(payload) => {
                ctrl.open.sg_ids = payload.sub_graphs.iter().map(|s| s.sub_graph_id).collect();
                ctrl.open.payload = payload;
            }
            CmdPayload::GraphMgmt(payload) => {
                ctrl.gm.cmd_sg_ids = payload.sub_graphs;
                ctrl.gm.links = payload.links;
            }
            CmdPayload::Cfg(payload) => {
                ctrl.cfg.params = payload.params;
            }
            CmdPayload::None => {}
            CmdPayload::OutOfBand(_) | CmdPayload::MemMap { .. } | CmdPayload::MemUnmap { .. } => {
                return Err(ApmError::BadParam);
            }
        }
        Ok(())
    }

    /// Resets the response bookkeeping ahead of a fan-out step.
    pub(crate) fn begin_fanout(&mut self, slot: usize) {
        let ctrl = self.cmds.ctrl_mut(slot);
        ctrl.rsp.clear();
        ctrl.rsp.pending_conts.clear();
    }

    /// Pending when the fan-out issued anything, otherwise done.
    pub(crate) fn fanout_outcome(&self, slot: usize) -> StepOutcome {
        if self.cmds.ctrl(slot).rsp.num_cmd_issued > 0 {
            StepOutcome::Pending
        } else {
            StepOutcome::Done
        }
    }

    /// Issues one message to one container, tagging it with the
    /// aggregator's token.
    pub(crate) fn issue_to_container(
        &mut self,
        slot: usize,
        container: ContainerId,
        opcode: ContainerOpcode,
        payload: ContainerPayload,
    ) -> Result<(), ApmError> {
        let token = CmdToken { slot, container };
        let host = self.hosts.get_mut(&container).ok_or(ApmError::BadParam)?;
        host.deliver(ContainerMsg {
            opcode,
            token,
            payload,
        })?;

        let ctrl = self.cmds.ctrl_mut(slot);
        ctrl.rsp.num_cmd_issued += 1;
        ctrl.rsp.rsp_pending = true;
        if !ctrl.rsp.pending_conts.contains(&container) {
            ctrl.rsp.pending_conts.push(container);
        }
        Ok(())
    }

    /// A handle for containers created by the factory to respond through.
    pub(crate) fn responder(&self) -> Responder {
        Responder::new(self.rsp_sender.clone())
    }

    pub(crate) fn send_reply(&self, reply: ClientReply) {
        // A departed client is not this loop's problem.
        let _ = self.replies.send(reply);
    }

    pub(crate) fn log<E: Into<ApmEvent>>(&self, event: E) {
        if let Some(logger) = &self.logger {
            logger.log(event.into());
        }
    }

    pub(crate) fn log_sort_report(&self, report: &SortReport) {
        for conn in &report.reclassified {
            self.log(GraphEvent::CycleReclassified(*conn));
        }
        for (graph, order) in &report.orders {
            self.log(GraphEvent::Sorted {
                graph: *graph,
                order: order.clone(),
            });
        }
    }

    /// Read access to the graph database, for observation and tests.
    pub fn graph_db(&self) -> &GraphDb {
        &self.db
    }

    /// Read access to the shared-memory registry.
    pub fn shared_mem(&self) -> &SharedMemRegistry {
        &self.shmem
    }

    /// Commands currently allocated (executing or deferred).
    pub fn active_cmd_count(&self) -> usize {
        self.cmds.pending_count()
    }

    /// Commands parked in the deferred FIFO.
    pub fn deferred_cmd_count(&self) -> usize {
        self.deferred.queue.len()
    }

    /// Whether a CLOSE_ALL sits in the deferred FIFO.
    pub fn close_all_deferred(&self) -> bool {
        self.deferred.close_all_deferred
    }

    /// The slot-table parity invariant.
    pub fn slot_mask_parity_holds(&self) -> bool {
        self.cmds.mask_parity_holds()
    }

    /// Verifies the graph-database invariants.
    pub fn check_invariants(&self) -> Result<(), String> {
        self.db.check_invariants()
    }
}

/// Launches the work loop on its own thread and returns the client handle
/// with the join handle. The loop runs until the kill signal fires.
pub fn execute(
    config: Config,
    factory: Box<dyn ContainerFactory>,
    pwr_mgr: Box<dyn PowerMgr>,
) -> (ApmClient, thread::JoinHandle<()>) {
    let (client_tx, client_rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("apm".to_owned())
        .spawn(move || {
            let (mut apm, client) = Apm::create(config, factory, pwr_mgr);
            client_tx.send(client).expect("caller waits for the client");
            while apm.step_or_park(None) {}
        })
        .expect("spawn apm worker");
    let client = client_rx.recv().expect("worker thread started");
    (client, handle)
}
