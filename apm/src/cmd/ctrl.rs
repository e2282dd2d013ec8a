//! The fixed table of per-command control slots.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::graph::{ConnId, ContainerId, GraphId, LinkCfg, SgState, SubGraphId};
use crate::messages::container::ConnSpec;
use crate::messages::payload::{ModuleCfg, OobRef, OpenPayload, PidPayload};
use crate::messages::CmdOpcode;
use crate::status::{ApmError, Status};

use super::sequencer::SeqCursor;

/// Upper bound on concurrently executing commands. The slot bitmask is one
/// bit per slot.
pub const MAX_PARALLEL_CMDS: usize = 8;

/// Mask value when every slot is taken.
pub const CMD_LIST_FULL_MASK: u32 = (1 << MAX_PARALLEL_CMDS) - 1;

/// Where a command came from, for reply routing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CmdOrigin {
    /// External RPC; the token is echoed in the reply.
    External { token: u32 },
    /// Internal inter-component message.
    Internal,
}

/// Response aggregation counters for one command.
#[derive(Debug)]
pub struct RspCtrl {
    pub num_cmd_issued: u32,
    pub num_rsp_rcvd: u32,
    pub num_rsp_failed: u32,
    /// True while container responses are outstanding.
    pub rsp_pending: bool,
    pub rsp_status: Status,
    /// Containers addressed by the in-flight fan-out.
    pub pending_conts: Vec<ContainerId>,
}

impl Default for RspCtrl {
    fn default() -> Self {
        RspCtrl {
            num_cmd_issued: 0,
            num_rsp_rcvd: 0,
            num_rsp_failed: 0,
            rsp_pending: false,
            rsp_status: Ok(()),
            pending_conts: Vec::new(),
        }
    }
}

impl RspCtrl {
    /// Clears the counters between fan-out steps.
    pub fn clear(&mut self) {
        self.num_cmd_issued = 0;
        self.num_rsp_rcvd = 0;
        self.num_rsp_failed = 0;
        self.rsp_pending = false;
        self.rsp_status = Ok(());
    }
}

/// GRAPH_OPEN scratch.
#[derive(Debug, Default)]
pub struct OpenScratch {
    /// The validated payload, cached for the fan-out steps.
    pub payload: OpenPayload,
    /// Sub-graphs named by this open.
    pub sg_ids: Vec<SubGraphId>,
    pub created_containers: Vec<ContainerId>,
    /// Connections created by this open.
    pub conns: Vec<ConnId>,
    /// Links across already-started sub-graphs, cached at parse time and
    /// driven through a state-management sub-sequence at the end of open.
    pub link_start: Vec<LinkCfg>,
    /// Set when the open failed and the error path is unwinding it.
    pub failed: bool,
}

/// Graph-management scratch.
#[derive(Debug, Default)]
pub struct GraphMgmtScratch {
    /// Sub-graph ids exactly as named in the command; the overlap test
    /// reads these before any validation has run.
    pub cmd_sg_ids: Vec<SubGraphId>,
    /// Link operations named in the command.
    pub links: Vec<LinkCfg>,
    /// Validated sub-graphs named directly, still to process.
    pub reg_sgs: Vec<SubGraphId>,
    /// Sub-graphs implicated indirectly by a link operation crossing into
    /// them.
    pub link_sgs: Vec<SubGraphId>,
    /// Connections scheduled for closure (or runtime start).
    pub cached_conns: Vec<ConnId>,
    /// Containers sent DESTROY_CONTAINER in the current sub-sequence.
    pub destroy_targets: Vec<ContainerId>,
    /// Reduced state of the processing list, per opcode min/max rules.
    pub list_state: Option<SgState>,
    /// Container-graphs the traversal will visit, in database order.
    pub graphs: Vec<GraphId>,
}

/// SET_CFG / GET_CFG / REGISTER_CFG scratch.
#[derive(Debug, Default)]
pub struct CfgScratch {
    pub params: Vec<PidPayload>,
    /// Out-of-band origin of the payload, kept for write-back and the
    /// final cache flush.
    pub oob: Option<OobRef>,
    /// Aggregated GET_CFG reply records.
    pub reply_params: Vec<PidPayload>,
}

/// Scratch attached to one container for the duration of one command: its
/// share of the cached configuration, and its response state.
#[derive(Debug, Default)]
pub struct ContScratch {
    pub open_sub_graphs: Vec<SubGraphId>,
    pub open_modules: Vec<ModuleCfg>,
    pub mixed_heap_peers: Vec<ContainerId>,
    pub connect_links: Vec<ConnSpec>,
    pub params: Vec<PidPayload>,
    /// Parameter records returned by the container.
    pub rsp_params: Vec<PidPayload>,
    pub last_result: Option<Status>,
}

/// Per-command state: one slot of the fixed table.
#[derive(Debug)]
pub struct CmdCtrl {
    pub slot: usize,
    pub origin: CmdOrigin,
    pub opcode: CmdOpcode,
    /// True from allocation to release; deferred commands stay pending.
    pub pending: bool,
    /// True while parked in the deferred FIFO.
    pub deferred: bool,
    /// Cumulative command status; the first critical error wins.
    pub status: Status,
    /// GET_CFG keeps its aggregated response status apart from `status`,
    /// so a sequencer error and a container error reach the client
    /// distinctly.
    pub agg_rsp_status: Status,
    pub seq: SeqCursor,
    pub open: OpenScratch,
    pub gm: GraphMgmtScratch,
    pub cfg: CfgScratch,
    pub rsp: RspCtrl,
    pub cont_scratch: BTreeMap<ContainerId, ContScratch>,
    pub started_at: Instant,
}

impl CmdCtrl {
    fn new(slot: usize, origin: CmdOrigin, opcode: CmdOpcode) -> Self {
        CmdCtrl {
            slot,
            origin,
            opcode,
            pending: true,
            deferred: false,
            status: Ok(()),
            agg_rsp_status: Ok(()),
            seq: SeqCursor::default(),
            open: OpenScratch::default(),
            gm: GraphMgmtScratch::default(),
            cfg: CfgScratch::default(),
            rsp: RspCtrl::default(),
            cont_scratch: BTreeMap::new(),
            started_at: Instant::now(),
        }
    }

    /// Records a failure without overwriting an earlier one.
    pub fn record_error(&mut self, error: ApmError) {
        if self.status.is_ok() {
            self.status = Err(error);
        }
    }

    /// Scratch for `container`, created on first touch.
    pub fn scratch_mut(&mut self, container: ContainerId) -> &mut ContScratch {
        self.cont_scratch.entry(container).or_default()
    }
}

/// The slot table: a fixed array plus a bit-per-slot mask of active
/// entries and a "current" cursor updated before every component call.
pub struct CmdTable {
    slots: Vec<Option<CmdCtrl>>,
    pub active_mask: u32,
    pub current: Option<usize>,
}

impl Default for CmdTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CmdTable {
    pub fn new() -> Self {
        CmdTable {
            slots: (0..MAX_PARALLEL_CMDS).map(|_| None).collect(),
            active_mask: 0,
            current: None,
        }
    }

    pub fn is_full(&self) -> bool {
        self.active_mask == CMD_LIST_FULL_MASK
    }

    /// Claims the lowest free slot.
    ///
    /// The caller keeps the command queue masked off while the table is
    /// full, so exhaustion here means the flow control was bypassed.
    pub fn allocate(&mut self, origin: CmdOrigin, opcode: CmdOpcode) -> Result<usize, ApmError> {
        if self.is_full() {
            return Err(ApmError::NoResource);
        }
        let slot = self.active_mask.trailing_ones() as usize;
        self.active_mask |= 1 << slot;
        self.slots[slot] = Some(CmdCtrl::new(slot, origin, opcode));
        self.current = Some(slot);
        Ok(slot)
    }

    /// Releases a slot, returning its final state for the completion log.
    pub fn release(&mut self, slot: usize) -> CmdCtrl {
        let ctrl = self.slots[slot].take().expect("releasing a vacant slot");
        self.active_mask &= !(1 << slot);
        if self.current == Some(slot) {
            self.current = None;
        }
        ctrl
    }

    pub fn ctrl(&self, slot: usize) -> &CmdCtrl {
        self.slots[slot].as_ref().expect("vacant command slot")
    }

    pub fn ctrl_mut(&mut self, slot: usize) -> &mut CmdCtrl {
        self.slots[slot].as_mut().expect("vacant command slot")
    }

    pub fn get(&self, slot: usize) -> Option<&CmdCtrl> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// Slots with a command allocated, in slot order.
    pub fn active_slots(&self) -> impl Iterator<Item = usize> + '_ {
        (0..MAX_PARALLEL_CMDS).filter(|slot| self.slots[*slot].is_some())
    }

    /// Number of commands between allocation and release.
    pub fn pending_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.as_ref().is_some_and(|c| c.pending))
            .count()
    }

    /// The slot-table parity invariant: every mask bit corresponds to an
    /// allocated, pending slot.
    pub fn mask_parity_holds(&self) -> bool {
        self.active_mask.count_ones() as usize == self.pending_count()
    }
}
