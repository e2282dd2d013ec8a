//! The command sequencer: a declarative operation list per opcode, driven
//! as a pure reducer over per-command cursor state.
//!
//! A sub-operation either completes synchronously or fans out to
//! containers and returns pending; the response aggregator re-enters the
//! sequencer once the fan-out completes. Any failing step switches the
//! remaining operation list to the opcode's error-handler sequence, which
//! is enumerated explicitly per opcode rather than being a generic
//! exception mechanism.

use crate::logging::{CommandEvent, CommandEventKind};
use crate::messages::{ClientReply, CmdOpcode, ContainerOpcode};
use crate::status::{ApmError, Status};
use crate::worker::Apm;

use super::ctrl::CmdOrigin;

/// Sub-operations a command sequence is built from.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CmdOp {
    OpenParse,
    OpenCreateSubGraphs,
    OpenCreateContainers,
    OpenIssueOpens,
    OpenConnectPeers,
    OpenLinkStartSetup,
    OpenUpdateGraphs,
    GmValidateSgList,
    GmCfgProcessList,
    GmSetUpTraversal,
    GmProcessContainers,
    GmDestroyClosed,
    CfgParse,
    CfgFanout,
    CfgAssembleReply,
    Finish,
}

/// Outcome of executing one sub-operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StepOutcome {
    /// The sub-operation ran to completion on this thread.
    Done,
    /// Container responses are outstanding; the aggregator re-enters.
    Pending,
}

/// Sequence position of one command: the primary operation list, the
/// active container sub-sequence, and the per-operation status.
#[derive(Debug)]
pub struct SeqCursor {
    pub ops: &'static [CmdOp],
    pub index: usize,
    /// Container opcodes of the active sub-sequence, if any.
    pub stages: Vec<ContainerOpcode>,
    pub stage_index: usize,
    /// Aggregated result of the sub-operation that just completed.
    pub step_status: Status,
    pub on_error_path: bool,
}

impl Default for SeqCursor {
    fn default() -> Self {
        SeqCursor {
            ops: &[],
            index: 0,
            stages: Vec::new(),
            stage_index: 0,
            step_status: Ok(()),
            on_error_path: false,
        }
    }
}

impl SeqCursor {
    pub fn new(ops: &'static [CmdOp]) -> Self {
        SeqCursor {
            ops,
            ..Default::default()
        }
    }

    pub fn current_op(&self) -> Option<CmdOp> {
        self.ops.get(self.index).copied()
    }
}

const OPEN_OPS: &[CmdOp] = &[
    CmdOp::OpenParse,
    CmdOp::OpenCreateSubGraphs,
    CmdOp::OpenCreateContainers,
    CmdOp::OpenIssueOpens,
    CmdOp::OpenConnectPeers,
    CmdOp::OpenLinkStartSetup,
    CmdOp::GmProcessContainers,
    CmdOp::OpenUpdateGraphs,
    CmdOp::Finish,
];

const GM_OPS: &[CmdOp] = &[
    CmdOp::GmValidateSgList,
    CmdOp::GmCfgProcessList,
    CmdOp::GmSetUpTraversal,
    CmdOp::GmProcessContainers,
    CmdOp::Finish,
];

const GM_CLOSE_OPS: &[CmdOp] = &[
    CmdOp::GmValidateSgList,
    CmdOp::GmCfgProcessList,
    CmdOp::GmSetUpTraversal,
    CmdOp::GmProcessContainers,
    CmdOp::GmDestroyClosed,
    CmdOp::Finish,
];

const CFG_OPS: &[CmdOp] = &[
    CmdOp::CfgParse,
    CmdOp::CfgFanout,
    CmdOp::CfgAssembleReply,
    CmdOp::Finish,
];

/// OPEN's error path closes the partially-created sub-graphs.
const OPEN_ERROR_OPS: &[CmdOp] = &[
    CmdOp::GmCfgProcessList,
    CmdOp::GmSetUpTraversal,
    CmdOp::GmProcessContainers,
    CmdOp::GmDestroyClosed,
    CmdOp::Finish,
];

const FINISH_ONLY: &[CmdOp] = &[CmdOp::Finish];

/// The primary operation list for an opcode.
pub fn op_list(opcode: CmdOpcode) -> &'static [CmdOp] {
    match opcode {
        CmdOpcode::GraphOpen => OPEN_OPS,
        CmdOpcode::GraphClose | CmdOpcode::CloseAll => GM_CLOSE_OPS,
        CmdOpcode::GraphPrepare
        | CmdOpcode::GraphStart
        | CmdOpcode::GraphStop
        | CmdOpcode::GraphFlush
        | CmdOpcode::GraphSuspend
        | CmdOpcode::ProxyGraphPrepare
        | CmdOpcode::ProxyGraphStart
        | CmdOpcode::ProxyGraphStop => GM_OPS,
        CmdOpcode::SetCfg
        | CmdOpcode::GetCfg
        | CmdOpcode::RegisterCfg
        | CmdOpcode::DeregisterCfg => CFG_OPS,
        // Inline-handled opcodes never reach a slot; an empty sequence
        // completes immediately if one ever does.
        _ => FINISH_ONLY,
    }
}

impl Apm {
    /// Drives the current command forward until it finishes or suspends on
    /// container responses.
    pub(crate) fn run_sequencer(&mut self, slot: usize) -> Result<(), ApmError> {
        loop {
            // The slot disappears when Finish releases it.
            let Some(ctrl) = self.cmds.get(slot) else {
                return Ok(());
            };
            let Some(op) = ctrl.seq.current_op() else {
                self.finish_cmd(slot);
                return Ok(());
            };

            match self.execute_op(slot, op) {
                Ok(StepOutcome::Pending) => return Ok(()),
                Ok(StepOutcome::Done) => {
                    if self.cmds.get(slot).is_none() {
                        // Finish released the slot.
                        return Ok(());
                    }
                    self.seq_advance(slot, op);
                }
                Err(error) => self.seq_handle_error(slot, error),
            }
        }
    }

    /// Re-entry point from the response aggregator once a fan-out
    /// completed: branch to the error path or advance, then keep driving.
    pub(crate) fn resume_sequencer(&mut self, slot: usize) -> Result<(), ApmError> {
        let (step_status, on_error_path) = {
            let seq = &self.cmds.ctrl(slot).seq;
            (seq.step_status, seq.on_error_path)
        };

        if step_status.is_err() && !on_error_path {
            self.enter_error_path(slot);
        } else {
            self.advance_after_responses(slot, step_status.is_ok());
        }
        self.run_sequencer(slot)
    }

    fn execute_op(&mut self, slot: usize, op: CmdOp) -> Result<StepOutcome, ApmError> {
        match op {
            CmdOp::OpenParse => self.op_open_parse(slot),
            CmdOp::OpenCreateSubGraphs => self.op_open_create_sub_graphs(slot),
            CmdOp::OpenCreateContainers => self.op_open_create_containers(slot),
            CmdOp::OpenIssueOpens => self.op_open_issue_opens(slot),
            CmdOp::OpenConnectPeers => self.op_open_connect_peers(slot),
            CmdOp::OpenLinkStartSetup => self.op_open_link_start_setup(slot),
            CmdOp::OpenUpdateGraphs => self.op_open_update_graphs(slot),
            CmdOp::GmValidateSgList => self.op_gm_validate_sg_list(slot),
            CmdOp::GmCfgProcessList => self.op_gm_cfg_process_list(slot),
            CmdOp::GmSetUpTraversal => self.op_gm_set_up_traversal(slot),
            CmdOp::GmProcessContainers => self.op_gm_process_containers(slot),
            CmdOp::GmDestroyClosed => self.op_gm_destroy_closed(slot),
            CmdOp::CfgParse => self.op_cfg_parse(slot),
            CmdOp::CfgFanout => self.op_cfg_fanout(slot),
            CmdOp::CfgAssembleReply => self.op_cfg_assemble_reply(slot),
            CmdOp::Finish => {
                self.finish_cmd(slot);
                Ok(StepOutcome::Done)
            }
        }
    }

    /// Advances past a synchronously completed sub-operation.
    fn seq_advance(&mut self, slot: usize, op: CmdOp) {
        let ctrl = self.cmds.ctrl_mut(slot);
        if op == CmdOp::GmProcessContainers {
            ctrl.seq.stages.clear();
            ctrl.seq.stage_index = 0;
        }
        ctrl.seq.index += 1;
    }

    /// Advances the cursor after a fan-out completed. Within a container
    /// sub-sequence only the stage moves; the primary operation re-runs
    /// and either issues the next stage or completes.
    fn advance_after_responses(&mut self, slot: usize, step_ok: bool) {
        let op = self.cmds.ctrl(slot).seq.current_op();
        let in_stages = {
            let seq = &self.cmds.ctrl(slot).seq;
            seq.stage_index < seq.stages.len()
        };

        if op == Some(CmdOp::GmProcessContainers) && in_stages {
            let stage = self.cmds.ctrl(slot).seq.stages[self.cmds.ctrl(slot).seq.stage_index];
            if step_ok {
                self.apply_stage_transition(slot, stage);
            }
            self.cmds.ctrl_mut(slot).seq.stage_index += 1;
        } else if let Some(op) = op {
            self.seq_advance(slot, op);
        }
    }

    /// Records a step failure and reroutes the sequence.
    fn seq_handle_error(&mut self, slot: usize, error: ApmError) {
        self.cmds.ctrl_mut(slot).record_error(error);
        self.enter_error_path(slot);
    }

    /// Overrides the remaining operation list with the opcode's
    /// error-handler sequence. A failure on the error path itself degrades
    /// to a bare finish.
    pub(crate) fn enter_error_path(&mut self, slot: usize) {
        let ctrl = self.cmds.ctrl_mut(slot);
        ctrl.seq.stages.clear();
        ctrl.seq.stage_index = 0;
        ctrl.seq.step_status = Ok(());

        if ctrl.seq.on_error_path {
            ctrl.seq.ops = FINISH_ONLY;
            ctrl.seq.index = 0;
            return;
        }
        ctrl.seq.on_error_path = true;
        ctrl.seq.index = 0;

        match ctrl.opcode {
            CmdOpcode::GraphOpen => {
                // Unwind: close whatever this open created. The original
                // open error is preserved; close failures are logged but
                // never overwrite it.
                ctrl.open.failed = true;
                ctrl.gm.cmd_sg_ids = ctrl.open.sg_ids.clone();
                // The error sequence has no validation step; the named
                // sub-graphs go straight in as candidates and the state
                // check weeds out whatever was never created.
                ctrl.gm.reg_sgs = ctrl.open.sg_ids.clone();
                ctrl.gm.link_sgs.clear();
                ctrl.gm.links.clear();
                ctrl.gm.cached_conns.clear();
                ctrl.gm.list_state = None;
                ctrl.seq.ops = OPEN_ERROR_OPS;
            }
            _ => {
                ctrl.seq.ops = FINISH_ONLY;
            }
        }
    }

    /// Ends the command: client reply, shared-memory release, wall-clock
    /// accounting, slot release, and deferred-command evaluation.
    pub(crate) fn finish_cmd(&mut self, slot: usize) {
        {
            let ctrl = self.cmds.ctrl_mut(slot);
            ctrl.pending = false;
        }

        // Out-of-band payloads: flush and drop the region reference before
        // the reply goes out.
        if let Some(oob) = self.cmds.ctrl(slot).cfg.oob {
            let _ = self.shmem.decr_refcount_and_flush(oob.mem_map_handle);
        }

        let reply = self.build_reply(slot);
        self.send_reply(reply);

        let ctrl = self.cmds.release(slot);
        let elapsed = ctrl.started_at.elapsed();
        self.log(CommandEvent {
            slot,
            opcode: ctrl.opcode,
            kind: CommandEventKind::Completed {
                status: ctrl.status,
                elapsed,
            },
        });
        if elapsed > self.config.cmd_time_ceiling {
            assert!(
                !self.config.fatal_on_cmd_overrun,
                "command {:?} exceeded the execution-time ceiling ({:?})",
                ctrl.opcode,
                elapsed
            );
        }

        // Start listening to the command queue again as soon as one slot
        // frees up.
        self.curr_wait_mask |= crate::worker::CMD_Q_MASK;
        let _ = self.pwr.devote();

        self.evaluate_deferred();
    }

    fn build_reply(&self, slot: usize) -> ClientReply {
        let ctrl = self.cmds.ctrl(slot);
        let token = match ctrl.origin {
            CmdOrigin::External { token } => token,
            CmdOrigin::Internal => 0,
        };

        if ctrl.opcode == CmdOpcode::GetCfg && ctrl.status.is_ok() {
            // Success path: the reply carries the separately aggregated
            // container status. Out-of-band data is already written back;
            // in-band data rides in the reply.
            ClientReply::GetCfg {
                token,
                status: ctrl.agg_rsp_status,
                params: if ctrl.cfg.oob.is_some() {
                    Vec::new()
                } else {
                    ctrl.cfg.reply_params.clone()
                },
            }
        } else {
            ClientReply::Basic {
                opcode: ctrl.opcode,
                token,
                status: ctrl.status,
            }
        }
    }
}
