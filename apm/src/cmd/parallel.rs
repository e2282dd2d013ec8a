//! The parallel-command coordinator: sub-graph overlap detection between
//! concurrent commands, the deferred FIFO, and ordered resumption.

use std::collections::VecDeque;

use crate::graph::SubGraphId;
use crate::logging::{CommandEvent, CommandEventKind};
use crate::messages::CmdOpcode;
use crate::status::ApmError;
use crate::worker::Apm;

use super::ctrl::CmdCtrl;

/// Commands whose processing is parked until the commands they overlap
/// with have finished, in arrival order.
#[derive(Debug, Default)]
pub struct DeferredCmds {
    pub queue: VecDeque<usize>,
    /// Set while a CLOSE_ALL sits in the queue; it resumes only once it is
    /// the sole remaining command.
    pub close_all_deferred: bool,
}

fn names_sub_graph(ctrl: &CmdCtrl, sg: SubGraphId) -> bool {
    ctrl.gm.cmd_sg_ids.contains(&sg) || ctrl.gm.link_sgs.contains(&sg)
}

impl Apm {
    /// The overlap test: two commands overlap when any sub-graph named
    /// (directly or via link operations) by one is named by the other, or
    /// is the peer of a global inter-sub-graph edge owned by one of the
    /// first command's sub-graphs.
    fn sg_lists_overlap(&self, curr_slot: usize, other_slot: usize) -> bool {
        let curr = self.cmds.ctrl(curr_slot);
        let other = self.cmds.ctrl(other_slot);

        for sg in &curr.gm.cmd_sg_ids {
            if names_sub_graph(other, *sg) {
                return true;
            }
            for conn in &self.db.sg_edges {
                if let Some(peer) = self
                    .db
                    .connections
                    .get(conn)
                    .and_then(|c| c.peer_sub_graph(*sg))
                {
                    if names_sub_graph(other, peer) {
                        return true;
                    }
                }
            }
        }
        curr.gm
            .link_sgs
            .iter()
            .any(|sg| names_sub_graph(other, *sg))
    }

    /// Tests `slot` against every other pending command.
    ///
    /// CLOSE_ALL overlaps unconditionally in both directions. A proxy
    /// graph-management command meeting an in-flight CLOSE_ALL does not
    /// defer; it fails immediately with busy.
    pub(crate) fn overlaps_active(&self, slot: usize) -> Result<bool, ApmError> {
        let curr_opcode = self.cmds.ctrl(slot).opcode;

        for other in self.cmds.active_slots() {
            if other == slot || !self.cmds.ctrl(other).pending {
                continue;
            }
            if curr_opcode == CmdOpcode::CloseAll {
                return Ok(true);
            }
            let other_opcode = self.cmds.ctrl(other).opcode;
            if other_opcode == CmdOpcode::CloseAll {
                if curr_opcode.is_proxy_graph_mgmt() {
                    return Err(ApmError::Busy);
                }
                return Ok(true);
            }
            if self.sg_lists_overlap(slot, other) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Decides at admission whether the command must wait its turn.
    pub(crate) fn check_and_defer(&mut self, slot: usize) -> Result<bool, ApmError> {
        let opcode = self.cmds.ctrl(slot).opcode;
        if !opcode.is_graph_mgmt() || self.cmds.active_mask.count_ones() <= 1 {
            return Ok(false);
        }

        let overlapped = if opcode == CmdOpcode::CloseAll {
            true
        } else {
            self.overlaps_active(slot)?
        };

        let mut deferred = false;
        if overlapped {
            self.deferred.queue.push_back(slot);
            self.cmds.ctrl_mut(slot).deferred = true;
            if opcode == CmdOpcode::CloseAll {
                self.deferred.close_all_deferred = true;
            }
            self.log(CommandEvent {
                slot,
                opcode,
                kind: CommandEventKind::Deferred,
            });
            deferred = true;
        }

        // A proxy command only waits for close commands; with no close in
        // flight the deferral is reverted and it proceeds concurrently.
        if deferred && opcode.is_proxy_graph_mgmt() && !self.close_cmd_active() {
            self.deferred.queue.retain(|s| *s != slot);
            self.cmds.ctrl_mut(slot).deferred = false;
            self.log(CommandEvent {
                slot,
                opcode,
                kind: CommandEventKind::DeferralReverted,
            });
            deferred = false;
        }

        Ok(deferred)
    }

    fn close_cmd_active(&self) -> bool {
        self.cmds.active_slots().any(|slot| {
            let ctrl = self.cmds.ctrl(slot);
            ctrl.pending && ctrl.opcode == CmdOpcode::GraphClose
        })
    }

    /// Invoked at the end of every command: resume the first deferred
    /// command whose overlap test is clear, or the head outright when only
    /// deferred commands remain.
    pub(crate) fn evaluate_deferred(&mut self) {
        if self.deferred.queue.is_empty() {
            return;
        }

        if self.deferred.queue.len() == self.cmds.pending_count() {
            if let Some(slot) = self.deferred.queue.front().copied() {
                self.resume_deferred(slot);
            }
            return;
        }

        let snapshot: Vec<usize> = self.deferred.queue.iter().copied().collect();
        for slot in snapshot {
            match self.overlaps_active(slot) {
                Ok(true) => continue,
                Ok(false) => {
                    self.resume_deferred(slot);
                    break;
                }
                Err(error) => {
                    // A deferred proxy command meeting CLOSE_ALL: fail it
                    // rather than resume it.
                    self.deferred.queue.retain(|s| *s != slot);
                    let ctrl = self.cmds.ctrl_mut(slot);
                    ctrl.deferred = false;
                    ctrl.record_error(error);
                    self.enter_error_path(slot);
                    let _ = self.run_sequencer(slot);
                    break;
                }
            }
        }
    }

    fn resume_deferred(&mut self, slot: usize) {
        self.deferred.queue.retain(|s| *s != slot);
        let ctrl = self.cmds.ctrl_mut(slot);
        ctrl.deferred = false;
        let opcode = ctrl.opcode;
        if opcode == CmdOpcode::CloseAll {
            self.deferred.close_all_deferred = false;
        }
        self.cmds.current = Some(slot);
        self.log(CommandEvent {
            slot,
            opcode,
            kind: CommandEventKind::Resumed,
        });
        if let Err(error) = self.run_sequencer(slot) {
            self.cmds.ctrl_mut(slot).record_error(error);
        }
    }

    /// A closed sub-graph is elided from every deferred proxy command's
    /// target list, rather than failing the command later.
    pub(crate) fn update_deferred_for_closed_sg(&mut self, sg: SubGraphId) {
        let snapshot: Vec<usize> = self.deferred.queue.iter().copied().collect();
        for slot in snapshot {
            let ctrl = self.cmds.ctrl_mut(slot);
            if ctrl.opcode.is_proxy_graph_mgmt() {
                ctrl.gm.cmd_sg_ids.retain(|s| *s != sg);
                ctrl.gm.reg_sgs.retain(|s| *s != sg);
                ctrl.gm.link_sgs.retain(|s| *s != sg);
            }
        }
    }
}
