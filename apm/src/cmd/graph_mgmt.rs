//! Graph-management commands: sub-graph list validation, the per-opcode
//! state machine, ordered container-graph traversal, and the close-time
//! destruction cascade.

use crate::graph::connection::{self, LinkPolicy};
use crate::graph::{sort, ContainerId, SgState, SubGraphId};
use crate::logging::GraphEvent;
use crate::messages::container::{ContainerOpcode, ContainerPayload};
use crate::messages::CmdOpcode;
use crate::status::ApmError;
use crate::worker::Apm;

use super::ctrl::CmdCtrl;
use super::sequencer::StepOutcome;

/// The state-machine flavour of the command being sequenced.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum GmKind {
    Prepare,
    Start,
    Stop,
    Suspend,
    Flush,
    Close,
    /// OPEN's end-of-command start of a link between started sub-graphs.
    LinkStart,
}

pub(crate) fn gm_kind(ctrl: &CmdCtrl) -> GmKind {
    match ctrl.opcode {
        CmdOpcode::GraphPrepare | CmdOpcode::ProxyGraphPrepare => GmKind::Prepare,
        CmdOpcode::GraphStart | CmdOpcode::ProxyGraphStart => GmKind::Start,
        CmdOpcode::GraphStop | CmdOpcode::ProxyGraphStop => GmKind::Stop,
        CmdOpcode::GraphSuspend => GmKind::Suspend,
        CmdOpcode::GraphFlush => GmKind::Flush,
        CmdOpcode::GraphOpen if ctrl.open.failed => GmKind::Close,
        CmdOpcode::GraphOpen => GmKind::LinkStart,
        _ => GmKind::Close,
    }
}

/// The state a sub-graph is assumed to be in before this command, used as
/// the fold seed for the list state.
fn default_list_state(kind: GmKind) -> SgState {
    match kind {
        GmKind::Prepare | GmKind::Close | GmKind::LinkStart => SgState::Stopped,
        GmKind::Start => SgState::Prepared,
        GmKind::Stop | GmKind::Suspend | GmKind::Flush => SgState::Started,
    }
}

/// The sub-graph state transition matrix.
///
/// A skip result ([`ApmError::Already`] / [`ApmError::NotReady`]) removes
/// the sub-graph from the command's working set without failing the
/// command.
fn validate_sg_state(kind: GmKind, open_unwind: bool, state: SgState) -> Result<(), ApmError> {
    match kind {
        GmKind::Close if open_unwind => {
            // Unwinding a failed open only closes sub-graphs still in their
            // freshly-created state.
            if state == SgState::Stopped {
                Ok(())
            } else {
                Err(ApmError::Already)
            }
        }
        GmKind::Close => Ok(()),
        GmKind::Prepare => {
            if state == SgState::Stopped {
                Ok(())
            } else {
                Err(ApmError::Already)
            }
        }
        GmKind::Start => {
            if state == SgState::Started {
                Err(ApmError::Already)
            } else {
                Ok(())
            }
        }
        GmKind::Stop => {
            if state == SgState::Stopped {
                Err(ApmError::Already)
            } else {
                Ok(())
            }
        }
        GmKind::Suspend | GmKind::Flush | GmKind::LinkStart => {
            if state == SgState::Started {
                Ok(())
            } else {
                Err(ApmError::NotReady)
            }
        }
    }
}

/// Reduces the working-set state: START works up from the lowest stage
/// present, CLOSE unwinds from the highest.
fn fold_list_state(kind: GmKind, state: SgState, current: SgState) -> SgState {
    match kind {
        GmKind::Start => state.min(current),
        GmKind::Close => state.max(current),
        _ => current,
    }
}

/// Container opcodes a command runs through, derived from the working-set
/// state.
fn stages_for(kind: GmKind, list_state: SgState) -> Vec<ContainerOpcode> {
    match kind {
        GmKind::Prepare => vec![ContainerOpcode::GraphPrepare],
        GmKind::Start | GmKind::LinkStart => {
            if list_state == SgState::Stopped {
                vec![ContainerOpcode::GraphPrepare, ContainerOpcode::GraphStart]
            } else {
                vec![ContainerOpcode::GraphStart]
            }
        }
        GmKind::Stop => vec![ContainerOpcode::GraphStop],
        GmKind::Suspend => vec![ContainerOpcode::GraphSuspend],
        GmKind::Flush => vec![ContainerOpcode::GraphFlush],
        GmKind::Close => {
            let mut stages = Vec::new();
            if list_state >= SgState::Started {
                stages.push(ContainerOpcode::GraphStop);
            }
            stages.extend([
                ContainerOpcode::GraphDisconnect,
                ContainerOpcode::GraphClose,
                ContainerOpcode::DestroyContainer,
            ]);
            stages
        }
    }
}

/// Sub-graph states a stage applies to.
fn stage_source_states(stage: ContainerOpcode) -> &'static [SgState] {
    match stage {
        ContainerOpcode::GraphPrepare => &[SgState::Stopped],
        ContainerOpcode::GraphStart => &[SgState::Prepared, SgState::Suspended],
        ContainerOpcode::GraphStop => {
            &[SgState::Prepared, SgState::Started, SgState::Suspended]
        }
        ContainerOpcode::GraphSuspend | ContainerOpcode::GraphFlush => &[SgState::Started],
        ContainerOpcode::GraphDisconnect | ContainerOpcode::GraphClose => &[
            SgState::Stopped,
            SgState::Prepared,
            SgState::Started,
            SgState::Suspended,
        ],
        _ => &[],
    }
}

impl Apm {
    /// Resolves the sub-graph ids named by the command. CLOSE tolerates
    /// unknown ids as long as one target remains; everything else fails on
    /// the first unknown id.
    pub(crate) fn op_gm_validate_sg_list(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let opcode = self.cmds.ctrl(slot).opcode;

        let ids: Vec<SubGraphId> = if opcode == CmdOpcode::CloseAll {
            self.db.sub_graphs.keys().copied().collect()
        } else {
            self.cmds.ctrl(slot).gm.cmd_sg_ids.clone()
        };

        if ids.is_empty()
            && self.cmds.ctrl(slot).gm.links.is_empty()
            && opcode != CmdOpcode::CloseAll
            // A deferred proxy command may have had its whole target list
            // elided by closes that ran ahead of it; it completes empty.
            && !opcode.is_proxy_graph_mgmt()
        {
            return Err(ApmError::BadParam);
        }

        let mut reg = Vec::new();
        for id in ids {
            if self.db.sub_graphs.contains_key(&id) {
                if !reg.contains(&id) {
                    reg.push(id);
                }
            } else if opcode != CmdOpcode::GraphClose {
                return Err(ApmError::BadParam);
            }
        }

        if opcode == CmdOpcode::GraphClose
            && reg.is_empty()
            && self.cmds.ctrl(slot).gm.links.is_empty()
        {
            // None of the named sub-graphs exist.
            return Err(ApmError::BadParam);
        }

        self.cmds.ctrl_mut(slot).gm.reg_sgs = reg;
        Ok(StepOutcome::Done)
    }

    /// Applies the state matrix to the working set: sub-graphs that are
    /// already there (or not ready) are skipped, the rest are kept and the
    /// list state folded. Link operations pull their host sub-graphs in
    /// indirectly.
    pub(crate) fn op_gm_cfg_process_list(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let (kind, open_unwind) = {
            let ctrl = self.cmds.ctrl(slot);
            (gm_kind(ctrl), ctrl.open.failed)
        };
        let mut list_state = default_list_state(kind);

        let candidates = std::mem::take(&mut self.cmds.ctrl_mut(slot).gm.reg_sgs);
        let mut reg = Vec::new();
        for id in candidates {
            // Candidates that never came to exist (an open that failed
            // before creating them) have nothing to process.
            let Some(state) = self.db.sub_graphs.get(&id).map(|sg| sg.state) else {
                continue;
            };
            match validate_sg_state(kind, open_unwind, state) {
                Ok(()) => {
                    reg.push(id);
                    list_state = fold_list_state(kind, state, list_state);
                }
                Err(e) if e.is_skip() => continue,
                Err(e) => return Err(e),
            }
        }

        let links = self.cmds.ctrl(slot).gm.links.clone();
        let mut link_sgs = Vec::new();
        let mut cached = Vec::new();
        for link in &links {
            let resolved = connection::resolve_link(&self.db, link, LinkPolicy::GraphMgmt)?;
            let (up, down) = (
                resolved.upstream.expect("policy requires both ends"),
                resolved.downstream.expect("policy requires both ends"),
            );
            if up.sub_graph == down.sub_graph {
                // A link inside one sub-graph follows its sub-graph's
                // lifecycle; nothing to do here.
                continue;
            }
            let conn = connection::find_connection(&self.db, link).ok_or(ApmError::BadParam)?;
            cached.push(conn);

            for end in [up, down] {
                if reg.contains(&end.sub_graph) || link_sgs.contains(&end.sub_graph) {
                    continue;
                }
                let state = self.db.sub_graph(end.sub_graph)?.state;
                match validate_sg_state(kind, false, state) {
                    Ok(()) => {
                        link_sgs.push(end.sub_graph);
                        list_state = fold_list_state(kind, state, list_state);
                    }
                    Err(e) if e.is_skip() => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        let ctrl = self.cmds.ctrl_mut(slot);
        ctrl.gm.reg_sgs = reg;
        ctrl.gm.link_sgs = link_sgs;
        ctrl.gm.cached_conns.extend(cached);
        ctrl.gm.list_state = Some(list_state);
        Ok(StepOutcome::Done)
    }

    /// Collects the container-graphs the traversal will visit and derives
    /// the container sub-sequence from the working-set state.
    pub(crate) fn op_gm_set_up_traversal(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let (kind, relevant, have_work, list_state) = {
            let ctrl = self.cmds.ctrl(slot);
            let mut relevant = ctrl.gm.reg_sgs.clone();
            relevant.extend(ctrl.gm.link_sgs.iter().copied());
            let have_work = !ctrl.gm.reg_sgs.is_empty() || !ctrl.gm.cached_conns.is_empty();
            let kind = gm_kind(ctrl);
            let list_state = ctrl.gm.list_state.unwrap_or_else(|| default_list_state(kind));
            (kind, relevant, have_work, list_state)
        };

        let graphs: Vec<_> = self
            .db
            .graphs
            .iter()
            .filter(|(_, g)| g.sub_graphs.iter().any(|sg| relevant.contains(sg)))
            .map(|(id, _)| *id)
            .collect();

        let ctrl = self.cmds.ctrl_mut(slot);
        ctrl.gm.graphs = graphs;
        ctrl.seq.stages = if have_work {
            stages_for(kind, list_state)
        } else {
            // Everything was skipped; the command still succeeds.
            Vec::new()
        };
        ctrl.seq.stage_index = 0;
        Ok(StepOutcome::Done)
    }

    /// Issues the current container sub-sequence stage, advancing through
    /// stages that have no recipients.
    pub(crate) fn op_gm_process_containers(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        loop {
            let stage = {
                let seq = &self.cmds.ctrl(slot).seq;
                match seq.stages.get(seq.stage_index) {
                    Some(stage) => *stage,
                    None => {
                        return Ok(StepOutcome::Done);
                    }
                }
            };
            let issued = self.issue_gm_stage(slot, stage)?;
            if issued > 0 {
                return Ok(StepOutcome::Pending);
            }
            // No recipients at this stage; fall through to the next.
            self.apply_stage_transition(slot, stage);
            self.cmds.ctrl_mut(slot).seq.stage_index += 1;
        }
    }

    fn issue_gm_stage(&mut self, slot: usize, stage: ContainerOpcode) -> Result<u32, ApmError> {
        self.begin_fanout(slot);
        let order = self.gm_traversal_order(slot, stage);
        for cid in order {
            if let Some(payload) = self.gm_stage_payload(slot, cid, stage) {
                if stage == ContainerOpcode::DestroyContainer {
                    self.cmds.ctrl_mut(slot).gm.destroy_targets.push(cid);
                }
                self.issue_to_container(slot, cid, stage, payload)?;
            }
        }
        Ok(self.cmds.ctrl(slot).rsp.num_cmd_issued)
    }

    /// Containers in the order the stage must reach them: the sorted
    /// container-graph order for teardown-direction stages, reversed for
    /// start-direction stages (downstream containers first).
    fn gm_traversal_order(&self, slot: usize, stage: ContainerOpcode) -> Vec<ContainerId> {
        let ctrl = self.cmds.ctrl(slot);
        let mut order: Vec<ContainerId> = Vec::new();
        for gid in &ctrl.gm.graphs {
            if let Some(graph) = self.db.graphs.get(gid) {
                order.extend(graph.containers.iter().copied());
            }
        }

        // Containers not yet absorbed into a graph (a failed open, or
        // control-only links) are appended in database order.
        let mut relevant = ctrl.gm.reg_sgs.clone();
        relevant.extend(ctrl.gm.link_sgs.iter().copied());
        for (cid, cont) in &self.db.containers {
            let affected = cont.sub_graphs.iter().any(|sg| relevant.contains(sg))
                || (ctrl.open.failed && ctrl.open.created_containers.contains(cid));
            if affected && !order.contains(cid) {
                order.push(*cid);
            }
        }

        if matches!(
            stage,
            ContainerOpcode::GraphPrepare | ContainerOpcode::GraphStart
        ) {
            order.reverse();
        }
        order
    }

    /// The cached per-container configuration for one stage, or `None`
    /// when the container has nothing to do at this stage.
    fn gm_stage_payload(
        &self,
        slot: usize,
        cid: ContainerId,
        stage: ContainerOpcode,
    ) -> Option<ContainerPayload> {
        let ctrl = self.cmds.ctrl(slot);
        let cont = self.db.containers.get(&cid)?;

        if stage == ContainerOpcode::DestroyContainer {
            let fully_closing = !cont.sub_graphs.is_empty()
                && cont
                    .sub_graphs
                    .iter()
                    .all(|sg| ctrl.gm.reg_sgs.contains(sg));
            let created_empty = ctrl.open.failed
                && cont.sub_graphs.is_empty()
                && ctrl.open.created_containers.contains(&cid);
            return (fully_closing || created_empty).then_some(ContainerPayload::None);
        }

        let sources = stage_source_states(stage);
        let sub_graphs: Vec<SubGraphId> = ctrl
            .gm
            .reg_sgs
            .iter()
            .filter(|sg| cont.sub_graphs.contains(*sg))
            .filter(|sg| {
                self.db
                    .sub_graphs
                    .get(*sg)
                    .is_some_and(|s| sources.contains(&s.state))
            })
            .copied()
            .collect();

        let port_handles = if matches!(
            stage,
            ContainerOpcode::GraphPrepare
                | ContainerOpcode::GraphStart
                | ContainerOpcode::GraphDisconnect
                | ContainerOpcode::GraphClose
        ) {
            ctrl.gm
                .cached_conns
                .iter()
                .filter_map(|conn| self.db.connections.get(conn))
                .filter_map(|conn| conn.end_in(cid))
                .map(|end| end.handle)
                .collect()
        } else {
            Vec::new()
        };

        if sub_graphs.is_empty() && port_handles.is_empty() {
            return None;
        }
        Some(ContainerPayload::GraphMgmt {
            sub_graphs,
            port_handles,
        })
    }

    /// Moves the working-set sub-graphs through the state machine once a
    /// stage has completed successfully.
    pub(crate) fn apply_stage_transition(&mut self, slot: usize, stage: ContainerOpcode) {
        let targets = self.cmds.ctrl(slot).gm.reg_sgs.clone();
        let sources = stage_source_states(stage);
        let next = match stage {
            ContainerOpcode::GraphPrepare => Some(SgState::Prepared),
            ContainerOpcode::GraphStart => Some(SgState::Started),
            ContainerOpcode::GraphStop => Some(SgState::Stopped),
            ContainerOpcode::GraphSuspend => Some(SgState::Suspended),
            _ => None,
        };
        let Some(next) = next else { return };

        for id in targets {
            if let Ok(sg) = self.db.sub_graph_mut(id) {
                if sources.contains(&sg.state) {
                    sg.state = next;
                }
            }
        }
    }

    /// CLOSE's final synchronous step: destroy the cached link
    /// connections, every port owned by a closing sub-graph, the module
    /// groupings (and with them emptied sub-graphs), the containers that
    /// terminated, and re-sort what remains.
    pub(crate) fn op_gm_destroy_closed(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        if gm_kind(self.cmds.ctrl(slot)) != GmKind::Close {
            return Ok(StepOutcome::Done);
        }

        let reg = self.cmds.ctrl(slot).gm.reg_sgs.clone();
        let cached = std::mem::take(&mut self.cmds.ctrl_mut(slot).gm.cached_conns);

        connection::destroy_connections(&mut self.db, &cached);
        if self.cmds.ctrl(slot).open.failed {
            // A failed open also takes its own connections back out, even
            // the ones anchored only in pre-existing sub-graphs.
            let conns = std::mem::take(&mut self.cmds.ctrl_mut(slot).open.conns);
            connection::destroy_connections(&mut self.db, &conns);
        }
        connection::destroy_ports_by_self_sg(&mut self.db, &reg);

        let affected: Vec<ContainerId> = self
            .db
            .containers
            .iter()
            .filter(|(_, c)| c.sub_graphs.iter().any(|sg| reg.contains(sg)))
            .map(|(id, _)| *id)
            .collect();
        for cid in affected {
            let destroyed = connection::clear_pspc_module_lists(&mut self.db, cid, &reg)?;
            for sg in destroyed {
                self.update_deferred_for_closed_sg(sg);
                self.log(GraphEvent::SubGraphDestroyed(sg));
            }
        }

        let doomed = std::mem::take(&mut self.cmds.ctrl_mut(slot).gm.destroy_targets);
        for cid in doomed {
            sort::remove_container(&mut self.db, cid);
            self.db.containers.remove(&cid);
            self.hosts.remove(&cid);
            self.log(GraphEvent::ContainerDestroyed(cid));
        }

        let report = sort::update_graphs(&mut self.db)?;
        self.log_sort_report(&report);
        Ok(StepOutcome::Done)
    }
}
