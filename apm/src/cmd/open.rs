//! GRAPH_OPEN: validate and cache the payload, create the named entities,
//! fan the open and connect messages out, and hand any cross-sub-graph
//! link between started sub-graphs to a state-management sub-sequence.

use std::collections::BTreeMap;

use crate::graph::connection::{self, LinkPolicy};
use crate::graph::{sort, ContainerId, LinkClass, ModuleId, SgState, SubGraphId};
use crate::logging::GraphEvent;
use crate::messages::container::{ConnSpec, ContainerOpcode, ContainerPayload};
use crate::messages::payload::ModuleCfg;
use crate::status::ApmError;
use crate::worker::Apm;

use super::sequencer::StepOutcome;

/// Where a link endpoint lives, counting modules of the open payload that
/// do not exist in the database yet.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum EndpointHome {
    /// Module already open; carries its host (sub-graph state, container).
    Existing(SubGraphId, ContainerId),
    /// Module named in this payload.
    Incoming,
    Absent,
}

impl Apm {
    /// Validates the cached payload and records any link whose endpoints
    /// both lie in already-started sub-graphs, to be started at the end of
    /// the open.
    pub(crate) fn op_open_parse(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let payload = self.cmds.ctrl(slot).open.payload.clone();

        // A sub-graph exists through its modules; opening one with none
        // would leave an entry no close could ever reach.
        for sg in &payload.sub_graphs {
            if !payload
                .modules
                .iter()
                .any(|m| m.sub_graph_id == sg.sub_graph_id)
            {
                return Err(ApmError::BadParam);
            }
        }

        // Every module must name a sub-graph and container that this open
        // creates or that already exist.
        for module in &payload.modules {
            let sg_known = payload
                .sub_graphs
                .iter()
                .any(|s| s.sub_graph_id == module.sub_graph_id)
                || self.db.sub_graphs.contains_key(&module.sub_graph_id);
            let cont_known = payload
                .containers
                .iter()
                .any(|c| c.container_id == module.container_id)
                || self.db.containers.contains_key(&module.container_id);
            if !sg_known || !cont_known {
                return Err(ApmError::BadParam);
            }
        }

        let home = |module: ModuleId| -> EndpointHome {
            if let Some(entry) = self.db.modules.get(&module) {
                EndpointHome::Existing(entry.sub_graph, entry.container)
            } else if payload.modules.iter().any(|m| m.module_id == module) {
                EndpointHome::Incoming
            } else {
                EndpointHome::Absent
            }
        };

        let mut link_start = Vec::new();
        for link in &payload.links {
            match (home(link.src.module), home(link.dst.module)) {
                // A link may dangle on one side, for concurrent use cases
                // opened independently. Both sides absent is an error.
                (EndpointHome::Absent, EndpointHome::Absent) => {
                    return Err(ApmError::DanglingLink);
                }
                (EndpointHome::Existing(src_sg, src_cont), EndpointHome::Existing(dst_sg, dst_cont)) => {
                    let src_started =
                        self.db.sub_graph(src_sg)?.state == SgState::Started;
                    let dst_started =
                        self.db.sub_graph(dst_sg)?.state == SgState::Started;
                    if src_started && dst_started {
                        if src_sg == dst_sg || src_cont == dst_cont {
                            // A runtime link must actually cross both a
                            // sub-graph and a container boundary.
                            return Err(ApmError::BadParam);
                        }
                        link_start.push(*link);
                    }
                }
                _ => {}
            }
        }

        self.cmds.ctrl_mut(slot).open.link_start = link_start;
        Ok(StepOutcome::Done)
    }

    pub(crate) fn op_open_create_sub_graphs(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let cfgs = self.cmds.ctrl(slot).open.payload.sub_graphs.clone();
        for cfg in cfgs {
            self.db.create_sub_graph(cfg.sub_graph_id)?;
            self.log(GraphEvent::SubGraphCreated(cfg.sub_graph_id));
        }
        Ok(StepOutcome::Done)
    }

    pub(crate) fn op_open_create_containers(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let cfgs = self.cmds.ctrl(slot).open.payload.containers.clone();
        for cfg in cfgs {
            self.db.create_container(cfg.container_id, cfg.heap_id)?;
            let responder = self.responder();
            let host = self.factory.create(cfg.container_id, cfg.heap_id, responder)?;
            self.hosts.insert(cfg.container_id, host);
            self.cmds
                .ctrl_mut(slot)
                .open
                .created_containers
                .push(cfg.container_id);
            self.log(GraphEvent::ContainerCreated(cfg.container_id));
        }
        Ok(StepOutcome::Done)
    }

    /// Creates the module records and issues GRAPH_OPEN to every container
    /// receiving modules (and to freshly created empty containers).
    pub(crate) fn op_open_issue_opens(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let payload = self.cmds.ctrl(slot).open.payload.clone();

        for module in &payload.modules {
            self.db
                .create_module(module.module_id, module.sub_graph_id, module.container_id)?;
        }

        // Containers on different heaps that share a link both cache a
        // mixed-heap entry for their open configuration.
        for link in &payload.links {
            if let Ok(resolved) = connection::resolve_link(&self.db, link, LinkPolicy::Open) {
                if let Some((a, b)) = connection::mixed_heap_pair(&self.db, &resolved) {
                    let ctrl = self.cmds.ctrl_mut(slot);
                    let scratch = ctrl.scratch_mut(a);
                    if !scratch.mixed_heap_peers.contains(&b) {
                        scratch.mixed_heap_peers.push(b);
                    }
                    let scratch = ctrl.scratch_mut(b);
                    if !scratch.mixed_heap_peers.contains(&a) {
                        scratch.mixed_heap_peers.push(a);
                    }
                }
            }
        }

        let mut by_container: BTreeMap<ContainerId, Vec<ModuleCfg>> = BTreeMap::new();
        for module in &payload.modules {
            by_container
                .entry(module.container_id)
                .or_default()
                .push(*module);
        }
        for cid in &self.cmds.ctrl(slot).open.created_containers.clone() {
            by_container.entry(*cid).or_default();
        }

        self.begin_fanout(slot);
        for (cid, modules) in by_container {
            let mut sub_graphs: Vec<SubGraphId> = Vec::new();
            for module in &modules {
                if !sub_graphs.contains(&module.sub_graph_id) {
                    sub_graphs.push(module.sub_graph_id);
                }
            }
            let mixed_heap_peers = {
                let ctrl = self.cmds.ctrl_mut(slot);
                let scratch = ctrl.scratch_mut(cid);
                scratch.open_modules = modules.clone();
                scratch.open_sub_graphs = sub_graphs.clone();
                scratch.mixed_heap_peers.clone()
            };
            self.issue_to_container(
                slot,
                cid,
                ContainerOpcode::GraphOpen,
                ContainerPayload::Open {
                    sub_graphs,
                    modules,
                    mixed_heap_peers,
                },
            )?;
        }

        Ok(self.fanout_outcome(slot))
    }

    /// Creates the connection records, merges container-graphs along data
    /// links, and issues GRAPH_CONNECT to the endpoint containers.
    pub(crate) fn op_open_connect_peers(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let links = self.cmds.ctrl(slot).open.payload.links.clone();
        let mut specs: BTreeMap<ContainerId, Vec<ConnSpec>> = BTreeMap::new();

        for link in &links {
            let resolved = connection::resolve_link(&self.db, link, LinkPolicy::Open)?;
            let conn = self
                .db
                .add_connection(resolved.class, resolved.upstream, resolved.downstream)?;
            self.cmds.ctrl_mut(slot).open.conns.push(conn);

            let (class, up, down) = {
                let entry = &self.db.connections[&conn];
                (entry.class, entry.upstream, entry.downstream)
            };
            if let (Some(up), Some(down)) = (up, down) {
                if class == LinkClass::Data {
                    sort::update_membership(&mut self.db, up.container, down.container, false)?;
                }
                specs.entry(up.container).or_default().push(ConnSpec {
                    self_handle: up.handle,
                    peer_handle: Some(down.handle),
                    peer_container: Some(down.container),
                });
                specs.entry(down.container).or_default().push(ConnSpec {
                    self_handle: down.handle,
                    peer_handle: Some(up.handle),
                    peer_container: Some(up.container),
                });
            } else {
                // Dangling link: only the present side learns of it.
                for end in [up, down].into_iter().flatten() {
                    specs.entry(end.container).or_default().push(ConnSpec {
                        self_handle: end.handle,
                        peer_handle: None,
                        peer_container: None,
                    });
                }
            }
        }

        self.begin_fanout(slot);
        for (cid, links) in specs {
            self.cmds.ctrl_mut(slot).scratch_mut(cid).connect_links = links.clone();
            self.issue_to_container(
                slot,
                cid,
                ContainerOpcode::GraphConnect,
                ContainerPayload::Connect { links },
            )?;
        }
        Ok(self.fanout_outcome(slot))
    }

    /// Stages a PREPARE+START sub-sequence over the links cached at parse
    /// time, addressed through their port handles.
    pub(crate) fn op_open_link_start_setup(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let link_start = self.cmds.ctrl(slot).open.link_start.clone();
        if link_start.is_empty() {
            return Ok(StepOutcome::Done);
        }

        let mut link_sgs: Vec<SubGraphId> = Vec::new();
        let mut graphs = Vec::new();
        let mut conns = Vec::new();
        for link in &link_start {
            let conn = connection::find_connection(&self.db, link).ok_or(ApmError::BadParam)?;
            conns.push(conn);
            let entry = &self.db.connections[&conn];
            for end in [entry.upstream, entry.downstream].into_iter().flatten() {
                if self.db.sub_graph(end.sub_graph)?.state == SgState::Started
                    && !link_sgs.contains(&end.sub_graph)
                {
                    link_sgs.push(end.sub_graph);
                }
                if let Some(gid) = self.db.container(end.container)?.graph {
                    if !graphs.contains(&gid) {
                        graphs.push(gid);
                    }
                }
            }
        }

        let ctrl = self.cmds.ctrl_mut(slot);
        ctrl.gm.cached_conns = conns;
        ctrl.gm.link_sgs = link_sgs;
        ctrl.gm.list_state = Some(SgState::Stopped);
        ctrl.gm.graphs = graphs;
        ctrl.seq.stages = vec![ContainerOpcode::GraphPrepare, ContainerOpcode::GraphStart];
        ctrl.seq.stage_index = 0;
        Ok(StepOutcome::Done)
    }

    /// Re-sorts whatever graphs this open reshaped.
    pub(crate) fn op_open_update_graphs(&mut self, _slot: usize) -> Result<StepOutcome, ApmError> {
        let report = sort::update_graphs(&mut self.db)?;
        self.log_sort_report(&report);
        Ok(StepOutcome::Done)
    }
}
