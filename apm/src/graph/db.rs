//! Arena storage for sub-graphs, containers, modules, connections, and
//! container-graphs, with search/insert/remove by identity.

use std::collections::BTreeMap;

use itertools::Itertools;
use smallvec::SmallVec;

use crate::status::ApmError;

use super::{
    ConnId, ContainerId, Cyclicity, GraphId, HeapId, LinkClass, ModuleId, PortClass, PortHandle,
    SgState, SubGraphId, PORT_CLASS_COUNT,
};

/// A client-addressable unit of lifecycle.
#[derive(Debug)]
pub struct SubGraph {
    pub id: SubGraphId,
    pub state: SgState,
    /// Containers hosting at least one module of this sub-graph.
    pub containers: Vec<ContainerId>,
}

/// Modules grouped per (sub-graph, container) pair.
#[derive(Debug)]
pub struct PspcModules {
    pub sub_graph: SubGraphId,
    pub modules: Vec<ModuleId>,
}

/// Per-sort scratch state, reset before every sort pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct SortScratch {
    pub visited: bool,
    pub sorted: bool,
    pub out_degree: u32,
}

/// Connection lists indexed by `(cyclicity, port class)`, each entry an id
/// into the connection arena.
#[derive(Debug)]
pub struct PortTable {
    lists: [[Vec<ConnId>; PORT_CLASS_COUNT]; 2],
}

impl Default for PortTable {
    fn default() -> Self {
        PortTable {
            lists: std::array::from_fn(|_| std::array::from_fn(|_| Vec::new())),
        }
    }
}

impl PortTable {
    pub fn list(&self, cyclicity: Cyclicity, class: PortClass) -> &[ConnId] {
        &self.lists[cyclicity.index()][class.index()]
    }

    pub fn push(&mut self, cyclicity: Cyclicity, class: PortClass, conn: ConnId) {
        self.lists[cyclicity.index()][class.index()].push(conn);
    }

    /// Removes `conn` wherever it is filed.
    pub fn remove(&mut self, conn: ConnId) {
        for row in &mut self.lists {
            for list in row {
                list.retain(|c| *c != conn);
            }
        }
    }

    /// Moves `conn` from the acyclic to the cyclic list of `class`.
    pub fn reclassify_cyclic(&mut self, class: PortClass, conn: ConnId) {
        let acyclic = &mut self.lists[Cyclicity::Acyclic.index()][class.index()];
        if let Some(pos) = acyclic.iter().position(|c| *c == conn) {
            acyclic.remove(pos);
            self.lists[Cyclicity::Cyclic.index()][class.index()].push(conn);
        }
    }

    /// Merges every cyclic list back into its acyclic counterpart.
    pub fn merge_cyclic_back(&mut self) {
        for class in 0..PORT_CLASS_COUNT {
            let cyclic = std::mem::take(&mut self.lists[Cyclicity::Cyclic.index()][class]);
            self.lists[Cyclicity::Acyclic.index()][class].extend(cyclic);
        }
    }
}

/// A runtime-level worker hosting modules; opaque except for its identity,
/// heap placement, and response contract.
#[derive(Debug)]
pub struct Container {
    pub id: ContainerId,
    pub heap_id: HeapId,
    /// Sub-graphs overlapping this container.
    pub sub_graphs: Vec<SubGraphId>,
    /// Module groupings, one per overlapping sub-graph.
    pub pspc: Vec<PspcModules>,
    pub ports: PortTable,
    pub graph: Option<GraphId>,
    pub(crate) sort: SortScratch,
}

impl Container {
    pub fn modules_of(&self, sub_graph: SubGraphId) -> &[ModuleId] {
        self.pspc
            .iter()
            .find(|p| p.sub_graph == sub_graph)
            .map(|p| p.modules.as_slice())
            .unwrap_or(&[])
    }
}

/// A signal-processing unit hosted by exactly one container and sub-graph.
#[derive(Debug, Clone, Copy)]
pub struct Module {
    pub id: ModuleId,
    pub sub_graph: SubGraphId,
    pub container: ContainerId,
}

/// One resolved endpoint of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEnd {
    pub handle: PortHandle,
    pub container: ContainerId,
    pub sub_graph: SubGraphId,
}

/// An inter-container link. An endpoint is `None` while dangling: the
/// module on that side has not been (or has ceased to be) opened.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub class: LinkClass,
    pub upstream: Option<LinkEnd>,
    pub downstream: Option<LinkEnd>,
}

impl Connection {
    /// True when both endpoints exist and live in different sub-graphs.
    pub fn crosses_sub_graphs(&self) -> bool {
        match (&self.upstream, &self.downstream) {
            (Some(up), Some(down)) => up.sub_graph != down.sub_graph,
            _ => false,
        }
    }

    /// The endpoint hosted by `container`, if any.
    pub fn end_in(&self, container: ContainerId) -> Option<&LinkEnd> {
        [self.upstream.as_ref(), self.downstream.as_ref()]
            .into_iter()
            .flatten()
            .find(|end| end.container == container)
    }

    /// The sub-graph of the endpoint opposite to `sub_graph`, if resolved.
    pub fn peer_sub_graph(&self, sub_graph: SubGraphId) -> Option<SubGraphId> {
        match (&self.upstream, &self.downstream) {
            (Some(up), Some(down)) if up.sub_graph == sub_graph => Some(down.sub_graph),
            (Some(up), Some(down)) if down.sub_graph == sub_graph => Some(up.sub_graph),
            _ => None,
        }
    }

    pub fn handles(&self) -> SmallVec<[PortHandle; 2]> {
        [self.upstream.as_ref(), self.downstream.as_ref()]
            .into_iter()
            .flatten()
            .map(|end| end.handle)
            .collect()
    }
}

/// A maximal weakly-connected set of containers; the unit over which the
/// topological sort runs.
#[derive(Debug)]
pub struct ContGraph {
    pub id: GraphId,
    /// Member containers; a topological order of the acyclic data edges
    /// whenever `sorted` holds.
    pub containers: Vec<ContainerId>,
    /// Union of the members' sub-graph lists.
    pub sub_graphs: Vec<SubGraphId>,
    pub sorted: bool,
}

/// The global graph database.
#[derive(Debug, Default)]
pub struct GraphDb {
    pub sub_graphs: BTreeMap<SubGraphId, SubGraph>,
    pub containers: BTreeMap<ContainerId, Container>,
    pub modules: BTreeMap<ModuleId, Module>,
    pub graphs: BTreeMap<GraphId, ContGraph>,
    pub connections: BTreeMap<ConnId, Connection>,
    /// Connections crossing sub-graph boundaries, the global edge list.
    pub sg_edges: Vec<ConnId>,
    /// Containers not yet absorbed into any container-graph.
    pub standalone: Vec<ContainerId>,
    next_uid: u32,
}

impl GraphDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// A free-running identifier for internally created objects. Starts at
    /// one; wrap-around is acceptable.
    pub fn next_uid(&mut self) -> u32 {
        self.next_uid = self.next_uid.wrapping_add(1);
        self.next_uid
    }

    pub fn sub_graph(&self, id: SubGraphId) -> Result<&SubGraph, ApmError> {
        self.sub_graphs.get(&id).ok_or(ApmError::BadParam)
    }

    pub fn sub_graph_mut(&mut self, id: SubGraphId) -> Result<&mut SubGraph, ApmError> {
        self.sub_graphs.get_mut(&id).ok_or(ApmError::BadParam)
    }

    pub fn container(&self, id: ContainerId) -> Result<&Container, ApmError> {
        self.containers.get(&id).ok_or(ApmError::BadParam)
    }

    pub fn container_mut(&mut self, id: ContainerId) -> Result<&mut Container, ApmError> {
        self.containers.get_mut(&id).ok_or(ApmError::BadParam)
    }

    pub fn module(&self, id: ModuleId) -> Result<&Module, ApmError> {
        self.modules.get(&id).ok_or(ApmError::BadParam)
    }

    /// Creates a sub-graph in the STOPPED state. The id must be fresh.
    pub fn create_sub_graph(&mut self, id: SubGraphId) -> Result<(), ApmError> {
        if self.sub_graphs.contains_key(&id) {
            return Err(ApmError::Already);
        }
        self.sub_graphs.insert(
            id,
            SubGraph {
                id,
                state: SgState::Stopped,
                containers: Vec::new(),
            },
        );
        Ok(())
    }

    /// Creates a container. The id must be fresh; the container starts
    /// standalone, outside any container-graph.
    pub fn create_container(&mut self, id: ContainerId, heap_id: HeapId) -> Result<(), ApmError> {
        if self.containers.contains_key(&id) {
            return Err(ApmError::Already);
        }
        self.containers.insert(
            id,
            Container {
                id,
                heap_id,
                sub_graphs: Vec::new(),
                pspc: Vec::new(),
                ports: PortTable::default(),
                graph: None,
                sort: SortScratch::default(),
            },
        );
        self.standalone.push(id);
        Ok(())
    }

    /// Creates a module in its (sub-graph, container) grouping, linking the
    /// sub-graph and container to each other.
    pub fn create_module(
        &mut self,
        id: ModuleId,
        sub_graph: SubGraphId,
        container: ContainerId,
    ) -> Result<(), ApmError> {
        if self.modules.contains_key(&id) {
            return Err(ApmError::Already);
        }
        if !self.sub_graphs.contains_key(&sub_graph) || !self.containers.contains_key(&container) {
            return Err(ApmError::BadParam);
        }

        let cont = self.containers.get_mut(&container).expect("checked above");
        match cont.pspc.iter_mut().find(|p| p.sub_graph == sub_graph) {
            Some(group) => group.modules.push(id),
            None => cont.pspc.push(PspcModules {
                sub_graph,
                modules: vec![id],
            }),
        }
        if !cont.sub_graphs.contains(&sub_graph) {
            cont.sub_graphs.push(sub_graph);
        }
        let sg = self.sub_graphs.get_mut(&sub_graph).expect("checked above");
        if !sg.containers.contains(&container) {
            sg.containers.push(container);
        }

        self.modules.insert(
            id,
            Module {
                id,
                sub_graph,
                container,
            },
        );
        Ok(())
    }

    /// Inserts a connection and files it in the endpoint containers' port
    /// tables (acyclic until a sort says otherwise).
    pub fn add_connection(
        &mut self,
        class: LinkClass,
        upstream: Option<LinkEnd>,
        downstream: Option<LinkEnd>,
    ) -> Result<ConnId, ApmError> {
        if upstream.is_none() && downstream.is_none() {
            return Err(ApmError::DanglingLink);
        }
        let id = ConnId(self.next_uid());
        let conn = Connection {
            id,
            class,
            upstream,
            downstream,
        };

        if let Some(up) = &conn.upstream {
            let class = port_class_for(conn.class, PortClass::DataOut);
            self.container_mut(up.container)?
                .ports
                .push(Cyclicity::Acyclic, class, id);
        }
        if let Some(down) = &conn.downstream {
            let class = port_class_for(conn.class, PortClass::DataIn);
            self.container_mut(down.container)?
                .ports
                .push(Cyclicity::Acyclic, class, id);
        }
        if conn.crosses_sub_graphs() {
            self.sg_edges.push(id);
        }
        self.connections.insert(id, conn);
        Ok(id)
    }

    /// Unfiles and removes a connection everywhere it is referenced.
    pub fn remove_connection(&mut self, id: ConnId) {
        if let Some(conn) = self.connections.remove(&id) {
            for end in [&conn.upstream, &conn.downstream].into_iter().flatten() {
                if let Some(cont) = self.containers.get_mut(&end.container) {
                    cont.ports.remove(id);
                }
            }
            self.sg_edges.retain(|c| *c != id);
        }
    }

    /// Acyclic data connections leaving `container`, with both ends
    /// resolved.
    pub fn data_out_conns(&self, container: ContainerId, cyclicity: Cyclicity) -> Vec<ConnId> {
        let Ok(cont) = self.container(container) else {
            return Vec::new();
        };
        cont.ports
            .list(cyclicity, PortClass::DataOut)
            .iter()
            .copied()
            .filter(|c| self.conn_peer(*c).is_some())
            .collect()
    }

    /// Acyclic data connections entering `container`, with both ends
    /// resolved.
    pub fn data_in_conns(&self, container: ContainerId, cyclicity: Cyclicity) -> Vec<ConnId> {
        let Ok(cont) = self.container(container) else {
            return Vec::new();
        };
        cont.ports
            .list(cyclicity, PortClass::DataIn)
            .iter()
            .copied()
            .filter(|c| self.conn_peer(*c).is_some())
            .collect()
    }

    fn conn_peer(&self, conn: ConnId) -> Option<(ContainerId, ContainerId)> {
        let conn = self.connections.get(&conn)?;
        match (&conn.upstream, &conn.downstream) {
            (Some(up), Some(down)) => Some((up.container, down.container)),
            _ => None,
        }
    }

    /// The downstream peer container of `conn`, when both ends exist.
    pub fn downstream_peer(&self, conn: ConnId) -> Option<ContainerId> {
        self.conn_peer(conn).map(|(_, down)| down)
    }

    /// The upstream peer container of `conn`, when both ends exist.
    pub fn upstream_peer(&self, conn: ConnId) -> Option<ContainerId> {
        self.conn_peer(conn).map(|(up, _)| up)
    }

    /// Verifies the global invariants. Intended for debug assertions and
    /// tests at quiescent points (no command in flight).
    pub fn check_invariants(&self) -> Result<(), String> {
        // Modules lie in exactly one grouping, and the arena is their union.
        let mut grouped = 0usize;
        for cont in self.containers.values() {
            for group in &cont.pspc {
                for module in &group.modules {
                    grouped += 1;
                    let entry = self
                        .modules
                        .get(module)
                        .ok_or_else(|| format!("{:?} grouped but not in arena", module))?;
                    if entry.container != cont.id || entry.sub_graph != group.sub_graph {
                        return Err(format!("{:?} grouping disagrees with arena", module));
                    }
                }
            }
        }
        if grouped != self.modules.len() {
            return Err(format!(
                "{} grouped modules vs {} in arena",
                grouped,
                self.modules.len()
            ));
        }

        // Cross-sub-graph edges appear in the global list exactly once and
        // are filed on both endpoint containers.
        for (id, conn) in &self.connections {
            let listed = self.sg_edges.iter().filter(|c| **c == *id).count();
            let expected = usize::from(conn.crosses_sub_graphs());
            if listed != expected {
                return Err(format!("{:?} listed {} times in sg_edges", id, listed));
            }
            for (end, direction) in [
                (&conn.upstream, PortClass::DataOut),
                (&conn.downstream, PortClass::DataIn),
            ] {
                if let Some(end) = end {
                    let filed_class = port_class_for(conn.class, direction);
                    let cont = self
                        .containers
                        .get(&end.container)
                        .ok_or_else(|| format!("{:?} endpoint container missing", id))?;
                    let filed = cont.ports.list(Cyclicity::Acyclic, filed_class).contains(id)
                        || cont.ports.list(Cyclicity::Cyclic, filed_class).contains(id);
                    if !filed {
                        return Err(format!("{:?} not filed on {:?}", id, end.container));
                    }
                }
            }
        }

        // Container-graph membership and sub-graph unions.
        for (gid, graph) in &self.graphs {
            let mut union: Vec<SubGraphId> = Vec::new();
            for cid in &graph.containers {
                let cont = self
                    .containers
                    .get(cid)
                    .ok_or_else(|| format!("{:?} member {:?} missing", gid, cid))?;
                if cont.graph != Some(*gid) {
                    return Err(format!("{:?} does not point back to {:?}", cid, gid));
                }
                union.extend(cont.sub_graphs.iter().copied());
            }
            let union: Vec<SubGraphId> = union.into_iter().sorted().dedup().collect();
            let listed: Vec<SubGraphId> = graph.sub_graphs.iter().copied().sorted().collect();
            if listed != union {
                return Err(format!("{:?} sub-graph list is not the member union", gid));
            }
        }

        // Sub-graphs with no containers must have been destroyed.
        for (id, sg) in &self.sub_graphs {
            if sg.containers.is_empty() {
                return Err(format!("{:?} has an empty container list", id));
            }
        }

        Ok(())
    }
}

/// Control links are filed under the control class on both ends; data links
/// keep their direction.
fn port_class_for(class: LinkClass, direction: PortClass) -> PortClass {
    match class {
        LinkClass::Data => direction,
        LinkClass::Control => PortClass::Control,
    }
}
