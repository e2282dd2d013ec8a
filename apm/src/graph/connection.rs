//! Link resolution and the connection teardown paths driven by CLOSE.

use crate::status::ApmError;

use super::db::{GraphDb, LinkEnd};
use super::{ConnId, ContainerId, LinkCfg, LinkClass, SubGraphId};

/// Who is asking a link to be resolved.
///
/// This is the single authority on dangling links: a graph OPEN may name a
/// link whose other endpoint belongs to a use case that is not running yet,
/// so one absent endpoint is tolerated and recorded as dangling. Every
/// graph-management operation requires both endpoints. Both endpoints
/// absent is an error for everyone.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkPolicy {
    Open,
    GraphMgmt,
}

impl LinkPolicy {
    fn allows_dangling(self) -> bool {
        matches!(self, LinkPolicy::Open)
    }
}

/// A link spec with its endpoints looked up in the database.
#[derive(Debug)]
pub struct ResolvedLink {
    pub class: LinkClass,
    pub upstream: Option<LinkEnd>,
    pub downstream: Option<LinkEnd>,
}

/// Looks up both endpoint modules of `link`.
///
/// An absent module leaves its side dangling when the policy permits it;
/// otherwise the link is a [`ApmError::BadParam`]. Two absent modules are
/// always [`ApmError::DanglingLink`].
pub fn resolve_link(
    db: &GraphDb,
    link: &LinkCfg,
    policy: LinkPolicy,
) -> Result<ResolvedLink, ApmError> {
    let mut ends = [None, None];
    for (slot, handle) in [link.src, link.dst].into_iter().enumerate() {
        match db.modules.get(&handle.module) {
            Some(module) => {
                ends[slot] = Some(LinkEnd {
                    handle,
                    container: module.container,
                    sub_graph: module.sub_graph,
                });
            }
            None if policy.allows_dangling() => {}
            None => return Err(ApmError::BadParam),
        }
    }
    let [upstream, downstream] = ends;
    if upstream.is_none() && downstream.is_none() {
        return Err(ApmError::DanglingLink);
    }
    Ok(ResolvedLink {
        class: link.class,
        upstream,
        downstream,
    })
}

/// Finds the connection carrying exactly this link, if it exists.
pub fn find_connection(db: &GraphDb, link: &LinkCfg) -> Option<ConnId> {
    db.connections
        .iter()
        .find(|(_, conn)| {
            conn.class == link.class
                && conn.upstream.as_ref().map(|e| e.handle) == Some(link.src)
                && conn.downstream.as_ref().map(|e| e.handle) == Some(link.dst)
        })
        .map(|(id, _)| *id)
}

/// Destroys a cached list of connections scheduled for closure.
pub fn destroy_connections(db: &mut GraphDb, conns: &[ConnId]) {
    for conn in conns {
        db.remove_connection(*conn);
    }
}

/// Drops every connection whose self side lies in any of the closing
/// sub-graphs, regardless of peer. Returns what was destroyed.
pub fn destroy_ports_by_self_sg(db: &mut GraphDb, closing: &[SubGraphId]) -> Vec<ConnId> {
    let doomed: Vec<ConnId> = db
        .connections
        .iter()
        .filter(|(_, conn)| {
            conn.upstream
                .as_ref()
                .is_some_and(|end| closing.contains(&end.sub_graph))
                || conn
                    .downstream
                    .as_ref()
                    .is_some_and(|end| closing.contains(&end.sub_graph))
        })
        .map(|(id, _)| *id)
        .collect();
    for conn in &doomed {
        db.remove_connection(*conn);
    }
    doomed
}

/// Clears the per-(sub-graph, container) module groupings of `container`
/// for each closing sub-graph, destroying modules, unlinking the pair, and
/// destroying any sub-graph whose container list empties.
///
/// Returns the sub-graphs destroyed, so the caller can elide them from
/// deferred commands.
pub fn clear_pspc_module_lists(
    db: &mut GraphDb,
    container: ContainerId,
    closing: &[SubGraphId],
) -> Result<Vec<SubGraphId>, ApmError> {
    let mut destroyed = Vec::new();

    for sg_id in closing {
        let cont = db.container_mut(container)?;
        let Some(pos) = cont.pspc.iter().position(|p| p.sub_graph == *sg_id) else {
            continue;
        };
        let group = cont.pspc.remove(pos);
        cont.sub_graphs.retain(|sg| sg != sg_id);
        for module in group.modules {
            db.modules.remove(&module);
        }

        let sg = db.sub_graph_mut(*sg_id)?;
        sg.containers.retain(|c| *c != container);
        let emptied = sg.containers.is_empty();
        if emptied {
            destroy_sub_graph(db, *sg_id);
            destroyed.push(*sg_id);
        }
    }

    Ok(destroyed)
}

/// Removes a container-less sub-graph: its arena entry, its membership in
/// every container-graph, and every connection endpoint still naming it
/// (which becomes dangling, in the same critical section).
fn destroy_sub_graph(db: &mut GraphDb, sg_id: SubGraphId) {
    super::sort::remove_sub_graph(db, sg_id);
    scrub_sub_graph_refs(db, sg_id);
    db.sub_graphs.remove(&sg_id);
}

/// Marks dangling every connection endpoint referencing `sg_id`, dropping
/// connections that lose both endpoints and edges that no longer cross
/// sub-graphs.
fn scrub_sub_graph_refs(db: &mut GraphDb, sg_id: SubGraphId) {
    let referencing: Vec<ConnId> = db
        .connections
        .iter()
        .filter(|(_, conn)| {
            [conn.upstream.as_ref(), conn.downstream.as_ref()]
                .into_iter()
                .flatten()
                .any(|end| end.sub_graph == sg_id)
        })
        .map(|(id, _)| *id)
        .collect();

    for id in referencing {
        let conn = db.connections.get_mut(&id).expect("listed connection");
        if conn
            .upstream
            .as_ref()
            .is_some_and(|end| end.sub_graph == sg_id)
        {
            conn.upstream = None;
        }
        if conn
            .downstream
            .as_ref()
            .is_some_and(|end| end.sub_graph == sg_id)
        {
            conn.downstream = None;
        }
        if conn.upstream.is_none() && conn.downstream.is_none() {
            db.remove_connection(id);
        } else if !db.connections[&id].crosses_sub_graphs() {
            db.sg_edges.retain(|c| *c != id);
        }
    }
}

/// Containers on different heaps that share a link must both allocate
/// cross-heap buffers; report such a pair so the open fan-out can annotate
/// both sides. A pure caching step with no algorithmic state.
pub fn mixed_heap_pair(db: &GraphDb, link: &ResolvedLink) -> Option<(ContainerId, ContainerId)> {
    let (up, down) = (link.upstream.as_ref()?, link.downstream.as_ref()?);
    let up_heap = db.container(up.container).ok()?.heap_id;
    let down_heap = db.container(down.container).ok()?.heap_id;
    (up_heap != down_heap).then_some((up.container, down.container))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{HeapId, ModuleId, PortHandle};

    fn handle(module: u32) -> PortHandle {
        PortHandle {
            module: ModuleId(module),
            port_id: 1,
        }
    }

    fn link(src: u32, dst: u32) -> LinkCfg {
        LinkCfg {
            class: LinkClass::Data,
            src: handle(src),
            dst: handle(dst),
        }
    }

    fn one_module_db() -> GraphDb {
        let mut db = GraphDb::new();
        db.create_sub_graph(SubGraphId(0x100)).unwrap();
        db.create_container(ContainerId(0xC1), HeapId(0)).unwrap();
        db.create_module(ModuleId(0xA1), SubGraphId(0x100), ContainerId(0xC1))
            .unwrap();
        db
    }

    #[test]
    fn open_tolerates_one_absent_endpoint() {
        let db = one_module_db();
        let resolved = resolve_link(&db, &link(0xA1, 0xFF), LinkPolicy::Open).unwrap();
        assert!(resolved.upstream.is_some());
        assert!(resolved.downstream.is_none());
    }

    #[test]
    fn graph_mgmt_requires_both_endpoints() {
        let db = one_module_db();
        let err = resolve_link(&db, &link(0xA1, 0xFF), LinkPolicy::GraphMgmt).unwrap_err();
        assert_eq!(err, ApmError::BadParam);
    }

    #[test]
    fn both_absent_is_dangling() {
        let db = one_module_db();
        let err = resolve_link(&db, &link(0xFE, 0xFF), LinkPolicy::Open).unwrap_err();
        assert_eq!(err, ApmError::DanglingLink);
    }

    #[test]
    fn closing_the_last_grouping_destroys_the_sub_graph() {
        let mut db = one_module_db();
        let destroyed =
            clear_pspc_module_lists(&mut db, ContainerId(0xC1), &[SubGraphId(0x100)]).unwrap();
        assert_eq!(destroyed, vec![SubGraphId(0x100)]);
        assert!(db.sub_graphs.is_empty());
        assert!(db.modules.is_empty());
    }

    #[test]
    fn destroying_a_peer_sub_graph_leaves_a_dangling_edge() {
        let mut db = one_module_db();
        db.create_sub_graph(SubGraphId(0x200)).unwrap();
        db.create_container(ContainerId(0xC2), HeapId(0)).unwrap();
        db.create_module(ModuleId(0xB1), SubGraphId(0x200), ContainerId(0xC2))
            .unwrap();

        let resolved = resolve_link(&db, &link(0xA1, 0xB1), LinkPolicy::Open).unwrap();
        let conn = db
            .add_connection(LinkClass::Data, resolved.upstream, resolved.downstream)
            .unwrap();
        assert_eq!(db.sg_edges, vec![conn]);

        // Close 0x200's only grouping without touching the connection
        // first: the edge survives with its peer marked dangling only if it
        // still has an endpoint; here the 0x200 side is scrubbed.
        let destroyed =
            clear_pspc_module_lists(&mut db, ContainerId(0xC2), &[SubGraphId(0x200)]).unwrap();
        assert_eq!(destroyed, vec![SubGraphId(0x200)]);
        let conn = db.connections.values().next().unwrap();
        assert!(conn.downstream.is_none());
        assert!(db.sg_edges.is_empty());
    }

    #[test]
    fn self_sg_teardown_drops_all_links() {
        let mut db = one_module_db();
        db.create_container(ContainerId(0xC2), HeapId(0)).unwrap();
        db.create_module(ModuleId(0xA2), SubGraphId(0x100), ContainerId(0xC2))
            .unwrap();
        let resolved = resolve_link(&db, &link(0xA1, 0xA2), LinkPolicy::Open).unwrap();
        db.add_connection(LinkClass::Data, resolved.upstream, resolved.downstream)
            .unwrap();

        let doomed = destroy_ports_by_self_sg(&mut db, &[SubGraphId(0x100)]);
        assert_eq!(doomed.len(), 1);
        assert!(db.connections.is_empty());
    }

    #[test]
    fn mixed_heap_links_are_reported() {
        let mut db = one_module_db();
        db.create_container(ContainerId(0xC2), HeapId(1)).unwrap();
        db.create_module(ModuleId(0xA2), SubGraphId(0x100), ContainerId(0xC2))
            .unwrap();
        let resolved = resolve_link(&db, &link(0xA1, 0xA2), LinkPolicy::Open).unwrap();
        assert_eq!(
            mixed_heap_pair(&db, &resolved),
            Some((ContainerId(0xC1), ContainerId(0xC2)))
        );
    }
}
