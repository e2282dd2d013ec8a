//! Disjoint container-graph maintenance and the per-graph topological sort.

use crate::status::ApmError;

use super::db::{ContGraph, GraphDb};
use super::{ConnId, ContainerId, Cyclicity, GraphId, PortClass};

/// Bail-out bound for the sort loop; trips only on corrupted port
/// bookkeeping, where the DFS would otherwise spin.
pub const MAX_SORT_LOOP_ITERATIONS: u32 = 4096;

/// What a sort pass did, for the event log.
#[derive(Debug, Default)]
pub struct SortReport {
    /// Data links moved to the cyclic lists of both endpoints.
    pub reclassified: Vec<ConnId>,
    /// Freshly computed processing orders.
    pub orders: Vec<(GraphId, Vec<ContainerId>)>,
}

/// Records that an edge now joins `upstream` and `downstream`, creating or
/// merging container-graphs as needed.
///
/// Adding an edge within an already-connected graph merely clears its
/// sorted flag (or retains it, for callers that know the order still
/// holds).
pub fn update_membership(
    db: &mut GraphDb,
    upstream: ContainerId,
    downstream: ContainerId,
    retain_sorted: bool,
) -> Result<(), ApmError> {
    let up_graph = db.container(upstream)?.graph;
    let down_graph = db.container(downstream)?.graph;

    match (up_graph, down_graph) {
        (Some(a), Some(b)) if a == b => {
            db.graphs.get_mut(&a).expect("member graph").sorted = retain_sorted;
        }
        (None, None) => {
            let gid = create_graph_for(db, upstream);
            absorb_container(db, gid, downstream);
            db.graphs.get_mut(&gid).expect("new graph").sorted = retain_sorted;
        }
        (Some(a), None) => {
            absorb_container(db, a, downstream);
            db.graphs.get_mut(&a).expect("member graph").sorted = retain_sorted;
        }
        (None, Some(b)) => {
            absorb_container(db, b, upstream);
            db.graphs.get_mut(&b).expect("member graph").sorted = retain_sorted;
        }
        (Some(a), Some(b)) => {
            // Distinct graphs: merge the smaller into the larger.
            let (into, from) = if db.graphs[&a].containers.len() >= db.graphs[&b].containers.len() {
                (a, b)
            } else {
                (b, a)
            };
            let absorbed = db.graphs.remove(&from).expect("merge source");
            for cid in &absorbed.containers {
                db.containers.get_mut(cid).expect("member container").graph = Some(into);
            }
            let target = db.graphs.get_mut(&into).expect("merge target");
            target.containers.extend(absorbed.containers);
            for sg in absorbed.sub_graphs {
                if !target.sub_graphs.contains(&sg) {
                    target.sub_graphs.push(sg);
                }
            }
            target.sorted = retain_sorted;
        }
    }
    Ok(())
}

/// Creates a singleton graph for a standalone container.
fn create_graph_for(db: &mut GraphDb, container: ContainerId) -> GraphId {
    let gid = GraphId(db.next_uid());
    let cont = db.containers.get_mut(&container).expect("container exists");
    cont.graph = Some(gid);
    let sub_graphs = cont.sub_graphs.clone();
    db.graphs.insert(
        gid,
        ContGraph {
            id: gid,
            containers: vec![container],
            sub_graphs,
            // A single container is trivially in order.
            sorted: true,
        },
    );
    db.standalone.retain(|c| *c != container);
    gid
}

/// Adds a standalone container to an existing graph.
fn absorb_container(db: &mut GraphDb, gid: GraphId, container: ContainerId) {
    let cont = db.containers.get_mut(&container).expect("container exists");
    cont.graph = Some(gid);
    let sub_graphs = cont.sub_graphs.clone();
    let graph = db.graphs.get_mut(&gid).expect("graph exists");
    graph.containers.push(container);
    for sg in sub_graphs {
        if !graph.sub_graphs.contains(&sg) {
            graph.sub_graphs.push(sg);
        }
    }
    db.standalone.retain(|c| *c != container);
}

/// Removes a container from its graph, deleting the graph when it empties.
pub fn remove_container(db: &mut GraphDb, container: ContainerId) {
    let Some(gid) = db.containers.get(&container).and_then(|c| c.graph) else {
        db.standalone.retain(|c| *c != container);
        return;
    };
    let graph = db.graphs.get_mut(&gid).expect("member graph");
    graph.containers.retain(|c| *c != container);
    graph.sorted = false;
    if graph.containers.is_empty() {
        db.graphs.remove(&gid);
    }
    db.containers.get_mut(&container).expect("container").graph = None;
}

/// Drops a destroyed sub-graph from every graph's sub-graph union.
pub fn remove_sub_graph(db: &mut GraphDb, sub_graph: super::SubGraphId) {
    for graph in db.graphs.values_mut() {
        graph.sub_graphs.retain(|sg| *sg != sub_graph);
    }
}

/// Re-sorts every graph whose shape changed and promotes standalone
/// containers into singleton graphs.
pub fn update_graphs(db: &mut GraphDb) -> Result<SortReport, ApmError> {
    let mut report = SortReport::default();

    let pending: Vec<GraphId> = db
        .graphs
        .iter()
        .filter(|(_, g)| !g.sorted)
        .map(|(id, _)| *id)
        .collect();

    for gid in pending {
        // The graph shape may have changed; yesterday's cycles are not
        // today's. Merge the cyclic lists back before re-deriving them.
        reset_cyclic_links(db, gid);
        sort_graph(db, gid, &mut report)?;
    }

    let standalone: Vec<ContainerId> = db.standalone.clone();
    for cid in standalone {
        create_graph_for(db, cid);
    }

    Ok(report)
}

fn reset_cyclic_links(db: &mut GraphDb, gid: GraphId) {
    let members = db.graphs[&gid].containers.clone();
    for cid in members {
        db.containers
            .get_mut(&cid)
            .expect("member container")
            .ports
            .merge_cyclic_back();
    }
}

fn clear_sort_scratch(db: &mut GraphDb, members: &[ContainerId]) {
    for cid in members {
        db.containers.get_mut(cid).expect("member container").sort = Default::default();
    }
}

/// Topologically sorts one container-graph with an iterative DFS,
/// reclassifying back-edges as cyclic on both endpoints.
fn sort_graph(db: &mut GraphDb, gid: GraphId, report: &mut SortReport) -> Result<(), ApmError> {
    let members = db.graphs[&gid].containers.clone();

    // Out-degree of each member over the acyclic data-output connections.
    for cid in &members {
        let degree = db.data_out_conns(*cid, Cyclicity::Acyclic).len() as u32;
        let cont = db.containers.get_mut(cid).expect("member container");
        cont.sort = Default::default();
        cont.sort.out_degree = degree;
    }

    let mut remaining: Vec<ContainerId> = members.clone();
    let mut sorted_rev: Vec<ContainerId> = Vec::with_capacity(members.len());
    let mut stack: Vec<ContainerId> = Vec::new();
    let mut bailout = 0u32;

    while let Some(&seed) = remaining.first() {
        stack.push(seed);

        while let Some(&top) = stack.last() {
            debug_assert!(!db.containers[&top].sort.sorted, "sorted node on dfs stack");
            if !db.containers[&top].sort.visited {
                db.containers.get_mut(&top).expect("top").sort.visited = true;
            }

            if db.containers[&top].sort.out_degree > 0 {
                bailout += 1;
                if bailout > MAX_SORT_LOOP_ITERATIONS {
                    // Possible infinite loop from corrupted bookkeeping.
                    // Merge the partial result back and give up.
                    remaining.extend(sorted_rev.drain(..));
                    db.graphs.get_mut(&gid).expect("graph").containers = remaining;
                    clear_sort_scratch(db, &members);
                    return Err(ApmError::NoResource);
                }

                let mut prev_peer: Option<ContainerId> = None;
                for conn in db.data_out_conns(top, Cyclicity::Acyclic) {
                    let peer = db.downstream_peer(conn).expect("resolved connection");
                    // Skip peers already placed, and repeated links to the
                    // peer just considered.
                    if Some(peer) == prev_peer || db.containers[&peer].sort.sorted {
                        continue;
                    }
                    prev_peer = Some(peer);

                    if !db.containers[&peer].sort.visited {
                        stack.push(peer);
                    } else {
                        // Back-edge: every acyclic data link from `top` to
                        // `peer` leaves the order, on both endpoints.
                        let moved = reclassify_links(db, top, peer, report);
                        let scratch = &mut db.containers.get_mut(&top).expect("top").sort;
                        scratch.out_degree = scratch.out_degree.saturating_sub(moved);
                    }
                    break;
                }
            } else {
                bailout = 0;

                db.containers.get_mut(&top).expect("top").sort.sorted = true;
                stack.pop();
                sorted_rev.push(top);

                for conn in db.data_in_conns(top, Cyclicity::Acyclic) {
                    let up = db.upstream_peer(conn).expect("resolved connection");
                    let scratch = &mut db.containers.get_mut(&up).expect("peer").sort;
                    scratch.out_degree = scratch.out_degree.saturating_sub(1);
                }

                remaining.retain(|c| *c != top);
            }
        }
    }

    // The DFS emits sinks first; the processing order runs upstream to
    // downstream.
    sorted_rev.reverse();
    report.orders.push((gid, sorted_rev.clone()));

    let graph = db.graphs.get_mut(&gid).expect("graph");
    graph.containers = sorted_rev;
    graph.sorted = true;

    clear_sort_scratch(db, &members);
    Ok(())
}

/// Moves every acyclic data link from `upstream` to `downstream` onto the
/// cyclic lists of both endpoints; returns how many moved.
fn reclassify_links(
    db: &mut GraphDb,
    upstream: ContainerId,
    downstream: ContainerId,
    report: &mut SortReport,
) -> u32 {
    let links: Vec<ConnId> = db
        .data_out_conns(upstream, Cyclicity::Acyclic)
        .into_iter()
        .filter(|c| db.downstream_peer(*c) == Some(downstream))
        .collect();

    for conn in &links {
        db.containers
            .get_mut(&upstream)
            .expect("upstream container")
            .ports
            .reclassify_cyclic(PortClass::DataOut, *conn);
        db.containers
            .get_mut(&downstream)
            .expect("downstream container")
            .ports
            .reclassify_cyclic(PortClass::DataIn, *conn);
        report.reclassified.push(*conn);
    }
    links.len() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::db::LinkEnd;
    use crate::graph::{HeapId, LinkClass, ModuleId, PortHandle, SubGraphId};

    const SG: SubGraphId = SubGraphId(0x100);

    /// Builds a database with `n` containers in one sub-graph, one module
    /// each, and the given directed data links (by container index).
    fn db_with_links(n: u32, links: &[(u32, u32)]) -> GraphDb {
        let mut db = GraphDb::new();
        db.create_sub_graph(SG).unwrap();
        for i in 0..n {
            db.create_container(ContainerId(i), HeapId(0)).unwrap();
            db.create_module(ModuleId(0x1000 + i), SG, ContainerId(i))
                .unwrap();
        }
        for (src, dst) in links {
            let up = LinkEnd {
                handle: PortHandle {
                    module: ModuleId(0x1000 + src),
                    port_id: 1,
                },
                container: ContainerId(*src),
                sub_graph: SG,
            };
            let down = LinkEnd {
                handle: PortHandle {
                    module: ModuleId(0x1000 + dst),
                    port_id: 1,
                },
                container: ContainerId(*dst),
                sub_graph: SG,
            };
            db.add_connection(LinkClass::Data, Some(up), Some(down))
                .unwrap();
            update_membership(&mut db, ContainerId(*src), ContainerId(*dst), false).unwrap();
        }
        db
    }

    fn order_of(db: &GraphDb) -> Vec<u32> {
        assert_eq!(db.graphs.len(), 1, "expected one container graph");
        let graph = db.graphs.values().next().unwrap();
        assert!(graph.sorted);
        graph.containers.iter().map(|c| c.0).collect()
    }

    fn assert_topological(db: &GraphDb, order: &[u32]) {
        let position =
            |c: u32| order.iter().position(|x| *x == c).expect("missing container");
        for conn in db.connections.values() {
            if let (Some(up), Some(down)) = (&conn.upstream, &conn.downstream) {
                let filed_cyclic = db
                    .containers[&up.container]
                    .ports
                    .list(Cyclicity::Cyclic, PortClass::DataOut)
                    .contains(&conn.id);
                if !filed_cyclic {
                    assert!(
                        position(up.container.0) < position(down.container.0),
                        "edge {:?} -> {:?} violates order {:?}",
                        up.container,
                        down.container,
                        order
                    );
                }
            }
        }
    }

    #[test]
    fn chain_sorts_upstream_first() {
        let mut db = db_with_links(3, &[(0, 1), (1, 2)]);
        update_graphs(&mut db).unwrap();
        assert_eq!(order_of(&db), vec![0, 1, 2]);
    }

    #[test]
    fn diamond_sorts_topologically() {
        let mut db = db_with_links(4, &[(0, 1), (0, 2), (1, 3), (2, 3)]);
        update_graphs(&mut db).unwrap();
        let order = order_of(&db);
        assert_topological(&db, &order);
        assert_eq!(order[0], 0);
        assert_eq!(order[3], 3);
    }

    #[test]
    fn cycle_is_reclassified_and_rest_sorted() {
        let mut db = db_with_links(3, &[(0, 1), (1, 2), (2, 0)]);
        let report = update_graphs(&mut db).unwrap();

        assert_eq!(report.reclassified.len(), 1);
        let order = order_of(&db);
        assert_eq!(order.len(), 3);
        assert_topological(&db, &order);

        // The cyclic link is filed on both endpoints.
        let conn = report.reclassified[0];
        let up = db.connections[&conn].upstream.as_ref().unwrap().container;
        let down = db.connections[&conn].downstream.as_ref().unwrap().container;
        assert!(db.containers[&up]
            .ports
            .list(Cyclicity::Cyclic, PortClass::DataOut)
            .contains(&conn));
        assert!(db.containers[&down]
            .ports
            .list(Cyclicity::Cyclic, PortClass::DataIn)
            .contains(&conn));
    }

    #[test]
    fn resort_merges_cyclic_links_back_first() {
        let mut db = db_with_links(3, &[(0, 1), (1, 2), (2, 0)]);
        update_graphs(&mut db).unwrap();

        // Breaking the cycle and re-sorting must leave nothing cyclic.
        let back_edge = db
            .connections
            .values()
            .find(|c| {
                let up = c.upstream.as_ref().unwrap().container;
                db.containers[&up]
                    .ports
                    .list(Cyclicity::Cyclic, PortClass::DataOut)
                    .contains(&c.id)
            })
            .map(|c| c.id)
            .expect("one cyclic link");
        db.remove_connection(back_edge);
        let gid = *db.graphs.keys().next().unwrap();
        db.graphs.get_mut(&gid).unwrap().sorted = false;

        let report = update_graphs(&mut db).unwrap();
        assert!(report.reclassified.is_empty());
        for cont in db.containers.values() {
            assert!(cont.ports.list(Cyclicity::Cyclic, PortClass::DataOut).is_empty());
            assert!(cont.ports.list(Cyclicity::Cyclic, PortClass::DataIn).is_empty());
        }
        assert_topological(&db, &order_of(&db));
    }

    #[test]
    fn edge_within_one_graph_only_clears_sorted_flag() {
        let mut db = db_with_links(3, &[(0, 1), (1, 2)]);
        update_graphs(&mut db).unwrap();
        let members_before = db.graphs.values().next().unwrap().containers.clone();

        update_membership(&mut db, ContainerId(0), ContainerId(2), false).unwrap();
        let graph = db.graphs.values().next().unwrap();
        assert!(!graph.sorted);
        let mut now = graph.containers.clone();
        let mut before = members_before;
        now.sort();
        before.sort();
        assert_eq!(now, before);
    }

    #[test]
    fn merge_absorbs_the_smaller_graph() {
        // 0 -> 1 -> 2 in one graph, 3 alone in another, then 2 -> 3.
        let mut db = db_with_links(4, &[(0, 1), (1, 2)]);
        update_graphs(&mut db).unwrap();
        assert_eq!(db.graphs.len(), 2);

        update_membership(&mut db, ContainerId(2), ContainerId(3), false).unwrap();
        assert_eq!(db.graphs.len(), 1);
        let graph = db.graphs.values().next().unwrap();
        assert_eq!(graph.containers.len(), 4);

        update_graphs(&mut db).unwrap();
        assert_eq!(order_of(&db), vec![0, 1, 2, 3]);
    }

    #[test]
    fn standalone_containers_get_singleton_graphs() {
        let mut db = db_with_links(2, &[]);
        assert_eq!(db.standalone.len(), 2);
        update_graphs(&mut db).unwrap();
        assert!(db.standalone.is_empty());
        assert_eq!(db.graphs.len(), 2);
        assert!(db.graphs.values().all(|g| g.sorted && g.containers.len() == 1));
    }

    #[test]
    fn random_dags_sort_topologically() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(0x5eed);
        for _ in 0..20 {
            let n = rng.gen_range(2..10u32);
            let mut links = Vec::new();
            for src in 0..n {
                for dst in (src + 1)..n {
                    if rng.gen_bool(0.3) {
                        links.push((src, dst));
                    }
                }
            }
            let mut db = db_with_links(n, &links);
            update_graphs(&mut db).unwrap();
            for graph in db.graphs.values() {
                assert!(graph.sorted);
                let order: Vec<u32> = graph.containers.iter().map(|c| c.0).collect();
                assert_topological(&db, &order);
            }
        }
    }
}
