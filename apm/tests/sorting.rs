//! Container-graph sorting observed through the external interface.

mod common;

use apm::graph::{ContainerId, Cyclicity, PortClass};
use apm::messages::container::ContainerOpcode;
use apm::messages::CmdOpcode;

use common::*;

fn chain_open() -> apm::messages::GprPacket {
    // C1 -> C2 -> C3 along the data path, one module each.
    packet(
        CmdOpcode::GraphOpen,
        open_payload(
            &[0x100],
            &[(0xC1, 0), (0xC2, 0), (0xC3, 0)],
            &[(0xA1, 0x100, 0xC1), (0xA2, 0x100, 0xC2), (0xA3, 0x100, 0xC3)],
            &[(0xA1, 0xA2), (0xA2, 0xA3)],
        ),
    )
}

#[test]
fn open_produces_one_sorted_graph() {
    let mut fx = fixture();
    fx.expect_ok(chain_open());

    let db = fx.apm.graph_db();
    assert_eq!(db.graphs.len(), 1);
    let graph = db.graphs.values().next().unwrap();
    assert!(graph.sorted);
    assert_eq!(
        graph.containers,
        vec![ContainerId(0xC1), ContainerId(0xC2), ContainerId(0xC3)]
    );
}

#[test]
fn start_runs_downstream_first_and_stop_upstream_first() {
    let mut fx = fixture();
    fx.expect_ok(chain_open());

    fx.expect_ok(graph_mgmt(CmdOpcode::GraphStart, &[0x100]));
    assert_eq!(
        fx.deliveries_of(ContainerOpcode::GraphStart),
        vec![ContainerId(0xC3), ContainerId(0xC2), ContainerId(0xC1)]
    );

    fx.expect_ok(graph_mgmt(CmdOpcode::GraphStop, &[0x100]));
    assert_eq!(
        fx.deliveries_of(ContainerOpcode::GraphStop),
        vec![ContainerId(0xC1), ContainerId(0xC2), ContainerId(0xC3)]
    );
}

#[test]
fn cycle_is_reclassified_and_the_graph_still_sorts() {
    let mut fx = fixture();
    // C1 -> C2 -> C3 -> C1.
    fx.expect_ok(packet(
        CmdOpcode::GraphOpen,
        open_payload(
            &[0x100],
            &[(0xC1, 0), (0xC2, 0), (0xC3, 0)],
            &[(0xA1, 0x100, 0xC1), (0xA2, 0x100, 0xC2), (0xA3, 0x100, 0xC3)],
            &[(0xA1, 0xA2), (0xA2, 0xA3), (0xA3, 0xA1)],
        ),
    ));

    let db = fx.apm.graph_db();
    assert_eq!(db.graphs.len(), 1);
    assert!(db.graphs.values().next().unwrap().sorted);

    // Exactly one of the three links was moved to the cyclic lists, on
    // both of its endpoints.
    let cyclic_out: usize = db
        .containers
        .values()
        .map(|c| c.ports.list(Cyclicity::Cyclic, PortClass::DataOut).len())
        .sum();
    let cyclic_in: usize = db
        .containers
        .values()
        .map(|c| c.ports.list(Cyclicity::Cyclic, PortClass::DataIn).len())
        .sum();
    assert_eq!((cyclic_out, cyclic_in), (1, 1));

    // The cyclic topology still closes cleanly.
    fx.expect_ok(graph_mgmt(CmdOpcode::GraphClose, &[0x100]));
    assert!(fx.apm.graph_db().containers.is_empty());
    fx.apm.check_invariants().unwrap();
}

#[test]
fn edge_addition_within_a_graph_keeps_the_container_set() {
    let mut fx = fixture();
    fx.expect_ok(chain_open());

    let before: Vec<ContainerId> = fx.apm.graph_db().containers.keys().copied().collect();

    // A second, parallel link between two members of the same graph.
    fx.expect_ok(link_open(&[(0xA1, 0xA3)]));

    let db = fx.apm.graph_db();
    assert_eq!(db.graphs.len(), 1);
    let graph = db.graphs.values().next().unwrap();
    assert!(graph.sorted);
    let after: Vec<ContainerId> = db.containers.keys().copied().collect();
    assert_eq!(before, after);
    // The new edge is consistent with the order.
    let order = &graph.containers;
    let pos = |c: u32| order.iter().position(|x| x.0 == c).unwrap();
    assert!(pos(0xC1) < pos(0xC3));
}

#[test]
fn disjoint_opens_stay_disjoint_graphs() {
    let mut fx = fixture();
    fx.expect_ok(packet(
        CmdOpcode::GraphOpen,
        open_payload(
            &[0x100],
            &[(0xC1, 0), (0xC2, 0)],
            &[(0xA1, 0x100, 0xC1), (0xA2, 0x100, 0xC2)],
            &[(0xA1, 0xA2)],
        ),
    ));
    fx.expect_ok(simple_open(0x200, 0xD1, 0xB1));

    let db = fx.apm.graph_db();
    assert_eq!(db.graphs.len(), 2);
    assert!(db.graphs.values().all(|g| g.sorted));
    assert!(db.standalone.is_empty());
}

#[test]
fn linking_two_graphs_merges_them() {
    let mut fx = fixture();
    fx.expect_ok(packet(
        CmdOpcode::GraphOpen,
        open_payload(
            &[0x100],
            &[(0xC1, 0), (0xC2, 0)],
            &[(0xA1, 0x100, 0xC1), (0xA2, 0x100, 0xC2)],
            &[(0xA1, 0xA2)],
        ),
    ));
    fx.expect_ok(packet(
        CmdOpcode::GraphOpen,
        open_payload(
            &[0x200],
            &[(0xD1, 0), (0xD2, 0)],
            &[(0xB1, 0x200, 0xD1), (0xB2, 0x200, 0xD2)],
            &[(0xB1, 0xB2)],
        ),
    ));
    assert_eq!(fx.apm.graph_db().graphs.len(), 2);

    fx.expect_ok(link_open(&[(0xA2, 0xB1)]));

    let db = fx.apm.graph_db();
    assert_eq!(db.graphs.len(), 1);
    let graph = db.graphs.values().next().unwrap();
    assert_eq!(graph.containers.len(), 4);
    assert_eq!(graph.sub_graphs.len(), 2);
    assert!(graph.sorted);
    fx.apm.check_invariants().unwrap();
}
