//! Parallel-command coordination: disjoint concurrency, overlap deferral,
//! CLOSE_ALL serialisation, and the proxy-command exceptions.

mod common;

use apm::messages::payload::{CmdPayload, GraphMgmtPayload};
use apm::messages::{CmdOpcode, InternalMsg};
use apm::ApmError;

use common::*;

fn proxy(opcode: CmdOpcode, sgs: &[u32]) -> InternalMsg {
    InternalMsg {
        opcode,
        payload: CmdPayload::GraphMgmt(GraphMgmtPayload {
            sub_graphs: sgs.iter().map(|id| sg(*id)).collect(),
            links: Vec::new(),
        }),
    }
}

#[test]
fn disjoint_commands_run_concurrently() {
    let mut fx = fixture();
    fx.expect_ok(simple_open(0x100, 0xC1, 0xA1));
    fx.expect_ok(simple_open(0x200, 0xC2, 0xB1));

    // Hold responses so both commands stay in flight together.
    fx.control.hold();
    fx.client
        .send(graph_mgmt(CmdOpcode::GraphPrepare, &[0x100]))
        .unwrap();
    fx.client
        .send(graph_mgmt(CmdOpcode::GraphStart, &[0x200]))
        .unwrap();
    fx.step(4);

    assert_eq!(fx.apm.active_cmd_count(), 2);
    assert_eq!(fx.apm.deferred_cmd_count(), 0);

    fx.control.release();
    fx.step(8);
    assert_eq!(fx.reply_status(), Ok(()));
    assert_eq!(fx.reply_status(), Ok(()));
    assert_eq!(fx.apm.active_cmd_count(), 0);
}

#[test]
fn overlapping_close_defers_behind_stop() {
    let mut fx = fixture();
    fx.expect_ok(simple_open(0x100, 0xC1, 0xA1));
    fx.expect_ok(graph_mgmt(CmdOpcode::GraphStart, &[0x100]));

    fx.control.hold();
    fx.client
        .send(graph_mgmt(CmdOpcode::GraphStop, &[0x100]))
        .unwrap();
    fx.step(2);
    fx.client
        .send(graph_mgmt(CmdOpcode::GraphClose, &[0x100]))
        .unwrap();
    fx.step(2);

    assert_eq!(fx.apm.active_cmd_count(), 2);
    assert_eq!(fx.apm.deferred_cmd_count(), 1);

    fx.control.release();
    fx.step(12);

    // Arrival order is preserved: STOP completes, then CLOSE runs.
    assert_eq!(fx.reply_status(), Ok(()));
    assert_eq!(fx.reply_status(), Ok(()));
    assert!(fx.apm.graph_db().sub_graphs.is_empty());
    assert_eq!(fx.apm.deferred_cmd_count(), 0);
}

#[test]
fn close_all_is_serialised_behind_everything() {
    let mut fx = fixture();
    for (sg_id, cont, module) in [(0x100, 0xC1, 0xA1), (0x200, 0xC2, 0xB1), (0x300, 0xC3, 0xD1)]
    {
        fx.expect_ok(simple_open(sg_id, cont, module));
        fx.expect_ok(graph_mgmt(CmdOpcode::GraphStart, &[sg_id]));
    }

    fx.control.hold();
    for sg_id in [0x100, 0x200, 0x300] {
        fx.client
            .send(graph_mgmt(CmdOpcode::GraphStop, &[sg_id]))
            .unwrap();
    }
    fx.step(6);
    assert_eq!(fx.apm.active_cmd_count(), 3);

    fx.client
        .send(packet(CmdOpcode::CloseAll, CmdPayload::None))
        .unwrap();
    fx.step(2);
    assert_eq!(fx.apm.deferred_cmd_count(), 1);
    assert!(fx.apm.close_all_deferred());

    // A new command targeting a live sub-graph queues behind CLOSE_ALL.
    fx.client
        .send(graph_mgmt(CmdOpcode::GraphSuspend, &[0x200]))
        .unwrap();
    fx.step(2);
    assert_eq!(fx.apm.deferred_cmd_count(), 2);

    fx.control.release();
    fx.step(24);

    // Three stops, then CLOSE_ALL alone, then the suspend (whose target
    // is gone by then).
    for _ in 0..3 {
        assert_eq!(fx.reply_status(), Ok(()));
    }
    assert_eq!(fx.reply_status(), Ok(()));
    assert_eq!(fx.reply_status(), Err(ApmError::BadParam));

    assert!(fx.apm.graph_db().sub_graphs.is_empty());
    assert!(fx.apm.graph_db().containers.is_empty());
    assert!(!fx.apm.close_all_deferred());
    assert_eq!(fx.apm.active_cmd_count(), 0);
}

#[test]
fn proxy_command_during_close_all_fails_busy() {
    let mut fx = fixture();
    fx.expect_ok(simple_open(0x100, 0xC1, 0xA1));
    fx.expect_ok(graph_mgmt(CmdOpcode::GraphStart, &[0x100]));

    fx.control.hold();
    fx.client
        .send(packet(CmdOpcode::CloseAll, CmdPayload::None))
        .unwrap();
    fx.step(2);
    assert_eq!(fx.apm.active_cmd_count(), 1);

    let reply = fx.run_internal(proxy(CmdOpcode::ProxyGraphStart, &[0x100]));
    assert_eq!(reply.status(), Err(ApmError::Busy));

    fx.control.release();
    fx.step(12);
    assert_eq!(fx.reply_status(), Ok(()));
    assert!(fx.apm.graph_db().sub_graphs.is_empty());
}

#[test]
fn proxy_deferral_is_reverted_without_a_close_in_flight() {
    let mut fx = fixture();
    fx.expect_ok(simple_open(0x100, 0xC1, 0xA1));

    fx.control.hold();
    fx.client
        .send(graph_mgmt(CmdOpcode::GraphStart, &[0x100]))
        .unwrap();
    fx.step(2);

    // The proxy overlaps the running start, but with no close active its
    // deferral is reverted and it proceeds concurrently.
    fx.client
        .send_internal(proxy(CmdOpcode::ProxyGraphStop, &[0x100]))
        .unwrap();
    fx.step(2);
    assert_eq!(fx.apm.active_cmd_count(), 2);
    assert_eq!(fx.apm.deferred_cmd_count(), 0);

    fx.control.release();
    fx.step(12);
    assert_eq!(fx.reply_status(), Ok(()));
    assert_eq!(fx.reply_status(), Ok(()));
}

#[test]
fn closed_sub_graphs_are_elided_from_deferred_proxy_commands() {
    let mut fx = fixture();
    fx.expect_ok(simple_open(0x100, 0xC1, 0xA1));

    fx.control.hold();
    fx.client
        .send(graph_mgmt(CmdOpcode::GraphClose, &[0x100]))
        .unwrap();
    fx.step(2);

    // Deferred behind the close, because a close is in flight.
    fx.client
        .send_internal(proxy(CmdOpcode::ProxyGraphStop, &[0x100]))
        .unwrap();
    fx.step(2);
    assert_eq!(fx.apm.deferred_cmd_count(), 1);

    fx.control.release();
    fx.step(12);

    // The close succeeds; the proxy's only target was closed under it and
    // elided, so it completes successfully instead of failing.
    assert_eq!(fx.reply_status(), Ok(()));
    assert_eq!(fx.reply_status(), Ok(()));
    assert!(fx.apm.graph_db().sub_graphs.is_empty());
}

#[test]
fn slot_exhaustion_masks_the_command_queue() {
    let mut fx = fixture();
    for i in 0..8u32 {
        fx.expect_ok(simple_open(0x100 + i, 0xC1 + i, 0xA1 + i));
    }

    fx.control.hold();
    for i in 0..8u32 {
        fx.client
            .send(graph_mgmt(CmdOpcode::GraphPrepare, &[0x100 + i]))
            .unwrap();
    }
    fx.step(10);
    assert_eq!(fx.apm.active_cmd_count(), 8);
    assert!(fx.apm.slot_mask_parity_holds());

    // A ninth command stays queued rather than being dropped or failed.
    fx.client
        .send(graph_mgmt(CmdOpcode::GraphStop, &[0x100]))
        .unwrap();
    fx.step(4);
    assert_eq!(fx.apm.active_cmd_count(), 8);
    assert!(fx.client.try_reply().is_none());

    fx.control.release();
    fx.step(16);
    // Eight prepares succeed, then the ninth command is admitted and
    // stops the now-prepared sub-graph.
    for _ in 0..9 {
        assert_eq!(fx.reply_status(), Ok(()));
    }
    assert_eq!(fx.apm.active_cmd_count(), 0);
}
