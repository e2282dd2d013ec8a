//! Drives a two-container pipeline through its full lifecycle against an
//! in-process echo container, printing the control-plane event stream.
//!
//! ```bash
//! cargo run --example lifecycle
//! ```

use std::time::Duration;

use apm::graph::{ContainerId, HeapId};
use apm::logging::ApmEvent;
use apm::messages::container::{
    ContainerFactory, ContainerHost, ContainerMsg, ContainerOpcode, ContainerRsp, Responder,
};
use apm::messages::payload::{
    CmdPayload, ContainerCfg, GraphMgmtPayload, ModuleCfg, OpenPayload, SubGraphCfg,
};
use apm::messages::{CmdOpcode, GprPacket};
use apm::pwr::NullPowerMgr;
use apm::{Apm, ApmError, Config};

/// A container that acknowledges everything it is told.
struct Echo {
    responder: Responder,
}

impl ContainerHost for Echo {
    fn deliver(&mut self, msg: ContainerMsg) -> Result<(), ApmError> {
        let result = if msg.opcode == ContainerOpcode::DestroyContainer {
            Err(ApmError::Terminated)
        } else {
            Ok(())
        };
        self.responder.respond(ContainerRsp {
            opcode: msg.opcode,
            token: msg.token,
            result,
            payload: None,
        })
    }
}

struct EchoFactory;

impl ContainerFactory for EchoFactory {
    fn create(
        &mut self,
        _id: ContainerId,
        _heap_id: HeapId,
        responder: Responder,
    ) -> Result<Box<dyn ContainerHost>, ApmError> {
        Ok(Box::new(Echo { responder }))
    }
}

fn packet(token: u32, opcode: CmdOpcode, payload: CmdPayload) -> GprPacket {
    GprPacket {
        src_domain: 2,
        dst_domain: 1,
        src_port: 0x2000,
        dst_port: 0x0001,
        token,
        opcode,
        payload,
    }
}

fn main() {
    let (mut apm, client) = Apm::create(
        Config::default(),
        Box::new(EchoFactory),
        Box::new(NullPowerMgr),
    );

    apm.log_register().insert::<ApmEvent>("apm", |_, batch| {
        for (time, event) in batch {
            println!("{time:>12?}  {event:?}");
        }
    });

    // Two containers joined by one data link, all in sub-graph 0x100.
    let open = OpenPayload {
        sub_graphs: vec![SubGraphCfg {
            sub_graph_id: apm::graph::SubGraphId(0x100),
        }],
        containers: vec![
            ContainerCfg {
                container_id: ContainerId(0xC1),
                heap_id: HeapId(0),
            },
            ContainerCfg {
                container_id: ContainerId(0xC2),
                heap_id: HeapId(0),
            },
        ],
        modules: vec![
            ModuleCfg {
                module_id: apm::graph::ModuleId(0xA1),
                sub_graph_id: apm::graph::SubGraphId(0x100),
                container_id: ContainerId(0xC1),
            },
            ModuleCfg {
                module_id: apm::graph::ModuleId(0xA2),
                sub_graph_id: apm::graph::SubGraphId(0x100),
                container_id: ContainerId(0xC2),
            },
        ],
        links: vec![apm::graph::LinkCfg {
            class: apm::graph::LinkClass::Data,
            src: apm::graph::PortHandle {
                module: apm::graph::ModuleId(0xA1),
                port_id: 1,
            },
            dst: apm::graph::PortHandle {
                module: apm::graph::ModuleId(0xA2),
                port_id: 1,
            },
        }],
    };

    let mgmt = |token, opcode| {
        packet(
            token,
            opcode,
            CmdPayload::GraphMgmt(GraphMgmtPayload {
                sub_graphs: vec![apm::graph::SubGraphId(0x100)],
                links: Vec::new(),
            }),
        )
    };

    let commands = vec![
        packet(1, CmdOpcode::GraphOpen, CmdPayload::Open(open)),
        mgmt(2, CmdOpcode::GraphPrepare),
        mgmt(3, CmdOpcode::GraphStart),
        mgmt(4, CmdOpcode::GraphStop),
        mgmt(5, CmdOpcode::GraphClose),
    ];

    for command in commands {
        let opcode = command.opcode;
        client.send(command).expect("command queue has room");
        let reply = loop {
            if let Some(reply) = client.try_reply() {
                break reply;
            }
            apm.step_or_park(Some(Duration::from_millis(1)));
        };
        println!("{opcode:?} -> {:?}", reply.status());
    }

    println!(
        "database empty again: {}",
        apm.graph_db().sub_graphs.is_empty() && apm.graph_db().containers.is_empty()
    );
}
