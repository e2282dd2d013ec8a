//! Shared fixtures: an in-process echo container host, command builders,
//! and a stepping harness around the work loop.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apm::graph::{ContainerId, HeapId, LinkCfg, LinkClass, ModuleId, PortHandle, SubGraphId};
use apm::messages::container::{
    ContainerFactory, ContainerHost, ContainerMsg, ContainerOpcode, ContainerPayload,
    ContainerRsp, ContainerRspPayload, Responder,
};
use apm::messages::payload::{
    CfgPayload, CmdPayload, ContainerCfg, GraphMgmtPayload, ModuleCfg, OpenPayload, PidPayload,
    SubGraphCfg,
};
use apm::messages::{ClientReply, CmdOpcode, GprPacket, InternalMsg};
use apm::pwr::NullPowerMgr;
use apm::{Apm, ApmClient, ApmError, Config};

/// Every container delivery, in issue order.
pub type DeliveryLog = Arc<Mutex<Vec<(ContainerId, ContainerOpcode)>>>;

/// Switchboard shared between the test and its echo hosts.
#[derive(Default)]
pub struct EchoControl {
    fail: Mutex<Vec<(ContainerOpcode, ApmError)>>,
    holding: Mutex<bool>,
    parked: Mutex<Vec<(Responder, ContainerRsp)>>,
}

impl EchoControl {
    /// Makes hosts answer `opcode` with `error`.
    pub fn fail_with(&self, opcode: ContainerOpcode, error: ApmError) {
        self.fail.lock().unwrap().push((opcode, error));
    }

    /// Parks responses instead of sending them, keeping commands in
    /// flight.
    pub fn hold(&self) {
        *self.holding.lock().unwrap() = true;
    }

    /// Sends every parked response and resumes immediate echoing.
    pub fn release(&self) {
        *self.holding.lock().unwrap() = false;
        for (responder, rsp) in self.parked.lock().unwrap().drain(..) {
            responder.respond(rsp).unwrap();
        }
    }
}

/// Test pattern stamped into echoed GET_CFG parameter data.
pub const ECHO_DATA: [u8; 4] = [0xA5, 0xA5, 0xA5, 0xA5];

struct EchoHost {
    id: ContainerId,
    responder: Responder,
    log: DeliveryLog,
    control: Arc<EchoControl>,
}

impl ContainerHost for EchoHost {
    fn deliver(&mut self, msg: ContainerMsg) -> Result<(), ApmError> {
        self.log.lock().unwrap().push((self.id, msg.opcode));

        let mut result = if msg.opcode == ContainerOpcode::DestroyContainer {
            Err(ApmError::Terminated)
        } else {
            Ok(())
        };
        if let Some((_, error)) = self
            .control
            .fail
            .lock()
            .unwrap()
            .iter()
            .find(|(opcode, _)| *opcode == msg.opcode)
        {
            result = Err(*error);
        }

        let payload = match (&msg.opcode, &msg.payload) {
            (ContainerOpcode::GetCfg, ContainerPayload::Cfg { params }) => {
                Some(ContainerRspPayload::Cfg {
                    params: params
                        .iter()
                        .map(|p| PidPayload {
                            module: p.module,
                            pid: p.pid,
                            status: Ok(()),
                            data: ECHO_DATA.to_vec(),
                        })
                        .collect(),
                })
            }
            _ => None,
        };

        let rsp = ContainerRsp {
            opcode: msg.opcode,
            token: msg.token,
            result,
            payload,
        };
        if *self.control.holding.lock().unwrap() {
            self.control
                .parked
                .lock()
                .unwrap()
                .push((self.responder.clone(), rsp));
            Ok(())
        } else {
            self.responder.respond(rsp)
        }
    }
}

pub struct EchoFactory {
    log: DeliveryLog,
    control: Arc<EchoControl>,
}

impl ContainerFactory for EchoFactory {
    fn create(
        &mut self,
        id: ContainerId,
        _heap_id: HeapId,
        responder: Responder,
    ) -> Result<Box<dyn ContainerHost>, ApmError> {
        Ok(Box::new(EchoHost {
            id,
            responder,
            log: Arc::clone(&self.log),
            control: Arc::clone(&self.control),
        }))
    }
}

/// A control plane wired to echo hosts, driven by explicit steps.
pub struct Fixture {
    pub apm: Apm,
    pub client: ApmClient,
    pub log: DeliveryLog,
    pub control: Arc<EchoControl>,
}

pub fn fixture() -> Fixture {
    let log: DeliveryLog = Arc::default();
    let control: Arc<EchoControl> = Arc::default();
    let factory = EchoFactory {
        log: Arc::clone(&log),
        control: Arc::clone(&control),
    };
    let (apm, client) = Apm::create(
        Config::default(),
        Box::new(factory),
        Box::new(NullPowerMgr),
    );
    Fixture {
        apm,
        client,
        log,
        control,
    }
}

impl Fixture {
    pub fn step(&mut self, rounds: usize) {
        for _ in 0..rounds {
            self.apm.step_or_park(Some(Duration::from_millis(1)));
        }
    }

    /// Submits a packet and steps until its reply arrives.
    pub fn run(&mut self, packet: GprPacket) -> ClientReply {
        self.client.send(packet).unwrap();
        self.reply()
    }

    /// Submits an internal message and steps until its reply arrives.
    pub fn run_internal(&mut self, msg: InternalMsg) -> ClientReply {
        self.client.send_internal(msg).unwrap();
        self.reply()
    }

    /// Steps until the next reply shows up.
    pub fn reply(&mut self) -> ClientReply {
        for _ in 0..64 {
            if let Some(reply) = self.client.try_reply() {
                return reply;
            }
            self.step(1);
        }
        panic!("no reply within 64 work-loop steps");
    }

    /// Final status of the next reply.
    pub fn reply_status(&mut self) -> Result<(), ApmError> {
        self.reply().status()
    }

    pub fn expect_ok(&mut self, packet: GprPacket) {
        let reply = self.run(packet);
        assert_eq!(reply.status(), Ok(()), "unexpected reply {reply:?}");
    }

    /// Deliveries of one container opcode, in issue order.
    pub fn deliveries_of(&self, opcode: ContainerOpcode) -> Vec<ContainerId> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, op)| *op == opcode)
            .map(|(cid, _)| *cid)
            .collect()
    }
}

static NEXT_TOKEN: AtomicU32 = AtomicU32::new(1);

pub fn packet(opcode: CmdOpcode, payload: CmdPayload) -> GprPacket {
    GprPacket {
        src_domain: 2,
        dst_domain: 1,
        src_port: 0x2000,
        dst_port: 0x0001,
        token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
        opcode,
        payload,
    }
}

pub fn sg(id: u32) -> SubGraphId {
    SubGraphId(id)
}

pub fn handle(module: u32) -> PortHandle {
    PortHandle {
        module: ModuleId(module),
        port_id: 1,
    }
}

pub fn data_link(src_module: u32, dst_module: u32) -> LinkCfg {
    LinkCfg {
        class: LinkClass::Data,
        src: handle(src_module),
        dst: handle(dst_module),
    }
}

/// An open payload from flat id lists: sub-graphs, `(container, heap)`
/// pairs, `(module, sub-graph, container)` triples, and data links.
pub fn open_payload(
    sgs: &[u32],
    conts: &[(u32, u32)],
    modules: &[(u32, u32, u32)],
    links: &[(u32, u32)],
) -> CmdPayload {
    CmdPayload::Open(OpenPayload {
        sub_graphs: sgs
            .iter()
            .map(|id| SubGraphCfg {
                sub_graph_id: SubGraphId(*id),
            })
            .collect(),
        containers: conts
            .iter()
            .map(|(id, heap)| ContainerCfg {
                container_id: ContainerId(*id),
                heap_id: HeapId(*heap),
            })
            .collect(),
        modules: modules
            .iter()
            .map(|(module, sg, cont)| ModuleCfg {
                module_id: ModuleId(*module),
                sub_graph_id: SubGraphId(*sg),
                container_id: ContainerId(*cont),
            })
            .collect(),
        links: links
            .iter()
            .map(|(src, dst)| data_link(*src, *dst))
            .collect(),
    })
}

/// One sub-graph, one container, one module.
pub fn simple_open(sg: u32, cont: u32, module: u32) -> GprPacket {
    packet(
        CmdOpcode::GraphOpen,
        open_payload(&[sg], &[(cont, 0)], &[(module, sg, cont)], &[]),
    )
}

pub fn graph_mgmt(opcode: CmdOpcode, sgs: &[u32]) -> GprPacket {
    packet(
        opcode,
        CmdPayload::GraphMgmt(GraphMgmtPayload {
            sub_graphs: sgs.iter().map(|id| SubGraphId(*id)).collect(),
            links: Vec::new(),
        }),
    )
}

pub fn link_open(links: &[(u32, u32)]) -> GprPacket {
    packet(CmdOpcode::GraphOpen, open_payload(&[], &[], &[], links))
}

pub fn cfg_params(modules_and_pids: &[(u32, u32)]) -> Vec<PidPayload> {
    modules_and_pids
        .iter()
        .map(|(module, pid)| PidPayload {
            module: ModuleId(*module),
            pid: *pid,
            status: Ok(()),
            data: Vec::new(),
        })
        .collect()
}

pub fn cfg_packet(opcode: CmdOpcode, params: Vec<PidPayload>) -> GprPacket {
    packet(opcode, CmdPayload::Cfg(CfgPayload { params }))
}
