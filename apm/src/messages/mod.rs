//! Message types carried by the command and response queues.
//!
//! Two families share the queues: external RPC packets from clients, and
//! internal inter-component messages (proxy graph management, internal
//! configuration, container responses). The work loop's dispatch table is
//! indexed by `(queue, family)`.

pub mod container;
pub mod payload;

use serde::{Deserialize, Serialize};

use crate::status::Status;

pub use container::{
    CmdToken, ContainerFactory, ContainerHost, ContainerMsg, ContainerOpcode, ContainerPayload,
    ContainerRsp, ContainerRspPayload, Responder,
};
pub use payload::{CfgPayload, CmdPayload, GraphMgmtPayload, OobRef, OpenPayload, PidPayload};

/// Command opcodes understood by the control plane, spanning both message
/// families. The `Proxy*` opcodes and `PathDelayEvent` arrive only as
/// internal messages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum CmdOpcode {
    GraphOpen,
    SetCfg,
    GetCfg,
    RegisterCfg,
    DeregisterCfg,
    GraphPrepare,
    GraphStart,
    GraphStop,
    GraphFlush,
    GraphClose,
    CloseAll,
    GraphSuspend,
    GetSpfState,
    SharedMemMap,
    GlobalSharedMemMap,
    SharedMemUnmap,
    GlobalSharedMemUnmap,
    ProxyGraphPrepare,
    ProxyGraphStart,
    ProxyGraphStop,
    PathDelayEvent,
}

impl CmdOpcode {
    /// Graph-management opcodes participate in sub-graph overlap deferral.
    pub fn is_graph_mgmt(self) -> bool {
        matches!(
            self,
            CmdOpcode::GraphPrepare
                | CmdOpcode::GraphStart
                | CmdOpcode::GraphStop
                | CmdOpcode::GraphFlush
                | CmdOpcode::GraphClose
                | CmdOpcode::CloseAll
                | CmdOpcode::GraphSuspend
                | CmdOpcode::ProxyGraphPrepare
                | CmdOpcode::ProxyGraphStart
                | CmdOpcode::ProxyGraphStop
        )
    }

    /// Internally-sourced graph-management commands.
    pub fn is_proxy_graph_mgmt(self) -> bool {
        matches!(
            self,
            CmdOpcode::ProxyGraphPrepare | CmdOpcode::ProxyGraphStart | CmdOpcode::ProxyGraphStop
        )
    }
}

/// An external RPC packet.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GprPacket {
    pub src_domain: u8,
    pub dst_domain: u8,
    pub src_port: u32,
    pub dst_port: u32,
    /// Client transaction token, echoed in the reply.
    pub token: u32,
    pub opcode: CmdOpcode,
    pub payload: CmdPayload,
}

/// An internal inter-component message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InternalMsg {
    pub opcode: CmdOpcode,
    pub payload: CmdPayload,
}

/// Which handler column of the dispatch table a message selects.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MsgFamily {
    External,
    Internal,
}

/// One element of the command or response queues.
#[derive(Debug)]
pub enum SpfMsg {
    /// External RPC, on either queue.
    External(GprPacket),
    /// Internal command, on the command queue.
    Internal(InternalMsg),
    /// Container response, on the response queue.
    Response(ContainerRsp),
}

impl SpfMsg {
    pub fn family(&self) -> MsgFamily {
        match self {
            SpfMsg::External(_) => MsgFamily::External,
            SpfMsg::Internal(_) | SpfMsg::Response(_) => MsgFamily::Internal,
        }
    }

    pub fn opcode(&self) -> Option<CmdOpcode> {
        match self {
            SpfMsg::External(pkt) => Some(pkt.opcode),
            SpfMsg::Internal(msg) => Some(msg.opcode),
            SpfMsg::Response(_) => None,
        }
    }
}

/// Framework readiness, reported by GET_SPF_STATE.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SpfState {
    Ready,
}

/// Replies delivered back to clients and internal requesters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientReply {
    /// The basic response: final aggregated status for one command.
    Basic {
        opcode: CmdOpcode,
        token: u32,
        status: Status,
    },
    /// GET_CFG success path, carrying the separately aggregated response
    /// status and, for in-band queries, the parameter data.
    GetCfg {
        token: u32,
        status: Status,
        params: Vec<PidPayload>,
    },
    /// GET_SPF_STATE reply.
    SpfState { token: u32, state: SpfState },
    /// Shared-memory map reply carrying the registered handle.
    MemMap {
        token: u32,
        status: Status,
        mem_map_handle: u32,
    },
}

impl ClientReply {
    /// The final status a client observes, whatever the reply shape.
    pub fn status(&self) -> Status {
        match self {
            ClientReply::Basic { status, .. }
            | ClientReply::GetCfg { status, .. }
            | ClientReply::MemMap { status, .. } => *status,
            ClientReply::SpfState { .. } => Ok(()),
        }
    }
}
