//! The outbound container command surface and its response contract.

use serde::{Deserialize, Serialize};

use apm_channel::QueueSender;

use crate::graph::{ContainerId, HeapId, PortHandle, SubGraphId};
use crate::status::{ApmError, Status};

use super::payload::{ModuleCfg, PidPayload};
use super::SpfMsg;

/// Opcodes issued to containers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ContainerOpcode {
    GraphOpen,
    GraphConnect,
    GraphDisconnect,
    GraphPrepare,
    GraphStart,
    GraphStop,
    GraphFlush,
    GraphSuspend,
    GraphClose,
    SetCfg,
    GetCfg,
    RegisterCfg,
    DeregisterCfg,
    DestroyContainer,
}

/// The aggregator's lookup key, embedded in every outbound message and
/// echoed in the container's response.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CmdToken {
    /// Command-control slot owning this exchange.
    pub slot: usize,
    /// The container addressed.
    pub container: ContainerId,
}

/// A command issued to one container.
#[derive(Clone, Debug)]
pub struct ContainerMsg {
    pub opcode: ContainerOpcode,
    pub token: CmdToken,
    pub payload: ContainerPayload,
}

/// Cached per-container configuration attached to an outbound command.
#[derive(Clone, Debug)]
pub enum ContainerPayload {
    None,
    Open {
        sub_graphs: Vec<SubGraphId>,
        modules: Vec<ModuleCfg>,
        /// Peer containers on a different heap; the container allocates
        /// cross-heap buffers for links toward these.
        mixed_heap_peers: Vec<ContainerId>,
    },
    Connect {
        links: Vec<ConnSpec>,
    },
    /// Sub-graph operations plus any individual port handles implicated by
    /// link operations.
    GraphMgmt {
        sub_graphs: Vec<SubGraphId>,
        port_handles: Vec<PortHandle>,
    },
    Cfg {
        params: Vec<PidPayload>,
    },
}

/// One link endpoint pairing handed to a container at connect time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ConnSpec {
    pub self_handle: PortHandle,
    /// Absent for a dangling link.
    pub peer_handle: Option<PortHandle>,
    pub peer_container: Option<ContainerId>,
}

/// A container's response to one command, routed by its token.
#[derive(Clone, Debug)]
pub struct ContainerRsp {
    pub opcode: ContainerOpcode,
    pub token: CmdToken,
    pub result: Status,
    pub payload: Option<ContainerRspPayload>,
}

/// Response data beyond the status code.
#[derive(Clone, Debug)]
pub enum ContainerRspPayload {
    Cfg { params: Vec<PidPayload> },
}

/// A handle containers use to push responses onto the response queue.
#[derive(Clone)]
pub struct Responder {
    sender: QueueSender<SpfMsg>,
}

impl Responder {
    pub(crate) fn new(sender: QueueSender<SpfMsg>) -> Self {
        Responder { sender }
    }

    /// Enqueues a response; a full response queue is a resource failure
    /// surfaced to the container task.
    pub fn respond(&self, rsp: ContainerRsp) -> Result<(), ApmError> {
        self.sender
            .push(SpfMsg::Response(rsp))
            .map_err(|_| ApmError::NoResource)
    }
}

/// The opaque handle through which the control plane drives one container.
///
/// Implementations run on their own tasks in production; the delivery call
/// must only hand the message over, never block on its completion.
pub trait ContainerHost {
    fn deliver(&mut self, msg: ContainerMsg) -> Result<(), ApmError>;
}

/// Creates container hosts at GRAPH_OPEN.
pub trait ContainerFactory: Send {
    fn create(
        &mut self,
        id: ContainerId,
        heap_id: HeapId,
        responder: Responder,
    ) -> Result<Box<dyn ContainerHost>, ApmError>;
}
