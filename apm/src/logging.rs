//! Typed events emitted on the "apm" log stream.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::graph::{ConnId, ContainerId, GraphId, SubGraphId};
use crate::messages::{CmdOpcode, ContainerOpcode};
use crate::status::Status;

/// Logger for control-plane events.
pub type ApmLogger = apm_logging::Logger<ApmEvent>;

/// Any event the control plane logs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ApmEvent {
    Command(CommandEvent),
    Response(ResponseEvent),
    Graph(GraphEvent),
}

/// Lifecycle of one command slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandEvent {
    pub slot: usize,
    pub opcode: CmdOpcode,
    pub kind: CommandEventKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CommandEventKind {
    Accepted,
    Deferred,
    DeferralReverted,
    Resumed,
    /// The command finished; `elapsed` is the wall clock from slot
    /// allocation to release.
    Completed { status: Status, elapsed: Duration },
}

/// One container response folded into a command's aggregate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub slot: usize,
    pub container: ContainerId,
    pub opcode: ContainerOpcode,
    pub result: Status,
}

/// Mutations of the graph database.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum GraphEvent {
    SubGraphCreated(SubGraphId),
    SubGraphDestroyed(SubGraphId),
    ContainerCreated(ContainerId),
    ContainerDestroyed(ContainerId),
    Sorted {
        graph: GraphId,
        order: Vec<ContainerId>,
    },
    CycleReclassified(ConnId),
}

impl From<CommandEvent> for ApmEvent {
    fn from(event: CommandEvent) -> Self {
        ApmEvent::Command(event)
    }
}

impl From<ResponseEvent> for ApmEvent {
    fn from(event: ResponseEvent) -> Self {
        ApmEvent::Response(event)
    }
}

impl From<GraphEvent> for ApmEvent {
    fn from(event: GraphEvent) -> Self {
        ApmEvent::Graph(event)
    }
}
