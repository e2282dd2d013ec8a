//! The graph database and the algorithms that maintain it.
//!
//! Entities live in arenas keyed by their wire-visible identities; every
//! cross-reference is an identifier, never a pointer, so the invariants of
//! the database are plain predicates over the arenas (see
//! [`db::GraphDb::check_invariants`]).

pub mod connection;
pub mod db;
pub mod sort;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Client-assigned identity of a sub-graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubGraphId(pub u32);

/// Client-assigned identity of a container.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u32);

/// Client-assigned identity of a module instance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModuleId(pub u32);

/// Internal identity of a connected container-graph.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct GraphId(pub u32);

/// Internal identity of an inter-container connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct ConnId(pub u32);

impl fmt::Debug for SubGraphId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SG[0x{:X}]", self.0)
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CONT[0x{:X}]", self.0)
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "M[0x{:X}]", self.0)
    }
}

/// Heap placement property of a container, opaque to this crate except for
/// equality (mixed-heap links are annotated on both endpoint containers).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct HeapId(pub u32);

/// Lifecycle state of a sub-graph.
///
/// The ordering is meaningful: graph-management commands reduce a list of
/// sub-graph states with `min` (START begins from the lowest stage present)
/// or `max` (CLOSE unwinds from the highest).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub enum SgState {
    Stopped,
    Prepared,
    Started,
    Suspended,
}

/// One endpoint of a link: a port on a module instance.
///
/// Opaque to the graph algorithms, which only compare handles for identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct PortHandle {
    pub module: ModuleId,
    pub port_id: u32,
}

/// Data or control link.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum LinkClass {
    Data,
    Control,
}

/// A client link specification between two module ports.
///
/// For data links `src` is the output side and `dst` the input side; for
/// control links the two are symmetric peers.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct LinkCfg {
    pub class: LinkClass,
    pub src: PortHandle,
    pub dst: PortHandle,
}

/// Which per-container port list a connection is filed under.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PortClass {
    DataIn,
    DataOut,
    Control,
}

/// Number of [`PortClass`] values; sizes the per-container port tables.
pub const PORT_CLASS_COUNT: usize = 3;

impl PortClass {
    pub(crate) fn index(self) -> usize {
        match self {
            PortClass::DataIn => 0,
            PortClass::DataOut => 1,
            PortClass::Control => 2,
        }
    }
}

/// Whether a connection currently counts toward the topological order.
///
/// This is a cache computed by the sorter, not a property of the graph:
/// every sort pass first merges the cyclic lists back and then re-derives
/// them from the back-edges it encounters.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cyclicity {
    Acyclic,
    Cyclic,
}

impl Cyclicity {
    pub(crate) fn index(self) -> usize {
        match self {
            Cyclicity::Acyclic => 0,
            Cyclicity::Cyclic => 1,
        }
    }
}
