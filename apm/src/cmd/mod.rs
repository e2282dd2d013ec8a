//! Command handling: the slot table, the per-opcode operation sequences,
//! response aggregation, and the parallel-command coordinator.

pub mod cfg;
pub mod ctrl;
pub mod graph_mgmt;
pub mod open;
pub mod parallel;
pub mod rsp;
pub mod sequencer;

pub use ctrl::{CmdCtrl, CmdOrigin, CmdTable, MAX_PARALLEL_CMDS};
pub use parallel::DeferredCmds;
pub use sequencer::{CmdOp, SeqCursor};
