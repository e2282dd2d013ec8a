//! Core control plane of an audio/signal processing graph manager.
//!
//! External clients submit graph lifecycle commands (open, prepare, start,
//! stop, suspend, flush, close, get/set configuration) against a database
//! of sub-graphs, containers, modules, and inter-container links. This
//! crate owns that database, serialises command execution against it, fans
//! commands out to the containers hosting the signal-processing modules,
//! aggregates their asynchronous responses, and propagates lifecycle state
//! transitions.
//!
//! The execution model is single-threaded and cooperative: one work loop
//! ([`worker::Apm::step_or_park`]) drains a kill signal, a command queue,
//! and a response queue; commands suspend by fanning out to containers and
//! resume when the response aggregator has collected every answer. No lock
//! guards the graph state because only the loop touches it.
//!
//! ```no_run
//! use apm::messages::container::{ContainerFactory, ContainerHost, Responder};
//! use apm::graph::{ContainerId, HeapId};
//! use apm::pwr::NullPowerMgr;
//! use apm::{ApmError, Config};
//!
//! struct Hosts;
//! impl ContainerFactory for Hosts {
//!     fn create(
//!         &mut self,
//!         _id: ContainerId,
//!         _heap_id: HeapId,
//!         _responder: Responder,
//!     ) -> Result<Box<dyn ContainerHost>, ApmError> {
//!         unimplemented!("spawn a container task and return its handle")
//!     }
//! }
//!
//! let (client, worker) =
//!     apm::execute(Config::default(), Box::new(Hosts), Box::new(NullPowerMgr));
//! // ... submit commands through `client` ...
//! client.kill();
//! worker.join().unwrap();
//! ```

pub mod cmd;
pub mod graph;
pub mod logging;
pub mod messages;
pub mod pwr;
pub mod shmem;
pub mod status;
pub mod worker;

pub use status::{ApmError, Status};
pub use worker::{execute, Apm, ApmClient, Config};
