//! Status codes shared between the control plane, its clients, and the
//! containers it drives.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The error kinds surfaced by the control plane.
///
/// These are wire-visible codes, not just internal errors: container
/// responses carry them, the aggregator folds them, and the final client
/// reply reports one of them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApmError {
    /// Malformed payload, unknown identity, or an invalid module pair.
    #[error("bad parameter")]
    BadParam,
    /// The sub-graph is not in a state that permits this transition.
    #[error("not ready for requested transition")]
    NotReady,
    /// The sub-graph is already in the target state.
    #[error("already in requested state")]
    Already,
    /// Neither endpoint module of a link exists.
    #[error("both link endpoints are absent")]
    DanglingLink,
    /// A proxy command arrived while CLOSE_ALL is in flight.
    #[error("busy with close-all")]
    Busy,
    /// The opcode is not recognised on this interface.
    #[error("unsupported opcode")]
    Unsupported,
    /// One or more containers returned a failure.
    #[error("container command failed")]
    ContainerFailed,
    /// The container destroyed itself. Not a failure; routed into the
    /// destroy path of the sequencer.
    #[error("container terminated")]
    Terminated,
    /// An allocation failed.
    #[error("out of memory")]
    NoMemory,
    /// A bounded resource (queue, slot table, region) is exhausted.
    #[error("out of resources")]
    NoResource,
}

/// The aggregation domain: success, or the first meaningful error.
pub type Status = Result<(), ApmError>;

/// Folds one container response into an aggregate status.
///
/// The first non-OK result is kept; a second, *different* non-OK result
/// collapses the aggregate to [`ApmError::ContainerFailed`], and the client
/// recovers individual codes from the per-param error fields.
///
/// # Examples
///
/// ```
/// use apm::status::{aggregate, ApmError};
///
/// let agg = aggregate(Ok(()), Err(ApmError::BadParam));
/// assert_eq!(agg, Err(ApmError::BadParam));
/// let agg = aggregate(agg, Err(ApmError::BadParam));
/// assert_eq!(agg, Err(ApmError::BadParam));
/// let agg = aggregate(agg, Err(ApmError::NoMemory));
/// assert_eq!(agg, Err(ApmError::ContainerFailed));
/// ```
pub fn aggregate(current: Status, incoming: Status) -> Status {
    match (current, incoming) {
        (_, Ok(())) => current,
        (Ok(()), Err(e)) => Err(e),
        (Err(prev), Err(e)) if prev == e => current,
        (Err(_), Err(_)) => Err(ApmError::ContainerFailed),
    }
}

impl ApmError {
    /// True for the non-fatal per-sub-graph results which remove the
    /// sub-graph from the command's working set without failing the command.
    pub fn is_skip(self) -> bool {
        matches!(self, ApmError::Already | ApmError::NotReady)
    }
}

/// Numeric code carried in wire envelopes; zero is success.
pub fn status_to_wire(status: Status) -> u32 {
    match status {
        Ok(()) => 0,
        Err(ApmError::BadParam) => 1,
        Err(ApmError::NotReady) => 2,
        Err(ApmError::Already) => 3,
        Err(ApmError::DanglingLink) => 4,
        Err(ApmError::Busy) => 5,
        Err(ApmError::Unsupported) => 6,
        Err(ApmError::ContainerFailed) => 7,
        Err(ApmError::Terminated) => 8,
        Err(ApmError::NoMemory) => 9,
        Err(ApmError::NoResource) => 10,
    }
}

/// Inverse of [`status_to_wire`]; unrecognised codes collapse to the
/// generic container failure.
pub fn status_from_wire(code: u32) -> Status {
    match code {
        0 => Ok(()),
        1 => Err(ApmError::BadParam),
        2 => Err(ApmError::NotReady),
        3 => Err(ApmError::Already),
        4 => Err(ApmError::DanglingLink),
        5 => Err(ApmError::Busy),
        6 => Err(ApmError::Unsupported),
        7 => Err(ApmError::ContainerFailed),
        8 => Err(ApmError::Terminated),
        9 => Err(ApmError::NoMemory),
        10 => Err(ApmError::NoResource),
        _ => Err(ApmError::ContainerFailed),
    }
}
