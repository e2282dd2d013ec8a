//! Power-manager voting.
//!
//! A max-performance vote is taken when command resources are allocated and
//! released when the command ends. The release is reference-counted and,
//! when the count strikes zero, delayed, which amortises the vote across
//! back-to-back commands.

use std::time::Duration;

use crate::status::Status;

/// The power-manager collaborator.
pub trait PowerMgr: Send {
    /// Requests the maximum performance vote, synchronously.
    fn request_max(&mut self) -> Status;
    /// Schedules release of the vote after `delay`.
    fn release_max(&mut self, delay: Duration) -> Status;
}

/// A power manager that accepts every vote; the default for hosts without
/// power management.
#[derive(Debug, Default)]
pub struct NullPowerMgr;

impl PowerMgr for NullPowerMgr {
    fn request_max(&mut self) -> Status {
        Ok(())
    }
    fn release_max(&mut self, _delay: Duration) -> Status {
        Ok(())
    }
}

/// Reference-counted voting on top of a [`PowerMgr`].
pub struct PowerVotes {
    mgr: Box<dyn PowerMgr>,
    vote_count: u32,
    release_delay: Duration,
}

impl PowerVotes {
    pub fn new(mgr: Box<dyn PowerMgr>, release_delay: Duration) -> Self {
        PowerVotes {
            mgr,
            vote_count: 0,
            release_delay,
        }
    }

    /// One more command in flight; the first vote reaches the manager.
    pub fn vote(&mut self) -> Status {
        self.mgr.request_max()?;
        self.vote_count += 1;
        Ok(())
    }

    /// One command finished; the actual release happens only when the
    /// count reaches zero, and then with the configured delay.
    pub fn devote(&mut self) -> Status {
        if self.vote_count == 0 {
            return Ok(());
        }
        self.vote_count -= 1;
        if self.vote_count == 0 {
            self.mgr.release_max(self.release_delay)?;
        }
        Ok(())
    }

    pub fn vote_count(&self) -> u32 {
        self.vote_count
    }
}
