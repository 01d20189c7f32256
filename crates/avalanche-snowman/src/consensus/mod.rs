//! Consensus state for a linear chain.

pub mod snowman;

use avalanche_ids::Id;
use avalanche_utils::Bag;
use chrono::{DateTime, Utc};

use crate::{BlockRef, Parameters, Result};

/// Status of a block known to consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Being processed
    Processing,
    /// Accepted and finalized
    Accepted,
    /// Rejected
    Rejected,
    /// Unknown status
    Unknown,
}

impl Status {
    /// Returns true if decided (accepted or rejected).
    pub fn decided(&self) -> bool {
        matches!(self, Status::Accepted | Status::Rejected)
    }

    /// Returns true if the item was accepted.
    pub fn accepted(&self) -> bool {
        matches!(self, Status::Accepted)
    }
}

/// The consensus decision state driven by the engine.
///
/// Blocks are added once their ancestry is fully issued; aggregated poll
/// results arrive through [`Consensus::record_poll`]. Everything here is
/// synchronous and unsynchronized; the engine serializes access.
pub trait Consensus: Send {
    /// Initializes consensus at the last accepted block.
    fn initialize(
        &mut self,
        params: Parameters,
        last_accepted: Id,
        last_accepted_height: u64,
        last_accepted_time: DateTime<Utc>,
    ) -> Result<()>;

    /// Adds a block whose parent is processing or last accepted.
    fn add(&mut self, block: BlockRef) -> Result<()>;

    /// Returns true if the block is currently processing.
    fn processing(&self, id: &Id) -> bool;

    /// Returns true if the block is on the currently preferred chain.
    fn is_preferred(&self, id: &Id) -> bool;

    /// Returns the current preference (tip of the preferred chain).
    fn preference(&self) -> Id;

    /// Returns the preferred block at the given height, if one exists.
    fn preference_at_height(&self, height: u64) -> Option<Id>;

    /// Returns the last accepted block's id and height.
    fn last_accepted(&self) -> (Id, u64);

    /// Returns the number of processing blocks.
    fn num_processing(&self) -> usize;

    /// Records the aggregated result of a completed poll.
    ///
    /// Returns the ids of every block the poll decided (accepted or
    /// rejected), so the caller can drop bookkeeping tied to them.
    fn record_poll(&mut self, votes: &Bag<Id>) -> Result<Vec<Id>>;

    /// Reports the health of the consensus state.
    fn health_check(&self) -> Result<serde_json::Value>;
}
