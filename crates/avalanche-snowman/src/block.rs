//! Block traits for Snowman consensus.

use std::sync::Arc;

use avalanche_ids::Id;
use chrono::{DateTime, Utc};

use crate::Result;

/// A shared handle to a block.
///
/// Blocks move between the engine's tables (pending, non-verified cache) and
/// the consensus state, so they are reference counted. Decision side effects
/// go through `&self`; implementations use interior mutability for their
/// status.
pub type BlockRef = Arc<dyn Block>;

/// The oracle capability of a block.
///
/// An oracle block deterministically expands into a fixed, ordered pair of
/// option children when it is accepted. Regular blocks have no options.
#[derive(Clone)]
pub enum BlockOptions {
    /// An ordinary block with no option children.
    Regular,
    /// An oracle block and its two options, in preference order.
    Oracle([BlockRef; 2]),
}

/// A block in the Snowman chain.
pub trait Block: Send + Sync {
    /// Returns the block's unique identifier.
    fn id(&self) -> Id;

    /// Returns the parent block's ID.
    fn parent(&self) -> Id;

    /// Returns the block's height.
    fn height(&self) -> u64;

    /// Returns the block's timestamp.
    fn timestamp(&self) -> DateTime<Utc>;

    /// Returns the block's byte representation.
    fn bytes(&self) -> &[u8];

    /// Verifies the block is valid.
    fn verify(&self) -> Result<()>;

    /// Accepts the block as final.
    fn accept(&self) -> Result<()>;

    /// Rejects the block.
    fn reject(&self) -> Result<()>;

    /// Returns the block's option children, if it is an oracle block.
    fn options(&self) -> Result<BlockOptions> {
        Ok(BlockOptions::Regular)
    }
}
