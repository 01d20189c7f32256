//! Error types for consensus.

use thiserror::Error;

/// Result type for consensus operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors that can occur during consensus operations.
#[derive(Debug, Error, Clone)]
pub enum ConsensusError {
    /// Consensus has not been initialized yet
    #[error("consensus not initialized")]
    NotInitialized,

    /// Invalid consensus parameters
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Block not found
    #[error("block not found: {0}")]
    BlockNotFound(String),

    /// Invalid block
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// Parent block not found
    #[error("parent block not found: {0}")]
    ParentNotFound(String),

    /// Block already exists
    #[error("block already exists: {0}")]
    BlockExists(String),

    /// Not enough validators to sample
    #[error("insufficient validators: need {needed}, have {have}")]
    InsufficientValidators { needed: usize, have: usize },

    /// Block height arithmetic overflowed
    #[error("block height overflow above {0}")]
    HeightOverflow(u64),

    /// VM error
    #[error("VM error: {0}")]
    Vm(String),

    /// Health check failure
    #[error("unhealthy: {0}")]
    Unhealthy(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}
