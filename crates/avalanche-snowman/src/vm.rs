//! VM traits for consensus integration.
//!
//! These traits define the interface between the consensus engine and the
//! block-execution virtual machine. VM calls are the engine's only
//! suspension points; everything else the engine touches is synchronous.

use async_trait::async_trait;

use avalanche_ids::{Id, NodeId};

use crate::{BlockRef, Result};

/// Lifecycle state reported to the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Initial state, not yet started
    Initializing,
    /// Syncing state summaries from the network
    StateSyncing,
    /// Bootstrapping from the network
    Bootstrapping,
    /// Normal consensus operation
    NormalOp,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Initializing => write!(f, "Initializing"),
            State::StateSyncing => write!(f, "StateSyncing"),
            State::Bootstrapping => write!(f, "Bootstrapping"),
            State::NormalOp => write!(f, "NormalOp"),
        }
    }
}

/// Chain VM trait for linear chain VMs driven by Snowman consensus.
///
/// Application messages and peer connectivity events are routed to the VM
/// untouched; the default implementations ignore them.
#[async_trait]
pub trait ChainVM: Send + Sync {
    /// Parses a block from bytes.
    async fn parse_block(&self, bytes: &[u8]) -> Result<BlockRef>;

    /// Gets a block by ID. Returns `None` if the VM doesn't know the block.
    async fn get_block(&self, id: Id) -> Result<Option<BlockRef>>;

    /// Builds a new block on top of the preferred block.
    async fn build_block(&self) -> Result<BlockRef>;

    /// Returns the last accepted block ID.
    async fn last_accepted(&self) -> Result<Id>;

    /// Returns the ID of the accepted block at the given height, if known.
    ///
    /// A pruning VM may not be able to answer for historical heights.
    async fn get_block_id_at_height(&self, height: u64) -> Result<Option<Id>>;

    /// Sets the preferred block.
    async fn set_preference(&self, id: Id) -> Result<()>;

    /// Notifies the VM of an engine state transition.
    async fn set_state(&self, state: State) -> Result<()>;

    /// Shuts down the VM.
    async fn shutdown(&self) -> Result<()>;

    /// Performs a health check.
    async fn health_check(&self) -> Result<serde_json::Value>;

    /// Called when a peer connects.
    async fn connected(&self, _node_id: &NodeId) -> Result<()> {
        Ok(())
    }

    /// Called when a peer disconnects.
    async fn disconnected(&self, _node_id: &NodeId) -> Result<()> {
        Ok(())
    }

    /// Handles an application-level request from a peer.
    async fn app_request(&self, _node_id: &NodeId, _request_id: u32, _msg: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Handles an application-level response from a peer.
    async fn app_response(&self, _node_id: &NodeId, _request_id: u32, _msg: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Handles a failed application-level request.
    async fn app_request_failed(&self, _node_id: &NodeId, _request_id: u32) -> Result<()> {
        Ok(())
    }

    /// Handles application-level gossip.
    async fn app_gossip(&self, _node_id: &NodeId, _msg: &[u8]) -> Result<()> {
        Ok(())
    }
}
