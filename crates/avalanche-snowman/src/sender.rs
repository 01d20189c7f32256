//! Outbound message sink.

use avalanche_ids::{Id, NodeId};
use avalanche_utils::Set;

/// The engine's view of the wire transport.
///
/// Sends are fire-and-forget: the transport owns request timeouts and
/// reports them back as `GetFailed` / `QueryFailed` messages keyed by
/// `(peer, request_id)`.
pub trait Sender: Send + Sync {
    /// Requests the block with [block_id] from [node_id].
    fn send_get(&self, node_id: &NodeId, request_id: u32, block_id: Id);

    /// Asks [node_ids] for their preferences, by block ID.
    fn send_pull_query(
        &self,
        node_ids: &Set<NodeId>,
        request_id: u32,
        block_id: Id,
        requested_height: u64,
    );

    /// Asks [node_ids] for their preferences, carrying the block bytes.
    fn send_push_query(
        &self,
        node_ids: &Set<NodeId>,
        request_id: u32,
        block_bytes: &[u8],
        requested_height: u64,
    );

    /// Answers a query with this node's votes.
    fn send_chits(
        &self,
        node_id: &NodeId,
        request_id: u32,
        preferred_id: Id,
        preferred_id_at_height: Id,
        accepted_id: Id,
    );
}
