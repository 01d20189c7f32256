//! Shared test doubles for consensus and engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use avalanche_ids::{Id, NodeId};
use avalanche_utils::Set;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;

use crate::{
    Block, BlockOptions, BlockRef, ChainVM, ConsensusError, Result, Sender, State, Status,
};

/// A scripted block.
pub(crate) struct TestBlock {
    id: Id,
    parent: Id,
    height: u64,
    timestamp: DateTime<Utc>,
    bytes: Vec<u8>,
    verify_error: Option<String>,
    options: Option<[BlockRef; 2]>,
    status: Mutex<Status>,
}

impl TestBlock {
    pub fn new(id_byte: u8, parent: Id, height: u64) -> Self {
        Self {
            id: Id::from_bytes([id_byte; 32]),
            parent,
            height,
            timestamp: Utc.timestamp_opt(height as i64, 0).unwrap(),
            bytes: vec![0xb1, id_byte],
            verify_error: None,
            options: None,
            status: Mutex::new(Status::Processing),
        }
    }

    /// A regular block that verifies successfully.
    pub fn build(id_byte: u8, parent: Id, height: u64) -> Arc<TestBlock> {
        Arc::new(Self::new(id_byte, parent, height))
    }

    /// A block whose `verify` fails.
    pub fn failing(id_byte: u8, parent: Id, height: u64) -> Arc<TestBlock> {
        let mut block = Self::new(id_byte, parent, height);
        block.verify_error = Some("scripted verification failure".to_string());
        Arc::new(block)
    }

    /// An oracle block with the given option children.
    pub fn oracle(id_byte: u8, parent: Id, height: u64, options: [BlockRef; 2]) -> Arc<TestBlock> {
        let mut block = Self::new(id_byte, parent, height);
        block.options = Some(options);
        Arc::new(block)
    }

    pub fn status(&self) -> Status {
        *self.status.lock()
    }
}

impl Block for TestBlock {
    fn id(&self) -> Id {
        self.id
    }

    fn parent(&self) -> Id {
        self.parent
    }

    fn height(&self) -> u64 {
        self.height
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn verify(&self) -> Result<()> {
        match &self.verify_error {
            Some(msg) => Err(ConsensusError::InvalidBlock(msg.clone())),
            None => Ok(()),
        }
    }

    fn accept(&self) -> Result<()> {
        *self.status.lock() = Status::Accepted;
        Ok(())
    }

    fn reject(&self) -> Result<()> {
        *self.status.lock() = Status::Rejected;
        Ok(())
    }

    fn options(&self) -> Result<BlockOptions> {
        match &self.options {
            Some(options) => Ok(BlockOptions::Oracle(options.clone())),
            None => Ok(BlockOptions::Regular),
        }
    }
}

/// A scripted VM.
#[derive(Default)]
pub(crate) struct TestVm {
    blocks: Mutex<HashMap<Id, BlockRef>>,
    parseable: Mutex<HashMap<Vec<u8>, BlockRef>>,
    build_queue: Mutex<VecDeque<BlockRef>>,
    last_accepted: Mutex<Id>,
    height_index: Mutex<HashMap<u64, Id>>,
    preferences: Mutex<Vec<Id>>,
    states: Mutex<Vec<State>>,
    shutdown_called: Mutex<bool>,
}

impl TestVm {
    pub fn new() -> Arc<TestVm> {
        Arc::new(Self::default())
    }

    /// Makes a block returnable from both `get_block` and `parse_block`.
    pub fn add_block(&self, block: Arc<TestBlock>) {
        self.blocks.lock().insert(block.id, block.clone());
        self.parseable.lock().insert(block.bytes.clone(), block);
    }

    /// Makes a block parseable without making it known to `get_block`.
    pub fn make_parseable(&self, block: Arc<TestBlock>) {
        self.parseable.lock().insert(block.bytes.clone(), block);
    }

    pub fn set_last_accepted(&self, id: Id) {
        *self.last_accepted.lock() = id;
    }

    pub fn queue_build(&self, block: Arc<TestBlock>) {
        self.build_queue.lock().push_back(block);
    }

    pub fn index_height(&self, height: u64, id: Id) {
        self.height_index.lock().insert(height, id);
    }

    /// Every `set_preference` call, in order.
    pub fn preferences(&self) -> Vec<Id> {
        self.preferences.lock().clone()
    }

    pub fn states(&self) -> Vec<State> {
        self.states.lock().clone()
    }

    pub fn was_shutdown(&self) -> bool {
        *self.shutdown_called.lock()
    }
}

#[async_trait]
impl ChainVM for TestVm {
    async fn parse_block(&self, bytes: &[u8]) -> Result<BlockRef> {
        self.parseable
            .lock()
            .get(bytes)
            .cloned()
            .ok_or_else(|| ConsensusError::InvalidBlock("unparseable bytes".to_string()))
    }

    async fn get_block(&self, id: Id) -> Result<Option<BlockRef>> {
        Ok(self.blocks.lock().get(&id).cloned())
    }

    async fn build_block(&self) -> Result<BlockRef> {
        self.build_queue
            .lock()
            .pop_front()
            .ok_or_else(|| ConsensusError::Vm("nothing to build".to_string()))
    }

    async fn last_accepted(&self) -> Result<Id> {
        Ok(*self.last_accepted.lock())
    }

    async fn get_block_id_at_height(&self, height: u64) -> Result<Option<Id>> {
        Ok(self.height_index.lock().get(&height).copied())
    }

    async fn set_preference(&self, id: Id) -> Result<()> {
        self.preferences.lock().push(id);
        Ok(())
    }

    async fn set_state(&self, state: State) -> Result<()> {
        self.states.lock().push(state);
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        *self.shutdown_called.lock() = true;
        Ok(())
    }

    async fn health_check(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({"healthy": true}))
    }
}

/// A message recorded by [`TestSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SentMessage {
    Get {
        node_id: NodeId,
        request_id: u32,
        block_id: Id,
    },
    PullQuery {
        node_ids: Vec<NodeId>,
        request_id: u32,
        block_id: Id,
        requested_height: u64,
    },
    PushQuery {
        node_ids: Vec<NodeId>,
        request_id: u32,
        block_bytes: Vec<u8>,
        requested_height: u64,
    },
    Chits {
        node_id: NodeId,
        request_id: u32,
        preferred_id: Id,
        preferred_id_at_height: Id,
        accepted_id: Id,
    },
}

/// A sender that records every outbound message.
#[derive(Default)]
pub(crate) struct TestSender {
    sent: Mutex<Vec<SentMessage>>,
}

impl TestSender {
    pub fn new() -> Arc<TestSender> {
        Arc::new(Self::default())
    }

    /// Returns and clears the recorded messages.
    pub fn take(&self) -> Vec<SentMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }
}

impl Sender for TestSender {
    fn send_get(&self, node_id: &NodeId, request_id: u32, block_id: Id) {
        self.sent.lock().push(SentMessage::Get {
            node_id: *node_id,
            request_id,
            block_id,
        });
    }

    fn send_pull_query(
        &self,
        node_ids: &Set<NodeId>,
        request_id: u32,
        block_id: Id,
        requested_height: u64,
    ) {
        let mut node_ids = node_ids.to_vec();
        node_ids.sort_unstable();
        self.sent.lock().push(SentMessage::PullQuery {
            node_ids,
            request_id,
            block_id,
            requested_height,
        });
    }

    fn send_push_query(
        &self,
        node_ids: &Set<NodeId>,
        request_id: u32,
        block_bytes: &[u8],
        requested_height: u64,
    ) {
        let mut node_ids = node_ids.to_vec();
        node_ids.sort_unstable();
        self.sent.lock().push(SentMessage::PushQuery {
            node_ids,
            request_id,
            block_bytes: block_bytes.to_vec(),
            requested_height,
        });
    }

    fn send_chits(
        &self,
        node_id: &NodeId,
        request_id: u32,
        preferred_id: Id,
        preferred_id_at_height: Id,
        accepted_id: Id,
    ) {
        self.sent.lock().push(SentMessage::Chits {
            node_id: *node_id,
            request_id,
            preferred_id,
            preferred_id_at_height,
            accepted_id,
        });
    }
}
