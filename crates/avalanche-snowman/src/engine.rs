//! The Snowman transitive consensus engine.
//!
//! The engine drives a node through repeated-sampling consensus over a
//! linear chain of blocks. It consumes peer messages (queries, query
//! responses, block fetches and their failures) and local signals (build
//! requests, gossip ticks), and issues outbound queries, block fetches, and
//! decisions against the consensus state. Blocks whose ancestry is not yet
//! available are fetched transitively, with the work that depends on them
//! parked in a blocked-job table.
//!
//! # Locking
//!
//! The engine owns all of its tables mutably and holds no locks of its own.
//! The caller serializes every handler invocation; no handler may run
//! concurrently with another.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use avalanche_ids::{Id, NodeId, ID_LEN};
use avalanche_utils::{Bag, Errs, Set};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::ancestor::AncestorTree;
use crate::cache::SizedLru;
use crate::event::{Blocker, Ready};
use crate::metrics::{
    EngineMetrics, IssueSource, Registry, ANCESTOR_RESULT, DECIDED_RESULT, MISSING_RESULT,
    SELF_RESULT,
};
use crate::poll::PollSet;
use crate::{
    BlockOptions, BlockRef, ChainVM, Consensus, ConsensusError, Parameters, Result, Sender, State,
    Validators,
};

/// Default byte budget of the non-verified block cache.
pub const NON_VERIFIED_CACHE_SIZE: usize = 64 * 1024 * 1024;

/// Accounting overhead per cached block reference.
const POINTER_OVERHEAD: usize = 8;

fn cached_block_size(blk: &BlockRef) -> usize {
    ID_LEN + blk.bytes().len() + POINTER_OVERHEAD
}

/// A message from the VM delivered through `notify`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message {
    /// The mempool has transactions; the engine should try to build blocks.
    PendingTxs,
    /// State sync has completed.
    StateSyncDone,
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::PendingTxs => write!(f, "PendingTxs"),
            Message::StateSyncDone => write!(f, "StateSyncDone"),
        }
    }
}

/// Identifies an outstanding request to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    /// The peer the request was sent to.
    pub node_id: NodeId,
    /// The engine-assigned request id.
    pub request_id: u32,
}

/// Bidirectional map of outstanding block fetches.
///
/// Each outstanding fetch is keyed both by its `(peer, request_id)` pair and
/// by the block id it is expected to return. The issuance source recorded
/// when the fetch was sent lives and dies with the request entry.
#[derive(Default)]
struct RequestMap {
    req_to_block: HashMap<Request, (Id, IssueSource)>,
    block_to_req: HashMap<Id, Request>,
}

impl RequestMap {
    /// Inserts a request. Fails if the request or the block id is already
    /// tracked.
    fn put(&mut self, request: Request, block_id: Id, source: IssueSource) -> bool {
        if self.req_to_block.contains_key(&request) || self.block_to_req.contains_key(&block_id) {
            return false;
        }
        self.req_to_block.insert(request, (block_id, source));
        self.block_to_req.insert(block_id, request);
        true
    }

    fn delete_key(&mut self, request: &Request) -> Option<(Id, IssueSource)> {
        let (block_id, source) = self.req_to_block.remove(request)?;
        self.block_to_req.remove(&block_id);
        Some((block_id, source))
    }

    /// Removes the request expecting `block_id`, along with its source tag.
    fn delete_value(&mut self, block_id: &Id) -> Option<Request> {
        let request = self.block_to_req.remove(block_id)?;
        self.req_to_block.remove(&request);
        Some(request)
    }

    fn has_value(&self, block_id: &Id) -> bool {
        self.block_to_req.contains_key(block_id)
    }

    fn len(&self) -> usize {
        self.req_to_block.len()
    }
}

/// Work parked until its block dependencies are issued.
enum Job {
    /// Deliver a block once its parent is issued.
    Issue {
        node_id: NodeId,
        block: BlockRef,
        push: bool,
        source: IssueSource,
    },
    /// Apply a peer's votes once the voted blocks are issued.
    Vote {
        node_id: NodeId,
        request_id: u32,
        /// Vote candidates in decreasing height order; the first one with a
        /// processing ancestor is applied.
        response_options: Vec<Id>,
    },
}

/// An entry of the engine's internal work queue.
enum WorkItem {
    Fulfill(Id),
    Abandon(Id),
    Run(Ready<Job>),
}

/// Engine configuration.
pub struct Config {
    /// Consensus parameters.
    pub params: Parameters,
    /// This node's id.
    pub node_id: NodeId,
    /// Vote only for accepted blocks; set when the node verifies just a
    /// subset of the chain.
    pub partial_sync: bool,
    /// True while the node is still state syncing; cleared by
    /// `Notify(StateSyncDone)`.
    pub state_syncing: bool,
    /// Byte budget of the non-verified block cache.
    pub non_verified_cache_size: usize,
    /// The block-execution VM.
    pub vm: Arc<dyn ChainVM>,
    /// The wire transport.
    pub sender: Arc<dyn Sender>,
    /// The validator-set view of this chain's subnet.
    pub validators: Arc<dyn Validators>,
    /// The consensus decision state.
    pub consensus: Box<dyn Consensus>,
    /// Metric registry to register the engine metrics on.
    pub registry: Arc<Registry>,
}

impl Config {
    /// Creates a configuration with default parameters.
    pub fn new(
        node_id: NodeId,
        vm: Arc<dyn ChainVM>,
        sender: Arc<dyn Sender>,
        validators: Arc<dyn Validators>,
        consensus: Box<dyn Consensus>,
    ) -> Self {
        Self {
            params: Parameters::default(),
            node_id,
            partial_sync: false,
            state_syncing: false,
            non_verified_cache_size: NON_VERIFIED_CACHE_SIZE,
            vm,
            sender,
            validators,
            consensus,
            registry: Arc::new(Registry::default()),
        }
    }
}

/// The transitive consensus engine.
pub struct Transitive {
    params: Parameters,
    node_id: NodeId,
    partial_sync: bool,
    state_syncing: bool,
    state: State,

    vm: Arc<dyn ChainVM>,
    sender: Arc<dyn Sender>,
    validators: Arc<dyn Validators>,
    consensus: Box<dyn Consensus>,
    metrics: EngineMetrics,

    /// Monotonically increasing request counter.
    request_id: u32,

    /// Outstanding preference queries.
    polls: PollSet,

    /// Blocks we have sent Get requests for but haven't received yet.
    blk_reqs: RequestMap,

    /// Blocks queued for issuance while their ancestors are fetched.
    pending: HashMap<Id, BlockRef>,

    /// Parent edges of blocks that failed verification, for vote bubbling.
    non_verifieds: AncestorTree,

    /// Byte-bounded cache of the failed blocks themselves.
    non_verified_cache: SizedLru<Id, BlockRef>,

    /// Latest accepted block id reported by each peer.
    accepted_frontiers: HashMap<NodeId, Id>,

    /// Jobs blocked on blocks being issued.
    blocked: Blocker<Job>,

    /// Ready jobs and dependency resolutions awaiting the drain loop.
    work: VecDeque<WorkItem>,

    /// Outstanding build requests from the VM.
    pending_build_blocks: usize,

    /// Fatal error latch; once set, handlers short-circuit.
    errs: Errs<ConsensusError>,
}

impl Transitive {
    /// Creates a new engine from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        config
            .params
            .validate()
            .map_err(ConsensusError::InvalidParameters)?;

        info!("initializing consensus engine");

        let metrics = EngineMetrics::new(&config.registry);
        let polls = PollSet::new(
            config.params.alpha_preference,
            config.params.alpha_confidence,
            config.params.max_outstanding_items,
        );

        Ok(Self {
            params: config.params,
            node_id: config.node_id,
            partial_sync: config.partial_sync,
            state_syncing: config.state_syncing,
            state: State::Initializing,
            vm: config.vm,
            sender: config.sender,
            validators: config.validators,
            consensus: config.consensus,
            metrics,
            request_id: 0,
            polls,
            blk_reqs: RequestMap::default(),
            pending: HashMap::new(),
            non_verifieds: AncestorTree::new(),
            non_verified_cache: SizedLru::new(config.non_verified_cache_size),
            accepted_frontiers: HashMap::new(),
            blocked: Blocker::new(),
            work: VecDeque::new(),
            pending_build_blocks: 0,
            errs: Errs::new(),
        })
    }

    /// Starts the engine in normal operation at the VM's last accepted block.
    pub async fn start(&mut self, start_request_id: u32) -> Result<()> {
        self.request_id = start_request_id;

        let last_accepted_id = self.vm.last_accepted().await?;
        let Some(last_accepted) = self.get_block(&last_accepted_id).await else {
            error!(block_id = %last_accepted_id, "failed to get last accepted block");
            return Err(ConsensusError::BlockNotFound(last_accepted_id.to_string()));
        };

        let last_accepted_height = last_accepted.height();
        self.consensus.initialize(
            self.params.clone(),
            last_accepted_id,
            last_accepted_height,
            last_accepted.timestamp(),
        )?;

        // If we bootstrapped into an oracle block, its options must be
        // re-delivered so consensus holds the option preferences again. The
        // single SetPreference below reports the resulting preference.
        match last_accepted.options()? {
            BlockOptions::Oracle(options) => {
                for blk in options {
                    self.deliver(self.node_id, blk, false, IssueSource::Built)
                        .await?;
                }
                let preference = self.consensus.preference();
                if let Err(err) = self.vm.set_preference(preference).await {
                    return Err(self.fatal(err));
                }
            }
            BlockOptions::Regular => {
                if let Err(err) = self.vm.set_preference(last_accepted_id).await {
                    return Err(self.fatal(err));
                }
            }
        }

        info!(
            last_accepted_id = %last_accepted_id,
            last_accepted_height,
            "starting consensus"
        );
        self.metrics.bootstrap_finished.set(1.0);

        self.state = State::NormalOp;
        if let Err(err) = self.vm.set_state(State::NormalOp).await {
            return Err(self.fatal(ConsensusError::Vm(format!(
                "failed to notify VM that consensus is starting: {err}"
            ))));
        }
        self.execute_deferred_work().await
    }

    /// Handles a block received in response to a Get request.
    pub async fn put(&mut self, node_id: NodeId, request_id: u32, blk_bytes: &[u8]) -> Result<()> {
        let request = Request {
            node_id,
            request_id,
        };
        let Some((expected_id, source)) = self.blk_reqs.delete_key(&request) else {
            debug!(node_id = %node_id, request_id, "unexpected Put");
            self.metrics
                .num_useless_put_bytes
                .inc_by(blk_bytes.len() as u64);
            return Ok(());
        };

        let blk = match self.vm.parse_block(blk_bytes).await {
            Ok(blk) => blk,
            Err(err) => {
                debug!(node_id = %node_id, request_id, %err, "failed to parse block");
                self.metrics
                    .num_useless_put_bytes
                    .inc_by(blk_bytes.len() as u64);
                self.queue_abandon(expected_id);
                return self.execute_deferred_work().await;
            }
        };

        let actual_id = blk.id();
        if actual_id != expected_id {
            debug!(
                node_id = %node_id,
                request_id,
                block_id = %actual_id,
                expected_id = %expected_id,
                "incorrect block returned in Put"
            );
            self.metrics
                .num_useless_put_bytes
                .inc_by(blk_bytes.len() as u64);
            self.queue_abandon(expected_id);
            return self.execute_deferred_work().await;
        }

        if !self.should_queue_for_issuance(&blk) {
            self.metrics
                .num_useless_put_bytes
                .inc_by(blk_bytes.len() as u64);
        }

        // Issue the block into consensus. If the block was already issued
        // this is a noop; if its ancestry has holes, [node_id] receives the
        // fetches to fill them.
        self.issue_chain(node_id, blk, source).await?;
        self.execute_deferred_work().await
    }

    /// Handles a failed Get request.
    pub async fn get_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        let request = Request {
            node_id,
            request_id,
        };
        let Some((block_id, _)) = self.blk_reqs.delete_key(&request) else {
            debug!(node_id = %node_id, request_id, "unexpected GetFailed");
            return Ok(());
        };

        // The fetch was dropped, so the block is no longer expected to be
        // issued.
        self.queue_abandon(block_id);
        self.execute_deferred_work().await
    }

    /// Handles a query that names the block by id.
    pub async fn pull_query(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        block_id: Id,
        requested_height: u64,
    ) -> Result<()> {
        self.send_chits(node_id, request_id, requested_height).await;

        self.issue_id(node_id, block_id, IssueSource::PushGossip)
            .await?;
        self.execute_deferred_work().await
    }

    /// Handles a query that carries the block bytes.
    pub async fn push_query(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        blk_bytes: &[u8],
        requested_height: u64,
    ) -> Result<()> {
        self.send_chits(node_id, request_id, requested_height).await;

        let blk = match self.vm.parse_block(blk_bytes).await {
            Ok(blk) => blk,
            // We didn't ask for this block, so just drop the request.
            Err(err) => {
                debug!(node_id = %node_id, request_id, %err, "failed to parse block");
                return Ok(());
            }
        };

        if !self.should_queue_for_issuance(&blk) {
            self.metrics
                .num_useless_push_query_bytes
                .inc_by(blk_bytes.len() as u64);
        }

        self.issue_chain(node_id, blk, IssueSource::PushGossip)
            .await?;
        self.execute_deferred_work().await
    }

    /// Handles a peer's votes in response to a query.
    pub async fn chits(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        preferred_id: Id,
        preferred_id_at_height: Id,
        accepted_id: Id,
    ) -> Result<()> {
        self.accepted_frontiers.insert(node_id, accepted_id);

        debug!(
            node_id = %node_id,
            request_id,
            preferred_id = %preferred_id,
            preferred_id_at_height = %preferred_id_at_height,
            accepted_id = %accepted_id,
            "received chits"
        );

        let source = IssueSource::PullGossip;
        let wait_on_preferred = self.issue_id(node_id, preferred_id, source).await?;

        // Invariant: response_options is ordered by decreasing height. When
        // the vote is applied, the first option with a processing ancestor
        // wins.
        let mut response_options = vec![preferred_id];
        let mut deps = Set::new();
        if wait_on_preferred {
            deps.add(preferred_id);
        }
        if preferred_id != preferred_id_at_height {
            if self
                .issue_id(node_id, preferred_id_at_height, source)
                .await?
            {
                deps.add(preferred_id_at_height);
            }
            response_options.push(preferred_id_at_height);
        }

        // The chit is recorded once every voted block has been issued.
        self.register_job(
            Job::Vote {
                node_id,
                request_id,
                response_options,
            },
            deps,
        );
        self.execute_deferred_work().await
    }

    /// Handles a query that received no response.
    pub async fn query_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        if let Some(last_accepted) = self.accepted_frontiers.get(&node_id).copied() {
            return self
                .chits(
                    node_id,
                    request_id,
                    last_accepted,
                    last_accepted,
                    last_accepted,
                )
                .await;
        }

        self.register_job(
            Job::Vote {
                node_id,
                request_id,
                response_options: Vec::new(),
            },
            Set::new(),
        );
        self.execute_deferred_work().await
    }

    /// Handles a message from the VM.
    pub async fn notify(&mut self, message: Message) -> Result<()> {
        match message {
            Message::PendingTxs => {
                // The pending txs message means we should attempt to build a
                // block.
                self.pending_build_blocks += 1;
                self.execute_deferred_work().await
            }
            Message::StateSyncDone => {
                self.state_syncing = false;
                Ok(())
            }
        }
    }

    /// Gossips the current preference to one connected validator.
    pub async fn gossip(&mut self) -> Result<()> {
        let num_processing = self.consensus.num_processing();
        if num_processing != 0 {
            debug!(num_processing, "skipping block gossip, blocks processing");

            // Deferred work still runs here to unstick the engine if it
            // previously failed to issue a query, e.g. while the subnet
            // temporarily had no validators.
            return self.execute_deferred_work().await;
        }

        // Uniform sampling keeps gossip bandwidth independent of stake.
        let Some(vdr_id) = self.validators.sample_connected() else {
            warn!("skipping block gossip, no connected validators");
            return Ok(());
        };

        let (last_accepted_id, last_accepted_height) = self.consensus.last_accepted();
        let Some(next_height_to_accept) = last_accepted_height.checked_add(1) else {
            error!(
                block_id = %last_accepted_id,
                last_accepted_height,
                "skipping block gossip, block height overflow"
            );
            return Ok(());
        };

        self.request_id = self.request_id.wrapping_add(1);
        self.sender.send_pull_query(
            &Set::of([vdr_id]),
            self.request_id,
            self.consensus.preference(),
            next_height_to_accept,
        );
        Ok(())
    }

    /// Timeouts are handled by the transport; nothing to do.
    pub fn timeout(&mut self) -> Result<()> {
        Ok(())
    }

    /// Halts the engine; nothing to do.
    pub fn halt(&mut self) {}

    /// Shuts down the engine and the VM.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("shutting down consensus engine");
        self.vm.shutdown().await
    }

    /// Reports the combined health of consensus and the VM.
    pub async fn health_check(&mut self) -> Result<serde_json::Value> {
        debug!(
            request_id = self.request_id,
            outstanding_polls = self.polls.len(),
            outstanding_requests = self.blk_reqs.len(),
            blocked_jobs = self.blocked.len(),
            pending_build_blocks = self.pending_build_blocks,
            "running health check"
        );

        let consensus_result = self.consensus.health_check();
        let vm_result = self.vm.health_check().await;

        let report = json!({
            "consensus": consensus_result.as_ref().ok(),
            "vm": vm_result.as_ref().ok(),
        });
        match (consensus_result, vm_result) {
            (Ok(_), Ok(_)) => Ok(report),
            (Err(consensus_err), Ok(_)) => Err(consensus_err),
            (Ok(_), Err(vm_err)) => Err(vm_err),
            (Err(consensus_err), Err(vm_err)) => Err(ConsensusError::Unhealthy(format!(
                "vm: {vm_err} ; consensus: {consensus_err}"
            ))),
        }
    }

    /// Routes a peer connection to the VM.
    pub async fn connected(&mut self, node_id: NodeId) -> Result<()> {
        self.vm.connected(&node_id).await
    }

    /// Routes a peer disconnection to the VM.
    pub async fn disconnected(&mut self, node_id: NodeId) -> Result<()> {
        self.vm.disconnected(&node_id).await
    }

    /// Routes an application request to the VM.
    pub async fn app_request(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        msg: &[u8],
    ) -> Result<()> {
        self.vm.app_request(&node_id, request_id, msg).await
    }

    /// Routes an application response to the VM.
    pub async fn app_response(
        &mut self,
        node_id: NodeId,
        request_id: u32,
        msg: &[u8],
    ) -> Result<()> {
        self.vm.app_response(&node_id, request_id, msg).await
    }

    /// Routes an application request failure to the VM.
    pub async fn app_request_failed(&mut self, node_id: NodeId, request_id: u32) -> Result<()> {
        self.vm.app_request_failed(&node_id, request_id).await
    }

    /// Routes application gossip to the VM.
    pub async fn app_gossip(&mut self, node_id: NodeId, msg: &[u8]) -> Result<()> {
        self.vm.app_gossip(&node_id, msg).await
    }

    // ---- internals ----

    /// Latches a fatal error and returns it for propagation.
    fn fatal(&mut self, err: ConsensusError) -> ConsensusError {
        self.errs.add(err.clone());
        err
    }

    fn queue_fulfill(&mut self, block_id: Id) {
        self.work.push_back(WorkItem::Fulfill(block_id));
    }

    fn queue_abandon(&mut self, block_id: Id) {
        self.work.push_back(WorkItem::Abandon(block_id));
    }

    fn register_job(&mut self, job: Job, deps: Set<Id>) {
        if let Some(ready) = self.blocked.register(job, deps) {
            self.work.push_back(WorkItem::Run(ready));
        }
    }

    /// Runs queued jobs and dependency resolutions until the queue drains.
    ///
    /// Jobs run iteratively off this queue rather than recursively, so a
    /// deep chain of pending blocks resolves in bounded stack space.
    async fn drain_work(&mut self) {
        while let Some(item) = self.work.pop_front() {
            let ready_jobs = match item {
                WorkItem::Fulfill(block_id) => self.blocked.fulfill(&block_id),
                WorkItem::Abandon(block_id) => self.blocked.abandon(&block_id),
                WorkItem::Run(ready) => vec![ready],
            };
            for ready in ready_jobs {
                self.run_job(ready).await;
            }
        }
    }

    async fn run_job(&mut self, ready: Ready<Job>) {
        if self.errs.errored() {
            return;
        }

        match ready.job {
            Job::Issue {
                node_id,
                block,
                push,
                source,
            } => {
                if ready.abandoned {
                    // The ancestry fetch failed. Keep the block around for
                    // vote bubbling and abandon everything below it.
                    let block_id = block.id();
                    self.pending.remove(&block_id);
                    self.add_to_non_verifieds(&block);
                    self.queue_abandon(block_id);
                } else if let Err(err) = self.deliver(node_id, block, push, source).await {
                    if !self.errs.errored() {
                        self.errs.add(err);
                    }
                }
            }
            Job::Vote {
                node_id,
                request_id,
                response_options,
            } => {
                self.apply_chit(node_id, request_id, &response_options).await;
            }
        }
    }

    /// Runs after every handler body: drains jobs, builds requested blocks,
    /// refills repolls, and publishes the table gauges.
    async fn execute_deferred_work(&mut self) -> Result<()> {
        self.drain_work().await;
        if let Some(err) = self.errs.err() {
            return Err(err);
        }

        // Build blocks if they have been requested and the number of
        // processing blocks is below optimal.
        while self.pending_build_blocks > 0
            && self.consensus.num_processing() < self.params.optimal_processing
        {
            self.pending_build_blocks -= 1;
            self.build_block().await?;
            self.drain_work().await;
        }

        if self.consensus.num_processing() > 0 {
            // While repolling, gossip the current preference to propagate the
            // most likely branch as quickly as possible.
            self.repoll();
        }

        self.metrics.num_requests.set(self.blk_reqs.len() as f64);
        self.metrics.num_pending.set(self.pending.len() as f64);
        self.metrics.num_blocked.set(self.blocked.len() as f64);
        self.metrics
            .num_non_verifieds
            .set(self.non_verifieds.len() as f64);

        match self.errs.err() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Looks a block up locally (pending, non-verified cache) before asking
    /// the VM.
    async fn get_block(&mut self, block_id: &Id) -> Option<BlockRef> {
        if let Some(blk) = self.pending.get(block_id) {
            return Some(blk.clone());
        }
        if let Some(blk) = self.non_verified_cache.get(block_id) {
            return Some(blk.clone());
        }
        self.vm.get_block(*block_id).await.ok().flatten()
    }

    /// Votes in response to a query at `requested_height`.
    async fn send_chits(&mut self, node_id: NodeId, request_id: u32, requested_height: u64) {
        let (last_accepted_id, last_accepted_height) = self.consensus.last_accepted();

        // If we aren't fully verifying blocks, only vote for blocks that the
        // validator set already accepted.
        if self.state_syncing || self.partial_sync {
            let accepted_at_height = match self.vm.get_block_id_at_height(requested_height).await {
                Ok(Some(id)) => id,
                // The requested height is likely above the last accepted
                // block, so this path is common.
                _ => {
                    debug!(
                        node_id = %node_id,
                        requested_height,
                        last_accepted_height,
                        "failed fetching accepted block"
                    );
                    last_accepted_id
                }
            };
            self.sender.send_chits(
                &node_id,
                request_id,
                last_accepted_id,
                accepted_at_height,
                last_accepted_id,
            );
            return;
        }

        let preference = self.consensus.preference();
        let preference_at_height = if requested_height < last_accepted_height {
            match self.vm.get_block_id_at_height(requested_height).await {
                Ok(Some(id)) => id,
                // A pruning chain can't always answer for historical
                // heights; fall back to the last accepted id. Correct peers
                // rarely ask for these, but byzantine ones can spam them.
                _ => {
                    debug!(
                        node_id = %node_id,
                        requested_height,
                        last_accepted_height,
                        "failed fetching accepted block"
                    );
                    self.metrics.num_missing_accepted_blocks.inc();
                    last_accepted_id
                }
            }
        } else {
            match self.consensus.preference_at_height(requested_height) {
                Some(id) => id,
                // Nothing is preferred at the requested height yet.
                None => {
                    debug!(
                        node_id = %node_id,
                        requested_height,
                        preferred_id = %preference,
                        "failed fetching processing block"
                    );
                    preference
                }
            }
        };
        self.sender.send_chits(
            &node_id,
            request_id,
            preference,
            preference_at_height,
            last_accepted_id,
        );
    }

    async fn build_block(&mut self) -> Result<()> {
        let blk = match self.vm.build_block().await {
            Ok(blk) => blk,
            Err(err) => {
                debug!(%err, "failed building block");
                self.metrics.num_builds_failed.inc();
                return Ok(());
            }
        };
        self.metrics.num_builds.inc();

        let block_id = blk.id();
        let parent_id = blk.parent();
        if self.should_drop(&blk) {
            let (last_accepted_id, last_accepted_height) = self.consensus.last_accepted();
            warn!(
                block_id = %block_id,
                parent_id = %parent_id,
                height = blk.height(),
                last_accepted_id = %last_accepted_id,
                last_accepted_height,
                "dropping newly built block"
            );
            return Ok(());
        }

        if !self.can_have_child_issued(&parent_id) {
            let (last_accepted_id, last_accepted_height) = self.consensus.last_accepted();
            warn!(
                block_id = %block_id,
                parent_id = %parent_id,
                height = blk.height(),
                last_accepted_id = %last_accepted_id,
                last_accepted_height,
                "newly built block can't be issued"
            );
            return Ok(());
        }

        // A block built on anything but the preference has a poor chance of
        // being confirmed.
        let preference = self.consensus.preference();
        if parent_id != preference {
            warn!(
                expected_parent_id = %preference,
                parent_id = %parent_id,
                "built block with unexpected parent"
            );
        }

        // There can't be an issue job outstanding for this block, but a
        // fetch may be.
        self.blk_reqs.delete_value(&block_id);

        self.deliver(self.node_id, blk, true, IssueSource::Built)
            .await
    }

    /// Attempts to issue the branch ending at `block_id` into consensus.
    ///
    /// Returns true if the caller must wait on `block_id` being issued.
    /// Missing ancestors are requested from `node_id`.
    async fn issue_id(
        &mut self,
        node_id: NodeId,
        block_id: Id,
        source: IssueSource,
    ) -> Result<bool> {
        match self.get_block(&block_id).await {
            Some(blk) => self.issue_chain(node_id, blk, source).await,
            None => {
                self.send_request(node_id, block_id, source);
                Ok(true)
            }
        }
    }

    /// Attempts to issue the chain of blocks ending at `blk` to consensus.
    ///
    /// Returns true if the caller must wait on `blk` being issued.
    /// Missing ancestors are requested from `node_id`.
    async fn issue_chain(
        &mut self,
        node_id: NodeId,
        mut blk: BlockRef,
        source: IssueSource,
    ) -> Result<bool> {
        loop {
            let block_id = blk.id();
            // The block is here; any outstanding fetch for it is moot.
            self.blk_reqs.delete_value(&block_id);

            // An accepted block has already fulfilled its jobs, but a
            // rejected one can still have jobs pending its issuance. Those
            // must be abandoned.
            if self.is_block_decided(&blk) {
                self.queue_abandon(block_id);
                return Ok(false);
            }

            // Either the last accepted block or a processing one; nobody
            // should register a dependency on it.
            if self.can_have_child_issued(&block_id) {
                return Ok(false);
            }

            // Already queued for issuance, so jobs can wait on it.
            if self.pending.contains_key(&block_id) {
                return Ok(true);
            }

            let parent_id = blk.parent();
            if self.can_have_child_issued(&parent_id) {
                // Delivering either fulfills or abandons the block.
                self.deliver(node_id, blk, false, source).await?;
                return Ok(false);
            }

            // Queue the block until its ancestry has been issued.
            self.pending.insert(block_id, blk.clone());
            self.register_job(
                Job::Issue {
                    node_id,
                    block: blk.clone(),
                    push: false,
                    source,
                },
                Set::of([parent_id]),
            );

            blk = match self.get_block(&parent_id).await {
                Some(parent) => parent,
                None => {
                    self.send_request(node_id, parent_id, source);
                    return Ok(true);
                }
            };
        }
    }

    /// Requests `block_id` from `node_id`, unless a fetch for it is already
    /// outstanding.
    fn send_request(&mut self, node_id: NodeId, block_id: Id, source: IssueSource) {
        if self.blk_reqs.has_value(&block_id) {
            return;
        }

        self.request_id = self.request_id.wrapping_add(1);
        let request = Request {
            node_id,
            request_id: self.request_id,
        };
        let inserted = self.blk_reqs.put(request, block_id, source);
        debug_assert!(inserted, "request ids are never reused while live");

        debug!(
            node_id = %node_id,
            request_id = self.request_id,
            block_id = %block_id,
            "sending Get request"
        );
        self.sender.send_get(&node_id, self.request_id, block_id);
    }

    /// Samples the validators and queries them about `block_id`. A push
    /// query carries `blk_bytes`; a pull query carries just the id.
    fn send_query(&mut self, block_id: Id, blk_bytes: Option<Vec<u8>>, push: bool) {
        let vdr_ids = match self.validators.sample(self.params.k) {
            Ok(vdr_ids) => vdr_ids,
            Err(err) => {
                warn!(
                    block_id = %block_id,
                    size = self.params.k,
                    %err,
                    "dropped query for block, insufficient validators"
                );
                return;
            }
        };

        let (_, last_accepted_height) = self.consensus.last_accepted();
        let Some(next_height_to_accept) = last_accepted_height.checked_add(1) else {
            error!(
                block_id = %block_id,
                last_accepted_height,
                "dropped query for block, block height overflow"
            );
            return;
        };

        let vdr_bag = Bag::of(vdr_ids.iter().copied());
        self.request_id = self.request_id.wrapping_add(1);
        if !self.polls.add(self.request_id, vdr_bag) {
            error!(
                block_id = %block_id,
                request_id = self.request_id,
                "dropped query for block, failed to add poll"
            );
            return;
        }

        let vdr_set = Set::of(vdr_ids);
        match blk_bytes {
            Some(bytes) if push => self.sender.send_push_query(
                &vdr_set,
                self.request_id,
                &bytes,
                next_height_to_accept,
            ),
            _ => self.sender.send_pull_query(
                &vdr_set,
                self.request_id,
                block_id,
                next_height_to_accept,
            ),
        }
    }

    /// Keeps `concurrent_repolls` queries outstanding at the current
    /// preference.
    fn repoll(&mut self) {
        let preference = self.consensus.preference();
        for _ in self.polls.len()..self.params.concurrent_repolls {
            self.send_query(preference, None, false);
        }
    }

    /// Issues `blk` (and any oracle options) to consensus.
    ///
    /// If `push` is true, resulting queries push the block bytes; otherwise
    /// they pull by id.
    async fn deliver(
        &mut self,
        node_id: NodeId,
        blk: BlockRef,
        push: bool,
        source: IssueSource,
    ) -> Result<()> {
        let mut to_issue = VecDeque::with_capacity(3);
        let mut to_fulfill: Vec<BlockRef> = Vec::with_capacity(3);
        let mut to_abandon: Vec<Id> = Vec::with_capacity(3);
        to_issue.push_back(blk);

        while let Some(blk) = to_issue.pop_front() {
            let block_id = blk.id();

            // Already issued or decided; nothing to do.
            if self.should_drop(&blk) {
                to_abandon.push(block_id);
                continue;
            }

            let parent_id = blk.parent();
            if !self.can_have_child_issued(&parent_id) {
                to_abandon.push(block_id);
                continue;
            }

            let height = blk.height();
            if let Err(err) = blk.verify() {
                debug!(
                    node_id = %node_id,
                    block_id = %block_id,
                    height,
                    %err,
                    "block verification failed"
                );

                // If verify fails, all descendants are also invalid.
                self.add_to_non_verifieds(&blk);
                to_abandon.push(block_id);
                continue;
            }

            self.metrics.issued.inc_with(&[source.label()]);
            self.non_verifieds.remove(&block_id);
            self.non_verified_cache.evict(&block_id);
            self.metrics
                .issuer_stake
                .observe(self.validators.weight(&node_id) as f64);
            debug!(
                node_id = %node_id,
                block_id = %block_id,
                height,
                "adding block to consensus"
            );
            if let Err(err) = self.consensus.add(blk.clone()) {
                return Err(self.fatal(err));
            }
            to_fulfill.push(blk.clone());

            match blk.options()? {
                BlockOptions::Regular => {}
                BlockOptions::Oracle(options) => to_issue.extend(options),
            }
        }

        // During start the options of the last accepted block pass through
        // here; the caller reports the final preference once.
        let running = self.state == State::NormalOp;
        if running {
            let preference = self.consensus.preference();
            if let Err(err) = self.vm.set_preference(preference).await {
                return Err(self.fatal(err));
            }
        }

        for blk in to_fulfill {
            let block_id = blk.id();
            if running && self.consensus.is_preferred(&block_id) {
                self.send_query(block_id, Some(blk.bytes().to_vec()), push);
            }

            self.pending.remove(&block_id);
            self.blk_reqs.delete_value(&block_id);
            self.queue_fulfill(block_id);
        }
        for block_id in to_abandon {
            self.pending.remove(&block_id);
            self.blk_reqs.delete_value(&block_id);
            self.queue_abandon(block_id);
        }
        Ok(())
    }

    /// Applies a voter job: bubbles each response option to a processing
    /// ancestor, applies the first hit to the poll, and feeds any finished
    /// polls to consensus.
    async fn apply_chit(&mut self, node_id: NodeId, request_id: u32, response_options: &[Id]) {
        let mut vote = None;
        for option in response_options {
            if let Some(bubbled) = self.get_processing_ancestor(*option).await {
                vote = Some(bubbled);
                break;
            }
        }

        let results = match vote {
            Some(vote) => self.polls.vote(request_id, &node_id, vote),
            None => self.polls.drop_vote(request_id, &node_id),
        };
        if results.is_empty() {
            return;
        }

        for result in results {
            debug!(request_id, num_votes = result.len(), "finishing poll");
            match self.consensus.record_poll(&result) {
                Ok(decided) => {
                    for block_id in &decided {
                        self.non_verifieds.remove(block_id);
                        self.non_verified_cache.evict(block_id);
                    }
                }
                Err(err) => {
                    self.errs.add(err);
                    return;
                }
            }
        }

        let preference = self.consensus.preference();
        if let Err(err) = self.vm.set_preference(preference).await {
            self.errs.add(err);
            return;
        }

        if self.consensus.num_processing() == 0 {
            debug!("engine can quiesce");
            return;
        }
        self.repoll();
    }

    /// Finds the most recent ancestor of `initial_vote` that is processing
    /// in consensus. Returns `None` if the vote should be dropped.
    async fn get_processing_ancestor(&mut self, initial_vote: Id) -> Option<Id> {
        // If the non-verified forest knows the vote, bubbling starts at the
        // root of its failed ancestry; otherwise we walk whatever blocks we
        // can fetch, best effort.
        let mut bubbled = self.non_verifieds.ancestor(&initial_vote);
        let (_, last_accepted_height) = self.consensus.last_accepted();
        let last_useful_height = last_accepted_height.saturating_add(1);
        loop {
            if self.consensus.processing(&bubbled) {
                debug!(
                    initial_vote_id = %initial_vote,
                    bubbled_vote_id = %bubbled,
                    "applying vote"
                );
                let label = if bubbled == initial_vote {
                    SELF_RESULT
                } else {
                    ANCESTOR_RESULT
                };
                self.metrics
                    .num_get_processing_ancestor_results
                    .inc_with(&[label]);
                return Some(bubbled);
            }

            let Some(blk) = self.get_block(&bubbled).await else {
                debug!(
                    initial_vote_id = %initial_vote,
                    bubbled_vote_id = %bubbled,
                    "dropping vote, ancestor couldn't be fetched"
                );
                self.metrics
                    .num_get_processing_ancestor_results
                    .inc_with(&[MISSING_RESULT]);
                return None;
            };

            let height = blk.height();
            if height <= last_useful_height {
                debug!(
                    initial_vote_id = %initial_vote,
                    bubbled_vote_id = %bubbled,
                    height,
                    "dropping vote, bubbled vote already decided"
                );
                self.metrics
                    .num_get_processing_ancestor_results
                    .inc_with(&[DECIDED_RESULT]);
                return None;
            }

            bubbled = blk.parent();
        }
    }

    /// Records a block whose verification failed, if its parent is either
    /// also recorded or processing. Decided parents never enter the forest.
    fn add_to_non_verifieds(&mut self, blk: &BlockRef) {
        if self.should_drop(blk) {
            return;
        }

        let parent_id = blk.parent();
        if self.non_verifieds.has(&parent_id) || self.consensus.processing(&parent_id) {
            let block_id = blk.id();
            self.non_verifieds.add(block_id, parent_id);
            self.non_verified_cache
                .put(block_id, blk.clone(), cached_block_size(blk));
        }
    }

    /// True if the block is worth queueing: not dropped and not already
    /// pending.
    fn should_queue_for_issuance(&self, blk: &BlockRef) -> bool {
        !self.should_drop(blk) && !self.pending.contains_key(&blk.id())
    }

    /// True if the block should not be issued: it is already processing or
    /// its height says it was decided.
    fn should_drop(&self, blk: &BlockRef) -> bool {
        self.consensus.processing(&blk.id()) || self.is_block_decided(blk)
    }

    /// True if the block's height and parent say it has been decided.
    fn is_block_decided(&self, blk: &BlockRef) -> bool {
        let (last_accepted_id, last_accepted_height) = self.consensus.last_accepted();
        let height = blk.height();
        if height <= last_accepted_height {
            return true;
        }

        let next_height_to_accept = last_accepted_height.saturating_add(1);
        height == next_height_to_accept && blk.parent() != last_accepted_id
    }

    /// True if a child of `parent_id` can be issued into consensus: the
    /// parent is either processing or the most recently accepted block.
    fn can_have_child_issued(&self, parent_id: &Id) -> bool {
        let (last_accepted_id, _) = self.consensus.last_accepted();
        *parent_id == last_accepted_id || self.consensus.processing(parent_id)
    }
}
