//! Snowman linear chain consensus.
//!
//! Snowman converges on a single preferred chain of blocks by repeatedly
//! sampling the validator set. Each poll result either builds or resets
//! confidence in the currently preferred branch; once confidence reaches
//! `beta`, the branch is accepted and every competing branch is rejected.

use std::collections::HashMap;
use std::time::Instant;

use avalanche_ids::Id;
use avalanche_utils::{Bag, Set};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

use crate::{BlockRef, Consensus, ConsensusError, Parameters, Result};

/// A processing block and its poll bookkeeping.
struct BlockNode {
    block: BlockRef,
    confidence: usize,
    added_at: Instant,
}

/// Snowman consensus state.
///
/// Tracks the processing blocks as a tree rooted at the last accepted block.
/// Not synchronized; the engine serializes access.
pub struct Snowman {
    params: Parameters,
    initialized: bool,
    /// Last accepted block
    last_accepted: Id,
    last_accepted_height: u64,
    last_accepted_time: DateTime<Utc>,
    /// Processing blocks indexed by ID
    blocks: HashMap<Id, BlockNode>,
    /// Processing children indexed by parent ID (the parent may be accepted)
    children: HashMap<Id, Set<Id>>,
    /// Tip of the preferred chain
    preference: Id,
    /// Winner of the most recent confidence-building poll
    last_winner: Id,
    /// Consecutive successful polls for [last_winner]'s branch
    consecutive_successes: usize,
}

impl Snowman {
    /// Creates a new, uninitialized Snowman instance.
    pub fn new(params: Parameters) -> Self {
        Self {
            params,
            initialized: false,
            last_accepted: Id::EMPTY,
            last_accepted_height: 0,
            last_accepted_time: DateTime::<Utc>::MIN_UTC,
            blocks: HashMap::new(),
            children: HashMap::new(),
            preference: Id::EMPTY,
            last_winner: Id::EMPTY,
            consecutive_successes: 0,
        }
    }

    /// Accepts the chain ending at `winner` and rejects every competing
    /// branch. Returns the decided block ids.
    fn accept_through(&mut self, winner: Id) -> Result<Vec<Id>> {
        // Collect the processing chain from the winner down to the accepted
        // frontier, then decide it oldest first.
        let mut chain = Vec::new();
        let mut cur = winner;
        while cur != self.last_accepted {
            let node = self.blocks.get(&cur).ok_or_else(|| {
                ConsensusError::Internal(format!("accepted chain is broken at {cur}"))
            })?;
            chain.push(cur);
            cur = node.block.parent();
        }
        chain.reverse();

        let mut decided = Vec::new();
        for blk_id in chain {
            self.accept_block(blk_id, &mut decided)?;
        }

        self.consecutive_successes = 0;
        self.last_winner = self.last_accepted;
        if self.preference != self.last_accepted && !self.blocks.contains_key(&self.preference) {
            // The preferred tip was on a rejected branch.
            self.preference = self.last_accepted;
        }
        Ok(decided)
    }

    fn accept_block(&mut self, blk_id: Id, decided: &mut Vec<Id>) -> Result<()> {
        let node = self
            .blocks
            .remove(&blk_id)
            .ok_or_else(|| ConsensusError::BlockNotFound(blk_id.to_string()))?;

        // Competing siblings (and their descendants) conflict with the
        // accepted block and are rejected.
        let parent_id = node.block.parent();
        if let Some(siblings) = self.children.remove(&parent_id) {
            for sibling in siblings {
                if sibling != blk_id {
                    self.reject_subtree(sibling, decided)?;
                }
            }
        }

        node.block.accept()?;
        self.last_accepted = blk_id;
        self.last_accepted_height = node.block.height();
        self.last_accepted_time = node.block.timestamp();
        decided.push(blk_id);

        debug!(block_id = %blk_id, height = self.last_accepted_height, "accepted block");
        Ok(())
    }

    fn reject_subtree(&mut self, blk_id: Id, decided: &mut Vec<Id>) -> Result<()> {
        let Some(node) = self.blocks.remove(&blk_id) else {
            return Ok(());
        };
        node.block.reject()?;
        decided.push(blk_id);

        if let Some(children) = self.children.remove(&blk_id) {
            for child in children {
                self.reject_subtree(child, decided)?;
            }
        }
        Ok(())
    }
}

impl Consensus for Snowman {
    fn initialize(
        &mut self,
        params: Parameters,
        last_accepted: Id,
        last_accepted_height: u64,
        last_accepted_time: DateTime<Utc>,
    ) -> Result<()> {
        params
            .validate()
            .map_err(ConsensusError::InvalidParameters)?;
        self.params = params;
        self.last_accepted = last_accepted;
        self.last_accepted_height = last_accepted_height;
        self.last_accepted_time = last_accepted_time;
        self.preference = last_accepted;
        self.last_winner = last_accepted;
        self.initialized = true;
        Ok(())
    }

    fn add(&mut self, block: BlockRef) -> Result<()> {
        if !self.initialized {
            return Err(ConsensusError::NotInitialized);
        }

        let blk_id = block.id();
        if self.blocks.contains_key(&blk_id) {
            return Err(ConsensusError::BlockExists(blk_id.to_string()));
        }

        // The engine only delivers blocks whose parent is the last accepted
        // block or still processing.
        let parent_id = block.parent();
        if parent_id != self.last_accepted && !self.blocks.contains_key(&parent_id) {
            return Err(ConsensusError::ParentNotFound(parent_id.to_string()));
        }

        self.children.entry(parent_id).or_default().add(blk_id);
        self.blocks.insert(
            blk_id,
            BlockNode {
                block,
                confidence: 0,
                added_at: Instant::now(),
            },
        );

        // A child extending the preferred tip becomes the new tip.
        if self.preference == parent_id {
            self.preference = blk_id;
        }
        Ok(())
    }

    fn processing(&self, id: &Id) -> bool {
        self.blocks.contains_key(id)
    }

    fn is_preferred(&self, id: &Id) -> bool {
        let mut cur = self.preference;
        loop {
            if cur == *id {
                return true;
            }
            match self.blocks.get(&cur) {
                Some(node) => cur = node.block.parent(),
                None => return false,
            }
        }
    }

    fn preference(&self) -> Id {
        self.preference
    }

    fn preference_at_height(&self, height: u64) -> Option<Id> {
        if height == self.last_accepted_height {
            return Some(self.last_accepted);
        }

        let mut cur = self.preference;
        while let Some(node) = self.blocks.get(&cur) {
            let cur_height = node.block.height();
            if cur_height == height {
                return Some(cur);
            }
            if cur_height < height {
                return None;
            }
            cur = node.block.parent();
        }
        None
    }

    fn last_accepted(&self) -> (Id, u64) {
        (self.last_accepted, self.last_accepted_height)
    }

    fn num_processing(&self) -> usize {
        self.blocks.len()
    }

    fn record_poll(&mut self, votes: &Bag<Id>) -> Result<Vec<Id>> {
        if !self.initialized {
            return Err(ConsensusError::NotInitialized);
        }

        let Some((winner, count)) = votes.mode() else {
            self.consecutive_successes = 0;
            return Ok(Vec::new());
        };

        if count < self.params.alpha_preference || !self.blocks.contains_key(&winner) {
            self.consecutive_successes = 0;
            return Ok(Vec::new());
        }

        // Only switch the preference when the winner is off the currently
        // preferred chain; a vote for an ancestor of the tip keeps the tip.
        if !self.is_preferred(&winner) {
            self.preference = winner;
        }

        if count < self.params.alpha_confidence {
            self.consecutive_successes = 0;
            return Ok(Vec::new());
        }

        if self.last_winner == winner {
            self.consecutive_successes += 1;
        } else {
            self.last_winner = winner;
            self.consecutive_successes = 1;
        }
        if let Some(node) = self.blocks.get_mut(&winner) {
            node.confidence += 1;
        }

        if self.consecutive_successes >= self.params.beta {
            return self.accept_through(winner);
        }
        Ok(Vec::new())
    }

    fn health_check(&self) -> Result<serde_json::Value> {
        let preferred_confidence = self
            .blocks
            .get(&self.preference)
            .map_or(0, |node| node.confidence);
        let report = json!({
            "numProcessing": self.blocks.len(),
            "lastAcceptedID": self.last_accepted.to_string(),
            "lastAcceptedHeight": self.last_accepted_height,
            "lastAcceptedTime": self.last_accepted_time.to_rfc3339(),
            "preferredID": self.preference.to_string(),
            "preferredConfidence": preferred_confidence,
        });

        if let Some(longest) = self.blocks.values().map(|n| n.added_at.elapsed()).max() {
            if longest > self.params.max_item_processing_time {
                return Err(ConsensusError::Unhealthy(format!(
                    "block processing for {longest:?}, report: {report}"
                )));
            }
        }
        Ok(report)
    }
}
