//! Outstanding query polls.
//!
//! Every query the engine sends registers a poll with the set of sampled
//! validators. Votes and dropped responses are applied with the responder's
//! sampled multiplicity. A poll can terminate early once further responses
//! cannot change its outcome. Finished polls are only drained from the front
//! of the set, so their vote bags reach consensus in the order the polls
//! were issued.

use std::collections::VecDeque;

use avalanche_ids::{Id, NodeId};
use avalanche_utils::Bag;
use tracing::debug;

/// The set of outstanding polls, ordered by issuance.
pub struct PollSet {
    alpha_preference: usize,
    alpha_confidence: usize,
    max_outstanding: usize,
    polls: VecDeque<(u32, Poll)>,
}

struct Poll {
    /// Validators still expected to respond, with sampled multiplicity
    polled: Bag<NodeId>,
    /// Votes received so far
    votes: Bag<Id>,
    finished: bool,
}

impl Poll {
    fn new(polled: Bag<NodeId>) -> Self {
        Self {
            polled,
            votes: Bag::new(),
            finished: false,
        }
    }

    fn vote(&mut self, node_id: &NodeId, vote: Id, alpha_preference: usize, alpha_confidence: usize) {
        let count = self.polled.remove(node_id);
        self.votes.add_count(vote, count);
        self.update(alpha_preference, alpha_confidence);
    }

    fn drop_vote(&mut self, node_id: &NodeId, alpha_preference: usize, alpha_confidence: usize) {
        self.polled.remove(node_id);
        self.update(alpha_preference, alpha_confidence);
    }

    /// Marks the poll finished once no response can change its outcome:
    ///   1. every polled validator responded or was dropped,
    ///   2. an alpha_preference majority is out of reach, or
    ///   3. the leading choice reached alpha_confidence (or reached
    ///      alpha_preference while alpha_confidence is out of reach).
    fn update(&mut self, alpha_preference: usize, alpha_confidence: usize) {
        if self.finished {
            return;
        }

        let remaining = self.polled.len();
        if remaining == 0 {
            self.finished = true;
            return;
        }

        let received = self.votes.len();
        let max_possible = received + remaining;
        if max_possible < alpha_preference {
            self.finished = true;
            return;
        }

        let freq = self.votes.mode().map_or(0, |(_, count)| count);
        self.finished = freq >= alpha_confidence
            || (freq >= alpha_preference && max_possible < alpha_confidence);
    }
}

impl PollSet {
    /// Creates an empty poll set.
    pub fn new(alpha_preference: usize, alpha_confidence: usize, max_outstanding: usize) -> Self {
        Self {
            alpha_preference,
            alpha_confidence,
            max_outstanding,
            polls: VecDeque::new(),
        }
    }

    /// Registers a poll for `request_id` over the sampled validators.
    ///
    /// Returns false if the request id is already tracked or the set is full.
    #[must_use]
    pub fn add(&mut self, request_id: u32, polled: Bag<NodeId>) -> bool {
        if self.polls.len() >= self.max_outstanding {
            debug!(request_id, "dropping poll, too many outstanding");
            return false;
        }
        if self.polls.iter().any(|(id, _)| *id == request_id) {
            debug!(request_id, "dropping poll, duplicate request id");
            return false;
        }

        self.polls.push_back((request_id, Poll::new(polled)));
        true
    }

    /// Applies a vote from `node_id` to the poll for `request_id`.
    ///
    /// Returns the vote bags of every leading poll that finished.
    #[must_use]
    pub fn vote(&mut self, request_id: u32, node_id: &NodeId, vote: Id) -> Vec<Bag<Id>> {
        let Some((_, poll)) = self.polls.iter_mut().find(|(id, _)| *id == request_id) else {
            debug!(request_id, node_id = %node_id, "dropping vote, unknown poll");
            return Vec::new();
        };
        poll.vote(node_id, vote, self.alpha_preference, self.alpha_confidence);
        self.drain_finished()
    }

    /// Records that `node_id` will not respond to the poll for `request_id`.
    ///
    /// Returns the vote bags of every leading poll that finished.
    #[must_use]
    pub fn drop_vote(&mut self, request_id: u32, node_id: &NodeId) -> Vec<Bag<Id>> {
        let Some((_, poll)) = self.polls.iter_mut().find(|(id, _)| *id == request_id) else {
            debug!(request_id, node_id = %node_id, "dropping response, unknown poll");
            return Vec::new();
        };
        poll.drop_vote(node_id, self.alpha_preference, self.alpha_confidence);
        self.drain_finished()
    }

    fn drain_finished(&mut self) -> Vec<Bag<Id>> {
        let mut results = Vec::new();
        while let Some((_, poll)) = self.polls.front() {
            if !poll.finished {
                break;
            }
            let (_, poll) = self.polls.pop_front().expect("front poll exists");
            results.push(poll.votes);
        }
        results
    }

    /// Returns the number of outstanding polls.
    pub fn len(&self) -> usize {
        self.polls.len()
    }

    /// Returns true if no polls are outstanding.
    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }
}
