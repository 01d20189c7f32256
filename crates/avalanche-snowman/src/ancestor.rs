//! Parent-child forest of blocks that failed verification.
//!
//! When a block fails `verify`, its descendants can still attract votes from
//! peers that verified them successfully. The forest records the parent edges
//! of those failed blocks so such votes can be bubbled up to the nearest
//! processing ancestor instead of being dropped.

use std::collections::HashMap;

use avalanche_ids::Id;
use avalanche_utils::Set;

/// A forest of block-id edges.
#[derive(Debug, Default)]
pub struct AncestorTree {
    child_to_parent: HashMap<Id, Id>,
    parent_to_children: HashMap<Id, Set<Id>>,
}

impl AncestorTree {
    /// Creates an empty forest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `block_id` as a child of `parent_id`.
    pub fn add(&mut self, block_id: Id, parent_id: Id) {
        self.child_to_parent.insert(block_id, parent_id);
        self.parent_to_children
            .entry(parent_id)
            .or_default()
            .add(block_id);
    }

    /// Returns true if `block_id` is in the forest.
    pub fn has(&self, block_id: &Id) -> bool {
        self.child_to_parent.contains_key(block_id)
    }

    /// Walks up the parent edges from `block_id` and returns the first id
    /// without one. Returns `block_id` itself if it is not in the forest.
    pub fn ancestor(&self, block_id: &Id) -> Id {
        let mut current = *block_id;
        while let Some(parent) = self.child_to_parent.get(&current) {
            current = *parent;
        }
        current
    }

    /// Removes `block_id`'s own edge.
    ///
    /// Children of `block_id` stay in the forest; their ancestor walks now
    /// stop at `block_id`.
    pub fn remove(&mut self, block_id: &Id) {
        let Some(parent) = self.child_to_parent.remove(block_id) else {
            return;
        };
        if let Some(children) = self.parent_to_children.get_mut(&parent) {
            children.remove(block_id);
            if children.is_empty() {
                self.parent_to_children.remove(&parent);
            }
        }
    }

    /// Returns the number of blocks in the forest.
    pub fn len(&self) -> usize {
        self.child_to_parent.len()
    }

    /// Returns true if the forest is empty.
    pub fn is_empty(&self) -> bool {
        self.child_to_parent.is_empty()
    }
}
