//! Validator set management.

use std::collections::{HashMap, HashSet};

use avalanche_ids::{Id, NodeId};
use parking_lot::RwLock;
use rand::Rng;

use crate::{ConsensusError, Result};

/// A validator in the network.
#[derive(Debug, Clone)]
pub struct Validator {
    /// Node ID
    pub node_id: NodeId,
    /// Stake weight
    pub weight: u64,
}

impl Validator {
    /// Creates a new validator.
    pub fn new(node_id: NodeId, weight: u64) -> Self {
        Self { node_id, weight }
    }
}

/// The engine's view of the validator set.
pub trait Validators: Send + Sync {
    /// Samples `k` validators weighted by stake, with replacement.
    ///
    /// A heavily staked validator can occupy several of the returned slots;
    /// its eventual vote counts with that multiplicity.
    fn sample(&self, k: usize) -> Result<Vec<NodeId>>;

    /// Samples one connected validator uniformly, for gossip.
    fn sample_connected(&self) -> Option<NodeId>;

    /// Returns the stake weight of a validator (0 if unknown).
    fn weight(&self, node_id: &NodeId) -> u64;

    /// Returns the number of validators.
    fn len(&self) -> usize;

    /// Returns true if there are no validators.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A set of validators with weights and connectivity tracking.
#[derive(Debug)]
pub struct ValidatorSet {
    /// Validators indexed by node ID
    validators: RwLock<HashMap<NodeId, Validator>>,
    /// Total stake weight
    total_weight: RwLock<u64>,
    /// Currently connected validators
    connected: RwLock<HashSet<NodeId>>,
    /// Subnet this set belongs to
    subnet_id: Id,
}

impl ValidatorSet {
    /// Creates a new empty validator set.
    pub fn new(subnet_id: Id) -> Self {
        Self {
            validators: RwLock::new(HashMap::new()),
            total_weight: RwLock::new(0),
            connected: RwLock::new(HashSet::new()),
            subnet_id,
        }
    }

    /// Returns the subnet ID.
    pub fn subnet_id(&self) -> Id {
        self.subnet_id
    }

    /// Adds a validator to the set.
    pub fn add(&self, validator: Validator) -> Result<()> {
        let mut validators = self.validators.write();
        let mut total = self.total_weight.write();

        if validators.contains_key(&validator.node_id) {
            return Err(ConsensusError::Internal(format!(
                "validator {} already exists",
                validator.node_id
            )));
        }

        *total += validator.weight;
        validators.insert(validator.node_id, validator);
        Ok(())
    }

    /// Removes a validator from the set.
    pub fn remove(&self, node_id: &NodeId) -> Result<()> {
        let mut validators = self.validators.write();
        let mut total = self.total_weight.write();

        if let Some(validator) = validators.remove(node_id) {
            *total = total.saturating_sub(validator.weight);
            self.connected.write().remove(node_id);
            Ok(())
        } else {
            Err(ConsensusError::Internal(format!(
                "validator {} not found",
                node_id
            )))
        }
    }

    /// Marks a validator as connected.
    pub fn connect(&self, node_id: NodeId) {
        self.connected.write().insert(node_id);
    }

    /// Marks a validator as disconnected.
    pub fn disconnect(&self, node_id: &NodeId) {
        self.connected.write().remove(node_id);
    }

    /// Returns true if the validator exists.
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.validators.read().contains_key(node_id)
    }

    /// Returns the total stake weight.
    pub fn total_weight(&self) -> u64 {
        *self.total_weight.read()
    }

    /// Returns all node IDs.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.validators.read().keys().copied().collect()
    }
}

impl Validators for ValidatorSet {
    fn sample(&self, k: usize) -> Result<Vec<NodeId>> {
        let validators = self.validators.read();
        let total = *self.total_weight.read();

        if validators.is_empty() || total == 0 {
            return Err(ConsensusError::InsufficientValidators {
                needed: k,
                have: validators.len(),
            });
        }

        // Cumulative stake distribution; each of the k draws is independent,
        // so repeats are possible and intended.
        let mut cumulative = Vec::with_capacity(validators.len());
        let mut running = 0u64;
        for (node_id, validator) in validators.iter() {
            running += validator.weight;
            cumulative.push((*node_id, running));
        }

        let mut rng = rand::thread_rng();
        let mut sampled = Vec::with_capacity(k);
        for _ in 0..k {
            let target = rng.gen_range(0..total);
            let idx = cumulative.partition_point(|(_, weight)| *weight <= target);
            sampled.push(cumulative[idx].0);
        }
        Ok(sampled)
    }

    fn sample_connected(&self) -> Option<NodeId> {
        let connected = self.connected.read();
        if connected.is_empty() {
            return None;
        }

        let idx = rand::thread_rng().gen_range(0..connected.len());
        connected.iter().nth(idx).copied()
    }

    fn weight(&self, node_id: &NodeId) -> u64 {
        self.validators
            .read()
            .get(node_id)
            .map(|v| v.weight)
            .unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.validators.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_node_id(byte: u8) -> NodeId {
        NodeId::from_bytes([byte; 20])
    }

    fn make_set(weights: &[(u8, u64)]) -> ValidatorSet {
        let set = ValidatorSet::new(Id::EMPTY);
        for (byte, weight) in weights {
            set.add(Validator::new(make_node_id(*byte), *weight)).unwrap();
        }
        set
    }

    #[test]
    fn test_add_remove() {
        let set = make_set(&[(1, 100), (2, 200)]);

        assert_eq!(set.len(), 2);
        assert_eq!(set.total_weight(), 300);
        assert!(set.contains(&make_node_id(1)));

        set.remove(&make_node_id(1)).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.total_weight(), 200);
        assert!(set.remove(&make_node_id(1)).is_err());
    }

    #[test]
    fn test_duplicate_add_fails() {
        let set = make_set(&[(1, 100)]);
        assert!(set.add(Validator::new(make_node_id(1), 50)).is_err());
    }

    #[test]
    fn test_sample_with_replacement() {
        let set = make_set(&[(1, 100)]);

        // One validator absorbs every slot.
        let sampled = set.sample(5).unwrap();
        assert_eq!(sampled, vec![make_node_id(1); 5]);
    }

    #[test]
    fn test_sample_empty_fails() {
        let set = make_set(&[]);
        assert!(matches!(
            set.sample(1),
            Err(ConsensusError::InsufficientValidators { .. })
        ));
    }

    #[test]
    fn test_sample_weighted() {
        let set = make_set(&[(1, 1), (2, 1_000_000)]);

        // The heavy validator should dominate the sample.
        let sampled = set.sample(100).unwrap();
        let heavy = sampled.iter().filter(|id| **id == make_node_id(2)).count();
        assert!(heavy > 90, "heavy validator sampled {heavy}/100 times");
    }

    #[test]
    fn test_sample_connected() {
        let set = make_set(&[(1, 100), (2, 100)]);
        assert_eq!(set.sample_connected(), None);

        set.connect(make_node_id(1));
        assert_eq!(set.sample_connected(), Some(make_node_id(1)));

        set.disconnect(&make_node_id(1));
        assert_eq!(set.sample_connected(), None);
    }

    #[test]
    fn test_weight() {
        let set = make_set(&[(1, 100)]);
        assert_eq!(set.weight(&make_node_id(1)), 100);
        assert_eq!(set.weight(&make_node_id(9)), 0);
    }
}
