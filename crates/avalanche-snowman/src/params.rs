//! Consensus parameters.

use std::time::Duration;

/// Parameters for Snowman consensus.
#[derive(Debug, Clone)]
pub struct Parameters {
    /// Sample size (k) - number of validators to poll
    pub k: usize,

    /// Votes needed for a poll to update the preference
    pub alpha_preference: usize,

    /// Votes needed for a poll to increase confidence
    pub alpha_confidence: usize,

    /// Consecutive successful polls needed to finalize
    pub beta: usize,

    /// Number of polls kept outstanding while blocks are processing
    pub concurrent_repolls: usize,

    /// Number of processing blocks above which block building pauses
    pub optimal_processing: usize,

    /// Maximum number of outstanding polls
    pub max_outstanding_items: usize,

    /// Maximum time a block may stay processing before the engine reports
    /// itself unhealthy
    pub max_item_processing_time: Duration,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            k: 20,
            alpha_preference: 15,
            alpha_confidence: 15,
            beta: 20,
            concurrent_repolls: 4,
            optimal_processing: 10,
            max_outstanding_items: 256,
            max_item_processing_time: Duration::from_secs(30),
        }
    }
}

impl Parameters {
    /// Creates new parameters with the given thresholds.
    pub fn new(k: usize, alpha_preference: usize, alpha_confidence: usize, beta: usize) -> Self {
        let defaults = Self::default();
        Self {
            k,
            alpha_preference,
            alpha_confidence,
            beta,
            concurrent_repolls: defaults.concurrent_repolls.min(beta).max(1),
            ..defaults
        }
    }

    /// Validates the parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.k == 0 {
            return Err("k must be positive".to_string());
        }
        if self.alpha_preference <= self.k / 2 {
            return Err("alpha_preference must be > k/2".to_string());
        }
        if self.alpha_preference > self.alpha_confidence {
            return Err("alpha_preference must be <= alpha_confidence".to_string());
        }
        if self.alpha_confidence > self.k {
            return Err("alpha_confidence must be <= k".to_string());
        }
        if self.beta == 0 {
            return Err("beta must be positive".to_string());
        }
        if self.concurrent_repolls == 0 {
            return Err("concurrent_repolls must be positive".to_string());
        }
        if self.concurrent_repolls > self.beta {
            return Err("concurrent_repolls must be <= beta".to_string());
        }
        if self.optimal_processing == 0 {
            return Err("optimal_processing must be positive".to_string());
        }
        if self.max_outstanding_items == 0 {
            return Err("max_outstanding_items must be positive".to_string());
        }
        Ok(())
    }
}
