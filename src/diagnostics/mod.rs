//! Diagnostics and statistics
//!
//! Every engine records one [`InferenceStats`] entry on the runtime when it
//! finishes. Entries serialize with serde for reporting.

use serde::{Deserialize, Serialize};

/// Summary of one completed inference run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceStats {
    /// Engine name
    pub algorithm: String,
    /// Completed program executions (enumeration paths, MH iterations, particles)
    pub executions: usize,
    /// MH proposals made (including rejuvenation moves)
    pub proposals: usize,
    /// Proposals accepted
    pub accepted: usize,
    /// Resampling rounds performed
    pub resampling_rounds: usize,
    /// Smallest effective sample size seen before a resampling
    pub min_ess: Option<f64>,
    /// Distinct values in the released marginal
    pub support_size: usize,
    /// Learned variational parameters, ordered by address
    pub variational_params: Vec<(String, Vec<f64>)>,
}

impl InferenceStats {
    /// Create empty stats for an engine
    pub fn new(algorithm: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            ..Self::default()
        }
    }

    /// Record one proposal and whether it was accepted
    pub fn record_proposal(&mut self, accepted: bool) {
        self.proposals += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    /// Record one resampling round and its pre-resampling ESS
    pub fn record_resampling(&mut self, ess: f64) {
        self.resampling_rounds += 1;
        self.min_ess = Some(self.min_ess.map_or(ess, |m| m.min(ess)));
    }

    /// Fraction of proposals accepted
    pub fn acceptance_rate(&self) -> Option<f64> {
        if self.proposals == 0 {
            None
        } else {
            Some(self.accepted as f64 / self.proposals as f64)
        }
    }

    pub fn with_executions(mut self, executions: usize) -> Self {
        self.executions = executions;
        self
    }

    pub fn with_support_size(mut self, size: usize) -> Self {
        self.support_size = size;
        self
    }
}
