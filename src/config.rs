//! Runtime configuration

use serde::{Deserialize, Serialize};

use crate::error::{InferResult, InferenceError};

/// Default number of AdaGrad steps taken by variational inference
pub const DEFAULT_VARIATIONAL_STEPS: usize = 500;

/// Configuration for a [`Runtime`](crate::dispatch::Runtime)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// RNG seed; `None` seeds from entropy
    pub seed: Option<u64>,
    /// Outer gradient steps for variational runs that don't set their own
    pub variational_steps: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: None,
            variational_steps: DEFAULT_VARIATIONAL_STEPS,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the RNG seed
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the default number of variational steps
    pub fn variational_steps(mut self, steps: usize) -> Self {
        self.variational_steps = steps;
        self
    }

    /// Parse from a JSON document
    pub fn from_json(json: &str) -> InferResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| InferenceError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> InferResult<()> {
        if self.variational_steps == 0 {
            return Err(InferenceError::Configuration(
                "variational_steps must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
