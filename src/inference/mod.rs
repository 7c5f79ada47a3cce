//! Inference engines
//!
//! Each engine is a [`Handler`](crate::dispatch::Handler) installed over a
//! program. It runs the program as many times as it needs and finally hands
//! its result to the continuation it was installed with.
//!
//! [`Algorithm`] selects an engine and its parameters as data, so a run can
//! be configured from JSON.

pub mod enumerate;
pub mod mh;
pub mod particle_filter;
pub mod pmcmc;
pub mod rejuvenation;
pub mod variational;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::dispatch::{Cont, Program, Step};
use crate::error::{InferResult, InferenceError};
use crate::value::Store;

pub use enumerate::{enumerate, Enumerate, SearchStrategy};
pub use mh::{acceptance_probability, mh, MetropolisHastings, TraceKernel};
pub use particle_filter::{particle_filter, ParticleFilter};
pub use pmcmc::{pmcmc, PathParticle, Pmcmc};
pub use rejuvenation::{particle_filter_rejuv, MhParticle, ParticleFilterRejuv, Rejuvenated};
pub use variational::{variational, Variational};

/// Inference algorithm and its parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum Algorithm {
    /// Exhaustive enumeration of finite-support programs
    Enumerate {
        #[serde(default)]
        max_executions: Option<usize>,
        #[serde(default)]
        strategy: SearchStrategy,
    },
    /// Lightweight single-site Metropolis–Hastings
    Mh { iterations: usize },
    /// Sequential Monte Carlo with residual resampling
    ParticleFilter { particles: usize },
    /// Particle MCMC with a retained path
    Pmcmc { particles: usize, sweeps: usize },
    /// Particle filter with MH rejuvenation after each resampling
    ParticleFilterRejuv { particles: usize, rejuv_steps: usize },
    /// Mean-field variational inference
    Variational {
        estimate_samples: usize,
        #[serde(default)]
        steps: Option<usize>,
    },
}

impl Algorithm {
    /// Unbounded likely-first enumeration
    pub fn enumerate() -> Self {
        Self::Enumerate {
            max_executions: None,
            strategy: SearchStrategy::default(),
        }
    }

    pub fn mh(iterations: usize) -> Self {
        Self::Mh { iterations }
    }

    pub fn particle_filter(particles: usize) -> Self {
        Self::ParticleFilter { particles }
    }

    pub fn pmcmc(particles: usize, sweeps: usize) -> Self {
        Self::Pmcmc { particles, sweeps }
    }

    pub fn particle_filter_rejuv(particles: usize, rejuv_steps: usize) -> Self {
        Self::ParticleFilterRejuv {
            particles,
            rejuv_steps,
        }
    }

    /// Variational inference with the runtime's default step count
    pub fn variational(estimate_samples: usize) -> Self {
        Self::Variational {
            estimate_samples,
            steps: None,
        }
    }

    /// Handler name of the engine this selects
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enumerate { .. } => "Enumerate",
            Self::Mh { .. } => "MH",
            Self::ParticleFilter { .. } => "ParticleFilter",
            Self::Pmcmc { .. } => "PMCMC",
            Self::ParticleFilterRejuv { .. } => "ParticleFilterRejuv",
            Self::Variational { .. } => "Variational",
        }
    }

    /// Reject parameter choices no engine can run with
    pub fn validate(&self) -> InferResult<()> {
        let positive = |value: usize, what: &str| {
            if value == 0 {
                Err(InferenceError::Configuration(format!(
                    "{}: {} must be positive",
                    self.name(),
                    what
                )))
            } else {
                Ok(())
            }
        };
        match *self {
            Self::Enumerate { max_executions, .. } => match max_executions {
                Some(n) => positive(n, "max_executions"),
                None => Ok(()),
            },
            Self::Mh { iterations } => positive(iterations, "iterations"),
            Self::ParticleFilter { particles } => positive(particles, "particles"),
            Self::Pmcmc { particles, sweeps } => {
                positive(particles, "particles")?;
                positive(sweeps, "sweeps")
            }
            Self::ParticleFilterRejuv { particles, .. } => positive(particles, "particles"),
            Self::Variational {
                estimate_samples,
                steps,
            } => {
                positive(estimate_samples, "estimate_samples")?;
                match steps {
                    Some(n) => positive(n, "steps"),
                    None => Ok(()),
                }
            }
        }
    }

    /// Step that installs the selected engine over `program`
    pub fn invoke(&self, store: Store, k: Cont, address: Address, program: Program) -> Step {
        match *self {
            Self::Enumerate {
                max_executions,
                strategy,
            } => enumerate(store, k, address, program, max_executions, strategy),
            Self::Mh { iterations } => mh(store, k, address, program, iterations),
            Self::ParticleFilter { particles } => {
                particle_filter(store, k, address, program, particles)
            }
            Self::Pmcmc { particles, sweeps } => {
                pmcmc(store, k, address, program, particles, sweeps)
            }
            Self::ParticleFilterRejuv {
                particles,
                rejuv_steps,
            } => particle_filter_rejuv(store, k, address, program, particles, rejuv_steps),
            Self::Variational {
                estimate_samples,
                steps,
            } => variational(store, k, address, program, estimate_samples, steps),
        }
    }

    /// Parse and validate from a JSON document
    pub fn from_json(json: &str) -> InferResult<Self> {
        let algorithm: Self =
            serde_json::from_str(json).map_err(|e| InferenceError::Configuration(e.to_string()))?;
        algorithm.validate()?;
        Ok(algorithm)
    }
}

pub mod prelude {
    pub use super::enumerate::{enumerate, SearchStrategy};
    pub use super::mh::mh;
    pub use super::particle_filter::particle_filter;
    pub use super::pmcmc::pmcmc;
    pub use super::rejuvenation::particle_filter_rejuv;
    pub use super::variational::variational;
    pub use super::Algorithm;
}
