//! Error types for ppl-runtime
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

use crate::address::Address;

/// Error type for distribution operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DistributionError {
    /// Parameters outside the distribution's domain
    #[error("Invalid parameters for {distribution}: {reason}")]
    InvalidParameters {
        distribution: &'static str,
        reason: String,
    },
}

impl DistributionError {
    /// Shorthand for an invalid-parameter error
    pub fn invalid(distribution: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            distribution,
            reason: reason.into(),
        }
    }
}

/// Top-level error type for inference runs
///
/// Every variant is fatal to the run that raised it: the runtime unwinds its
/// handler stack and hands the error back to the invoker.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// `factor` reached the default handler
    #[error("factor at {address} is only allowed inside inference")]
    FactorOutsideInference { address: Address },

    /// Enumeration met a distribution without finite support
    #[error("{algorithm} requires finite support, but {distribution} at {address} has none")]
    MissingSupport {
        algorithm: &'static str,
        distribution: &'static str,
        address: Address,
    },

    /// Variational inference met a distribution without a gradient
    #[error("no score gradient for {distribution} at {address}")]
    MissingGradient {
        distribution: &'static str,
        address: Address,
    },

    /// A step was dispatched under a handler other than the one that issued it
    #[error("Handler mismatch: expected {expected}, installed {installed}")]
    HandlerMismatch { expected: String, installed: String },

    /// Particles reached different kinds of synchronization points in one round
    #[error("Unsynchronized particles: expected every particle at {expected}, found one at {found}")]
    UnsynchronizedParticles {
        expected: &'static str,
        found: &'static str,
    },

    /// Marginal with zero (or non-finite) total mass
    #[error("Marginal distribution has no probability mass")]
    EmptyMarginal,

    /// Numerical failure (e.g. every particle weight is -inf)
    #[error("Numerical instability: {0}")]
    Numerical(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Distribution error
    #[error("Distribution error: {0}")]
    Distribution(#[from] DistributionError),
}

/// Result type alias for inference operations
pub type InferResult<T> = Result<T, InferenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distribution_error_display() {
        let err = DistributionError::invalid("gaussian", "sigma must be positive");
        assert_eq!(
            err.to_string(),
            "Invalid parameters for gaussian: sigma must be positive"
        );
    }

    #[test]
    fn test_inference_error_display() {
        let err = InferenceError::FactorOutsideInference {
            address: Address::root().child("obs"),
        };
        assert_eq!(err.to_string(), "factor at /obs is only allowed inside inference");

        let err = InferenceError::MissingSupport {
            algorithm: "Enumerate",
            distribution: "gaussian",
            address: Address::root().child("x"),
        };
        assert_eq!(
            err.to_string(),
            "Enumerate requires finite support, but gaussian at /x has none"
        );

        let err = InferenceError::HandlerMismatch {
            expected: "#2 ParticleFilterRejuv".to_string(),
            installed: "#3 MhParticle".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Handler mismatch: expected #2 ParticleFilterRejuv, installed #3 MhParticle"
        );
    }

    #[test]
    fn test_inference_error_from_distribution_error() {
        let dist_err = DistributionError::invalid("beta", "a must be positive");
        let err: InferenceError = dist_err.into();
        assert!(matches!(err, InferenceError::Distribution(_)));
    }
}
