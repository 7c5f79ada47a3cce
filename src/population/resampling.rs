//! Log-space weight arithmetic and resampling schemes
//!
//! Residual resampling follows Liu (2008), section 3.4.4: every particle
//! keeps `floor(w)` deterministic copies of its normalized weight `w`, and
//! the fractional remainders drive a multinomial fill of the free slots.

use rand::Rng;
use rand_distr::{Distribution, WeightedIndex};

use crate::error::{InferResult, InferenceError};

/// `ln(sum(exp(xs)))` without overflow
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn log_sum_exp(xs: &[f64]) -> f64 {
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || max == f64::INFINITY {
        return max;
    }
    max + xs.iter().map(|x| (x - max).exp()).sum::<f64>().ln()
}

/// Effective sample size of a set of log-weights
pub fn effective_sample_size(log_weights: &[f64]) -> f64 {
    let doubled: Vec<f64> = log_weights.iter().map(|w| 2.0 * w).collect();
    (2.0 * log_sum_exp(log_weights) - log_sum_exp(&doubled)).exp()
}

/// Result of one residual resampling pass
#[derive(Clone, Debug, PartialEq)]
pub struct ResampleOutcome {
    /// Source index for every new slot: retained copies first, then draws
    pub indices: Vec<usize>,
    /// How many leading entries of `indices` are deterministic copies
    pub retained: usize,
    /// Log-weight every resampled particle starts from
    pub reset_weight: f64,
}

/// Normalized expected copy counts `exp(w_i - (W - ln M))`
///
/// Also returns the reset weight `W - ln M`.
pub fn expected_copies(log_weights: &[f64]) -> InferResult<(Vec<f64>, f64)> {
    let m = log_weights.len();
    if m == 0 {
        return Err(InferenceError::Configuration(
            "cannot resample an empty population".to_string(),
        ));
    }
    let total = log_sum_exp(log_weights);
    if !total.is_finite() {
        return Err(InferenceError::Numerical(format!(
            "total particle weight is {}",
            total
        )));
    }
    let reset_weight = total - (m as f64).ln();
    let copies = log_weights
        .iter()
        .map(|w| (w - reset_weight).exp())
        .collect();
    Ok((copies, reset_weight))
}

/// Residual resampling of `log_weights.len()` particles
pub fn residual_resample<R: Rng + ?Sized>(
    log_weights: &[f64],
    rng: &mut R,
) -> InferResult<ResampleOutcome> {
    let m = log_weights.len();
    let (copies, reset_weight) = expected_copies(log_weights)?;

    let mut indices = Vec::with_capacity(m);
    let mut remainders = Vec::with_capacity(m);
    for (i, &w) in copies.iter().enumerate() {
        let whole = w.floor();
        remainders.push(w - whole);
        let keep = (whole as usize).min(m - indices.len());
        indices.extend(std::iter::repeat(i).take(keep));
    }
    let retained = indices.len();

    let free = m - retained;
    if free > 0 {
        let dist = WeightedIndex::new(&remainders)
            .map_err(|e| InferenceError::Numerical(format!("residual weights: {}", e)))?;
        indices.extend((0..free).map(|_| dist.sample(rng)));
    }

    Ok(ResampleOutcome {
        indices,
        retained,
        reset_weight,
    })
}

/// `count` independent draws proportional to `exp(log_weights)`
pub fn multinomial_resample<R: Rng + ?Sized>(
    log_weights: &[f64],
    count: usize,
    rng: &mut R,
) -> InferResult<Vec<usize>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return Err(InferenceError::Numerical(format!(
            "largest particle weight is {}",
            max
        )));
    }
    let probs: Vec<f64> = log_weights.iter().map(|w| (w - max).exp()).collect();
    let dist = WeightedIndex::new(&probs)
        .map_err(|e| InferenceError::Numerical(format!("multinomial weights: {}", e)))?;
    Ok((0..count).map(|_| dist.sample(rng)).collect())
}
