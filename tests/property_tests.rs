//! Property-based tests for ppl-runtime
//!
//! Uses proptest to verify invariants of resampling, weights and marginals.

use ppl_runtime::address::Address;
use ppl_runtime::dispatch::{exit_cont, Choice};
use ppl_runtime::distributions::{Dist, Histogram, Marginal, Primitive};
use ppl_runtime::inference::acceptance_probability;
use ppl_runtime::population::resampling::expected_copies;
use ppl_runtime::population::{
    effective_sample_size, log_sum_exp, multinomial_resample, residual_resample,
};
use ppl_runtime::trace::{ChoiceRecord, Trace};
use ppl_runtime::value::{Store, Value};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn log_weights() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-30.0..5.0f64, 1..60)
}

/// Choice scores and reuse flags for a trace; `-inf` scores included
fn trace_sites() -> impl Strategy<Value = Vec<(f64, bool)>> {
    let score = prop_oneof![9 => -20.0..0.0f64, 1 => Just(f64::NEG_INFINITY)];
    prop::collection::vec((score, any::<bool>()), 1..12)
}

fn build_trace(sites: &[(f64, bool)], prefix: &str) -> Trace {
    let mut trace = Trace::new();
    for (i, &(choice_score, reused)) in sites.iter().enumerate() {
        // Sites below 4 are shared between traces, the rest are trace-specific
        let name = if i < 4 { format!("s{}", i) } else { format!("{}{}", prefix, i) };
        trace.push(ChoiceRecord {
            choice: Choice::new(Address::root().child(name), Dist::Bernoulli, vec![0.5]),
            value: Value::Bool(reused),
            choice_score,
            reused,
            k: exit_cont(),
            score: 0.0,
            factors: 0,
            store: Store::new(),
        });
    }
    trace
}

proptest! {
    // ==================== Residual Resampling ====================

    #[test]
    fn residual_resample_keeps_population_size(weights in log_weights(), seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let outcome = residual_resample(&weights, &mut rng).unwrap();
        prop_assert_eq!(outcome.indices.len(), weights.len());
        prop_assert!(outcome.indices.iter().all(|&i| i < weights.len()));
        prop_assert!(outcome.retained <= weights.len());
    }

    #[test]
    fn residual_resample_retains_whole_copies(weights in log_weights(), seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (copies, _) = expected_copies(&weights).unwrap();
        let outcome = residual_resample(&weights, &mut rng).unwrap();
        let retained = &outcome.indices[..outcome.retained];
        let whole: f64 = copies.iter().map(|w| w.floor()).sum();
        prop_assert_eq!(outcome.retained as f64, whole);
        for (i, w) in copies.iter().enumerate() {
            let kept = retained.iter().filter(|&&j| j == i).count();
            prop_assert_eq!(kept as f64, w.floor());
        }
        // Retained copies come first and in particle order
        prop_assert!(retained.windows(2).all(|p| p[0] <= p[1]));
    }

    #[test]
    fn residual_resample_draws_only_fractional_particles(weights in log_weights(), seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let (copies, _) = expected_copies(&weights).unwrap();
        let outcome = residual_resample(&weights, &mut rng).unwrap();
        for &i in &outcome.indices[outcome.retained..] {
            prop_assert!(copies[i] - copies[i].floor() > 0.0);
        }
    }

    #[test]
    fn reset_weight_preserves_total(weights in log_weights(), seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let outcome = residual_resample(&weights, &mut rng).unwrap();
        let reset = vec![outcome.reset_weight; weights.len()];
        prop_assert!((log_sum_exp(&reset) - log_sum_exp(&weights)).abs() < 1e-9);
    }

    #[test]
    fn expected_copies_sum_to_population_size(weights in log_weights()) {
        let (copies, _) = expected_copies(&weights).unwrap();
        let total: f64 = copies.iter().sum();
        prop_assert!((total - weights.len() as f64).abs() < 1e-6 * weights.len() as f64);
    }

    // ==================== Weights ====================

    #[test]
    fn ess_is_between_one_and_population_size(weights in log_weights()) {
        let ess = effective_sample_size(&weights);
        prop_assert!(ess >= 1.0 - 1e-9);
        prop_assert!(ess <= weights.len() as f64 + 1e-9);
    }

    #[test]
    fn log_sum_exp_dominates_max(weights in log_weights()) {
        let max = weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let total = log_sum_exp(&weights);
        prop_assert!(total >= max);
        prop_assert!(total <= max + (weights.len() as f64).ln() + 1e-12);
    }

    #[test]
    fn multinomial_draws_requested_count(
        weights in log_weights(),
        count in 0usize..100,
        seed in any::<u64>()
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let draws = multinomial_resample(&weights, count, &mut rng).unwrap();
        prop_assert_eq!(draws.len(), count);
        prop_assert!(draws.iter().all(|&i| i < weights.len()));
    }

    // ==================== Marginals ====================

    #[test]
    fn marginal_probabilities_normalized(masses in prop::collection::vec(0.01..10.0f64, 1..30)) {
        let mut hist = Histogram::new();
        for (i, &m) in masses.iter().enumerate() {
            hist.add(Value::Int((i % 7) as i64), m);
        }
        let marginal = hist.into_marginal().unwrap();
        let total: f64 = marginal.probabilities().iter().sum();
        prop_assert!((total - 1.0).abs() < 1e-9);
        prop_assert!(marginal.len() <= 7);
    }

    #[test]
    fn marginal_samples_stay_in_support(masses in prop::collection::vec(0.01..10.0f64, 1..10), seed in any::<u64>()) {
        let marginal = Marginal::from_weighted(
            masses.iter().enumerate().map(|(i, &m)| (Value::Int(i as i64), m)),
        ).unwrap();
        let dist = Dist::from(marginal.clone());
        let mut rng = StdRng::seed_from_u64(seed);
        for _ in 0..20 {
            let v = dist.sample(&[], &mut rng).unwrap();
            prop_assert!(marginal.probability(&v) > 0.0);
            prop_assert!(dist.score(&[], &v).is_finite());
        }
    }

    // ==================== Addresses ====================

    #[test]
    fn child_address_extends_parent(labels in prop::collection::vec("[a-z0-9]{1,6}", 1..8)) {
        let mut address = Address::root();
        for (depth, label) in labels.iter().enumerate() {
            let child = address.child(label);
            prop_assert!(child.as_str().starts_with(address.as_str()));
            prop_assert_eq!(child.depth(), depth + 1);
            address = child;
        }
    }

    // ==================== MH ====================

    #[test]
    fn acceptance_probability_is_a_probability(
        new_sites in trace_sites(),
        old_sites in trace_sites(),
        regen in 0usize..12,
        curr_score in prop_oneof![9 => -50.0..10.0f64, 1 => Just(f64::NEG_INFINITY)],
        old_score in prop_oneof![9 => -50.0..10.0f64, 1 => Just(f64::NEG_INFINITY)],
    ) {
        let new = build_trace(&new_sites, "n");
        let old = build_trace(&old_sites, "o");
        let regen_from = regen % new_sites.len().min(old_sites.len());
        let p = acceptance_probability(&new, Some(&old), regen_from, curr_score, old_score);
        prop_assert!((0.0..=1.0).contains(&p), "acceptance {}", p);
    }
}
