//! Finite marginal distributions built from weighted outcomes

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use rand::Rng;
use rand_distr::{Distribution, WeightedIndex};

use super::traits::Primitive;
use crate::error::{DistributionError, InferResult, InferenceError};
use crate::value::{canonical_bits, Value};

/// Accumulates probability mass per distinct outcome
///
/// Outcomes keep their first-insertion order so the resulting marginal has a
/// deterministic support ordering.
#[derive(Clone, Debug, Default)]
pub struct Histogram {
    entries: Vec<(Value, f64)>,
    index: HashMap<Value, usize>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `mass` to the bucket for `value`
    pub fn add(&mut self, value: Value, mass: f64) {
        match self.index.get(&value) {
            Some(&i) => self.entries[i].1 += mass,
            None => {
                self.index.insert(value.clone(), self.entries.len());
                self.entries.push((value, mass));
            }
        }
    }

    /// Mass recorded for `value`
    pub fn mass(&self, value: &Value) -> f64 {
        self.index.get(value).map_or(0.0, |&i| self.entries[i].1)
    }

    pub fn total(&self) -> f64 {
        self.entries.iter().map(|(_, m)| m).sum()
    }

    /// Number of distinct outcomes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Normalize into a marginal
    ///
    /// Fails with [`InferenceError::EmptyMarginal`] when the total mass is
    /// zero or not finite.
    pub fn into_marginal(self) -> InferResult<Marginal> {
        let total = self.total();
        if !(total > 0.0) || !total.is_finite() {
            return Err(InferenceError::EmptyMarginal);
        }
        let (values, probs): (Vec<_>, Vec<_>) = self
            .entries
            .into_iter()
            .map(|(v, m)| (v, m / total))
            .unzip();
        Ok(Marginal {
            values,
            probs,
            index: self.index,
            mass: total,
        })
    }
}

/// Normalized distribution over a finite set of values
///
/// This is what every inference engine releases to its continuation.
#[derive(Clone, Debug)]
pub struct Marginal {
    values: Vec<Value>,
    probs: Vec<f64>,
    index: HashMap<Value, usize>,
    mass: f64,
}

impl Marginal {
    /// Build from `(value, mass)` pairs, merging duplicates
    pub fn from_weighted<I>(outcomes: I) -> InferResult<Self>
    where
        I: IntoIterator<Item = (Value, f64)>,
    {
        let mut hist = Histogram::new();
        for (value, mass) in outcomes {
            hist.add(value, mass);
        }
        hist.into_marginal()
    }

    /// Point mass on a single value
    pub fn delta(value: Value) -> Self {
        let mut index = HashMap::new();
        index.insert(value.clone(), 0);
        Self {
            values: vec![value],
            probs: vec![1.0],
            index,
            mass: 1.0,
        }
    }

    /// Probability of `value`, zero when outside the support
    pub fn probability(&self, value: &Value) -> f64 {
        self.index.get(value).map_or(0.0, |&i| self.probs[i])
    }

    /// Values with nonzero bucket, in first-seen order
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probs
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, f64)> {
        self.values.iter().zip(self.probs.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Unnormalized mass the marginal was built from
    pub fn total_mass(&self) -> f64 {
        self.mass
    }

    /// Most probable value (first seen wins ties)
    pub fn mode(&self) -> Option<&Value> {
        let mut best: Option<(usize, f64)> = None;
        for (i, &p) in self.probs.iter().enumerate() {
            if best.map_or(true, |(_, bp)| p > bp) {
                best = Some((i, p));
            }
        }
        best.map(|(i, _)| &self.values[i])
    }

    /// Expectation of `f` over the marginal
    ///
    /// Returns `None` if `f` is undefined on any supported value.
    pub fn expectation<F>(&self, f: F) -> Option<f64>
    where
        F: Fn(&Value) -> Option<f64>,
    {
        self.iter()
            .map(|(v, p)| f(v).map(|x| x * p))
            .sum::<Option<f64>>()
    }

    /// Mean of a numeric marginal (booleans count as 0/1)
    pub fn mean(&self) -> Option<f64> {
        self.expectation(|v| match v {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            other => other.as_real(),
        })
    }
}

impl PartialEq for Marginal {
    /// Same support with bit-identical probabilities, ignoring order
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(v, p)| canonical_bits(other.probability(v)) == canonical_bits(p))
    }
}

impl Eq for Marginal {}

impl Hash for Marginal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Order-insensitive: combine per-entry hashes commutatively
        let mut acc: u64 = 0;
        for (v, p) in self.iter() {
            let mut h = std::collections::hash_map::DefaultHasher::new();
            v.hash(&mut h);
            canonical_bits(p).hash(&mut h);
            acc = acc.wrapping_add(h.finish());
        }
        self.len().hash(state);
        acc.hash(state);
    }
}

impl Primitive for Marginal {
    fn name(&self) -> &'static str {
        "marginal"
    }

    fn sample<R: Rng + ?Sized>(&self, _params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        let dist = WeightedIndex::new(&self.probs)
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        Ok(self.values[dist.sample(rng)].clone())
    }

    fn score(&self, _params: &[f64], value: &Value) -> f64 {
        self.probability(value).ln()
    }

    fn support(&self, _params: &[f64]) -> Option<Vec<Value>> {
        Some(self.values.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_histogram_merges_duplicates() {
        let mut hist = Histogram::new();
        hist.add(Value::Bool(true), 1.0);
        hist.add(Value::Bool(false), 1.0);
        hist.add(Value::Bool(true), 2.0);
        assert_eq!(hist.len(), 2);
        assert_eq!(hist.mass(&Value::Bool(true)), 3.0);

        let m = hist.into_marginal().unwrap();
        assert!((m.probability(&Value::Bool(true)) - 0.75).abs() < 1e-12);
        assert_eq!(m.values()[0], Value::Bool(true));
        assert_eq!(m.total_mass(), 4.0);
    }

    #[test]
    fn test_empty_histogram_is_error() {
        assert!(matches!(
            Histogram::new().into_marginal(),
            Err(InferenceError::EmptyMarginal)
        ));
        let mut hist = Histogram::new();
        hist.add(Value::Int(1), 0.0);
        assert!(hist.into_marginal().is_err());
    }

    #[test]
    fn test_marginal_equality_ignores_order() {
        let a = Marginal::from_weighted(vec![(Value::Int(1), 1.0), (Value::Int(2), 3.0)]).unwrap();
        let b = Marginal::from_weighted(vec![(Value::Int(2), 3.0), (Value::Int(1), 1.0)]).unwrap();
        assert_eq!(a, b);
        assert_eq!(Value::from(a), Value::from(b));
    }

    #[test]
    fn test_marginal_as_primitive() {
        let m = Marginal::from_weighted(vec![(Value::Int(0), 1.0), (Value::Int(1), 1.0)]).unwrap();
        assert!((m.score(&[], &Value::Int(1)) - 0.5f64.ln()).abs() < 1e-12);
        assert_eq!(m.score(&[], &Value::Int(5)), f64::NEG_INFINITY);
        let mut rng = StdRng::seed_from_u64(3);
        let draw = m.sample(&[], &mut rng).unwrap();
        assert!(m.probability(&draw) > 0.0);
    }

    #[test]
    fn test_mean_and_mode() {
        let m = Marginal::from_weighted(vec![(Value::Bool(true), 3.0), (Value::Bool(false), 1.0)]).unwrap();
        assert!((m.mean().unwrap() - 0.75).abs() < 1e-12);
        assert_eq!(m.mode(), Some(&Value::Bool(true)));
        assert_eq!(Marginal::delta(Value::Unit).mode(), Some(&Value::Unit));
    }
}
