//! Elementary distributions
//!
//! Parameter layouts:
//!
//! | Distribution | Params | Value |
//! |---|---|---|
//! | Bernoulli | `[p]` | bool |
//! | Uniform | `[a, b]` | real |
//! | Gaussian | `[mu, sigma]` | real |
//! | Beta | `[a, b]` | real |
//! | Gamma | `[shape, scale]` | real |
//! | Exponential | `[rate]` | real |
//! | Binomial | `[p, n]` | int |
//! | Poisson | `[mu]` | int |
//! | Discrete | `[w0, .., wk]` | int |
//! | RandomInteger | `[n]` | int |
//! | Dirichlet | `[a0, .., ak]` | vector |

use rand::Rng;
use rand_distr::{Distribution, Normal, WeightedIndex};
use statrs::function::gamma::{digamma, ln_gamma};

use super::traits::Primitive;
use crate::error::DistributionError;
use crate::value::Value;

/// Smallest distance kept from a parameter's domain boundary
pub const PARAM_EPSILON: f64 = 1e-6;

const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_8;

fn arity(params: &[f64], n: usize) -> bool {
    params.len() == n && params.iter().all(|p| !p.is_nan())
}

fn expect_arity(
    name: &'static str,
    params: &[f64],
    n: usize,
) -> Result<(), DistributionError> {
    if arity(params, n) {
        Ok(())
    } else {
        Err(DistributionError::invalid(
            name,
            format!("expected {} parameters, got {:?}", n, params),
        ))
    }
}

fn clamp_probability(p: &mut f64) {
    *p = p.clamp(PARAM_EPSILON, 1.0 - PARAM_EPSILON);
}

fn clamp_positive(x: &mut f64) {
    if x.is_nan() || *x < PARAM_EPSILON {
        *x = PARAM_EPSILON;
    }
}

fn ln_choose(n: f64, k: f64) -> f64 {
    ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
}

fn count_param(name: &'static str, n: f64) -> Result<u64, DistributionError> {
    if n.is_finite() && n >= 0.0 && n.fract() == 0.0 {
        Ok(n as u64)
    } else {
        Err(DistributionError::invalid(
            name,
            format!("count parameter must be a non-negative integer, got {}", n),
        ))
    }
}

/// Integer value in `0..n`, as an index
fn index_in(value: &Value, n: usize) -> Option<usize> {
    value
        .as_int()
        .filter(|&i| i >= 0 && (i as usize) < n)
        .map(|i| i as usize)
}

/// Bernoulli over `{true, false}`
#[derive(Clone, Copy, Debug, Default)]
pub struct Bernoulli;

impl Primitive for Bernoulli {
    fn name(&self) -> &'static str {
        "bernoulli"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        expect_arity(self.name(), params, 1)?;
        let dist = rand_distr::Bernoulli::new(params[0])
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        Ok(Value::Bool(dist.sample(rng)))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        if !arity(params, 1) {
            return f64::NEG_INFINITY;
        }
        match value.as_bool() {
            Some(true) => params[0].ln(),
            Some(false) => (1.0 - params[0]).ln(),
            None => f64::NEG_INFINITY,
        }
    }

    fn support(&self, _params: &[f64]) -> Option<Vec<Value>> {
        Some(vec![Value::Bool(true), Value::Bool(false)])
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        let p = *params.first()?;
        match value.as_bool()? {
            true => Some(vec![1.0 / p]),
            false => Some(vec![-1.0 / (1.0 - p)]),
        }
    }

    fn constrain(&self, params: &mut [f64]) {
        if let Some(p) = params.first_mut() {
            clamp_probability(p);
        }
    }
}

/// Continuous uniform on `[a, b]`
#[derive(Clone, Copy, Debug, Default)]
pub struct Uniform;

impl Primitive for Uniform {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        expect_arity(self.name(), params, 2)?;
        let (a, b) = (params[0], params[1]);
        if !(a < b) || !a.is_finite() || !b.is_finite() {
            return Err(DistributionError::invalid(
                self.name(),
                format!("need finite a < b, got [{}, {}]", a, b),
            ));
        }
        Ok(Value::Real(rng.gen_range(a..b)))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        if !arity(params, 2) {
            return f64::NEG_INFINITY;
        }
        let (a, b) = (params[0], params[1]);
        match value.as_real() {
            Some(x) if x >= a && x <= b => -(b - a).ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        let (a, b) = (*params.first()?, *params.get(1)?);
        value.as_real()?;
        let width = b - a;
        Some(vec![1.0 / width, -1.0 / width])
    }

    fn constrain(&self, params: &mut [f64]) {
        if params.len() == 2 && !(params[1] > params[0]) {
            params[1] = params[0] + PARAM_EPSILON;
        }
    }
}

/// Normal distribution with mean `mu` and standard deviation `sigma`
#[derive(Clone, Copy, Debug, Default)]
pub struct Gaussian;

impl Primitive for Gaussian {
    fn name(&self) -> &'static str {
        "gaussian"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        expect_arity(self.name(), params, 2)?;
        let dist = Normal::new(params[0], params[1])
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        Ok(Value::Real(dist.sample(rng)))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        if !arity(params, 2) {
            return f64::NEG_INFINITY;
        }
        let (mu, sigma) = (params[0], params[1]);
        match value.as_real() {
            Some(x) => {
                let z = (x - mu) / sigma;
                -LN_SQRT_2PI - sigma.ln() - 0.5 * z * z
            }
            None => f64::NEG_INFINITY,
        }
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        let (mu, sigma) = (*params.first()?, *params.get(1)?);
        let x = value.as_real()?;
        let d = x - mu;
        let s2 = sigma * sigma;
        Some(vec![d / s2, -1.0 / sigma + d * d / (s2 * sigma)])
    }

    fn constrain(&self, params: &mut [f64]) {
        if let Some(sigma) = params.get_mut(1) {
            clamp_positive(sigma);
        }
    }
}

/// Beta distribution on `(0, 1)`
#[derive(Clone, Copy, Debug, Default)]
pub struct Beta;

impl Primitive for Beta {
    fn name(&self) -> &'static str {
        "beta"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        expect_arity(self.name(), params, 2)?;
        let dist = rand_distr::Beta::new(params[0], params[1])
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        Ok(Value::Real(dist.sample(rng)))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        if !arity(params, 2) {
            return f64::NEG_INFINITY;
        }
        let (a, b) = (params[0], params[1]);
        match value.as_real() {
            Some(x) if x > 0.0 && x < 1.0 => {
                let ln_beta = ln_gamma(a) + ln_gamma(b) - ln_gamma(a + b);
                (a - 1.0) * x.ln() + (b - 1.0) * (1.0 - x).ln() - ln_beta
            }
            _ => f64::NEG_INFINITY,
        }
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        let (a, b) = (*params.first()?, *params.get(1)?);
        let x = value.as_real()?;
        let common = digamma(a + b);
        Some(vec![
            x.ln() - digamma(a) + common,
            (1.0 - x).ln() - digamma(b) + common,
        ])
    }

    fn constrain(&self, params: &mut [f64]) {
        params.iter_mut().for_each(clamp_positive);
    }
}

/// Gamma distribution with shape and scale
#[derive(Clone, Copy, Debug, Default)]
pub struct Gamma;

impl Primitive for Gamma {
    fn name(&self) -> &'static str {
        "gamma"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        expect_arity(self.name(), params, 2)?;
        let dist = rand_distr::Gamma::new(params[0], params[1])
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        Ok(Value::Real(dist.sample(rng)))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        if !arity(params, 2) {
            return f64::NEG_INFINITY;
        }
        let (shape, scale) = (params[0], params[1]);
        match value.as_real() {
            Some(x) if x > 0.0 => {
                (shape - 1.0) * x.ln() - x / scale - ln_gamma(shape) - shape * scale.ln()
            }
            _ => f64::NEG_INFINITY,
        }
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        let (shape, scale) = (*params.first()?, *params.get(1)?);
        let x = value.as_real()?;
        Some(vec![
            x.ln() - scale.ln() - digamma(shape),
            x / (scale * scale) - shape / scale,
        ])
    }

    fn constrain(&self, params: &mut [f64]) {
        params.iter_mut().for_each(clamp_positive);
    }
}

/// Exponential distribution with rate `lambda`
#[derive(Clone, Copy, Debug, Default)]
pub struct Exponential;

impl Primitive for Exponential {
    fn name(&self) -> &'static str {
        "exponential"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        expect_arity(self.name(), params, 1)?;
        let dist = rand_distr::Exp::new(params[0])
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        Ok(Value::Real(dist.sample(rng)))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        if !arity(params, 1) {
            return f64::NEG_INFINITY;
        }
        let rate = params[0];
        match value.as_real() {
            Some(x) if x >= 0.0 => rate.ln() - rate * x,
            _ => f64::NEG_INFINITY,
        }
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        let rate = *params.first()?;
        let x = value.as_real()?;
        Some(vec![1.0 / rate - x])
    }

    fn constrain(&self, params: &mut [f64]) {
        params.iter_mut().for_each(clamp_positive);
    }
}

/// Binomial count of successes in `n` trials
#[derive(Clone, Copy, Debug, Default)]
pub struct Binomial;

impl Primitive for Binomial {
    fn name(&self) -> &'static str {
        "binomial"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        expect_arity(self.name(), params, 2)?;
        let n = count_param(self.name(), params[1])?;
        let dist = rand_distr::Binomial::new(n, params[0])
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        Ok(Value::Int(dist.sample(rng) as i64))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        if !arity(params, 2) {
            return f64::NEG_INFINITY;
        }
        let (p, n) = (params[0], params[1]);
        match value.as_int() {
            Some(k) if k >= 0 && (k as f64) <= n => {
                let k = k as f64;
                ln_choose(n, k) + k * p.ln() + (n - k) * (1.0 - p).ln()
            }
            _ => f64::NEG_INFINITY,
        }
    }

    fn support(&self, params: &[f64]) -> Option<Vec<Value>> {
        let n = count_param(self.name(), *params.get(1)?).ok()?;
        Some((0..=n as i64).map(Value::Int).collect())
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        let (p, n) = (*params.first()?, *params.get(1)?);
        let k = value.as_int()? as f64;
        Some(vec![k / p - (n - k) / (1.0 - p), 0.0])
    }

    fn constrain(&self, params: &mut [f64]) {
        if let Some(p) = params.first_mut() {
            clamp_probability(p);
        }
    }
}

/// Poisson count with mean `mu`
#[derive(Clone, Copy, Debug, Default)]
pub struct Poisson;

impl Primitive for Poisson {
    fn name(&self) -> &'static str {
        "poisson"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        expect_arity(self.name(), params, 1)?;
        let dist = rand_distr::Poisson::new(params[0])
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        let k: f64 = dist.sample(rng);
        Ok(Value::Int(k as i64))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        if !arity(params, 1) {
            return f64::NEG_INFINITY;
        }
        let mu = params[0];
        match value.as_int() {
            Some(k) if k >= 0 => {
                let k = k as f64;
                k * mu.ln() - mu - ln_gamma(k + 1.0)
            }
            _ => f64::NEG_INFINITY,
        }
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        let mu = *params.first()?;
        let k = value.as_int()? as f64;
        Some(vec![k / mu - 1.0])
    }

    fn constrain(&self, params: &mut [f64]) {
        params.iter_mut().for_each(clamp_positive);
    }
}

/// Categorical over indices `0..k` with unnormalized weights
#[derive(Clone, Copy, Debug, Default)]
pub struct Discrete;

impl Primitive for Discrete {
    fn name(&self) -> &'static str {
        "discrete"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        let dist = WeightedIndex::new(params)
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        Ok(Value::Int(dist.sample(rng) as i64))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        let total: f64 = params.iter().sum();
        match index_in(value, params.len()) {
            Some(i) => (params[i] / total).ln(),
            None => f64::NEG_INFINITY,
        }
    }

    fn support(&self, params: &[f64]) -> Option<Vec<Value>> {
        Some((0..params.len() as i64).map(Value::Int).collect())
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        let i = index_in(value, params.len())?;
        let total: f64 = params.iter().sum();
        Some(
            params
                .iter()
                .enumerate()
                .map(|(j, w)| (if j == i { 1.0 / w } else { 0.0 }) - 1.0 / total)
                .collect(),
        )
    }

    fn constrain(&self, params: &mut [f64]) {
        params.iter_mut().for_each(clamp_positive);
    }
}

/// Uniform integer in `0..n`
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomInteger;

impl Primitive for RandomInteger {
    fn name(&self) -> &'static str {
        "randomInteger"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        expect_arity(self.name(), params, 1)?;
        let n = count_param(self.name(), params[0])?;
        if n == 0 {
            return Err(DistributionError::invalid(self.name(), "n must be positive"));
        }
        Ok(Value::Int(rng.gen_range(0..n) as i64))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        if !arity(params, 1) {
            return f64::NEG_INFINITY;
        }
        let n = params[0];
        match value.as_int() {
            Some(i) if i >= 0 && (i as f64) < n => -n.ln(),
            _ => f64::NEG_INFINITY,
        }
    }

    fn support(&self, params: &[f64]) -> Option<Vec<Value>> {
        let n = count_param(self.name(), *params.first()?).ok()?;
        Some((0..n as i64).map(Value::Int).collect())
    }
}

/// Dirichlet over the probability simplex
#[derive(Clone, Copy, Debug, Default)]
pub struct Dirichlet;

impl Primitive for Dirichlet {
    fn name(&self) -> &'static str {
        "dirichlet"
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        let dist = rand_distr::Dirichlet::new(params)
            .map_err(|e| DistributionError::invalid(self.name(), e.to_string()))?;
        Ok(Value::Vector(dist.sample(rng)))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        match value.as_vector() {
            Some(xs) if xs.len() == params.len() && xs.iter().all(|&x| x > 0.0) => {
                let alpha_sum: f64 = params.iter().sum();
                let norm = ln_gamma(alpha_sum) - params.iter().map(|&a| ln_gamma(a)).sum::<f64>();
                norm + params
                    .iter()
                    .zip(xs)
                    .map(|(a, x)| (a - 1.0) * x.ln())
                    .sum::<f64>()
            }
            _ => f64::NEG_INFINITY,
        }
    }
}
