//! Distribution library
//!
//! Every distribution implements [`Primitive`]. Programs name a distribution
//! through the closed [`Dist`] enum, which carries marginals returned by
//! nested inference as a variant so they can be sampled like any other.

pub mod marginal;
pub mod primitives;
pub mod traits;

use std::fmt;
use std::rc::Rc;

use rand::Rng;

use crate::error::DistributionError;
use crate::value::Value;

pub use marginal::{Histogram, Marginal};
pub use primitives::{
    Bernoulli, Beta, Binomial, Dirichlet, Discrete, Exponential, Gamma, Gaussian, Poisson,
    RandomInteger, Uniform, PARAM_EPSILON,
};
pub use traits::{Params, Primitive};

/// Distribution descriptor passed to `sample`
#[derive(Clone, Debug, PartialEq)]
pub enum Dist {
    Bernoulli,
    Uniform,
    Gaussian,
    Beta,
    Gamma,
    Exponential,
    Binomial,
    Poisson,
    Discrete,
    RandomInteger,
    Dirichlet,
    /// Marginal produced by an inner inference run
    Marginal(Rc<Marginal>),
}

macro_rules! dispatch {
    ($self:expr, $prim:ident => $body:expr) => {
        match $self {
            Dist::Bernoulli => {
                let $prim = &Bernoulli;
                $body
            }
            Dist::Uniform => {
                let $prim = &Uniform;
                $body
            }
            Dist::Gaussian => {
                let $prim = &Gaussian;
                $body
            }
            Dist::Beta => {
                let $prim = &Beta;
                $body
            }
            Dist::Gamma => {
                let $prim = &Gamma;
                $body
            }
            Dist::Exponential => {
                let $prim = &Exponential;
                $body
            }
            Dist::Binomial => {
                let $prim = &Binomial;
                $body
            }
            Dist::Poisson => {
                let $prim = &Poisson;
                $body
            }
            Dist::Discrete => {
                let $prim = &Discrete;
                $body
            }
            Dist::RandomInteger => {
                let $prim = &RandomInteger;
                $body
            }
            Dist::Dirichlet => {
                let $prim = &Dirichlet;
                $body
            }
            Dist::Marginal(m) => {
                let $prim = m.as_ref();
                $body
            }
        }
    };
}

impl Dist {
    /// Wrap a marginal so it can be sampled from
    pub fn marginal(m: Rc<Marginal>) -> Self {
        Self::Marginal(m)
    }
}

impl Primitive for Dist {
    fn name(&self) -> &'static str {
        dispatch!(self, p => p.name())
    }

    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R) -> Result<Value, DistributionError> {
        dispatch!(self, p => p.sample(params, rng))
    }

    fn score(&self, params: &[f64], value: &Value) -> f64 {
        dispatch!(self, p => p.score(params, value))
    }

    fn support(&self, params: &[f64]) -> Option<Vec<Value>> {
        dispatch!(self, p => p.support(params))
    }

    fn grad(&self, params: &[f64], value: &Value) -> Option<Vec<f64>> {
        dispatch!(self, p => p.grad(params, value))
    }

    fn constrain(&self, params: &mut [f64]) {
        dispatch!(self, p => p.constrain(params))
    }
}

impl fmt::Display for Dist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Marginal> for Dist {
    fn from(m: Marginal) -> Self {
        Self::Marginal(Rc::new(m))
    }
}

/// Commonly used distribution items
pub mod prelude {
    pub use super::marginal::{Histogram, Marginal};
    pub use super::traits::{Params, Primitive};
    pub use super::Dist;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_forwards_to_primitive() {
        assert_eq!(Dist::Gaussian.name(), "gaussian");
        assert_eq!(
            Dist::Bernoulli.score(&[0.5], &Value::Bool(true)),
            Bernoulli.score(&[0.5], &Value::Bool(true))
        );
        assert!(Dist::Gaussian.support(&[0.0, 1.0]).is_none());
        assert!(Dist::RandomInteger.grad(&[3.0], &Value::Int(1)).is_none());
    }

    #[test]
    fn test_marginal_variant() {
        let m = Marginal::from_weighted(vec![(Value::Int(4), 1.0)]).unwrap();
        let d = Dist::from(m);
        assert_eq!(d.name(), "marginal");
        assert_eq!(d.support(&[]), Some(vec![Value::Int(4)]));
        assert_eq!(d.score(&[], &Value::Int(4)), 0.0);
    }
}
