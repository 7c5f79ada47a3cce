//! Capability interface shared by every distribution

use rand::Rng;

use crate::error::DistributionError;
use crate::value::Value;

/// Distribution parameters, always a flat real vector
///
/// The variational engine treats these as the optimization variables, so
/// every distribution exposes its parameters in this one shape.
pub type Params = Vec<f64>;

/// Elementary random primitive
///
/// `sample` and `score` are mandatory. `support` is required only by
/// enumeration, `grad` only by variational inference.
pub trait Primitive {
    /// Short lowercase name used in errors and logs
    fn name(&self) -> &'static str;

    /// Draw a value
    fn sample<R: Rng + ?Sized>(&self, params: &[f64], rng: &mut R)
        -> Result<Value, DistributionError>;

    /// Log-probability (density or mass) of `value`
    ///
    /// Returns `-inf` outside the support, for a value of the wrong shape, or
    /// when `params` has the wrong arity.
    fn score(&self, params: &[f64], value: &Value) -> f64;

    /// Finite support, when one exists
    fn support(&self, _params: &[f64]) -> Option<Vec<Value>> {
        None
    }

    /// Gradient of `score` with respect to `params`
    fn grad(&self, _params: &[f64], _value: &Value) -> Option<Vec<f64>> {
        None
    }

    /// Project parameters back into their valid domain after a gradient step
    fn constrain(&self, _params: &mut [f64]) {}
}
