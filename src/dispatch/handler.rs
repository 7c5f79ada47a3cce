//! Handler trait and the default (no inference) handler

use std::fmt;

use rand::Rng;

use super::{cont, Choice, Cont, Runtime, ScoreFn, Step};
use crate::address::Address;
use crate::distributions::Primitive;
use crate::error::{InferResult, InferenceError};
use crate::value::{Store, Value};

/// Identity of one installed handler
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub(crate) usize);

impl HandlerId {
    /// Id of the default handler at the bottom of every stack
    pub const DEFAULT: HandlerId = HandlerId(0);
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An inference engine as seen by the scheduler
///
/// Every method returns the next step instead of running it, and receives
/// the runtime for randomness and diagnostics. Implementations keep their
/// mutable state behind a `RefCell`.
pub trait Handler {
    /// Engine name, used in logs and consistency errors
    fn name(&self) -> &'static str;

    /// Called once after the handler is pushed with its id
    fn start(&self, rt: &mut Runtime, id: HandlerId) -> InferResult<Step>;

    /// Handle a random choice
    fn sample(&self, rt: &mut Runtime, store: Store, k: Cont, choice: Choice) -> InferResult<Step>;

    /// Handle a random choice carrying an extra score term
    ///
    /// Defaults to a plain sample followed by a factor of `score_fn(value)`
    /// at `address/swf`.
    fn sample_with_factor(
        &self,
        rt: &mut Runtime,
        store: Store,
        k: Cont,
        choice: Choice,
        score_fn: ScoreFn,
    ) -> InferResult<Step> {
        let factor_address = choice.address.child("swf");
        let then = cont(move |store, value| {
            let score = score_fn(&value);
            let k = k.clone();
            Step::Factor {
                store,
                k: cont(move |store, _| k(store, value.clone())),
                address: factor_address.clone(),
                score,
            }
        });
        self.sample(rt, store, then, choice)
    }

    /// Handle a score accumulation
    fn factor(
        &self,
        rt: &mut Runtime,
        store: Store,
        k: Cont,
        address: Address,
        score: f64,
    ) -> InferResult<Step>;

    /// Handle the end of one execution path
    fn exit(&self, rt: &mut Runtime, store: Store, value: Value) -> InferResult<Step>;
}

/// Bottom of the handler stack: plain forward execution
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {
    fn name(&self) -> &'static str {
        "Default"
    }

    fn start(&self, _rt: &mut Runtime, id: HandlerId) -> InferResult<Step> {
        Err(InferenceError::HandlerMismatch {
            expected: HandlerId::DEFAULT.to_string(),
            installed: format!("{} Default", id),
        })
    }

    fn sample(&self, rt: &mut Runtime, store: Store, k: Cont, choice: Choice) -> InferResult<Step> {
        let value = choice.dist.sample(&choice.params, rt.rng())?;
        Ok(Step::Resume { k, store, value })
    }

    fn factor(
        &self,
        _rt: &mut Runtime,
        _store: Store,
        _k: Cont,
        address: Address,
        _score: f64,
    ) -> InferResult<Step> {
        Err(InferenceError::FactorOutsideInference { address })
    }

    fn exit(&self, _rt: &mut Runtime, store: Store, value: Value) -> InferResult<Step> {
        Ok(Step::Halt { store, value })
    }
}

/// Uniform draw in `[0, 1)` used for accept/reject decisions
pub(crate) fn uniform_unit(rt: &mut Runtime) -> f64 {
    rt.rng().gen::<f64>()
}
