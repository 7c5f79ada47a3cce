//! Dispatch core
//!
//! A transformed program never calls an inference engine directly. Each
//! effect it wants to perform (draw a random choice, add a score, finish) is
//! returned as a [`Step`], and the [`Runtime`] scheduler routes it to the
//! handler on top of its handler stack. Handlers answer with further steps,
//! so control is passed around by a single trampoline loop instead of nested
//! calls.
//!
//! A program for a fair coin conditioned towards heads:
//!
//! ```
//! use ppl_runtime::prelude::*;
//!
//! let coin = program(|store, k, address| {
//!     let at = address.child("flip");
//!     sample(store, cont(move |store, flip| {
//!         let heads = flip.as_bool() == Some(true);
//!         let bias = if heads { 3f64.ln() } else { 0.0 };
//!         let k = k.clone();
//!         factor(store, cont(move |store, _| k(store, flip.clone())), address.child("obs"), bias)
//!     }), at, Dist::Bernoulli, vec![0.5])
//! });
//!
//! let mut rt = Runtime::seeded(1);
//! let result = rt.infer(&Algorithm::enumerate(), &coin).unwrap();
//! let marginal = result.as_dist().unwrap();
//! assert!((marginal.probability(&Value::Bool(true)) - 0.75).abs() < 1e-12);
//! ```

pub mod handler;
pub mod runtime;

use std::fmt;
use std::rc::Rc;

use crate::address::Address;
use crate::distributions::{Dist, Params, Primitive};
use crate::error::InferResult;
use crate::value::{Store, Value};

pub use handler::{DefaultHandler, Handler, HandlerId};
pub use runtime::Runtime;

/// Continuation: receives the threaded store and a value
pub type Cont = Rc<dyn Fn(Store, Value) -> Step>;

/// Transformed program: `program(store, k, address)` eventually hands its
/// result to `k`
pub type Program = Rc<dyn Fn(Store, Cont, Address) -> Step>;

/// Extra scoring term attached to a choice by `sample_with_factor`
pub type ScoreFn = Rc<dyn Fn(&Value) -> f64>;

/// Deferred work run by the scheduler after popping a handler
pub type Resumption = Box<dyn FnOnce(&mut Runtime) -> InferResult<Step>>;

/// One random-choice request
#[derive(Clone, Debug)]
pub struct Choice {
    pub address: Address,
    pub dist: Dist,
    pub params: Params,
}

impl Choice {
    pub fn new(address: Address, dist: Dist, params: Params) -> Self {
        Self {
            address,
            dist,
            params,
        }
    }

    /// Log-score of `value` under this choice's distribution
    pub fn score(&self, value: &Value) -> f64 {
        self.dist.score(&self.params, value)
    }
}

/// Unit of work handed to the scheduler
pub enum Step {
    /// Call a continuation
    Resume { k: Cont, store: Store, value: Value },
    /// Random choice, routed to the active handler
    Sample { store: Store, k: Cont, choice: Choice },
    /// Random choice with an extra score term on the drawn value
    SampleWithFactor {
        store: Store,
        k: Cont,
        choice: Choice,
        score_fn: ScoreFn,
    },
    /// Score accumulation, routed to the active handler
    Factor {
        store: Store,
        k: Cont,
        address: Address,
        score: f64,
    },
    /// End of one execution path, routed to the active handler
    Exit { store: Store, value: Value },
    /// Push a handler and start it
    Install(Rc<dyn Handler>),
    /// Push a handler, asserting that `parent` is the active one
    Nest {
        parent: HandlerId,
        handler: Rc<dyn Handler>,
    },
    /// Pop the active handler, then run the resumption
    Restore(Resumption),
    /// The run is over
    Halt { store: Store, value: Value },
}

impl Step {
    /// Short name of the step kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resume { .. } => "resume",
            Self::Sample { .. } => "sample",
            Self::SampleWithFactor { .. } => "sample_with_factor",
            Self::Factor { .. } => "factor",
            Self::Exit { .. } => "exit",
            Self::Install(_) => "install",
            Self::Nest { .. } => "nest",
            Self::Restore(_) => "restore",
            Self::Halt { .. } => "halt",
        }
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sample { choice, .. } | Self::SampleWithFactor { choice, .. } => f
                .debug_struct(self.kind())
                .field("address", &choice.address)
                .field("dist", &choice.dist.name())
                .finish(),
            Self::Factor { address, score, .. } => f
                .debug_struct(self.kind())
                .field("address", address)
                .field("score", score)
                .finish(),
            Self::Exit { value, .. } | Self::Halt { value, .. } | Self::Resume { value, .. } => f
                .debug_struct(self.kind())
                .field("value", value)
                .finish(),
            Self::Install(h) => f.debug_tuple(self.kind()).field(&h.name()).finish(),
            Self::Nest { parent, handler } => f
                .debug_struct(self.kind())
                .field("parent", parent)
                .field("handler", &handler.name())
                .finish(),
            Self::Restore(_) => f.write_str(self.kind()),
        }
    }
}

/// Wrap a closure as a continuation
pub fn cont<F>(f: F) -> Cont
where
    F: Fn(Store, Value) -> Step + 'static,
{
    Rc::new(f)
}

/// Wrap a closure as a transformed program
pub fn program<F>(f: F) -> Program
where
    F: Fn(Store, Cont, Address) -> Step + 'static,
{
    Rc::new(f)
}

/// Continuation that ends the execution path through the active handler
pub fn exit_cont() -> Cont {
    cont(|store, value| Step::Exit { store, value })
}

/// Hand `value` to `k` through the scheduler rather than on the native stack
pub fn resume(k: Cont, store: Store, value: impl Into<Value>) -> Step {
    Step::Resume {
        k,
        store,
        value: value.into(),
    }
}

/// Request a random choice
pub fn sample(store: Store, k: Cont, address: Address, dist: Dist, params: Params) -> Step {
    Step::Sample {
        store,
        k,
        choice: Choice::new(address, dist, params),
    }
}

/// Request a random choice whose drawn value also contributes `score_fn(value)`
pub fn sample_with_factor<F>(
    store: Store,
    k: Cont,
    address: Address,
    dist: Dist,
    params: Params,
    score_fn: F,
) -> Step
where
    F: Fn(&Value) -> f64 + 'static,
{
    Step::SampleWithFactor {
        store,
        k,
        choice: Choice::new(address, dist, params),
        score_fn: Rc::new(score_fn),
    }
}

/// Add `score` to the current execution's log-weight
pub fn factor(store: Store, k: Cont, address: Address, score: f64) -> Step {
    Step::Factor {
        store,
        k,
        address,
        score,
    }
}

/// Condition on `value` having been drawn from `dist`
pub fn observe(
    store: Store,
    k: Cont,
    address: Address,
    dist: Dist,
    params: Params,
    value: &Value,
) -> Step {
    let score = dist.score(&params, value);
    factor(store, k, address, score)
}

/// End the current execution path with `value`
pub fn exit(store: Store, value: impl Into<Value>) -> Step {
    Step::Exit {
        store,
        value: value.into(),
    }
}

pub mod prelude {
    pub use super::handler::{Handler, HandlerId};
    pub use super::runtime::Runtime;
    pub use super::{
        cont, exit, exit_cont, factor, observe, program, resume, sample, sample_with_factor,
        Choice, Cont, Program, Step,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_cont_produces_exit() {
        let k = exit_cont();
        match k(Store::new(), Value::Int(3)) {
            Step::Exit { value, .. } => assert_eq!(value, Value::Int(3)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_observe_scores_value() {
        let step = observe(
            Store::new(),
            exit_cont(),
            Address::root().child("o"),
            Dist::Bernoulli,
            vec![0.2],
            &Value::Bool(true),
        );
        match step {
            Step::Factor { score, address, .. } => {
                assert!((score - 0.2f64.ln()).abs() < 1e-12);
                assert_eq!(address.as_str(), "/o");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_step_kind_names() {
        assert_eq!(exit(Store::new(), ()).kind(), "exit");
        assert_eq!(resume(exit_cont(), Store::new(), 1i64).kind(), "resume");
    }
}
