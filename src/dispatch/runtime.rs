//! The scheduler
//!
//! `Runtime` owns the handler stack, the random number generator, and the
//! diagnostics of completed engine runs. `drive` is the trampoline: it pulls
//! one step at a time and hands it to the active handler until the default
//! handler halts.

use std::rc::Rc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace};

use super::handler::{DefaultHandler, Handler, HandlerId};
use super::{exit_cont, Program, Step};
use crate::address::Address;
use crate::config::RuntimeConfig;
use crate::diagnostics::InferenceStats;
use crate::error::{InferResult, InferenceError};
use crate::inference::Algorithm;
use crate::value::{Store, Value};

/// Single-threaded inference runtime
pub struct Runtime {
    config: RuntimeConfig,
    rng: StdRng,
    stack: Vec<(HandlerId, Rc<dyn Handler>)>,
    next_id: usize,
    stats: Vec<InferenceStats>,
}

impl Runtime {
    /// Create a runtime from a configuration
    pub fn new(config: RuntimeConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let default: Rc<dyn Handler> = Rc::new(DefaultHandler);
        Self {
            config,
            rng,
            stack: vec![(HandlerId::DEFAULT, default)],
            next_id: 1,
            stats: Vec::new(),
        }
    }

    /// Create a runtime with a fixed seed and default settings
    pub fn seeded(seed: u64) -> Self {
        Self::new(RuntimeConfig::default().seed(seed))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The runtime's random number generator
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Id of the handler currently receiving effects
    pub fn active_id(&self) -> HandlerId {
        self.stack.last().map_or(HandlerId::DEFAULT, |(id, _)| *id)
    }

    /// Number of inference handlers installed above the default one
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// Record the summary of a finished engine run
    pub fn record(&mut self, stats: InferenceStats) {
        self.stats.push(stats);
    }

    /// Summaries of every engine run so far, in completion order
    pub fn diagnostics(&self) -> &[InferenceStats] {
        &self.stats
    }

    /// Drain the recorded summaries
    pub fn take_diagnostics(&mut self) -> Vec<InferenceStats> {
        std::mem::take(&mut self.stats)
    }

    /// Run a program with an empty store and no inference
    pub fn run(&mut self, program: &Program) -> InferResult<Value> {
        self.run_with_store(program, Store::new()).map(|(_, value)| value)
    }

    /// Run a program from `store`, returning its final store and value
    pub fn run_with_store(&mut self, program: &Program, store: Store) -> InferResult<(Store, Value)> {
        let step = program(store, exit_cont(), Address::root());
        self.drive(step)
    }

    /// Run inference over `program` and return what the engine releases
    pub fn infer(&mut self, algorithm: &Algorithm, program: &Program) -> InferResult<Value> {
        algorithm.validate()?;
        let step = algorithm.invoke(Store::new(), exit_cont(), Address::root(), program.clone());
        self.drive(step).map(|(_, value)| value)
    }

    /// Trampoline `step` until the default handler halts
    ///
    /// On error the handler stack is unwound to the depth it had on entry.
    pub fn drive(&mut self, step: Step) -> InferResult<(Store, Value)> {
        let entry_depth = self.stack.len();
        let mut step = step;
        let outcome = loop {
            step = match step {
                Step::Halt { store, value } => break Ok((store, value)),
                other => match self.dispatch(other) {
                    Ok(next) => next,
                    Err(err) => break Err(err),
                },
            };
        };
        if outcome.is_err() && self.stack.len() > entry_depth {
            debug!(
                target: "ppl_runtime::dispatch",
                unwound = self.stack.len() - entry_depth,
                "Unwinding handler stack after error"
            );
            self.stack.truncate(entry_depth);
        }
        outcome
    }

    fn active(&self) -> Rc<dyn Handler> {
        match self.stack.last() {
            Some((_, handler)) => handler.clone(),
            None => Rc::new(DefaultHandler),
        }
    }

    fn install(&mut self, handler: Rc<dyn Handler>) -> InferResult<Step> {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        trace!(target: "ppl_runtime::dispatch", %id, handler = handler.name(), depth = self.stack.len(), "Install");
        self.stack.push((id, handler.clone()));
        handler.start(self, id)
    }

    fn dispatch(&mut self, step: Step) -> InferResult<Step> {
        match step {
            Step::Resume { k, store, value } => Ok(k(store, value)),
            Step::Sample { store, k, choice } => self.active().sample(self, store, k, choice),
            Step::SampleWithFactor {
                store,
                k,
                choice,
                score_fn,
            } => self
                .active()
                .sample_with_factor(self, store, k, choice, score_fn),
            Step::Factor {
                store,
                k,
                address,
                score,
            } => self.active().factor(self, store, k, address, score),
            Step::Exit { store, value } => self.active().exit(self, store, value),
            Step::Install(handler) => self.install(handler),
            Step::Nest { parent, handler } => {
                let active = self.active_id();
                if active != parent {
                    return Err(InferenceError::HandlerMismatch {
                        expected: parent.to_string(),
                        installed: format!("{} {}", active, self.active().name()),
                    });
                }
                self.install(handler)
            }
            Step::Restore(resumption) => {
                if self.stack.len() > 1 {
                    if let Some((id, handler)) = self.stack.pop() {
                        trace!(target: "ppl_runtime::dispatch", %id, handler = handler.name(), "Restore");
                    }
                }
                resumption(self)
            }
            Step::Halt { store, value } => Ok(Step::Halt { store, value }),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{cont, exit, factor, program, sample, Cont};
    use crate::distributions::Dist;

    fn counting_program() -> Program {
        program(|store, k: Cont, address: Address| {
            sample(
                store,
                cont(move |store, x| k(store.with("x", x.clone()), x)),
                address.child("x"),
                Dist::RandomInteger,
                vec![4.0],
            )
        })
    }

    #[test]
    fn test_run_without_inference_returns_value() {
        let p = program(|store, k, _| k(store, Value::Int(7)));
        let mut rt = Runtime::seeded(0);
        assert_eq!(rt.run(&p).unwrap(), Value::Int(7));
        assert_eq!(rt.depth(), 0);
    }

    #[test]
    fn test_default_handler_samples_and_threads_store() {
        let mut rt = Runtime::seeded(3);
        let (store, value) = rt.run_with_store(&counting_program(), Store::new()).unwrap();
        let x = value.as_int().unwrap();
        assert!((0..4).contains(&x));
        assert_eq!(store.get("x"), Some(&value));
    }

    #[test]
    fn test_factor_outside_inference_fails() {
        let p = program(|store, _k, address| {
            factor(store, cont(|s, _| exit(s, ())), address.child("obs"), -1.0)
        });
        let mut rt = Runtime::seeded(0);
        let err = rt.run(&p).unwrap_err();
        assert!(matches!(err, InferenceError::FactorOutsideInference { .. }));
        assert_eq!(rt.depth(), 0);
    }

    #[test]
    fn test_same_seed_same_run() {
        let p = counting_program();
        let a: Vec<_> = {
            let mut rt = Runtime::seeded(11);
            (0..10).map(|_| rt.run(&p).unwrap()).collect()
        };
        let b: Vec<_> = {
            let mut rt = Runtime::seeded(11);
            (0..10).map(|_| rt.run(&p).unwrap()).collect()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_nest_requires_matching_parent() {
        let mut rt = Runtime::seeded(0);
        let step = Step::Nest {
            parent: HandlerId(42),
            handler: Rc::new(DefaultHandler),
        };
        let err = rt.drive(step).unwrap_err();
        assert!(matches!(err, InferenceError::HandlerMismatch { .. }));
        assert_eq!(err.to_string(), "Handler mismatch: expected #42, installed #0 Default");
    }
}
