//! Lightweight single-site Metropolis–Hastings
//!
//! Each iteration picks one choice of the current trace uniformly, forces a
//! fresh draw there, and replays the program from that point reusing every
//! later choice whose address already appeared in the previous trace. The
//! proposal is accepted or rolled back at program exit.
//!
//! [`TraceKernel`] holds the proposal machinery so the particle rejuvenation
//! engine can run the same moves over a particle's trace.

use std::cell::RefCell;
use std::rc::Rc;

use rand::Rng;
use tracing::{debug, trace};

use crate::address::Address;
use crate::diagnostics::InferenceStats;
use crate::dispatch::handler::uniform_unit;
use crate::dispatch::{exit_cont, Choice, Cont, Handler, HandlerId, Program, Runtime, Step};
use crate::distributions::{Histogram, Primitive};
use crate::error::{InferResult, InferenceError};
use crate::trace::{ChoiceRecord, Trace};
use crate::value::{Store, Value};

/// MH acceptance probability of `trace` against the trace it replaced
///
/// `fw` is the log-probability of proposing the new trace: choosing the
/// regeneration site among `|old_trace|` plus every freshly drawn choice.
/// `bw` is the reverse move: choosing the site among `|trace|` plus every old
/// choice that the new trace dropped or redrew. The first execution (no
/// previous trace) is always accepted.
pub fn acceptance_probability(
    trace: &Trace,
    old_trace: Option<&Trace>,
    regen_from: usize,
    curr_score: f64,
    old_score: f64,
) -> f64 {
    let old_trace = match old_trace {
        Some(old) => old,
        None => return 1.0,
    };
    let fw = -(old_trace.len() as f64).ln()
        + trace
            .suffix(regen_from)
            .filter(|r| !r.reused)
            .map(|r| r.choice_score)
            .sum::<f64>();
    let bw = -(trace.len() as f64).ln()
        + old_trace
            .suffix(regen_from)
            .filter(|r| trace.find(r.address()).map_or(true, |nc| !nc.reused))
            .map(|r| r.choice_score)
            .sum::<f64>();
    let ratio = (curr_score - old_score + bw - fw).exp();
    if ratio.is_nan() {
        // Both states impossible: let the chain move
        1.0
    } else {
        ratio.min(1.0)
    }
}

/// Single-site proposal state shared by MH and rejuvenation
#[derive(Clone, Debug)]
pub struct TraceKernel {
    pub trace: Trace,
    pub old_trace: Option<Trace>,
    pub curr_score: f64,
    pub old_score: f64,
    pub regen_from: usize,
    /// Factors passed so far in the current execution
    pub factors: usize,
}

impl TraceKernel {
    pub fn new() -> Self {
        Self::from_trace(Trace::new(), 0.0)
    }

    /// Resume proposing over an existing trace and score
    pub fn from_trace(trace: Trace, score: f64) -> Self {
        Self {
            trace,
            old_trace: None,
            curr_score: score,
            old_score: f64::NEG_INFINITY,
            regen_from: 0,
            factors: 0,
        }
    }

    /// Make a choice, reusing the previous trace's value unless `force`
    pub fn sample_choice(
        &mut self,
        rt: &mut Runtime,
        store: Store,
        k: Cont,
        choice: Choice,
        force: bool,
    ) -> InferResult<Step> {
        let previous = if force {
            None
        } else {
            self.old_trace
                .as_ref()
                .and_then(|old| old.find(&choice.address))
                .map(|r| r.value.clone())
        };
        let reused = previous.is_some();
        let value = match previous {
            Some(value) => value,
            None => choice.dist.sample(&choice.params, rt.rng())?,
        };
        let choice_score = choice.score(&value);
        self.trace.push(ChoiceRecord {
            choice,
            value: value.clone(),
            choice_score,
            reused,
            k: k.clone(),
            score: self.curr_score,
            factors: self.factors,
            store: store.clone(),
        });
        self.curr_score += choice_score;
        Ok(Step::Resume { k, store, value })
    }

    /// Start a proposal: regenerate from a uniformly chosen choice
    ///
    /// Returns `None` when the trace has no choices to regenerate.
    pub fn propose(&mut self, rt: &mut Runtime) -> InferResult<Option<Step>> {
        if self.trace.is_empty() {
            return Ok(None);
        }
        self.regen_from = rt.rng().gen_range(0..self.trace.len());
        let regen = match self.trace.get(self.regen_from) {
            Some(record) => record.clone(),
            None => return Ok(None),
        };
        self.old_trace = Some(self.trace.clone());
        self.trace.truncate(self.regen_from);
        self.old_score = self.curr_score;
        self.curr_score = regen.score;
        self.factors = regen.factors;
        trace!(
            target: "ppl_runtime::inference::mh",
            regen_from = self.regen_from,
            address = %regen.address(),
            "Proposal"
        );
        self.sample_choice(
            rt,
            regen.store.clone(),
            regen.k.clone(),
            regen.choice.clone(),
            true,
        )
        .map(Some)
    }

    /// Acceptance probability of the proposal just completed
    pub fn acceptance(&self) -> f64 {
        acceptance_probability(
            &self.trace,
            self.old_trace.as_ref(),
            self.regen_from,
            self.curr_score,
            self.old_score,
        )
    }

    /// Draw the accept/reject decision and roll back on rejection
    pub fn accept_or_revert(&mut self, rt: &mut Runtime) -> bool {
        let acceptance = self.acceptance();
        let u = uniform_unit(rt);
        if u >= acceptance {
            self.revert();
            false
        } else {
            true
        }
    }

    /// Restore the pre-proposal trace and score
    pub fn revert(&mut self) {
        if let Some(old) = self.old_trace.take() {
            self.trace = old;
            self.curr_score = self.old_score;
        }
    }
}

impl Default for TraceKernel {
    fn default() -> Self {
        Self::new()
    }
}

struct MhState {
    kernel: TraceKernel,
    old_value: Option<Value>,
    remaining: usize,
    hist: Histogram,
    stats: InferenceStats,
}

/// Metropolis–Hastings engine
pub struct MetropolisHastings {
    store: Store,
    k: Cont,
    address: Address,
    program: Program,
    iterations: usize,
    state: RefCell<MhState>,
}

impl MetropolisHastings {
    pub fn new(store: Store, k: Cont, address: Address, program: Program, iterations: usize) -> Self {
        Self {
            store,
            k,
            address,
            program,
            iterations,
            state: RefCell::new(MhState {
                kernel: TraceKernel::new(),
                old_value: None,
                remaining: iterations,
                hist: Histogram::new(),
                stats: InferenceStats::new("MH"),
            }),
        }
    }

    fn finish(&self, rt: &mut Runtime) -> InferResult<Step> {
        let (hist, mut stats) = {
            let mut state = self.state.borrow_mut();
            (
                std::mem::take(&mut state.hist),
                std::mem::take(&mut state.stats),
            )
        };
        let marginal = hist.into_marginal()?;
        stats.executions = self.iterations;
        stats.support_size = marginal.len();
        debug!(
            target: "ppl_runtime::inference::mh",
            iterations = self.iterations,
            proposals = stats.proposals,
            accepted = stats.accepted,
            support = marginal.len(),
            "MH finished"
        );
        rt.record(stats);
        let k = self.k.clone();
        let store = self.store.clone();
        Ok(Step::Restore(Box::new(move |_rt| {
            Ok(Step::Resume {
                k,
                store,
                value: Value::Dist(Rc::new(marginal)),
            })
        })))
    }
}

impl Handler for MetropolisHastings {
    fn name(&self) -> &'static str {
        "MH"
    }

    fn start(&self, _rt: &mut Runtime, _id: HandlerId) -> InferResult<Step> {
        if self.iterations == 0 {
            return Err(InferenceError::Configuration(
                "MH needs at least one iteration".to_string(),
            ));
        }
        Ok((self.program)(self.store.clone(), exit_cont(), self.address.clone()))
    }

    fn sample(&self, rt: &mut Runtime, store: Store, k: Cont, choice: Choice) -> InferResult<Step> {
        self.state
            .borrow_mut()
            .kernel
            .sample_choice(rt, store, k, choice, false)
    }

    fn factor(
        &self,
        _rt: &mut Runtime,
        store: Store,
        k: Cont,
        _address: Address,
        score: f64,
    ) -> InferResult<Step> {
        let mut state = self.state.borrow_mut();
        state.kernel.curr_score += score;
        state.kernel.factors += 1;
        Ok(Step::Resume {
            k,
            store,
            value: Value::Unit,
        })
    }

    fn exit(&self, rt: &mut Runtime, _store: Store, value: Value) -> InferResult<Step> {
        let mut state = self.state.borrow_mut();
        let first = state.kernel.old_trace.is_none();
        let accepted = state.kernel.accept_or_revert(rt);
        if !first {
            state.stats.record_proposal(accepted);
        }
        let value = match (accepted, state.old_value.take()) {
            (false, Some(old)) => old,
            _ => value,
        };
        state.hist.add(value.clone(), 1.0);
        state.remaining -= 1;
        state.old_value = Some(value.clone());

        if state.remaining == 0 {
            drop(state);
            return self.finish(rt);
        }
        let proposal = state.kernel.propose(rt)?;
        match proposal {
            Some(step) => Ok(step),
            None => {
                // Nothing to regenerate: every remaining iteration repeats the value
                let remaining = std::mem::take(&mut state.remaining);
                state.hist.add(value, remaining as f64);
                drop(state);
                self.finish(rt)
            }
        }
    }
}

/// Install an MH engine over `program`
pub fn mh(store: Store, k: Cont, address: Address, program: Program, iterations: usize) -> Step {
    Step::Install(Rc::new(MetropolisHastings::new(
        store, k, address, program, iterations,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{cont, factor, program, sample};
    use crate::distributions::Dist;

    fn record(name: &str, score: f64, reused: bool) -> ChoiceRecord {
        ChoiceRecord {
            choice: Choice::new(Address::root().child(name), Dist::Bernoulli, vec![0.5]),
            value: Value::Bool(true),
            choice_score: score,
            reused,
            k: exit_cont(),
            score: 0.0,
            factors: 0,
            store: Store::new(),
        }
    }

    #[test]
    fn test_first_execution_accepts() {
        let trace = Trace::new();
        assert_eq!(acceptance_probability(&trace, None, 0, -3.0, f64::NEG_INFINITY), 1.0);
    }

    #[test]
    fn test_acceptance_symmetric_proposal() {
        // Same length, one redrawn choice with equal score on both sides
        let mut old = Trace::new();
        old.push(record("a", -0.7, false));
        old.push(record("b", -0.7, false));
        let mut new = Trace::new();
        new.push(record("a", -0.7, false));
        new.push(record("b", -0.7, true));
        let p = acceptance_probability(&new, Some(&old), 0, -1.4, -1.4);
        assert!((p - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_acceptance_is_clamped_and_nan_safe() {
        let mut old = Trace::new();
        old.push(record("a", -0.1, false));
        let mut new = Trace::new();
        new.push(record("a", -2.0, false));
        let p = acceptance_probability(&new, Some(&old), 0, -10.0, -0.1);
        assert!((0.0..=1.0).contains(&p));
        let p = acceptance_probability(&new, Some(&old), 0, f64::NEG_INFINITY, f64::NEG_INFINITY);
        assert_eq!(p, 1.0);
    }

    /// p ~ Beta(1, 1) discretized through a Bernoulli observation
    fn beta_bernoulli(observations: Vec<bool>) -> Program {
        let observations = Rc::new(observations);
        program(move |store, k, address| {
            let observations = observations.clone();
            let at = address.child("p");
            sample(
                store,
                cont(move |store, p| {
                    let theta = p.as_real().unwrap_or(0.5);
                    let score: f64 = observations
                        .iter()
                        .map(|&o| if o { theta.ln() } else { (1.0 - theta).ln() })
                        .sum();
                    let k = k.clone();
                    let heads = theta > 0.5;
                    factor(
                        store,
                        cont(move |store, _| k(store, Value::Bool(heads))),
                        address.child("obs"),
                        score,
                    )
                }),
                at,
                Dist::Beta,
                vec![1.0, 1.0],
            )
        })
    }

    #[test]
    fn test_mass_equals_iterations() {
        let mut rt = Runtime::seeded(4);
        let step = mh(Store::new(), exit_cont(), Address::root(), beta_bernoulli(vec![true]), 200);
        let (_, value) = rt.drive(step).unwrap();
        let m = value.as_dist().unwrap();
        assert_eq!(m.total_mass(), 200.0);
        let stats = &rt.diagnostics()[0];
        assert_eq!(stats.proposals, 199);
        assert!(stats.accepted <= stats.proposals);
        assert_eq!(rt.depth(), 0);
    }

    #[test]
    fn test_posterior_shifts_towards_data() {
        // Posterior Beta(9, 1): P(theta > 0.5) = 1 - 0.5^9
        let mut rt = Runtime::seeded(21);
        let step = mh(
            Store::new(),
            exit_cont(),
            Address::root(),
            beta_bernoulli(vec![true; 8]),
            4000,
        );
        let (_, value) = rt.drive(step).unwrap();
        let p = value.as_dist().unwrap().probability(&Value::Bool(true));
        assert!(p > 0.95, "P(theta > 0.5) = {}", p);
    }

    #[test]
    fn test_deterministic_program_fills_iterations() {
        let p = program(|store, k, _| k(store, Value::Int(5)));
        let mut rt = Runtime::seeded(0);
        let step = mh(Store::new(), exit_cont(), Address::root(), p, 10);
        let (_, value) = rt.drive(step).unwrap();
        let m = value.as_dist().unwrap();
        assert_eq!(m.probability(&Value::Int(5)), 1.0);
        assert_eq!(m.total_mass(), 10.0);
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let p = program(|store, k, _| k(store, Value::Unit));
        let mut rt = Runtime::seeded(0);
        let err = rt
            .drive(mh(Store::new(), exit_cont(), Address::root(), p, 0))
            .unwrap_err();
        assert!(matches!(err, InferenceError::Configuration(_)));
        assert_eq!(rt.depth(), 0);
    }
}
