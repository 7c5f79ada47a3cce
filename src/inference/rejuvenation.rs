//! Particle filter with MH rejuvenation
//!
//! Particles carry their trace and running score. After each resampling
//! round every particle is moved by `rejuv_steps` single-site MH proposals
//! run by a nested [`MhParticle`] engine. A proposal replays the particle
//! only as far as the factor it is parked at, counted by position rather than
//! address, and adopts the continuation and store captured there when
//! accepted. When every particle has exited, one
//! last unbounded rejuvenation pass runs before the marginal is built.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use super::mh::TraceKernel;
use super::particle_filter::{check_particles, start_cont};
use crate::address::Address;
use crate::diagnostics::InferenceStats;
use crate::dispatch::{Choice, Cont, Handler, HandlerId, Program, Runtime, Step};
use crate::distributions::Primitive;
use crate::error::{InferResult, InferenceError};
use crate::population::{Barrier, Particle, Population};
use crate::trace::ChoiceRecord;
use crate::value::{Store, Value};

/// Outcome of rejuvenating one particle
#[derive(Debug)]
pub struct Rejuvenated {
    pub particle: Particle,
    pub proposals: usize,
    pub accepted: usize,
}

type Rejoin = Box<dyn FnOnce(&mut Runtime, Rejuvenated) -> InferResult<Step>>;

/// Where a finished proposal left the particle
#[derive(Clone)]
struct Position {
    k: Cont,
    store: Store,
    value: Option<Value>,
}

struct MhParticleState {
    kernel: TraceKernel,
    current: Position,
    remaining: usize,
    proposals: usize,
    accepted: usize,
    rejoin: Option<Rejoin>,
}

/// Metropolis–Hastings over a single particle's trace
///
/// With a `limit`, a replay ends at the factor in the particle's barrier
/// position. The proposal is rejected when that factor has another address or
/// when the replay exits before reaching it.
pub struct MhParticle {
    original: Particle,
    limit: Option<Address>,
    state: RefCell<MhParticleState>,
}

impl MhParticle {
    pub fn new(
        particle: Particle,
        limit: Option<Address>,
        iterations: usize,
        rejoin: impl FnOnce(&mut Runtime, Rejuvenated) -> InferResult<Step> + 'static,
    ) -> Self {
        let mut kernel = TraceKernel::from_trace(particle.trace.clone(), particle.score);
        kernel.factors = particle.factors;
        let current = Position {
            k: particle.k.clone(),
            store: particle.store.clone(),
            value: particle.value.clone(),
        };
        Self {
            original: particle,
            limit,
            state: RefCell::new(MhParticleState {
                kernel,
                current,
                remaining: iterations,
                proposals: 0,
                accepted: 0,
                rejoin: Some(Box::new(rejoin)),
            }),
        }
    }

    /// Settle the proposal that just ended, then propose again or hand the
    /// particle back
    fn conclude(&self, rt: &mut Runtime, candidate: Option<Position>) -> InferResult<Step> {
        let mut state = self.state.borrow_mut();
        let accepted = match candidate {
            Some(candidate) => {
                let accepted = state.kernel.accept_or_revert(rt);
                if accepted {
                    state.current = candidate;
                }
                accepted
            }
            None => {
                state.kernel.revert();
                false
            }
        };
        state.proposals += 1;
        if accepted {
            state.accepted += 1;
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining > 0 {
            if let Some(step) = state.kernel.propose(rt)? {
                return Ok(step);
            }
        }
        drop(state);
        self.finish()
    }

    fn finish(&self) -> InferResult<Step> {
        let mut state = self.state.borrow_mut();
        let rejoin = state.rejoin.take().ok_or_else(|| {
            InferenceError::Configuration("particle rejuvenation finished twice".to_string())
        })?;
        let kernel = std::mem::take(&mut state.kernel);
        let Position { k, store, value } = state.current.clone();
        let outcome = Rejuvenated {
            particle: Particle {
                k,
                weight: self.original.weight,
                score: kernel.curr_score,
                value,
                trace: kernel.trace,
                store,
                barrier: self.original.barrier.clone(),
                factors: self.original.factors,
            },
            proposals: state.proposals,
            accepted: state.accepted,
        };
        Ok(Step::Restore(Box::new(move |rt| rejoin(rt, outcome))))
    }
}

impl Handler for MhParticle {
    fn name(&self) -> &'static str {
        "MHParticle"
    }

    fn start(&self, rt: &mut Runtime, _id: HandlerId) -> InferResult<Step> {
        let proposal = self.state.borrow_mut().kernel.propose(rt)?;
        match proposal {
            Some(step) => Ok(step),
            None => self.finish(),
        }
    }

    fn sample(&self, rt: &mut Runtime, store: Store, k: Cont, choice: Choice) -> InferResult<Step> {
        self.state
            .borrow_mut()
            .kernel
            .sample_choice(rt, store, k, choice, false)
    }

    fn factor(
        &self,
        rt: &mut Runtime,
        store: Store,
        k: Cont,
        address: Address,
        score: f64,
    ) -> InferResult<Step> {
        let passed = {
            let mut state = self.state.borrow_mut();
            state.kernel.curr_score += score;
            state.kernel.factors += 1;
            state.kernel.factors
        };
        if let Some(limit) = &self.limit {
            if passed >= self.original.factors {
                let candidate = (*limit == address).then_some(Position {
                    k,
                    store,
                    value: None,
                });
                return self.conclude(rt, candidate);
            }
        }
        Ok(Step::Resume {
            k,
            store,
            value: Value::Unit,
        })
    }

    fn exit(&self, rt: &mut Runtime, store: Store, value: Value) -> InferResult<Step> {
        if self.limit.is_some() {
            // Ran past the barrier the particle is parked at
            return self.conclude(rt, None);
        }
        let candidate = Position {
            k: self.original.k.clone(),
            store,
            value: Some(value),
        };
        self.conclude(rt, Some(candidate))
    }
}

struct RejuvState {
    id: HandlerId,
    population: Population,
    stats: InferenceStats,
}

struct Inner {
    store: Store,
    k: Cont,
    num_particles: usize,
    rejuv_steps: usize,
    state: RefCell<RejuvState>,
}

/// Particle filter engine that rejuvenates after every resampling
pub struct ParticleFilterRejuv {
    inner: Rc<Inner>,
}

impl ParticleFilterRejuv {
    pub fn new(
        store: Store,
        k: Cont,
        address: Address,
        program: Program,
        num_particles: usize,
        rejuv_steps: usize,
    ) -> Self {
        let population = Population::filled(num_particles, &start_cont(&program, &address), &store);
        Self {
            inner: Rc::new(Inner {
                store,
                k,
                num_particles,
                rejuv_steps,
                state: RefCell::new(RejuvState {
                    id: HandlerId::DEFAULT,
                    population,
                    stats: InferenceStats::new("ParticleFilterRejuv"),
                }),
            }),
        }
    }
}

impl Inner {
    /// Rejuvenate particles from `from` onwards, then continue the filter
    ///
    /// On the final pass proposals are unbounded and the engine finishes
    /// afterwards; otherwise each particle is bounded by its barrier and the
    /// population rewinds.
    fn rejuvenate(this: &Rc<Self>, rt: &mut Runtime, from: usize, last_pass: bool) -> InferResult<Step> {
        let mut state = this.state.borrow_mut();
        let len = state.population.len();
        let next = if this.rejuv_steps == 0 {
            None
        } else {
            (from..len).find(|&i| !state.population.particles()[i].trace.is_empty())
        };
        let i = match next {
            Some(i) => i,
            None => {
                if last_pass {
                    drop(state);
                    return this.finish(rt);
                }
                return Ok(state.population.rewind());
            }
        };

        let particle = state.population.particles()[i].clone();
        let limit = if last_pass {
            None
        } else {
            particle.barrier.clone()
        };
        let parent = state.id;
        trace!(
            target: "ppl_runtime::inference::rejuvenation",
            particle = i,
            limit = ?limit,
            "Rejuvenating"
        );
        let engine = this.clone();
        let handler = MhParticle::new(particle, limit, this.rejuv_steps, move |rt, done| {
            {
                let mut state = engine.state.borrow_mut();
                state.stats.proposals += done.proposals;
                state.stats.accepted += done.accepted;
                state.population.particles_mut()[i] = done.particle;
            }
            Inner::rejuvenate(&engine, rt, i + 1, last_pass)
        });
        Ok(Step::Nest {
            parent,
            handler: Rc::new(handler),
        })
    }

    fn finish(&self, rt: &mut Runtime) -> InferResult<Step> {
        let (hist, mut stats) = {
            let mut state = self.state.borrow_mut();
            (state.population.histogram(), std::mem::take(&mut state.stats))
        };
        let marginal = hist.into_marginal()?;
        stats.executions = self.num_particles;
        stats.support_size = marginal.len();
        debug!(
            target: "ppl_runtime::inference::rejuvenation",
            particles = self.num_particles,
            rejuv_steps = self.rejuv_steps,
            proposals = stats.proposals,
            accepted = stats.accepted,
            support = marginal.len(),
            "Particle filter with rejuvenation finished"
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

impl Handler for ParticleFilterRejuv {
    fn name(&self) -> &'static str {
        "ParticleFilterRejuv"
    }

    fn start(&self, _rt: &mut Runtime, id: HandlerId) -> InferResult<Step> {
        check_particles(self.inner.num_particles)?;
        let mut state = self.inner.state.borrow_mut();
        state.id = id;
        Ok(state.population.active().resume())
    }

    fn sample(&self, rt: &mut Runtime, store: Store, k: Cont, choice: Choice) -> InferResult<Step> {
        let value = choice.dist.sample(&choice.params, rt.rng())?;
        let choice_score = choice.score(&value);
        let mut state = self.inner.state.borrow_mut();
        let particle = state.population.active_mut();
        particle.trace.push(ChoiceRecord {
            choice,
            value: value.clone(),
            choice_score,
            reused: false,
            k: k.clone(),
            score: particle.score,
            factors: particle.factors,
            store: store.clone(),
        });
        particle.score += choice_score;
        Ok(Step::Resume { k, store, value })
    }

    fn factor(
        &self,
        rt: &mut Runtime,
        store: Store,
        k: Cont,
        address: Address,
        score: f64,
    ) -> InferResult<Step> {
        {
            let mut state = self.inner.state.borrow_mut();
            {
                let particle = state.population.active_mut();
                particle.weight += score;
                particle.score += score;
                particle.k = k;
                particle.store = store;
                particle.barrier = Some(address);
                particle.factors += 1;
            }
            if !state.population.arrive(Barrier::Factor)? {
                return Ok(state.population.advance());
            }
            let ess = state.population.resample(rt.rng())?;
            trace!(target: "ppl_runtime::inference::rejuvenation", ess, "Resampled");
            state.stats.record_resampling(ess);
        }
        Inner::rejuvenate(&self.inner, rt, 0, false)
    }

    fn exit(&self, rt: &mut Runtime, _store: Store, value: Value) -> InferResult<Step> {
        {
            let mut state = self.inner.state.borrow_mut();
            state.population.active_mut().value = Some(value);
            if !state.population.arrive(Barrier::Exit)? {
                return Ok(state.population.advance());
            }
        }
        Inner::rejuvenate(&self.inner, rt, 0, true)
    }
}

/// Install a rejuvenating particle filter over `program`
pub fn particle_filter_rejuv(
    store: Store,
    k: Cont,
    address: Address,
    program: Program,
    num_particles: usize,
    rejuv_steps: usize,
) -> Step {
    Step::Install(Rc::new(ParticleFilterRejuv::new(
        store,
        k,
        address,
        program,
        num_particles,
        rejuv_steps,
    )))
}
