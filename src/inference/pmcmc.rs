//! Particle MCMC (conditional SMC with a retained path)
//!
//! Every particle records its full path: the continuation, store and weight
//! increment at each factor it passed. Sweep 0 is an ordinary particle
//! filter. At the end of each sweep with more to come, one particle is chosen
//! uniformly as the retained path. The next sweep pins it in slot 0, where it
//! is never re-executed: at each barrier it presents the step it recorded
//! there, competes in the pool by its recorded increment, and always keeps
//! its slot. The other `M - 1` slots are drawn multinomially from the pool;
//! a draw that lands on the pinned path becomes an ordinary particle resuming
//! from the recorded step.
//!
//! The marginal counts every particle of every sweep after the first. A
//! single-sweep run counts sweep 0 instead, which makes it the plain particle
//! filter under the same seed.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use rand::Rng;
use tracing::{debug, trace};

use super::particle_filter::{check_particles, start_cont};
use crate::address::Address;
use crate::diagnostics::InferenceStats;
use crate::dispatch::{Choice, Cont, Handler, HandlerId, Program, Runtime, Step};
use crate::distributions::{Histogram, Primitive};
use crate::error::{InferResult, InferenceError};
use crate::population::{
    effective_sample_size, log_sum_exp, multinomial_resample, Barrier, Member, Population,
};
use crate::value::{Store, Value};

/// State of a path at one factor
#[derive(Clone)]
struct Snapshot {
    k: Cont,
    store: Store,
    increment: f64,
}

/// Particle that remembers every step of its path
#[derive(Clone)]
pub struct PathParticle {
    k: Cont,
    store: Store,
    weight: f64,
    increment: f64,
    value: Option<Value>,
    history: Vec<Snapshot>,
    pinned: bool,
    cursor: usize,
}

impl PathParticle {
    fn fresh(k: Cont, store: Store) -> Self {
        Self {
            k,
            store,
            weight: 0.0,
            increment: 0.0,
            value: None,
            history: Vec::new(),
            pinned: false,
            cursor: 0,
        }
    }

    /// Number of factors on the recorded path
    pub fn steps(&self) -> usize {
        self.history.len()
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Barrier a pinned path is parked at
    fn replay_barrier(&self) -> Barrier {
        if self.cursor < self.history.len() {
            Barrier::Factor
        } else {
            Barrier::Exit
        }
    }

    /// Weight increment at the current barrier
    fn current_increment(&self) -> f64 {
        if self.pinned {
            self.history
                .get(self.cursor)
                .map_or(f64::NEG_INFINITY, |s| s.increment)
        } else {
            self.increment
        }
    }

    /// Ordinary particle continuing a pinned path from its current step
    fn branch_off(&self) -> Self {
        let upto = (self.cursor + 1).min(self.history.len());
        let history = self.history[..upto].to_vec();
        match history.last() {
            Some(at) => Self {
                k: at.k.clone(),
                store: at.store.clone(),
                weight: self.weight,
                increment: at.increment,
                value: None,
                history: history.clone(),
                pinned: false,
                cursor: 0,
            },
            None => Self {
                pinned: false,
                cursor: 0,
                ..self.clone()
            },
        }
    }
}

impl Member for PathParticle {
    fn weight(&self) -> f64 {
        self.weight
    }

    fn set_weight(&mut self, weight: f64) {
        self.weight = weight;
    }

    fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    fn resume(&self) -> Step {
        Step::Resume {
            k: self.k.clone(),
            store: self.store.clone(),
            value: Value::Unit,
        }
    }
}

impl fmt::Debug for PathParticle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathParticle")
            .field("weight", &self.weight)
            .field("value", &self.value)
            .field("steps", &self.history.len())
            .field("pinned", &self.pinned)
            .field("cursor", &self.cursor)
            .finish()
    }
}

struct PmcmcState {
    population: Population<PathParticle>,
    sweep: usize,
    hist: Histogram,
    stats: InferenceStats,
}

/// Particle MCMC engine
pub struct Pmcmc {
    store: Store,
    k: Cont,
    start: Cont,
    num_particles: usize,
    num_sweeps: usize,
    state: RefCell<PmcmcState>,
}

impl Pmcmc {
    pub fn new(
        store: Store,
        k: Cont,
        address: Address,
        program: Program,
        num_particles: usize,
        num_sweeps: usize,
    ) -> Self {
        let start = start_cont(&program, &address);
        let population = Population::new(
            (0..num_particles)
                .map(|_| PathParticle::fresh(start.clone(), store.clone()))
                .collect(),
        );
        Self {
            store,
            k,
            start,
            num_particles,
            num_sweeps,
            state: RefCell::new(PmcmcState {
                population,
                sweep: 0,
                hist: Histogram::new(),
                stats: InferenceStats::new("PMCMC"),
            }),
        }
    }

    /// Handle the active particle reaching `barrier`, then run until a
    /// non-pinned particle needs executing
    fn arrive(&self, rt: &mut Runtime, state: &mut PmcmcState, barrier: Barrier) -> InferResult<Step> {
        let mut barrier = barrier;
        loop {
            if state.population.arrive(barrier)? {
                match barrier {
                    Barrier::Factor => self.resample(rt, state)?,
                    Barrier::Exit => {
                        if let Some(done) = self.end_sweep(rt, state)? {
                            return Ok(done);
                        }
                    }
                }
            } else {
                state.population.step_forward();
            }
            let active = state.population.active();
            if !active.pinned {
                return Ok(active.resume());
            }
            barrier = active.replay_barrier();
        }
    }

    fn resample(&self, rt: &mut Runtime, state: &mut PmcmcState) -> InferResult<()> {
        if state.sweep == 0 {
            let ess = state.population.resample(rt.rng())?;
            state.stats.record_resampling(ess);
            trace!(target: "ppl_runtime::inference::pmcmc", sweep = 0, ess, "Resampled");
        } else {
            let particles = state.population.particles();
            let increments: Vec<f64> = particles.iter().map(|p| p.current_increment()).collect();
            let ess = effective_sample_size(&increments);
            let reset_weight = log_sum_exp(&increments) - (particles.len() as f64).ln();
            let draws = multinomial_resample(&increments, particles.len() - 1, rt.rng())?;

            let mut retained = particles[0].clone();
            let mut next = Vec::with_capacity(particles.len());
            for &i in &draws {
                let source = &particles[i];
                next.push(if source.pinned {
                    source.branch_off()
                } else {
                    source.clone()
                });
            }
            retained.cursor += 1;
            next.insert(0, retained);
            for p in next.iter_mut() {
                p.weight = reset_weight;
            }
            state.population.replace(next);
            state.stats.record_resampling(ess);
            trace!(
                target: "ppl_runtime::inference::pmcmc",
                sweep = state.sweep,
                ess,
                "Conditionally resampled"
            );
        }
        state.population.step_to_start();
        Ok(())
    }

    /// Close the current sweep; returns the final step once every sweep ran
    fn end_sweep(&self, rt: &mut Runtime, state: &mut PmcmcState) -> InferResult<Option<Step>> {
        if state.sweep > 0 || self.num_sweeps == 1 {
            let PmcmcState {
                population, hist, ..
            } = state;
            population.add_to(hist);
        }
        debug!(
            target: "ppl_runtime::inference::pmcmc",
            sweep = state.sweep,
            counted = state.sweep > 0 || self.num_sweeps == 1,
            "Sweep finished"
        );
        state.sweep += 1;
        if state.sweep == self.num_sweeps {
            return self.finish(rt, state).map(Some);
        }

        let m = state.population.len();
        let chosen = rt.rng().gen_range(0..m);
        let mut retained = state.population.particles()[chosen].clone();
        retained.pinned = true;
        retained.cursor = 0;
        let mut particles = Vec::with_capacity(m);
        particles.push(retained);
        particles.extend((1..m).map(|_| PathParticle::fresh(self.start.clone(), self.store.clone())));
        state.population = Population::new(particles);
        Ok(None)
    }

    fn finish(&self, rt: &mut Runtime, state: &mut PmcmcState) -> InferResult<Step> {
        let marginal = std::mem::take(&mut state.hist).into_marginal()?;
        let mut stats = std::mem::take(&mut state.stats);
        stats.executions = self.num_particles * self.num_sweeps;
        stats.support_size = marginal.len();
        debug!(
            target: "ppl_runtime::inference::pmcmc",
            particles = self.num_particles,
            sweeps = self.num_sweeps,
            support = marginal.len(),
            "PMCMC finished"
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

impl Handler for Pmcmc {
    fn name(&self) -> &'static str {
        "PMCMC"
    }

    fn start(&self, _rt: &mut Runtime, _id: HandlerId) -> InferResult<Step> {
        check_particles(self.num_particles)?;
        if self.num_sweeps == 0 {
            return Err(InferenceError::Configuration(
                "PMCMC needs at least one sweep".to_string(),
            ));
        }
        Ok(self.state.borrow().population.active().resume())
    }

    fn sample(&self, rt: &mut Runtime, store: Store, k: Cont, choice: Choice) -> InferResult<Step> {
        let value = choice.dist.sample(&choice.params, rt.rng())?;
        Ok(Step::Resume { k, store, value })
    }

    fn factor(
        &self,
        rt: &mut Runtime,
        store: Store,
        k: Cont,
        _address: Address,
        score: f64,
    ) -> InferResult<Step> {
        let mut state = self.state.borrow_mut();
        {
            let particle = state.population.active_mut();
            particle.history.push(Snapshot {
                k: k.clone(),
                store: store.clone(),
                increment: score,
            });
            particle.k = k;
            particle.store = store;
            particle.weight += score;
            particle.increment = score;
        }
        self.arrive(rt, &mut state, Barrier::Factor)
    }

    fn exit(&self, rt: &mut Runtime, _store: Store, value: Value) -> InferResult<Step> {
        let mut state = self.state.borrow_mut();
        state.population.active_mut().value = Some(value);
        self.arrive(rt, &mut state, Barrier::Exit)
    }
}

/// Install a PMCMC engine over `program`
pub fn pmcmc(
    store: Store,
    k: Cont,
    address: Address,
    program: Program,
    num_particles: usize,
    num_sweeps: usize,
) -> Step {
    Step::Install(Rc::new(Pmcmc::new(
        store,
        k,
        address,
        program,
        num_particles,
        num_sweeps,
    )))
}
