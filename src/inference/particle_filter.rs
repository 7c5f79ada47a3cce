//! Sequential Monte Carlo
//!
//! Particles run one at a time. A `factor` is a synchronization point: the
//! particle's weight grows by the score, its continuation is parked, and the
//! next particle runs. Once the last particle reaches the barrier the
//! population is residually resampled and execution restarts at particle 0.
//! Random choices are drawn from the prior with no weight effect.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::address::Address;
use crate::diagnostics::InferenceStats;
use crate::dispatch::{cont, exit_cont, Choice, Cont, Handler, HandlerId, Program, Runtime, Step};
use crate::distributions::Primitive;
use crate::error::{InferResult, InferenceError};
use crate::population::{Barrier, Population};
use crate::value::{Store, Value};

/// Continuation that starts `program` from scratch, ignoring its input value
pub(crate) fn start_cont(program: &Program, address: &Address) -> Cont {
    let program = program.clone();
    let address = address.clone();
    cont(move |store, _| program(store, exit_cont(), address.clone()))
}

pub(crate) fn check_particles(num_particles: usize) -> InferResult<()> {
    if num_particles == 0 {
        return Err(InferenceError::Configuration(
            "particle count must be positive".to_string(),
        ));
    }
    Ok(())
}

struct FilterState {
    population: Population,
    stats: InferenceStats,
}

/// Particle filter engine
pub struct ParticleFilter {
    store: Store,
    k: Cont,
    num_particles: usize,
    state: RefCell<FilterState>,
}

impl ParticleFilter {
    pub fn new(store: Store, k: Cont, address: Address, program: Program, num_particles: usize) -> Self {
        let population = Population::filled(num_particles, &start_cont(&program, &address), &store);
        Self {
            store,
            k,
            num_particles,
            state: RefCell::new(FilterState {
                population,
                stats: InferenceStats::new("ParticleFilter"),
            }),
        }
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
            target: "ppl_runtime::inference::particle_filter",
            particles = self.num_particles,
            resampling_rounds = stats.resampling_rounds,
            min_ess = ?stats.min_ess,
            support = marginal.len(),
            "Particle filter finished"
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

impl Handler for ParticleFilter {
    fn name(&self) -> &'static str {
        "ParticleFilter"
    }

    fn start(&self, _rt: &mut Runtime, _id: HandlerId) -> InferResult<Step> {
        check_particles(self.num_particles)?;
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
        address: Address,
        score: f64,
    ) -> InferResult<Step> {
        let mut state = self.state.borrow_mut();
        {
            let particle = state.population.active_mut();
            particle.weight += score;
            particle.k = k;
            particle.store = store;
            particle.barrier = Some(address);
            particle.factors += 1;
        }
        if !state.population.arrive(Barrier::Factor)? {
            return Ok(state.population.advance());
        }
        let ess = state.population.resample(rt.rng())?;
        trace!(target: "ppl_runtime::inference::particle_filter", ess, "Resampled");
        state.stats.record_resampling(ess);
        Ok(state.population.rewind())
    }

    fn exit(&self, rt: &mut Runtime, _store: Store, value: Value) -> InferResult<Step> {
        let last = {
            let mut state = self.state.borrow_mut();
            state.population.active_mut().value = Some(value);
            state.population.arrive(Barrier::Exit)?
        };
        if last {
            self.finish(rt)
        } else {
            Ok(self.state.borrow_mut().population.advance())
        }
    }
}

/// Install a particle filter over `program`
pub fn particle_filter(
    store: Store,
    k: Cont,
    address: Address,
    program: Program,
    num_particles: usize,
) -> Step {
    Step::Install(Rc::new(ParticleFilter::new(
        store,
        k,
        address,
        program,
        num_particles,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{factor, program, sample};
    use crate::distributions::Dist;

    /// flip ~ Bernoulli(0.5); factor(ln 3) if heads
    fn biased_coin() -> Program {
        program(|store, k, address| {
            let at = address.child("flip");
            sample(
                store,
                cont(move |store, flip| {
                    let bias = if flip.as_bool() == Some(true) { 3f64.ln() } else { 0.0 };
                    let k = k.clone();
                    factor(
                        store,
                        cont(move |store, _| k(store, flip.clone())),
                        address.child("obs"),
                        bias,
                    )
                }),
                at,
                Dist::Bernoulli,
                vec![0.5],
            )
        })
    }

    fn run(p: Program, n: usize, seed: u64) -> (Rc<crate::distributions::Marginal>, Runtime) {
        let mut rt = Runtime::seeded(seed);
        let step = particle_filter(Store::new(), exit_cont(), Address::root(), p, n);
        let (_, value) = rt.drive(step).unwrap();
        (value.as_dist().unwrap().clone(), rt)
    }

    #[test]
    fn test_mass_equals_particle_count() {
        let (m, rt) = run(biased_coin(), 50, 1);
        assert_eq!(m.total_mass(), 50.0);
        assert_eq!(rt.diagnostics()[0].resampling_rounds, 1);
        assert_eq!(rt.depth(), 0);
    }

    #[test]
    fn test_approximates_posterior() {
        let (m, _) = run(biased_coin(), 2000, 7);
        let p = m.probability(&Value::Bool(true));
        assert!((p - 0.75).abs() < 0.05, "P(true) = {}", p);
    }

    #[test]
    fn test_same_seed_same_marginal() {
        let (a, _) = run(biased_coin(), 100, 3);
        let (b, _) = run(biased_coin(), 100, 3);
        assert_eq!(a, b);
    }

    #[test]
    fn test_unsynchronized_particles_rejected() {
        // Heads exits immediately, tails hits a factor first
        let p = program(|store, k, address| {
            let at = address.child("flip");
            sample(
                store,
                cont(move |store, flip| {
                    if flip.as_bool() == Some(true) {
                        k(store, flip)
                    } else {
                        let k = k.clone();
                        factor(store, cont(move |s, _| k(s, Value::Bool(false))), address.child("obs"), 0.0)
                    }
                }),
                at,
                Dist::Bernoulli,
                vec![0.5],
            )
        });
        let mut rt = Runtime::seeded(0);
        let step = particle_filter(Store::new(), exit_cont(), Address::root(), p, 64);
        let err = rt.drive(step).unwrap_err();
        assert!(matches!(err, InferenceError::UnsynchronizedParticles { .. }));
        assert_eq!(rt.depth(), 0);
    }

    #[test]
    fn test_zero_particles_rejected() {
        let mut rt = Runtime::seeded(0);
        let step = particle_filter(Store::new(), exit_cont(), Address::root(), biased_coin(), 0);
        assert!(matches!(rt.drive(step), Err(InferenceError::Configuration(_))));
    }
}
