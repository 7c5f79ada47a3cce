//! Particle populations
//!
//! This module provides the [`Particle`] type, the [`Population`] container
//! driven round-robin by the SMC-family engines, and the resampling schemes
//! they share.

pub mod particle;
pub mod resampling;

use rand::Rng;

use crate::dispatch::{Cont, Step};
use crate::distributions::Histogram;
use crate::error::{InferResult, InferenceError};
use crate::value::{Store, Value};

pub use particle::Particle;
pub use resampling::{
    effective_sample_size, log_sum_exp, multinomial_resample, residual_resample, ResampleOutcome,
};

/// Kind of synchronization point a particle stopped at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    Factor,
    Exit,
}

impl Barrier {
    pub fn name(self) -> &'static str {
        match self {
            Self::Factor => "factor",
            Self::Exit => "exit",
        }
    }
}

/// What a population needs from its members
pub trait Member: Clone {
    /// Accumulated log-weight
    fn weight(&self) -> f64;

    fn set_weight(&mut self, weight: f64);

    /// Return value, once the member has exited
    fn value(&self) -> Option<&Value>;

    /// Step that continues this member
    fn resume(&self) -> Step;
}

impl Member for Particle {
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
        Particle::resume(self)
    }
}

/// Fixed-size population advanced one member at a time
#[derive(Clone, Debug)]
pub struct Population<P = Particle> {
    particles: Vec<P>,
    index: usize,
    round: Option<Barrier>,
}

impl Population<Particle> {
    /// `n` fresh particles all starting at `k` with a copy of `store`
    pub fn filled(n: usize, k: &Cont, store: &Store) -> Self {
        Self::new((0..n).map(|_| Particle::new(k.clone(), store.clone())).collect())
    }
}

impl<P: Member> Population<P> {
    /// Create a population
    ///
    /// Engines check for a positive particle count before starting, so the
    /// active member always exists once execution begins.
    pub fn new(particles: Vec<P>) -> Self {
        Self {
            particles,
            index: 0,
            round: None,
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    /// Position of the active member
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn particles(&self) -> &[P] {
        &self.particles
    }

    pub fn particles_mut(&mut self) -> &mut [P] {
        &mut self.particles
    }

    /// Replace every member, keeping the round state
    pub fn replace(&mut self, particles: Vec<P>) {
        self.particles = particles;
    }

    pub fn active(&self) -> &P {
        &self.particles[self.index]
    }

    pub fn active_mut(&mut self) -> &mut P {
        &mut self.particles[self.index]
    }

    /// Note that the active member reached `barrier`
    ///
    /// Returns `true` when it was the last member of the round. Fails if an
    /// earlier member in the same round stopped at a different kind of
    /// barrier.
    pub fn arrive(&mut self, barrier: Barrier) -> InferResult<bool> {
        match self.round {
            Some(expected) if expected != barrier => {
                return Err(InferenceError::UnsynchronizedParticles {
                    expected: expected.name(),
                    found: barrier.name(),
                })
            }
            _ => self.round = Some(barrier),
        }
        let last = self.index + 1 == self.particles.len();
        if last {
            self.round = None;
        }
        Ok(last)
    }

    /// Make the next member active
    pub fn step_forward(&mut self) {
        self.index += 1;
    }

    /// Make the first member active
    pub fn step_to_start(&mut self) {
        self.index = 0;
        self.round = None;
    }

    /// Move to the next member and continue it
    pub fn advance(&mut self) -> Step {
        self.step_forward();
        self.active().resume()
    }

    /// Go back to the first member and continue it
    pub fn rewind(&mut self) -> Step {
        self.step_to_start();
        self.active().resume()
    }

    /// Log-weights of every member
    pub fn weights(&self) -> Vec<f64> {
        self.particles.iter().map(|p| p.weight()).collect()
    }

    /// Residually resample, returning the effective sample size beforehand
    pub fn resample<R: Rng + ?Sized>(&mut self, rng: &mut R) -> InferResult<f64> {
        let weights = self.weights();
        let ess = effective_sample_size(&weights);
        let outcome = residual_resample(&weights, rng)?;
        self.particles = outcome
            .indices
            .iter()
            .map(|&i| {
                let mut particle = self.particles[i].clone();
                particle.set_weight(outcome.reset_weight);
                particle
            })
            .collect();
        Ok(ess)
    }

    /// Unweighted count of every exited member's value
    pub fn histogram(&self) -> Histogram {
        let mut hist = Histogram::new();
        self.add_to(&mut hist);
        hist
    }

    /// Add one unit of mass per exited member to `hist`
    pub fn add_to(&self, hist: &mut Histogram) {
        for value in self.particles.iter().filter_map(|p| p.value()) {
            hist.add(value.clone(), 1.0);
        }
    }
}

pub mod prelude {
    pub use super::particle::*;
    pub use super::resampling::*;
    pub use super::{Barrier, Member, Population};
}
