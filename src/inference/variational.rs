//! Mean-field variational inference
//!
//! Every choice site gets its own copy of the distribution's parameters,
//! initialized to the model's parameters on first visit. Each outer step
//! runs the program `estimate_samples` times drawing from the variational
//! parameters, estimates the ELBO gradient with the score-function
//! estimator, and takes one AdaGrad step per parameter.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::address::Address;
use crate::diagnostics::InferenceStats;
use crate::dispatch::{exit_cont, Choice, Cont, Handler, HandlerId, Program, Runtime, Step};
use crate::distributions::{Dist, Params, Primitive};
use crate::error::{InferResult, InferenceError};
use crate::value::{Store, Value};

/// Variational parameters and AdaGrad state of one choice site
#[derive(Clone, Debug)]
struct Site {
    dist: Dist,
    params: Params,
    /// Running sum of squared gradients
    g2: Vec<f64>,
    /// Gradient accumulated over the current batch
    grad: Vec<f64>,
}

impl Site {
    fn new(dist: Dist, params: Params) -> Self {
        let n = params.len();
        Self {
            dist,
            params,
            g2: vec![0.0; n],
            grad: vec![0.0; n],
        }
    }

    /// One AdaGrad step with the batch-average gradient
    fn step(&mut self, batch: usize) {
        for ((param, grad), g2) in self.params.iter_mut().zip(&mut self.grad).zip(&mut self.g2) {
            let g = *grad / batch as f64;
            *g2 += g * g;
            if *g2 > 0.0 {
                *param += g / g2.sqrt();
            }
            *grad = 0.0;
        }
        self.dist.constrain(&mut self.params);
    }
}

#[derive(Default)]
struct VariationalState {
    steps: usize,
    step: usize,
    drawn: usize,
    sites: HashMap<Address, Site>,
    sample_grad: HashMap<Address, Vec<f64>>,
    joint_score: f64,
    vari_score: f64,
    stats: InferenceStats,
}

/// Variational inference engine
pub struct Variational {
    store: Store,
    k: Cont,
    address: Address,
    program: Program,
    estimate_samples: usize,
    steps: Option<usize>,
    state: RefCell<VariationalState>,
}

impl Variational {
    /// `steps` falls back to the runtime's configured default when `None`
    pub fn new(
        store: Store,
        k: Cont,
        address: Address,
        program: Program,
        estimate_samples: usize,
        steps: Option<usize>,
    ) -> Self {
        Self {
            store,
            k,
            address,
            program,
            estimate_samples,
            steps,
            state: RefCell::new(VariationalState {
                stats: InferenceStats::new("Variational"),
                ..Default::default()
            }),
        }
    }

    /// Start one more execution for the current gradient estimate
    fn take_sample(&self) -> Step {
        {
            let mut state = self.state.borrow_mut();
            state.sample_grad.clear();
            state.joint_score = 0.0;
            state.vari_score = 0.0;
            state.drawn += 1;
        }
        (self.program)(self.store.clone(), exit_cont(), self.address.clone())
    }

    fn finish(&self, rt: &mut Runtime) -> InferResult<Step> {
        let (params, mut stats) = {
            let mut state = self.state.borrow_mut();
            let mut params: Vec<(String, Vec<f64>)> = state
                .sites
                .iter()
                .map(|(address, site)| (address.to_string(), site.params.clone()))
                .collect();
            params.sort_by(|a, b| a.0.cmp(&b.0));
            (params, std::mem::take(&mut state.stats))
        };
        let steps = self.state.borrow().steps;
        stats.executions = steps * self.estimate_samples;
        stats.support_size = params.len();
        debug!(
            target: "ppl_runtime::inference::variational",
            steps,
            estimate_samples = self.estimate_samples,
            params = ?params,
            "Variational inference finished"
        );
        let value = Value::List(
            params
                .iter()
                .map(|(address, p)| {
                    Value::List(vec![Value::Str(address.clone()), Value::Vector(p.clone())])
                })
                .collect(),
        );
        stats.variational_params = params;
        rt.record(stats);
        let k = self.k.clone();
        let store = self.store.clone();
        Ok(Step::Restore(Box::new(move |_rt| {
            Ok(Step::Resume { k, store, value })
        })))
    }
}

impl Handler for Variational {
    fn name(&self) -> &'static str {
        "Variational"
    }

    fn start(&self, rt: &mut Runtime, _id: HandlerId) -> InferResult<Step> {
        if self.estimate_samples == 0 {
            return Err(InferenceError::Configuration(
                "variational inference needs at least one estimate sample".to_string(),
            ));
        }
        let steps = self.steps.unwrap_or(rt.config().variational_steps);
        if steps == 0 {
            return Err(InferenceError::Configuration(
                "variational inference needs at least one step".to_string(),
            ));
        }
        self.state.borrow_mut().steps = steps;
        Ok(self.take_sample())
    }

    fn sample(&self, rt: &mut Runtime, store: Store, k: Cont, choice: Choice) -> InferResult<Step> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;
        let site = state
            .sites
            .entry(choice.address.clone())
            .or_insert_with(|| Site::new(choice.dist.clone(), choice.params.clone()));
        let value = site.dist.sample(&site.params, rt.rng())?;
        let grad = site
            .dist
            .grad(&site.params, &value)
            .ok_or_else(|| InferenceError::MissingGradient {
                distribution: site.dist.name(),
                address: choice.address.clone(),
            })?;
        state.vari_score += site.dist.score(&site.params, &value);
        state.joint_score += choice.score(&value);
        state.sample_grad.insert(choice.address, grad);
        Ok(Step::Resume { k, store, value })
    }

    fn factor(
        &self,
        _rt: &mut Runtime,
        store: Store,
        k: Cont,
        _address: Address,
        score: f64,
    ) -> InferResult<Step> {
        self.state.borrow_mut().joint_score += score;
        Ok(Step::Resume {
            k,
            store,
            value: Value::Unit,
        })
    }

    fn exit(&self, rt: &mut Runtime, _store: Store, _value: Value) -> InferResult<Step> {
        let mut state = self.state.borrow_mut();
        let state_ref = &mut *state;
        let weight = state_ref.joint_score - state_ref.vari_score;
        // An impossible execution carries no usable gradient signal
        if weight.is_finite() {
            for (address, grad) in &state_ref.sample_grad {
                if let Some(site) = state_ref.sites.get_mut(address) {
                    for (acc, g) in site.grad.iter_mut().zip(grad) {
                        *acc += g * weight;
                    }
                }
            }
        }

        if state.drawn < self.estimate_samples {
            drop(state);
            return Ok(self.take_sample());
        }

        let batch = state.drawn;
        for site in state.sites.values_mut() {
            site.step(batch);
        }
        state.step += 1;
        state.drawn = 0;
        trace!(
            target: "ppl_runtime::inference::variational",
            step = state.step,
            sites = state.sites.len(),
            "Gradient step"
        );
        if state.step < state.steps {
            drop(state);
            return Ok(self.take_sample());
        }
        drop(state);
        self.finish(rt)
    }
}

/// Install a variational inference engine over `program`
pub fn variational(
    store: Store,
    k: Cont,
    address: Address,
    program: Program,
    estimate_samples: usize,
    steps: Option<usize>,
) -> Step {
    Step::Install(Rc::new(Variational::new(
        store,
        k,
        address,
        program,
        estimate_samples,
        steps,
    )))
}
