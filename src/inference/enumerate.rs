//! Exhaustive enumeration
//!
//! Every random choice forks one pending state per support value. Completed
//! paths contribute `exp(score)` to the bucket of their return value, so for
//! an uncapped run over finite-support choices the marginal is exact. The
//! frontier ordering only changes the visiting order, never the result.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::Address;
use crate::diagnostics::InferenceStats;
use crate::dispatch::{exit_cont, Choice, Cont, Handler, HandlerId, Program, Runtime, ScoreFn, Step};
use crate::distributions::{Histogram, Primitive};
use crate::error::{InferResult, InferenceError};
use crate::value::{Store, Value};

/// Order in which pending states are explored
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Highest score first, ties in insertion order
    #[default]
    LikelyFirst,
    /// First in, first out
    BreadthFirst,
    /// Last in, first out
    DepthFirst,
}

struct Pending {
    k: Cont,
    value: Value,
    score: f64,
    store: Store,
}

struct Ranked {
    pending: Pending,
    seq: u64,
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pending
            .score
            .total_cmp(&other.pending.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Frontier {
    Likely { heap: BinaryHeap<Ranked>, seq: u64 },
    Breadth(VecDeque<Pending>),
    Depth(Vec<Pending>),
}

impl Frontier {
    fn new(strategy: SearchStrategy) -> Self {
        match strategy {
            SearchStrategy::LikelyFirst => Self::Likely {
                heap: BinaryHeap::new(),
                seq: 0,
            },
            SearchStrategy::BreadthFirst => Self::Breadth(VecDeque::new()),
            SearchStrategy::DepthFirst => Self::Depth(Vec::new()),
        }
    }

    fn push(&mut self, pending: Pending) {
        match self {
            Self::Likely { heap, seq } => {
                heap.push(Ranked { pending, seq: *seq });
                *seq += 1;
            }
            Self::Breadth(queue) => queue.push_back(pending),
            Self::Depth(stack) => stack.push(pending),
        }
    }

    fn pop(&mut self) -> Option<Pending> {
        match self {
            Self::Likely { heap, .. } => heap.pop().map(|r| r.pending),
            Self::Breadth(queue) => queue.pop_front(),
            Self::Depth(stack) => stack.pop(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Likely { heap, .. } => heap.is_empty(),
            Self::Breadth(queue) => queue.is_empty(),
            Self::Depth(stack) => stack.is_empty(),
        }
    }
}

struct EnumerateState {
    frontier: Frontier,
    hist: Histogram,
    score: f64,
    executions: usize,
}

/// Enumeration engine
pub struct Enumerate {
    store: Store,
    k: Cont,
    address: Address,
    program: Program,
    max_executions: Option<usize>,
    strategy: SearchStrategy,
    state: RefCell<EnumerateState>,
}

impl Enumerate {
    pub fn new(
        store: Store,
        k: Cont,
        address: Address,
        program: Program,
        max_executions: Option<usize>,
        strategy: SearchStrategy,
    ) -> Self {
        Self {
            store,
            k,
            address,
            program,
            max_executions,
            strategy,
            state: RefCell::new(EnumerateState {
                frontier: Frontier::new(strategy),
                hist: Histogram::new(),
                score: 0.0,
                executions: 0,
            }),
        }
    }

    fn branch(
        &self,
        rt: &mut Runtime,
        store: Store,
        k: Cont,
        choice: Choice,
        extra: Option<ScoreFn>,
    ) -> InferResult<Step> {
        let support = choice
            .dist
            .support(&choice.params)
            .ok_or_else(|| InferenceError::MissingSupport {
                algorithm: "Enumerate",
                distribution: choice.dist.name(),
                address: choice.address.clone(),
            })?;
        {
            let mut state = self.state.borrow_mut();
            let base = state.score;
            for value in support {
                let mut score = base + choice.score(&value);
                if let Some(extra) = &extra {
                    score += extra(&value);
                }
                // Impossible branches carry no mass
                if score == f64::NEG_INFINITY {
                    continue;
                }
                state.frontier.push(Pending {
                    k: k.clone(),
                    value,
                    score,
                    store: store.clone(),
                });
            }
        }
        self.next(rt)
    }

    fn next(&self, rt: &mut Runtime) -> InferResult<Step> {
        let pending = self.state.borrow_mut().frontier.pop();
        match pending {
            Some(p) => {
                self.state.borrow_mut().score = p.score;
                Ok(Step::Resume {
                    k: p.k,
                    store: p.store,
                    value: p.value,
                })
            }
            None => self.finish(rt),
        }
    }

    fn finish(&self, rt: &mut Runtime) -> InferResult<Step> {
        let (hist, executions) = {
            let mut state = self.state.borrow_mut();
            (std::mem::take(&mut state.hist), state.executions)
        };
        let marginal = hist.into_marginal()?;
        debug!(
            target: "ppl_runtime::inference::enumerate",
            executions,
            support = marginal.len(),
            mass = marginal.total_mass(),
            strategy = ?self.strategy,
            "Enumeration finished"
        );
        rt.record(
            InferenceStats::new(self.name())
                .with_executions(executions)
                .with_support_size(marginal.len()),
        );
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

impl Handler for Enumerate {
    fn name(&self) -> &'static str {
        "Enumerate"
    }

    fn start(&self, _rt: &mut Runtime, _id: HandlerId) -> InferResult<Step> {
        if self.max_executions == Some(0) {
            return Err(InferenceError::Configuration(
                "max_executions must be positive".to_string(),
            ));
        }
        Ok((self.program)(self.store.clone(), exit_cont(), self.address.clone()))
    }

    fn sample(&self, rt: &mut Runtime, store: Store, k: Cont, choice: Choice) -> InferResult<Step> {
        self.branch(rt, store, k, choice, None)
    }

    fn sample_with_factor(
        &self,
        rt: &mut Runtime,
        store: Store,
        k: Cont,
        choice: Choice,
        score_fn: ScoreFn,
    ) -> InferResult<Step> {
        self.branch(rt, store, k, choice, Some(score_fn))
    }

    fn factor(
        &self,
        rt: &mut Runtime,
        store: Store,
        k: Cont,
        _address: Address,
        score: f64,
    ) -> InferResult<Step> {
        let dead = {
            let mut state = self.state.borrow_mut();
            state.score += score;
            state.score == f64::NEG_INFINITY
        };
        if dead {
            return self.next(rt);
        }
        Ok(Step::Resume {
            k,
            store,
            value: Value::Unit,
        })
    }

    fn exit(&self, rt: &mut Runtime, _store: Store, value: Value) -> InferResult<Step> {
        let done = {
            let mut state = self.state.borrow_mut();
            let mass = state.score.exp();
            state.hist.add(value, mass);
            state.executions += 1;
            state.frontier.is_empty() || self.max_executions.is_some_and(|cap| state.executions >= cap)
        };
        if done {
            self.finish(rt)
        } else {
            self.next(rt)
        }
    }
}

/// Install an enumeration engine over `program`
pub fn enumerate(
    store: Store,
    k: Cont,
    address: Address,
    program: Program,
    max_executions: Option<usize>,
    strategy: SearchStrategy,
) -> Step {
    Step::Install(Rc::new(Enumerate::new(
        store,
        k,
        address,
        program,
        max_executions,
        strategy,
    )))
}
