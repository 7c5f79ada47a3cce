//! Particle type

use std::fmt;

use crate::address::Address;
use crate::dispatch::{Cont, Step};
use crate::trace::Trace;
use crate::value::{Store, Value};

/// One weighted execution branch
#[derive(Clone)]
pub struct Particle {
    /// Where execution resumes
    pub k: Cont,
    /// Accumulated log-weight
    pub weight: f64,
    /// Accumulated log-score (choices and factors), used by rejuvenation
    pub score: f64,
    /// Return value, once the particle has exited
    pub value: Option<Value>,
    /// Random choices made so far
    pub trace: Trace,
    /// Store to resume with
    pub store: Store,
    /// Address of the factor this particle last stopped at
    pub barrier: Option<Address>,
    /// Number of factors passed, counting the one at `barrier`
    pub factors: usize,
}

impl Particle {
    /// A fresh particle at weight zero
    pub fn new(k: Cont, store: Store) -> Self {
        Self {
            k,
            weight: 0.0,
            score: 0.0,
            value: None,
            trace: Trace::new(),
            store,
            barrier: None,
            factors: 0,
        }
    }

    /// Step that continues this particle
    pub fn resume(&self) -> Step {
        Step::Resume {
            k: self.k.clone(),
            store: self.store.clone(),
            value: Value::Unit,
        }
    }

    /// Whether the particle has reached program exit
    pub fn has_exited(&self) -> bool {
        self.value.is_some()
    }
}

impl fmt::Debug for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("weight", &self.weight)
            .field("score", &self.score)
            .field("value", &self.value)
            .field("choices", &self.trace.len())
            .field("barrier", &self.barrier)
            .field("factors", &self.factors)
            .finish()
    }
}
