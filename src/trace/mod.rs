//! Execution traces
//!
//! A trace is the ordered list of random choices made by one execution.
//! Records are immutable and shared through `Rc`, so a superseded trace can
//! be kept alongside the live one at the cost of a vector of pointers.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::address::Address;
use crate::dispatch::{Choice, Cont};
use crate::value::{Store, Value};

/// One random choice together with everything needed to replay from it
#[derive(Clone)]
pub struct ChoiceRecord {
    /// Site, distribution and parameters of the choice
    pub choice: Choice,
    /// Value taken
    pub value: Value,
    /// Log-score of `value` under the choice's distribution
    pub choice_score: f64,
    /// Whether the value was copied from the previous trace
    pub reused: bool,
    /// Continuation that consumes the value
    pub k: Cont,
    /// Accumulated score before this choice
    pub score: f64,
    /// Factors passed before this choice
    pub factors: usize,
    /// Store at the choice point
    pub store: Store,
}

impl ChoiceRecord {
    pub fn address(&self) -> &Address {
        &self.choice.address
    }
}

impl fmt::Debug for ChoiceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChoiceRecord")
            .field("address", self.address())
            .field("value", &self.value)
            .field("choice_score", &self.choice_score)
            .field("reused", &self.reused)
            .field("score", &self.score)
            .field("factors", &self.factors)
            .finish()
    }
}

/// Ordered choice records with lookup by address
#[derive(Clone, Debug, Default)]
pub struct Trace {
    records: Vec<Rc<ChoiceRecord>>,
    index: HashMap<Address, usize>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; a repeated address shadows the earlier one
    pub fn push(&mut self, record: ChoiceRecord) {
        self.index
            .insert(record.address().clone(), self.records.len());
        self.records.push(Rc::new(record));
    }

    /// Record for `address`, if this trace made that choice
    pub fn find(&self, address: &Address) -> Option<&ChoiceRecord> {
        self.index.get(address).map(|&i| self.records[i].as_ref())
    }

    /// Record at position `i`
    pub fn get(&self, i: usize) -> Option<&Rc<ChoiceRecord>> {
        self.records.get(i)
    }

    /// Keep only the first `len` records
    pub fn truncate(&mut self, len: usize) {
        if len >= self.records.len() {
            return;
        }
        for record in self.records.drain(len..) {
            if self.index.get(record.address()).is_some_and(|&i| i >= len) {
                self.index.remove(record.address());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Rc<ChoiceRecord>] {
        &self.records
    }

    /// Records from position `from` onwards
    pub fn suffix(&self, from: usize) -> impl Iterator<Item = &ChoiceRecord> {
        self.records.iter().skip(from).map(|r| r.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::exit_cont;
    use crate::distributions::Dist;

    fn record(name: &str, value: bool) -> ChoiceRecord {
        ChoiceRecord {
            choice: Choice::new(Address::root().child(name), Dist::Bernoulli, vec![0.5]),
            value: Value::Bool(value),
            choice_score: 0.5f64.ln(),
            reused: false,
            k: exit_cont(),
            score: 0.0,
            factors: 0,
            store: Store::new(),
        }
    }

    #[test]
    fn test_find_by_address() {
        let mut trace = Trace::new();
        trace.push(record("a", true));
        trace.push(record("b", false));
        assert_eq!(trace.len(), 2);
        let b = trace.find(&Address::root().child("b")).unwrap();
        assert_eq!(b.value, Value::Bool(false));
        assert!(trace.find(&Address::root().child("c")).is_none());
    }

    #[test]
    fn test_truncate_drops_index_entries() {
        let mut trace = Trace::new();
        trace.push(record("a", true));
        trace.push(record("b", false));
        trace.push(record("c", true));
        let old = trace.clone();
        trace.truncate(1);
        assert_eq!(trace.len(), 1);
        assert!(trace.find(&Address::root().child("b")).is_none());
        assert!(trace.find(&Address::root().child("a")).is_some());
        // The superseded copy is untouched
        assert_eq!(old.len(), 3);
        assert!(old.find(&Address::root().child("c")).is_some());
    }

    #[test]
    fn test_suffix() {
        let mut trace = Trace::new();
        for name in ["a", "b", "c"] {
            trace.push(record(name, true));
        }
        let names: Vec<_> = trace.suffix(1).map(|r| r.address().as_str().to_string()).collect();
        assert_eq!(names, vec!["/b", "/c"]);
    }
}
