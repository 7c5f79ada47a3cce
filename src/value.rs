//! Program values and the threaded store
//!
//! `Value` is the closed set of shapes a transformed program can pass to a
//! continuation or return. Equality and hashing are structural so values key
//! marginal histograms directly.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::distributions::marginal::Marginal;

/// A dynamically shaped program value
#[derive(Clone, Debug)]
pub enum Value {
    /// No value (result of `factor`, statements)
    Unit,
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
    /// Real number
    Real(f64),
    /// String
    Str(String),
    /// Real vector (e.g. a Dirichlet draw)
    Vector(Vec<f64>),
    /// Heterogeneous list
    List(Vec<Value>),
    /// A marginal distribution produced by inference
    Dist(Rc<Marginal>),
}

/// Bit pattern used for real equality and hashing: `-0.0` folds onto `0.0`
/// and every NaN onto one canonical NaN.
pub(crate) fn canonical_bits(x: f64) -> u64 {
    if x == 0.0 {
        0
    } else if x.is_nan() {
        f64::NAN.to_bits()
    } else {
        x.to_bits()
    }
}

impl Value {
    /// Name of the value's shape
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Real(_) => "real",
            Self::Str(_) => "string",
            Self::Vector(_) => "vector",
            Self::List(_) => "list",
            Self::Dist(_) => "distribution",
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Self::Unit)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric view: reals, and integers widened to `f64`
    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(x) => Some(*x),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Self::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_dist(&self) -> Option<&Rc<Marginal>> {
        match self {
            Self::Dist(m) => Some(m),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unit, Self::Unit) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Real(a), Self::Real(b)) => canonical_bits(*a) == canonical_bits(*b),
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Vector(a), Self::Vector(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|(x, y)| canonical_bits(*x) == canonical_bits(*y))
            }
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Dist(a), Self::Dist(b)) => Rc::ptr_eq(a, b) || **a == **b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Unit => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Real(x) => canonical_bits(*x).hash(state),
            Self::Str(s) => s.hash(state),
            Self::Vector(v) => {
                v.len().hash(state);
                for x in v {
                    canonical_bits(*x).hash(state);
                }
            }
            Self::List(items) => items.hash(state),
            Self::Dist(m) => m.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => f.write_str("()"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Real(x) => write!(f, "{}", x),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Vector(v) => {
                f.write_str("[")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", x)?;
                }
                f.write_str("]")
            }
            Self::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str(")")
            }
            Self::Dist(m) => write!(f, "<marginal over {} values>", m.len()),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Self::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Real(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<Vec<f64>> for Value {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::List(items)
    }
}

impl From<Marginal> for Value {
    fn from(m: Marginal) -> Self {
        Self::Dist(Rc::new(m))
    }
}

/// Key-value state threaded through every continuation call
///
/// Cloned whenever execution forks, so branches never observe each other's
/// writes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Store {
    entries: BTreeMap<String, Value>,
}

impl Store {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Insert a binding, returning the previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    /// Builder-style insert, convenient inside continuations
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }
}
