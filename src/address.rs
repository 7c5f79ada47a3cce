//! Choice-site addresses
//!
//! An address is a string path naming one random-choice or factor site. It is
//! built by the lowering pipeline by appending a label per call site, so the
//! same site receives the same address on every re-execution that shares a
//! prefix. MH relies on this to match choices across executions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// String path identifying a random-choice or factor site
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// The empty root path
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Extend this address by one path segment
    pub fn child(&self, label: impl fmt::Display) -> Self {
        Self(format!("{}/{}", self.0, label))
    }

    /// Whether this is the root path
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw path string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Number of segments in the path
    pub fn depth(&self) -> usize {
        self.0.matches('/').count()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl From<&str> for Address {
    fn from(path: &str) -> Self {
        Self(path.to_string())
    }
}

/// Build an address from the root: `addr!("loop", 3)` is `/loop/3`
#[macro_export]
macro_rules! addr {
    ($($segment:expr),+ $(,)?) => {{
        let address = $crate::address::Address::root();
        $(let address = address.child($segment);)+
        address
    }};
}
