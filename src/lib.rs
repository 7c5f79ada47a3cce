//! # ppl-runtime
//!
//! An inference runtime for continuation-passing probabilistic programs.
//!
//! A program is a function of a store, a continuation and an address that
//! returns a [`Step`](dispatch::Step). Random choices, factors and program
//! exit are effects the program hands to whichever inference handler is
//! active; the [`Runtime`](dispatch::Runtime) trampolines those steps and
//! keeps the handler stack, so engines can nest.
//!
//! ## Engines
//!
//! - **Enumerate**: exact marginals for finite-support programs
//! - **MH**: lightweight single-site Metropolis–Hastings
//! - **ParticleFilter**: SMC that synchronizes particles at each factor
//! - **PMCMC**: conditional SMC sweeps around a retained path
//! - **ParticleFilterRejuv**: SMC with MH rejuvenation of every particle
//! - **Variational**: mean-field AdaGrad on the choices' parameters
//!
//! ## Quick Start
//!
//! ```rust
//! use ppl_runtime::prelude::*;
//!
//! // Two fair coins, conditioned on at least one landing heads
//! let model = program(|store, k, address| {
//!     let a_at = address.child("a");
//!     sample(
//!         store,
//!         cont(move |store, a| {
//!             let k = k.clone();
//!             let obs = address.child("obs");
//!             sample(
//!                 store,
//!                 cont(move |store, b| {
//!                     let heads = a.as_bool() == Some(true) || b.as_bool() == Some(true);
//!                     let score = if heads { 0.0 } else { f64::NEG_INFINITY };
//!                     let k = k.clone();
//!                     let a = a.clone();
//!                     factor(store, cont(move |s, _| k(s, a.clone())), obs.clone(), score)
//!                 }),
//!                 address.child("b"),
//!                 Dist::Bernoulli,
//!                 vec![0.5],
//!             )
//!         }),
//!         a_at,
//!         Dist::Bernoulli,
//!         vec![0.5],
//!     )
//! });
//!
//! let mut rt = Runtime::new(RuntimeConfig::default().seed(7));
//! let algorithm = Algorithm::from_json(r#"{"algorithm": "particle_filter", "particles": 2000}"#)?;
//! let posterior = rt.infer(&algorithm, &model)?;
//! let p = posterior.as_dist().map_or(0.0, |m| m.probability(&Value::Bool(true)));
//! assert!((p - 2.0 / 3.0).abs() < 0.05);
//! # Ok::<(), ppl_runtime::error::InferenceError>(())
//! ```

pub mod address;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod distributions;
pub mod error;
pub mod inference;
pub mod population;
pub mod trace;
pub mod value;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::config::RuntimeConfig;
    pub use crate::diagnostics::InferenceStats;
    pub use crate::dispatch::prelude::*;
    pub use crate::distributions::prelude::*;
    pub use crate::error::*;
    pub use crate::inference::prelude::*;
    pub use crate::value::{Store, Value};
}
