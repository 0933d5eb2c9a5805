//! fleet plan applier library.
//!
//! This crate primarily ships a `plan-applier` binary, but exposes its
//! store, queue and evaluation so scheduler workers and integration tests can
//! drive them in-process.

pub mod applier;
pub mod bad_nodes;
pub mod config;
pub mod error;
pub mod fit;
pub mod reads;
pub mod state;

pub use applier::{evaluate_plan, EvalTokens, PlanApplier, PlanQueue, PlanRequest};
pub use error::{ApplierError, ApplierResult};
pub use state::{StateSnapshot, StateStore};
