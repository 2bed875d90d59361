//! Conflict-free replicated data types and the causal machinery around them
//!
//! - `clock`: vector clocks and causal ordering
//! - `op`: the signed, content-addressed operation envelope
//! - `engine`: merge policies (LWW register, OR-set, PN counter)
//! - `validator`: Byzantine admission checks
//! - `holdback`: buffering for operations whose parents are missing

pub mod clock;
pub mod engine;
pub mod holdback;
pub mod op;
pub mod validator;

#[cfg(test)]
mod convergence_tests;

pub use clock::{CausalOrder, VectorClock};
pub use engine::{KeyState, MergeEngine};
pub use holdback::HoldbackQueue;
pub use op::{Mutation, Operation, Payload};
pub use validator::{Admission, AdmissionFilter, RejectionReason};
