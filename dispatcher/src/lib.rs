//! Periodic scheduler that drains the call queue under concurrency caps.
//!
//! Each tick walks users in fairness order, computes the slots the
//! system and per-user limits allow, and allocates queue items one at a
//! time: atomic slot reservation, then the provider call, with the slot
//! released on every failure path after reservation.

pub mod counters;
pub mod direct;
pub mod engine;
pub mod error;
pub mod source;
pub mod types;

pub use counters::Counters;
pub use direct::{DirectCallOutcome, DirectCallRequest};
pub use engine::Dispatcher;
pub use error::DispatchError;
pub use types::{Allocation, DIRECT_PRIORITY, DispatchConfig};
