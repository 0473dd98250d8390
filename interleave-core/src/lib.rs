//! Core machinery for systematic concurrency testing.
//!
//! This crate provides the cooperative scheduler, the pluggable exploration
//! strategies, program-state fingerprinting with liveness checking, and the
//! replayable decision trace that ties a found bug to a reproducible
//! schedule.

pub mod cache;
pub mod entity;
pub mod error;
pub mod liveness;
pub mod rng;
pub mod scheduler;
pub mod strategy;
pub mod trace;

// Re-export the main types
pub use cache::*;
pub use entity::*;
pub use error::*;
pub use liveness::*;
pub use rng::*;
pub use scheduler::*;
pub use strategy::*;
pub use trace::*;
