//! Systematic concurrency testing for message-passing actor programs.
//!
//! This is the main entry point for the interleave library: the controlled
//! actor runtime that hosts a system under test, and the testing engine
//! that drives it through many schedules looking for bugs.

pub use interleave_core::*;

pub mod engine;
pub mod runtime;

pub use engine::{Config, RunReport, StrategyKind, TestingEngine};
pub use runtime::{ControlledRuntime, EntityContext, MonitorDef, ScenarioResult};
