//! Scenario harness for memsan.
//!
//! This crate provides:
//! - Built-in scenarios exercising the engine end to end
//! - A runner that executes them against fresh engines
//! - A JSONL evidence log with schema validation and an artifact index

#![forbid(unsafe_code)]

pub mod error;
pub mod runner;
pub mod scenarios;
pub mod structured_log;

pub use error::HarnessError;
pub use runner::{RunSummary, ScenarioRunner};
pub use scenarios::{Scenario, ScenarioOutcome};
