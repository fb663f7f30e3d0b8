//! Sandboxed multi-language execution engine for live coding duels
//!
//! Raw user functions are wrapped into complete programs, run inside warm,
//! resource-bounded containers and judged against a problem's test cases.
//! `service::ExecutionService` is the single entry point.

pub mod adapter;
pub mod batch;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod harness;
pub mod pool;
pub mod registry;
pub mod sandbox;
pub mod service;

#[cfg(test)]
mod testing;

pub use config::LanguageConfigManager;
pub use error::{EngineError, Result};
pub use service::ExecutionService;
