//! Walker - model-based test runs with a live viewer
//!
//! This library drives an external path-generation engine, executes each
//! generated step against registered test code, and streams the run to a
//! viewer through a websocket relay.

pub mod cli;
pub mod commands;
pub mod common;
pub mod driver;
pub mod engine;
pub mod executor;
pub mod relay;
pub mod types;

// Re-export commonly used types for tests and test suites
pub use common::{Error, Result};
pub use executor::{StepContext, StepOutcome, Suite, SuiteCatalog};
pub use types::{ModelRef, Step, StepResult};
