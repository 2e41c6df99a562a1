//! Step executors
//!
//! An executor owns the test code for a run. The driver hands it one step at
//! a time; whatever the test code does, the executor answers with a
//! [`StepResult`] and never fails the run on a step's behalf.

pub mod suite;

use std::str::FromStr;

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::types::{Step, StepResult};

pub use suite::{InProcessExecutor, StepContext, StepOutcome, Suite, SuiteCatalog};

/// Runs test code for the steps of a walk
#[async_trait]
pub trait StepExecutor: Send {
    /// Resolve and prepare the test code; fails when nothing runnable is found
    async fn load(&mut self) -> Result<()>;

    /// Execute one step; failures are reported in the result's `error`
    async fn execute_step(&mut self, step: &Step) -> StepResult;

    /// Unload the test code; safe to call repeatedly
    async fn kill(&mut self) -> Result<()>;
}

/// Executor kinds accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutorKind {
    /// Handlers registered in the running binary
    #[default]
    InProcess,
}

impl FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-process" => Ok(Self::InProcess),
            other => Err(Error::UnsupportedExecutor(other.to_string())),
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess => write!(f, "in-process"),
        }
    }
}
