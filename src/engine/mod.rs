//! Path-generation engine
//!
//! The engine is an external process exposing a small REST service. This
//! module launches it, waits for it to be ready, and polls it for steps.

pub mod client;
pub mod process;
pub mod protocol;
mod recorded;

use async_trait::async_trait;

use crate::common::Result;
use crate::types::{JsonMap, Step};

pub use client::{AttemptStatus, EngineClient, StartupAttempt};
pub use process::EngineLaunch;
pub use recorded::RecordedPath;

/// Where the driver pulls its steps from
#[async_trait]
pub trait StepSource: Send {
    /// Whether another step is available
    async fn has_next(&mut self) -> Result<bool>;

    /// Take the next step
    async fn get_next(&mut self) -> Result<Step>;

    /// Current shared model data
    async fn get_data(&mut self) -> Result<JsonMap>;

    /// Replace the shared model data
    async fn set_data(&mut self, data: &JsonMap) -> Result<()>;

    /// End-of-run statistics, empty when unavailable
    async fn statistics(&mut self) -> JsonMap;
}
