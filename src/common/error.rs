//! Error types for the walker
//!
//! Errors are grouped by the component that raises them. Engine, executor
//! and model errors end a run; step-level failures never surface here, they
//! are captured into the step result instead.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::relay::protocol::Role;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the walker
#[derive(Error, Debug)]
pub enum Error {
    // === Model Errors ===
    #[error("Failed to load model '{path}': {reason}")]
    ModelLoad { path: String, reason: String },

    // === Engine Startup Errors ===
    #[error("Engine jar not found. Searched: {searched}")]
    EngineJarNotFound { searched: String },

    #[error("Failed to spawn engine process: {0}")]
    EngineSpawn(String),

    #[error("Engine exited during startup on port {port} (exit code {code:?}): {stderr}")]
    EngineStartupFailed {
        port: u16,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Engine on port {port} did not report ready within {timeout:?}")]
    EngineNotReady { port: u16, timeout: Duration },

    #[error("Engine unavailable: no attempt succeeded on ports {first_port}-{last_port}. Last error: {last_error}")]
    EngineUnavailable {
        first_port: u16,
        last_port: u16,
        last_error: String,
    },

    // === Engine Protocol Errors ===
    #[error("Engine protocol error: {0}")]
    EngineProtocol(String),

    #[error("Engine request '{endpoint}' failed: {message}")]
    EngineRequest { endpoint: String, message: String },

    #[error("Malformed step from engine: {0}")]
    MalformedStep(String),

    // === Executor Errors ===
    #[error("Failed to load tests: {0}")]
    ExecutorLoad(String),

    #[error("Unsupported executor '{0}'. Only 'in-process' is available")]
    UnsupportedExecutor(String),

    // === Relay Errors ===
    #[error("A {0} is already connected")]
    RoleOccupied(Role),

    #[error("Relay protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Relay connection error: {0}")]
    RelayConnection(String),

    // === Timeout Errors ===
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("Run interrupted")]
    Interrupted,

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a model load error
    pub fn model_load(path: &std::path::Path, reason: impl ToString) -> Self {
        Self::ModelLoad {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Create a jar not found error with the searched locations
    pub fn jar_not_found<S: AsRef<str>>(paths: &[S]) -> Self {
        Self::EngineJarNotFound {
            searched: paths.iter().map(|s| s.as_ref()).collect::<Vec<_>>().join(", "),
        }
    }

    /// Create an engine request error
    pub fn engine_request(endpoint: &str, message: impl ToString) -> Self {
        Self::EngineRequest {
            endpoint: endpoint.to_string(),
            message: message.to_string(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: &str, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.to_string(),
            timeout,
        }
    }

    /// Whether this is a per-port startup failure worth retrying on the next port
    pub fn is_retryable_startup(&self) -> bool {
        matches!(
            self,
            Self::EngineStartupFailed { .. } | Self::EngineNotReady { .. }
        )
    }
}
