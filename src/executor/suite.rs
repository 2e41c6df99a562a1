//! In-process executor backed by registered step handlers
//!
//! A [`Suite`] maps step names to closures. Handlers registered under a
//! model are looked up as `Model.step` first, then plain `step`. A step with
//! no handler is not a failure: it runs as a no-op with empty output.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::{Error, Result};
use crate::types::{JsonMap, Step, StepError, StepResult};

use super::StepExecutor;

/// What a step handler returns; `Err` marks the step as failed
pub type StepOutcome = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Handler = Arc<dyn Fn(&mut StepContext) -> StepOutcome + Send + Sync>;
type SuiteFactory = Box<dyn Fn() -> Suite + Send + Sync>;

/// Mutable state a handler sees while it runs
///
/// Text written with `write!`/`writeln!` becomes the step's output.
#[derive(Debug)]
pub struct StepContext {
    step: Step,
    /// Shared model data; changes are returned in the step result
    pub data: JsonMap,
    output: String,
}

impl StepContext {
    fn new(step: &Step) -> Self {
        Self {
            step: step.clone(),
            data: step.data_map(),
            output: String::new(),
        }
    }

    /// The step being executed
    pub fn step(&self) -> &Step {
        &self.step
    }

    /// Output captured so far
    pub fn output(&self) -> &str {
        &self.output
    }
}

impl fmt::Write for StepContext {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.output.push_str(s);
        Ok(())
    }
}

/// Step handlers for one test package
#[derive(Default, Clone)]
pub struct Suite {
    handlers: HashMap<String, Handler>,
}

impl Suite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a step name, regardless of model
    pub fn step<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut StepContext) -> StepOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Register handlers that only apply to steps of one model
    pub fn model<F>(mut self, model: &str, build: F) -> Self
    where
        F: FnOnce(ModelSteps) -> ModelSteps,
    {
        let steps = build(ModelSteps {
            handlers: Vec::new(),
        });
        for (name, handler) in steps.handlers {
            self.handlers.insert(format!("{}.{}", model, name), handler);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered handler keys, sorted
    pub fn handler_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn lookup(&self, step: &Step) -> Option<Handler> {
        let scoped = step
            .model_name
            .as_ref()
            .and_then(|model| self.handlers.get(&format!("{}.{}", model, step.name)));
        scoped.or_else(|| self.handlers.get(&step.name)).cloned()
    }
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suite")
            .field("handlers", &self.handler_names())
            .finish()
    }
}

/// Handlers being registered for one model
pub struct ModelSteps {
    handlers: Vec<(String, Handler)>,
}

impl ModelSteps {
    pub fn step<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(&mut StepContext) -> StepOutcome + Send + Sync + 'static,
    {
        self.handlers.push((name.to_string(), Arc::new(handler)));
        self
    }
}

/// Test packages known to this binary, by name
#[derive(Default)]
pub struct SuiteCatalog {
    suites: HashMap<String, SuiteFactory>,
}

impl SuiteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a suite factory under a package name
    pub fn register<F>(mut self, package: &str, factory: F) -> Self
    where
        F: Fn() -> Suite + Send + Sync + 'static,
    {
        self.suites.insert(package.to_string(), Box::new(factory));
        self
    }

    /// Build the suite for a test package path
    ///
    /// The path's last component is tried first, then the whole path.
    pub fn resolve(&self, package: &Path) -> Option<Suite> {
        let by_name = package
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| self.suites.get(name));
        let factory = by_name.or_else(|| self.suites.get(package.to_string_lossy().as_ref()))?;
        Some(factory())
    }

    pub fn packages(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.suites.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Executor that runs handlers from a [`SuiteCatalog`] inside this process
pub struct InProcessExecutor {
    package: PathBuf,
    catalog: Arc<SuiteCatalog>,
    suite: Option<Suite>,
}

impl InProcessExecutor {
    pub fn new(package: impl Into<PathBuf>, catalog: Arc<SuiteCatalog>) -> Self {
        Self {
            package: package.into(),
            catalog,
            suite: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.suite.is_some()
    }
}

#[async_trait]
impl StepExecutor for InProcessExecutor {
    async fn load(&mut self) -> Result<()> {
        let suite = self.catalog.resolve(&self.package).ok_or_else(|| {
            Error::ExecutorLoad(format!(
                "no test suite registered for '{}' (known: {})",
                self.package.display(),
                self.catalog.packages().join(", ")
            ))
        })?;

        if suite.is_empty() {
            return Err(Error::ExecutorLoad(format!(
                "test suite '{}' has no step handlers",
                self.package.display()
            )));
        }

        tracing::info!(
            package = %self.package.display(),
            handlers = suite.len(),
            "Loaded test suite"
        );
        self.suite = Some(suite);
        Ok(())
    }

    async fn execute_step(&mut self, step: &Step) -> StepResult {
        let mut result = StepResult::empty(step);

        let Some(suite) = &self.suite else {
            result.error = Some(StepError {
                message: "test suite is not loaded".to_string(),
                trace: String::new(),
            });
            return result;
        };

        let Some(handler) = suite.lookup(step) else {
            tracing::warn!(step = %step.qualified_name(), "No handler registered for step");
            return result;
        };

        let mut context = StepContext::new(step);
        let task = tokio::task::spawn_blocking(move || {
            let outcome = handler(&mut context);
            (context, outcome)
        });

        match task.await {
            Ok((context, outcome)) => {
                result.output = context.output;
                result.data = context.data;
                if let Err(e) = outcome {
                    tracing::warn!(step = %step.qualified_name(), "Step failed: {}", e);
                    result.error = Some(StepError {
                        message: e.to_string(),
                        trace: source_chain(e.as_ref()),
                    });
                }
            }
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                tracing::warn!(step = %step.qualified_name(), "Step panicked: {}", message);
                result.error = Some(StepError {
                    message,
                    trace: String::new(),
                });
            }
            Err(e) => {
                result.error = Some(StepError {
                    message: e.to_string(),
                    trace: String::new(),
                });
            }
        }

        tracing::debug!(step = %step.qualified_name(), failed = result.is_failure(), "Step executed");
        result
    }

    async fn kill(&mut self) -> Result<()> {
        if self.suite.take().is_some() {
            tracing::debug!(package = %self.package.display(), "Unloaded test suite");
        }
        Ok(())
    }
}

fn source_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = Vec::new();
    let mut source = error.source();
    while let Some(cause) = source {
        lines.push(format!("Caused by: {}", cause));
        source = cause.source();
    }
    lines.join("\n")
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {}", message)
    } else {
        "panicked".to_string()
    }
}
