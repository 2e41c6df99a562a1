//! Core data types shared by the engine client, executors and the reporter

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// JSON object used for model data and statistics
pub type JsonMap = Map<String, Value>;

/// A model file paired with the generator expression the engine walks it with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub path: PathBuf,
    pub generator: String,
}

impl ModelRef {
    pub fn new(path: impl Into<PathBuf>, generator: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            generator: generator.into(),
        }
    }
}

/// One element of the generated path (a vertex or an edge)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Value>,
}

impl Step {
    /// Create a step with only a name, as found in hand-written paths
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            model_name: None,
            data: None,
            kind: None,
            properties: None,
            actions: None,
        }
    }

    /// The step's data as a mapping; anything that is not an object reads as empty
    pub fn data_map(&self) -> JsonMap {
        match &self.data {
            Some(Value::Object(map)) => map.clone(),
            _ => JsonMap::new(),
        }
    }

    /// `Model.name` when the step belongs to a model, otherwise just the name
    pub fn qualified_name(&self) -> String {
        match &self.model_name {
            Some(model) => format!("{}.{}", model, self.name),
            None => self.name.clone(),
        }
    }
}

/// Failure captured while executing a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub message: String,
    #[serde(default)]
    pub trace: String,
}

/// Outcome of executing one step; `error` is present exactly when the step failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub output: String,

    #[serde(default)]
    pub data: JsonMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepResult {
    /// Successful result with no output, used when a step has no handler
    pub fn empty(step: &Step) -> Self {
        Self {
            id: step.id.clone(),
            output: String::new(),
            data: step.data_map(),
            error: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}
