//! Predefined paths replayed without an engine

use std::collections::VecDeque;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::common::{Error, Result};
use crate::types::{JsonMap, Step};

use super::StepSource;

/// A fixed list of steps, typically read from a JSON file
///
/// Model data is kept locally: a step's own `data` object is merged in when
/// the step is taken, and `set_data` replaces it.
#[derive(Debug, Default)]
pub struct RecordedPath {
    steps: VecDeque<Value>,
    data: JsonMap,
}

impl RecordedPath {
    pub fn new(steps: Vec<Value>) -> Self {
        Self {
            steps: steps.into(),
            data: JsonMap::new(),
        }
    }

    /// Read a JSON array of steps from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        let value: Value = serde_json::from_str(&content)?;
        match value {
            Value::Array(steps) => Ok(Self::new(steps)),
            _ => Err(Error::Config(format!(
                "Steps file '{}' must contain a JSON array",
                path.display()
            ))),
        }
    }

    pub fn remaining(&self) -> usize {
        self.steps.len()
    }
}

#[async_trait]
impl StepSource for RecordedPath {
    async fn has_next(&mut self) -> Result<bool> {
        Ok(!self.steps.is_empty())
    }

    async fn get_next(&mut self) -> Result<Step> {
        let raw = self
            .steps
            .pop_front()
            .ok_or_else(|| Error::MalformedStep("path is exhausted".to_string()))?;

        let step: Step = serde_json::from_value(raw)
            .map_err(|e| Error::MalformedStep(format!("invalid recorded step: {}", e)))?;
        if step.name.is_empty() {
            return Err(Error::MalformedStep("recorded step has an empty name".to_string()));
        }

        if let Some(Value::Object(data)) = &step.data {
            self.data.extend(data.clone());
        }
        Ok(step)
    }

    async fn get_data(&mut self) -> Result<JsonMap> {
        Ok(self.data.clone())
    }

    async fn set_data(&mut self, data: &JsonMap) -> Result<()> {
        self.data = data.clone();
        Ok(())
    }

    async fn statistics(&mut self) -> JsonMap {
        JsonMap::new()
    }
}
