//! Model payloads and the path report

use std::path::Path;

use serde_json::Value;

use crate::common::{Error, Result};
use crate::types::{ModelRef, Step};

/// Read every model file as JSON, in order
///
/// Fails on the first missing or malformed file.
pub fn load_models(models: &[ModelRef]) -> Result<Vec<Value>> {
    models
        .iter()
        .map(|model| {
            let content = std::fs::read_to_string(&model.path)
                .map_err(|e| Error::model_load(&model.path, e))?;
            let value: Value =
                serde_json::from_str(&content).map_err(|e| Error::model_load(&model.path, e))?;
            tracing::debug!(path = %model.path.display(), generator = %model.generator, "Loaded model");
            Ok(value)
        })
        .collect()
}

/// Write the executed steps as a JSON array
pub fn write_path_report(path: &Path, steps: &[Step]) -> Result<()> {
    let content = serde_json::to_string_pretty(steps)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), steps = steps.len(), "Wrote path report");
    Ok(())
}
