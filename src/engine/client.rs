//! Engine client: process lifecycle and the REST polling protocol

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::common::{config::Config, Error, Result};
use crate::types::{JsonMap, ModelRef, Step};

use super::process::{AttemptOutcome, EngineLaunch, EngineProcess};
use super::protocol;
use super::StepSource;

/// Result of one startup attempt, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupAttempt {
    pub port: u16,
    pub pid: Option<u32>,
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptStatus {
    Ready,
    StartupFailed,
    NotReady,
}

/// Client owning one engine process and talking to its REST service
pub struct EngineClient {
    launch: EngineLaunch,
    host: String,
    desired_port: u16,
    max_attempts: u16,
    http: reqwest::Client,
    process: Option<EngineProcess>,
    base_url: Option<String>,
    attempts: Vec<StartupAttempt>,
}

impl EngineClient {
    /// Create a client; nothing is launched until [`EngineClient::start`]
    pub fn new(
        launch: EngineLaunch,
        host: impl Into<String>,
        desired_port: u16,
        max_attempts: u16,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            launch,
            host: host.into(),
            desired_port,
            max_attempts: max_attempts.max(1),
            http,
            process: None,
            base_url: None,
            attempts: Vec::new(),
        })
    }

    /// Create a client from configuration plus the run's models and filters
    pub fn from_config(
        config: &Config,
        models: Vec<ModelRef>,
        blocked: bool,
        start_element: Option<String>,
    ) -> Result<Self> {
        let (program, leading_args) = config.engine.resolve_command()?;

        let launch = EngineLaunch {
            program,
            leading_args,
            debug_level: Some(config.engine.debug_level.clone()),
            models,
            blocked,
            start_element,
            ready_marker: config.engine.ready_marker.clone(),
            ready_timeout: config.timeouts.engine_ready(),
            env: config
                .engine
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        };

        Self::new(
            launch,
            config.engine.host.clone(),
            config.engine.port,
            config.engine.max_port_attempts,
            config.timeouts.engine_request(),
        )
    }

    /// Start the engine, trying consecutive ports until one attempt is ready
    ///
    /// Every failed attempt is killed and reaped before the next port is
    /// tried. Only startup failures move on to the next port; anything else
    /// ends the start. The attempt in flight is held by the client, so a
    /// start that is dropped midway is still cleaned up by
    /// [`EngineClient::kill`]. Returns the bound port.
    pub async fn start(&mut self) -> Result<u16> {
        if self.process.is_some() {
            return Err(Error::Internal("Engine already started".to_string()));
        }

        let first_port = self.desired_port;
        let mut last_port = first_port;
        let mut last_error: Option<Error> = None;

        for offset in 0..self.max_attempts {
            let Some(port) = first_port.checked_add(offset) else {
                break;
            };
            last_port = port;

            let process = self
                .process
                .insert(EngineProcess::spawn(&self.launch, port)?);
            let pid = process.pid();
            let outcome = process.wait_ready(self.launch.ready_timeout).await;

            let status = match &outcome {
                AttemptOutcome::Ready => AttemptStatus::Ready,
                AttemptOutcome::Exited { .. } => AttemptStatus::StartupFailed,
                AttemptOutcome::TimedOut => AttemptStatus::NotReady,
            };
            self.attempts.push(StartupAttempt { port, pid, status });

            match outcome.into_error(port, self.launch.ready_timeout) {
                None => {
                    self.base_url = Some(format!("http://{}:{}/graphwalker", self.host, port));
                    tracing::info!(port, "Engine started");
                    return Ok(port);
                }
                Some(err) => {
                    if let Some(mut process) = self.process.take() {
                        if let Err(e) = process.kill().await {
                            tracing::error!(port, "Failed to kill engine attempt: {}", e);
                        }
                    }
                    if !err.is_retryable_startup() {
                        return Err(err);
                    }
                    tracing::warn!(port, "Engine attempt failed, trying next port: {}", err);
                    last_error = Some(err);
                }
            }
        }

        Err(Error::EngineUnavailable {
            first_port,
            last_port,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no port available".to_string()),
        })
    }

    /// Port the engine is bound to, once started
    pub fn port(&self) -> Option<u16> {
        self.base_url.as_ref()?;
        self.process.as_ref().map(EngineProcess::port)
    }

    /// Process id of the current engine process, including an attempt still
    /// waiting to become ready
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(EngineProcess::pid)
    }

    /// Startup attempts made so far, in order
    pub fn attempts(&self) -> &[StartupAttempt] {
        &self.attempts
    }

    /// Check if the engine process is still running
    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(EngineProcess::is_running)
    }

    /// Kill the engine process and wait until it is reaped
    ///
    /// Safe to call repeatedly and when nothing was started.
    pub async fn kill(&mut self) -> Result<()> {
        self.base_url = None;
        if let Some(mut process) = self.process.take() {
            tracing::info!(port = process.port(), "Killing engine process");
            process.kill().await?;
        }
        Ok(())
    }

    fn url(&self, endpoint: &str) -> Result<String> {
        let base = self
            .base_url
            .as_ref()
            .ok_or_else(|| Error::engine_request(endpoint, "engine is not running"))?;
        Ok(format!("{}/{}", base, endpoint))
    }

    async fn read_json(endpoint: &str, response: reqwest::Response) -> Result<Value> {
        let response = response
            .error_for_status()
            .map_err(|e| Error::engine_request(endpoint, e))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| Error::EngineProtocol(format!("{}: invalid JSON body: {}", endpoint, e)))
    }

    async fn get_json(&self, endpoint: &str) -> Result<Value> {
        let url = self.url(endpoint)?;
        tracing::trace!(%url, "GET");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::engine_request(endpoint, e))?;
        Self::read_json(endpoint, response).await
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let url = self.url(endpoint)?;
        tracing::trace!(%url, method = method.as_str(), "request");
        let mut request = self.http.request(method, &url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::engine_request(endpoint, e))?;
        Self::read_json(endpoint, response).await
    }

    /// Whether the engine has more steps on the current path
    pub async fn has_next(&self) -> Result<bool> {
        let body = self.get_json("hasNext").await?;
        protocol::parse_has_next(&body)
    }

    /// Fetch the next step, normalized to the canonical shape
    pub async fn get_next(&self) -> Result<Step> {
        let body = self.get_json("getNext").await?;
        protocol::parse_next_step(body)
    }

    /// Current model data
    pub async fn get_data(&self) -> Result<JsonMap> {
        let body = self.get_json("getData").await?;
        unwrap_mapping("getData", body)
    }

    /// Replace model data
    pub async fn set_data(&self, data: &JsonMap) -> Result<()> {
        let body = Value::Object(data.clone());
        let response = self
            .send_json(reqwest::Method::PUT, "setData", Some(&body))
            .await?;
        protocol::parse_envelope(response)?;
        Ok(())
    }

    /// Restart the walk from the beginning
    pub async fn restart(&self) -> Result<()> {
        let response = self.send_json(reqwest::Method::PUT, "restart", None).await?;
        protocol::parse_envelope(response)?;
        Ok(())
    }

    /// Run statistics; failures are logged and read as an empty mapping
    pub async fn get_statistics(&self) -> JsonMap {
        let result = match self.get_json("getStatistics").await {
            Ok(body) => unwrap_mapping("getStatistics", body),
            Err(e) => Err(e),
        };

        result.unwrap_or_else(|e| {
            tracing::warn!("Failed to get statistics: {}", e);
            JsonMap::new()
        })
    }

    /// Load a model into the running engine
    pub async fn load(&self, model: &Value) -> Result<()> {
        let response = self
            .send_json(reqwest::Method::POST, "load", Some(model))
            .await?;
        protocol::parse_envelope(response)?;
        tracing::info!("Model loaded into engine");
        Ok(())
    }
}

/// Read a mapping response that may or may not come wrapped in an envelope
///
/// A wrapped response whose only field is a `data` object yields that object.
fn unwrap_mapping(endpoint: &str, body: Value) -> Result<JsonMap> {
    let map = match body {
        Value::Object(map) if map.contains_key("result") => {
            protocol::parse_envelope(Value::Object(map))?
        }
        Value::Object(map) => return Ok(map),
        other => {
            return Err(Error::EngineProtocol(format!(
                "{}: expected a JSON object, got: {}",
                endpoint, other
            )))
        }
    };

    if map.len() == 1 {
        if let Some(Value::Object(data)) = map.get("data") {
            return Ok(data.clone());
        }
    }
    Ok(map)
}

#[async_trait]
impl StepSource for EngineClient {
    async fn has_next(&mut self) -> Result<bool> {
        EngineClient::has_next(self).await
    }

    async fn get_next(&mut self) -> Result<Step> {
        EngineClient::get_next(self).await
    }

    async fn get_data(&mut self) -> Result<JsonMap> {
        EngineClient::get_data(self).await
    }

    async fn set_data(&mut self, data: &JsonMap) -> Result<()> {
        EngineClient::set_data(self, data).await
    }

    async fn statistics(&mut self) -> JsonMap {
        self.get_statistics().await
    }
}
