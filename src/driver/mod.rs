//! Run driver
//!
//! Ties the engine, an executor and the reporter together for one run:
//! load models, start the engine, load the tests, announce the run, walk the
//! path step by step, send the end event. Whatever happens, the executor and
//! then the engine are killed before the driver returns.

pub mod models;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::common::{config::Config, Error, Result};
use crate::engine::{EngineClient, RecordedPath, StepSource};
use crate::executor::{ExecutorKind, InProcessExecutor, StepExecutor, SuiteCatalog};
use crate::relay::Reporter;
use crate::types::{JsonMap, ModelRef, Step};

/// An online run against a live engine
#[derive(Debug, Clone)]
pub struct OnlineRequest {
    pub test_package: PathBuf,
    pub models: Vec<ModelRef>,
    pub executor: ExecutorKind,
    /// Websocket URL of the relay, e.g. `ws://localhost:5555`
    pub relay_url: String,
    pub blocked: bool,
    pub start_element: Option<String>,
    pub report_path_file: Option<PathBuf>,
}

/// A run over a predefined list of steps
#[derive(Debug, Clone)]
pub struct WalkRequest {
    pub test_package: PathBuf,
    pub steps_file: PathBuf,
    pub executor: ExecutorKind,
    pub relay_url: String,
    pub report_path_file: Option<PathBuf>,
}

/// How a run went
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// True when every step passed and the loop was not aborted
    pub status: bool,
    pub steps: usize,
    pub failures: usize,
    pub statistics: JsonMap,
    /// Why the step loop stopped early, if it did
    pub aborted: Option<String>,
    pub engine_port: Option<u16>,
}

/// Runs test suites from a catalog
pub struct Driver {
    config: Config,
    catalog: Arc<SuiteCatalog>,
}

impl Driver {
    pub fn new(config: Config, catalog: Arc<SuiteCatalog>) -> Self {
        Self { config, catalog }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn create_executor(&self, kind: ExecutorKind, package: &Path) -> Box<dyn StepExecutor> {
        match kind {
            ExecutorKind::InProcess => {
                Box::new(InProcessExecutor::new(package, self.catalog.clone()))
            }
        }
    }

    /// Run the tests online against a freshly started engine
    ///
    /// `shutdown` interrupts the run; teardown still happens and the result
    /// is `Error::Interrupted`.
    pub async fn online<F>(&self, request: OnlineRequest, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(state = "init", models = request.models.len(), "Preparing online run");
        if request.models.is_empty() {
            return Err(Error::Config("at least one model is required".to_string()));
        }
        let models_data = models::load_models(&request.models)?;

        let mut executor = self.create_executor(request.executor, &request.test_package);
        let mut engine = EngineClient::from_config(
            &self.config,
            request.models.clone(),
            request.blocked,
            request.start_element.clone(),
        )?;
        let mut reporter = None;
        let mut path = Vec::new();

        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            result = self.online_phases(
                &mut engine,
                executor.as_mut(),
                &mut reporter,
                models_data,
                &request.relay_url,
                &mut path,
            ) => result,
            _ = &mut shutdown => {
                tracing::warn!("Run interrupted");
                Err(Error::Interrupted)
            }
        };

        let outcome = close_run(outcome, &mut reporter, &path, request.report_path_file.as_deref()).await;
        teardown(executor.as_mut(), Some(&mut engine)).await;
        outcome
    }

    async fn online_phases(
        &self,
        engine: &mut EngineClient,
        executor: &mut dyn StepExecutor,
        reporter: &mut Option<Reporter>,
        models_data: Vec<Value>,
        relay_url: &str,
        path: &mut Vec<Step>,
    ) -> Result<RunSummary> {
        tracing::info!(state = "starting-engine", "Starting engine");
        let port = engine.start().await?;

        tracing::info!(state = "running", port, "Loading tests");
        executor.load().await?;
        let reporter = self.start_reporter(reporter, relay_url, models_data).await?;

        let mut summary = walk_path(engine, executor, reporter, path).await?;
        summary.engine_port = Some(port);
        Ok(summary)
    }

    /// Run the tests over a predefined path, without an engine
    pub async fn walk<F>(&self, request: WalkRequest, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(state = "init", steps_file = %request.steps_file.display(), "Preparing walk");
        let mut source = RecordedPath::from_file(&request.steps_file)?;
        let mut executor = self.create_executor(request.executor, &request.test_package);
        let mut reporter = None;
        let mut path = Vec::new();

        tokio::pin!(shutdown);
        let outcome = tokio::select! {
            result = self.walk_phases(
                &mut source,
                executor.as_mut(),
                &mut reporter,
                &request.relay_url,
                &mut path,
            ) => result,
            _ = &mut shutdown => {
                tracing::warn!("Run interrupted");
                Err(Error::Interrupted)
            }
        };

        let outcome = close_run(outcome, &mut reporter, &path, request.report_path_file.as_deref()).await;
        teardown(executor.as_mut(), None).await;
        outcome
    }

    async fn walk_phases(
        &self,
        source: &mut RecordedPath,
        executor: &mut dyn StepExecutor,
        reporter: &mut Option<Reporter>,
        relay_url: &str,
        path: &mut Vec<Step>,
    ) -> Result<RunSummary> {
        tracing::info!(state = "running", steps = source.remaining(), "Loading tests");
        executor.load().await?;
        let reporter = self.start_reporter(reporter, relay_url, Vec::new()).await?;
        walk_path(source, executor, reporter, path).await
    }

    /// Connect, announce the run and wait for a viewer to join
    ///
    /// The reporter lands in `slot` as soon as it is connected, so a run
    /// cut short during the viewer wait can still be closed. The run goes
    /// on without a viewer once the wait is used up.
    async fn start_reporter<'a>(
        &self,
        slot: &'a mut Option<Reporter>,
        relay_url: &str,
        models_data: Vec<Value>,
    ) -> Result<&'a mut Reporter> {
        let timeouts = &self.config.timeouts;
        let reporter = slot.insert(Reporter::connect(relay_url).await?);
        reporter.start(models_data, None).await?;

        for attempt in 1..=timeouts.viewer_ack_attempts {
            if reporter.await_ack(timeouts.viewer_ack()).await? {
                tracing::info!("Viewer joined");
                return Ok(reporter);
            }
            tracing::debug!(attempt, "Waiting for a viewer to join");
        }

        tracing::warn!("No viewer joined, running without one");
        Ok(reporter)
    }
}

/// The step loop plus the end event, shared by online runs and walks
async fn walk_path(
    source: &mut dyn StepSource,
    executor: &mut dyn StepExecutor,
    reporter: &mut Reporter,
    path: &mut Vec<Step>,
) -> Result<RunSummary> {
    let mut failures = 0;
    let mut aborted = None;

    while source.has_next().await? {
        let mut step = match source.get_next().await {
            Ok(step) => step,
            Err(Error::MalformedStep(reason)) => {
                tracing::error!("Aborting run on malformed step: {}", reason);
                if let Err(e) = reporter
                    .error(None, format!("Malformed step: {}", reason), None)
                    .await
                {
                    tracing::warn!("Failed to report malformed step: {}", e);
                }
                aborted = Some(reason);
                break;
            }
            Err(e) => return Err(e),
        };

        step.data = Some(Value::Object(source.get_data().await?));
        reporter.step_start(&step).await?;

        let result = executor.execute_step(&step).await;
        match &result.error {
            Some(error) => {
                failures += 1;
                tracing::warn!(step = %step.qualified_name(), error = %error.message, "Step failed");
            }
            None => tracing::info!(step = %step.qualified_name(), "Step passed"),
        }

        if result.data != step.data_map() {
            source.set_data(&result.data).await?;
        }

        reporter.step_end(&step, result).await?;
        path.push(step);
    }

    tracing::info!(state = "finishing", steps = path.len(), failures, "Path finished");
    let statistics = source.statistics().await;
    let status = failures == 0 && aborted.is_none();
    reporter.end(statistics.clone(), status).await?;

    Ok(RunSummary {
        status,
        steps: path.len(),
        failures,
        statistics,
        aborted,
        engine_port: None,
    })
}

/// Write the path report and, after a fatal error, tell the viewer the run failed
async fn close_run(
    outcome: Result<RunSummary>,
    reporter: &mut Option<Reporter>,
    path: &[Step],
    report_path_file: Option<&Path>,
) -> Result<RunSummary> {
    if let Err(error) = &outcome {
        if let Some(reporter) = reporter.as_mut().filter(|r| !r.is_ended()) {
            if let Err(e) = reporter.error(None, error.to_string(), None).await {
                tracing::debug!("Failed to report run error: {}", e);
            }
            if let Err(e) = reporter.end(JsonMap::new(), false).await {
                tracing::debug!("Failed to send end event: {}", e);
            }
        }
    }

    if let Some(file) = report_path_file {
        if let Err(e) = models::write_path_report(file, path) {
            tracing::warn!(path = %file.display(), "Failed to write path report: {}", e);
        }
    }

    outcome
}

/// Kill the executor, then the engine; a failure in one never skips the other
async fn teardown(executor: &mut dyn StepExecutor, engine: Option<&mut EngineClient>) {
    if let Err(e) = executor.kill().await {
        tracing::error!("Failed to kill executor: {}", e);
    }
    if let Some(engine) = engine {
        if let Err(e) = engine.kill().await {
            tracing::error!("Failed to kill engine: {}", e);
        }
    }
    tracing::info!(state = "done", "Teardown complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::broker::Outbound;
    use crate::relay::{Broker, RelayServer, Role};
    use crate::types::StepResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Executor that records calls and fails steps named `*_fail`
    #[derive(Default)]
    struct ScriptedExecutor {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StepExecutor for ScriptedExecutor {
        async fn load(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("load".to_string());
            Ok(())
        }

        async fn execute_step(&mut self, step: &Step) -> StepResult {
            self.calls.lock().unwrap().push(step.name.clone());
            let mut result = StepResult::empty(step);
            if step.name.ends_with("_fail") {
                result.error = Some(crate::types::StepError {
                    message: "failed on purpose".to_string(),
                    trace: String::new(),
                });
            }
            if step.name == "e_count" {
                result.data.insert("count".to_string(), json!(1));
            }
            result
        }

        async fn kill(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("kill".to_string());
            Ok(())
        }
    }

    async fn relay() -> (String, tokio::sync::oneshot::Sender<()>) {
        let (url, _broker, stop) = relay_with_broker().await;
        (url, stop)
    }

    async fn relay_with_broker() -> (String, Arc<Broker>, tokio::sync::oneshot::Sender<()>) {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let broker = server.broker();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(server.serve(async move {
            let _ = rx.await;
        }));
        (url, broker, tx)
    }

    fn quick_config() -> Config {
        let mut config = Config::default();
        config.timeouts.viewer_ack_secs = 0;
        config.timeouts.viewer_ack_attempts = 1;
        config
    }

    #[tokio::test]
    async fn test_walk_path_counts_failures_and_pushes_data() {
        let (url, _stop) = relay().await;
        let driver = Driver::new(quick_config(), Arc::new(SuiteCatalog::new()));
        let mut slot = None;
        let reporter = driver.start_reporter(&mut slot, &url, Vec::new()).await.unwrap();

        let mut source = RecordedPath::new(vec![
            json!({"name": "v_start"}),
            json!({"name": "e_count"}),
            json!({"name": "v_fail"}),
        ]);
        let mut executor = ScriptedExecutor::default();
        let mut path = Vec::new();

        let summary = walk_path(&mut source, &mut executor, reporter, &mut path)
            .await
            .unwrap();
        assert!(!summary.status);
        assert_eq!(summary.steps, 3);
        assert_eq!(summary.failures, 1);
        assert!(reporter.is_ended());
        assert_eq!(source.get_data().await.unwrap()["count"], 1);
    }

    #[tokio::test]
    async fn test_malformed_step_aborts_loop() {
        let (url, _stop) = relay().await;
        let driver = Driver::new(quick_config(), Arc::new(SuiteCatalog::new()));
        let mut slot = None;
        let reporter = driver.start_reporter(&mut slot, &url, Vec::new()).await.unwrap();

        let mut source = RecordedPath::new(vec![
            json!({"name": "v_start"}),
            json!({"id": "broken"}),
            json!({"name": "v_never"}),
        ]);
        let mut executor = ScriptedExecutor::default();
        let calls = executor.calls.clone();
        let mut path = Vec::new();

        let summary = walk_path(&mut source, &mut executor, reporter, &mut path)
            .await
            .unwrap();
        assert!(!summary.status);
        assert_eq!(summary.steps, 1);
        assert!(summary.aborted.is_some());
        assert_eq!(*calls.lock().unwrap(), vec!["v_start".to_string()]);
    }

    #[tokio::test]
    async fn test_teardown_kills_executor_without_engine() {
        let mut executor = ScriptedExecutor::default();
        let calls = executor.calls.clone();
        teardown(&mut executor, None).await;
        assert_eq!(*calls.lock().unwrap(), vec!["kill".to_string()]);
    }

    #[tokio::test]
    async fn test_online_requires_models() {
        let driver = Driver::new(Config::default(), Arc::new(SuiteCatalog::new()));
        let request = OnlineRequest {
            test_package: PathBuf::from("tests"),
            models: Vec::new(),
            executor: ExecutorKind::InProcess,
            relay_url: "ws://127.0.0.1:1".to_string(),
            blocked: false,
            start_element: None,
            report_path_file: None,
        };
        let err = driver.online(request, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_online_fails_fast_on_bad_model() {
        let driver = Driver::new(Config::default(), Arc::new(SuiteCatalog::new()));
        let request = OnlineRequest {
            test_package: PathBuf::from("tests"),
            models: vec![ModelRef::new("/nonexistent/model.json", "random(never)")],
            executor: ExecutorKind::InProcess,
            relay_url: "ws://127.0.0.1:1".to_string(),
            blocked: false,
            start_element: None,
            report_path_file: None,
        };
        let err = driver.online(request, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, Error::ModelLoad { .. }));
    }

    #[tokio::test]
    async fn test_walk_with_unknown_package_reports_executor_error() {
        let (url, _stop) = relay().await;
        let dir = tempfile::tempdir().unwrap();
        let steps = dir.path().join("steps.json");
        std::fs::write(&steps, r#"[{"name": "v_start"}]"#).unwrap();
        let report = dir.path().join("path.json");

        let driver = Driver::new(quick_config(), Arc::new(SuiteCatalog::new()));
        let request = WalkRequest {
            test_package: PathBuf::from("missing"),
            steps_file: steps,
            executor: ExecutorKind::InProcess,
            relay_url: url,
            report_path_file: Some(report.clone()),
        };
        let err = driver.walk(request, std::future::pending()).await.unwrap_err();
        assert!(matches!(err, Error::ExecutorLoad(_)));
        assert_eq!(std::fs::read_to_string(&report).unwrap(), "[]");
    }

    #[tokio::test]
    async fn test_walk_interrupted() {
        let dir = tempfile::tempdir().unwrap();
        let steps = dir.path().join("steps.json");
        std::fs::write(&steps, r#"[{"name": "v_start"}]"#).unwrap();

        let catalog = SuiteCatalog::new().register("tests", || {
            crate::executor::Suite::new().step("v_start", |_| Ok(()))
        });
        let driver = Driver::new(Config::default(), Arc::new(catalog));
        // The relay never answers the handshake, so the interrupt wins
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let request = WalkRequest {
            test_package: PathBuf::from("tests"),
            steps_file: steps,
            executor: ExecutorKind::InProcess,
            relay_url: format!("ws://{}", listener.local_addr().unwrap()),
            report_path_file: None,
        };
        let err = driver
            .walk(request, tokio::time::sleep(std::time::Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[tokio::test]
    async fn test_interrupt_while_waiting_for_viewer_ends_run() {
        let (url, broker, _stop) = relay_with_broker().await;
        let dir = tempfile::tempdir().unwrap();
        let steps = dir.path().join("steps.json");
        std::fs::write(&steps, r#"[{"name": "v_start"}]"#).unwrap();

        let catalog = SuiteCatalog::new().register("tests", || {
            crate::executor::Suite::new().step("v_start", |_| Ok(()))
        });
        // Default timeouts: the viewer wait outlasts the interrupt
        let driver = Driver::new(Config::default(), Arc::new(catalog));
        let request = WalkRequest {
            test_package: PathBuf::from("tests"),
            steps_file: steps,
            executor: ExecutorKind::InProcess,
            relay_url: url,
            report_path_file: None,
        };
        let err = driver
            .walk(request, tokio::time::sleep(std::time::Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));

        // A viewer joining now learns the run failed
        let (_id, mut viewer_rx) = broker.attach(Role::Viewer).await.unwrap();
        let frames: Vec<Value> = [viewer_rx.recv().await, viewer_rx.recv().await]
            .into_iter()
            .map(|frame| match frame {
                Some(Outbound::Text(text)) => serde_json::from_str(&text).unwrap(),
                other => panic!("expected text frame, got {:?}", other),
            })
            .collect();
        assert_eq!(frames[0]["type"], "start");
        assert_eq!(frames[1]["type"], "end");
        assert_eq!(frames[1]["status"], false);
    }
}
