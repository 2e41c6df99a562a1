//! Engine subprocess launch and readiness detection
//!
//! One launch is one attempt on one port. The engine's stdout and stderr are
//! read line by line on two background tasks; the first one that sees the
//! ready marker fires a oneshot. [`EngineProcess::wait_ready`] races that
//! signal against the process exiting and a deadline.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::common::{Error, Result};
use crate::types::ModelRef;

/// Number of stderr lines kept for startup failure reports
const STDERR_TAIL_LINES: usize = 50;

/// Grace period for the output readers to drain after the process exits
const READER_DRAIN: Duration = Duration::from_millis(500);

type ReadySender = Arc<Mutex<Option<oneshot::Sender<()>>>>;
type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Everything needed to launch the engine, except the port
#[derive(Debug, Clone)]
pub struct EngineLaunch {
    /// Program to execute
    pub program: PathBuf,
    /// Arguments placed before the engine arguments (e.g. `-jar graphwalker.jar`)
    pub leading_args: Vec<String>,
    /// Value for the `-d` flag, omitted when `None`
    pub debug_level: Option<String>,
    /// Models with their generator expressions
    pub models: Vec<ModelRef>,
    /// Filter out elements carrying the blocked property
    pub blocked: bool,
    /// Element the walk starts from
    pub start_element: Option<String>,
    /// Output line signalling that the REST listener is up
    pub ready_marker: String,
    /// How long to wait for the marker
    pub ready_timeout: Duration,
    /// Extra environment for the engine process
    pub env: Vec<(String, String)>,
}

impl EngineLaunch {
    /// Build the full argument list for a given port
    pub fn args(&self, port: u16) -> Vec<String> {
        let mut args = self.leading_args.clone();

        if let Some(level) = &self.debug_level {
            args.push("-d".to_string());
            args.push(level.clone());
        }

        args.push("online".to_string());
        args.extend(["-s".to_string(), "RESTFUL".to_string()]);
        args.extend(["-p".to_string(), port.to_string()]);

        for model in &self.models {
            args.push("-m".to_string());
            args.push(model.path.display().to_string());
            args.push(model.generator.clone());
        }

        if self.blocked {
            args.push("--blocked".to_string());
        }

        if let Some(element) = &self.start_element {
            args.push("-e".to_string());
            args.push(element.clone());
        }

        args
    }
}

/// How a single launch attempt ended
#[derive(Debug)]
pub enum AttemptOutcome {
    /// The ready marker was observed
    Ready,
    /// The process exited before the marker appeared
    Exited { code: Option<i32>, stderr: String },
    /// The deadline passed with the process still running
    TimedOut,
}

impl AttemptOutcome {
    /// Classify a failed attempt as an error; `None` for `Ready`
    pub fn into_error(self, port: u16, timeout: Duration) -> Option<Error> {
        match self {
            Self::Ready => None,
            Self::Exited { code, stderr } => Some(Error::EngineStartupFailed { port, code, stderr }),
            Self::TimedOut => Some(Error::EngineNotReady { port, timeout }),
        }
    }
}

enum Race {
    Ready,
    ReadersClosed,
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
}

/// A running engine process and its output readers
pub struct EngineProcess {
    child: Child,
    pid: Option<u32>,
    port: u16,
    readers: Vec<JoinHandle<()>>,
    stderr_tail: StderrTail,
    ready_rx: Option<oneshot::Receiver<()>>,
}

impl EngineProcess {
    /// Spawn the engine on `port` with its output readers running
    ///
    /// The caller owns the process from here on, whatever the outcome of
    /// [`EngineProcess::wait_ready`], and decides when to kill it.
    pub fn spawn(launch: &EngineLaunch, port: u16) -> Result<Self> {
        let args = launch.args(port);
        tracing::info!(
            port,
            program = %launch.program.display(),
            args = ?args,
            "Launching engine"
        );

        let mut cmd = Command::new(&launch.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &launch.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::EngineSpawn(format!("{}: {}", launch.program.display(), e))
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::EngineSpawn("Failed to get engine stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::EngineSpawn("Failed to get engine stderr".to_string()))?;

        let (ready_tx, ready_rx) = oneshot::channel();
        let ready_tx: ReadySender = Arc::new(Mutex::new(Some(ready_tx)));
        let stderr_tail: StderrTail = Arc::new(Mutex::new(VecDeque::new()));

        let readers = vec![
            tokio::spawn(watch_output(
                stdout,
                "stdout",
                launch.ready_marker.clone(),
                ready_tx.clone(),
                None,
            )),
            tokio::spawn(watch_output(
                stderr,
                "stderr",
                launch.ready_marker.clone(),
                ready_tx,
                Some(stderr_tail.clone()),
            )),
        ];

        Ok(Self {
            child,
            pid,
            port,
            readers,
            stderr_tail,
            ready_rx: Some(ready_rx),
        })
    }

    /// Wait for the ready marker, an early exit, or the deadline
    ///
    /// The process stays owned by `self` throughout, so dropping the wait
    /// midway leaves it to [`EngineProcess::kill`].
    pub async fn wait_ready(&mut self, timeout: Duration) -> AttemptOutcome {
        let Some(mut ready_rx) = self.ready_rx.take() else {
            return AttemptOutcome::Ready;
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let race = tokio::select! {
            ready = &mut ready_rx => if ready.is_ok() { Race::Ready } else { Race::ReadersClosed },
            status = self.child.wait() => Race::Exited(status),
            _ = tokio::time::sleep_until(deadline) => Race::TimedOut,
        };

        // Both streams closed without the marker: the process is on its way out
        let race = match race {
            Race::ReadersClosed => match tokio::time::timeout_at(deadline, self.child.wait()).await {
                Ok(status) => Race::Exited(status),
                Err(_) => Race::TimedOut,
            },
            other => other,
        };

        match race {
            Race::Ready => {
                tracing::info!(port = self.port, pid = ?self.pid(), "Engine reported ready");
                AttemptOutcome::Ready
            }
            Race::Exited(status) => {
                let code = status.ok().and_then(|s| s.code());
                self.drain_readers().await;
                let stderr = self.stderr_output().await;
                AttemptOutcome::Exited { code, stderr }
            }
            Race::TimedOut | Race::ReadersClosed => AttemptOutcome::TimedOut,
        }
    }

    /// OS process id as spawned; it stays set after the process is reaped
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Port this process was asked to bind
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Check if the process is still running
    pub fn is_running(&mut self) -> bool {
        self.child.try_wait().ok().flatten().is_none()
    }

    /// Buffered stderr lines joined into one string
    pub async fn stderr_output(&self) -> String {
        let tail = self.stderr_tail.lock().await;
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    async fn drain_readers(&mut self) {
        for reader in &mut self.readers {
            let _ = tokio::time::timeout(READER_DRAIN, reader).await;
        }
    }

    /// Send a hard kill and wait until the process is reaped
    pub async fn kill(&mut self) -> Result<()> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(port = self.port, ?status, "Engine already exited");
            }
            _ => {
                tracing::debug!(port = self.port, pid = ?self.pid(), "Killing engine process");
                self.child.kill().await?;
            }
        }

        for reader in self.readers.drain(..) {
            reader.abort();
        }
        Ok(())
    }
}

/// Forward engine output to the log and fire the ready signal on the marker line
async fn watch_output<R>(
    reader: R,
    stream: &'static str,
    marker: String,
    ready: ReadySender,
    tail: Option<StderrTail>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(stream, "Engine output read error: {}", e);
                break;
            }
        };

        tracing::debug!(target: "walker::engine::output", stream, "{}", line);

        if let Some(tail) = &tail {
            let mut tail = tail.lock().await;
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }

        if line.contains(&marker) {
            if let Some(tx) = ready.lock().await.take() {
                let _ = tx.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch() -> EngineLaunch {
        EngineLaunch {
            program: PathBuf::from("java"),
            leading_args: vec!["-jar".to_string(), "graphwalker.jar".to_string()],
            debug_level: Some("all".to_string()),
            models: vec![
                ModelRef::new("models/navigation.json", "random(vertex_coverage(100))"),
                ModelRef::new("models/checkout.json", "random(never)"),
            ],
            blocked: false,
            start_element: None,
            ready_marker: "[HttpServer] Started".to_string(),
            ready_timeout: Duration::from_secs(10),
            env: Vec::new(),
        }
    }

    #[test]
    fn test_args_encode_models_and_port() {
        let args = launch().args(8890);
        assert_eq!(
            args,
            vec![
                "-jar",
                "graphwalker.jar",
                "-d",
                "all",
                "online",
                "-s",
                "RESTFUL",
                "-p",
                "8890",
                "-m",
                "models/navigation.json",
                "random(vertex_coverage(100))",
                "-m",
                "models/checkout.json",
                "random(never)",
            ]
        );
    }

    #[test]
    fn test_args_include_filters() {
        let mut plan = launch();
        plan.debug_level = None;
        plan.blocked = true;
        plan.start_element = Some("v_homepage".to_string());

        let args = plan.args(8887);
        assert_eq!(args[2], "online");
        assert!(args.ends_with(&[
            "--blocked".to_string(),
            "-e".to_string(),
            "v_homepage".to_string()
        ]));
    }

    #[test]
    fn test_outcome_classification() {
        let timeout = Duration::from_secs(10);
        assert!(AttemptOutcome::Ready.into_error(8887, timeout).is_none());

        let err = AttemptOutcome::TimedOut.into_error(8887, timeout).unwrap();
        assert!(matches!(err, Error::EngineNotReady { port: 8887, timeout: t } if t == timeout));

        let err = AttemptOutcome::Exited {
            code: Some(1),
            stderr: "java.net.BindException: Address already in use".to_string(),
        }
        .into_error(8888, timeout)
        .unwrap();
        assert!(matches!(
            err,
            Error::EngineStartupFailed { port: 8888, code: Some(1), .. }
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_before_marker_captures_stderr() {
        let plan = EngineLaunch {
            program: PathBuf::from("sh"),
            leading_args: vec![
                "-c".to_string(),
                "echo 'Address already in use' >&2; exit 3".to_string(),
            ],
            debug_level: None,
            models: Vec::new(),
            blocked: false,
            start_element: None,
            ready_marker: "[HttpServer] Started".to_string(),
            ready_timeout: Duration::from_secs(5),
            env: Vec::new(),
        };

        let mut process = EngineProcess::spawn(&plan, 8887).unwrap();
        let outcome = process.wait_ready(plan.ready_timeout).await;
        match outcome {
            AttemptOutcome::Exited { code, stderr } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("Address already in use"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        process.kill().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_marker_on_stdout_is_ready() {
        let plan = EngineLaunch {
            program: PathBuf::from("sh"),
            leading_args: vec![
                "-c".to_string(),
                "echo 'INFO [HttpServer] Started'; sleep 30".to_string(),
            ],
            debug_level: None,
            models: Vec::new(),
            blocked: false,
            start_element: None,
            ready_marker: "[HttpServer] Started".to_string(),
            ready_timeout: Duration::from_secs(5),
            env: Vec::new(),
        };

        let mut process = EngineProcess::spawn(&plan, 8887).unwrap();
        let outcome = process.wait_ready(plan.ready_timeout).await;
        assert!(matches!(outcome, AttemptOutcome::Ready));
        assert!(process.is_running());
        process.kill().await.unwrap();
        assert!(!process.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_process_times_out() {
        let plan = EngineLaunch {
            program: PathBuf::from("sh"),
            leading_args: vec!["-c".to_string(), "sleep 30".to_string()],
            debug_level: None,
            models: Vec::new(),
            blocked: false,
            start_element: None,
            ready_marker: "[HttpServer] Started".to_string(),
            ready_timeout: Duration::from_millis(300),
            env: Vec::new(),
        };

        let mut process = EngineProcess::spawn(&plan, 8887).unwrap();
        let outcome = process.wait_ready(plan.ready_timeout).await;
        assert!(matches!(outcome, AttemptOutcome::TimedOut));
        process.kill().await.unwrap();
    }
}
