//! Configuration file handling

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::paths::{config_path, jar_candidates};
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Path-generation engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Relay server settings
    #[serde(default)]
    pub relay: RelayConfig,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,
}

/// How to launch and reach the path-generation engine
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Program to run (resolved through PATH when it is a bare name)
    #[serde(default = "default_engine_program")]
    pub program: PathBuf,

    /// Jar passed as `-jar <jar>`; set to an empty string to disable
    #[serde(default = "default_engine_jar")]
    pub jar: Option<PathBuf>,

    /// Extra arguments placed before the engine's own arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Host the engine REST service is reached on
    #[serde(default = "default_engine_host")]
    pub host: String,

    /// First port tried for the engine REST service
    #[serde(default = "default_engine_port")]
    pub port: u16,

    /// Number of consecutive ports tried before giving up
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,

    /// Output line that signals the REST listener is up
    #[serde(default = "default_ready_marker")]
    pub ready_marker: String,

    /// Value passed to the engine's `-d` debug flag
    #[serde(default = "default_debug_level")]
    pub debug_level: String,

    /// Extra environment variables for the engine process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            jar: default_engine_jar(),
            args: Vec::new(),
            host: default_engine_host(),
            port: default_engine_port(),
            max_port_attempts: default_max_port_attempts(),
            ready_marker: default_ready_marker(),
            debug_level: default_debug_level(),
            env: BTreeMap::new(),
        }
    }
}

fn default_engine_program() -> PathBuf {
    PathBuf::from("java")
}
fn default_engine_jar() -> Option<PathBuf> {
    Some(PathBuf::from("graphwalker.jar"))
}
fn default_engine_host() -> String {
    "127.0.0.1".to_string()
}
fn default_engine_port() -> u16 {
    8887
}
fn default_max_port_attempts() -> u16 {
    10
}
fn default_ready_marker() -> String {
    "[HttpServer] Started".to_string()
}
fn default_debug_level() -> String {
    "all".to_string()
}

/// Relay server settings
#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// Host the relay server binds to and the reporter connects to
    #[serde(default = "default_relay_host")]
    pub host: String,

    /// Port of the relay server
    #[serde(default = "default_relay_port")]
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_relay_host(),
            port: default_relay_port(),
        }
    }
}

fn default_relay_host() -> String {
    "localhost".to_string()
}
fn default_relay_port() -> u16 {
    5555
}

/// Timeout settings in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// Wait for the engine's ready marker, per port attempt
    #[serde(default = "default_engine_ready")]
    pub engine_ready_secs: u64,

    /// Timeout for a single engine REST request
    #[serde(default = "default_engine_request")]
    pub engine_request_secs: u64,

    /// Wait for the viewer's start acknowledgment, per receive
    #[serde(default = "default_viewer_ack")]
    pub viewer_ack_secs: u64,

    /// Number of acknowledgment receives before the run goes on without a viewer
    #[serde(default = "default_viewer_ack_attempts")]
    pub viewer_ack_attempts: u32,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            engine_ready_secs: default_engine_ready(),
            engine_request_secs: default_engine_request(),
            viewer_ack_secs: default_viewer_ack(),
            viewer_ack_attempts: default_viewer_ack_attempts(),
        }
    }
}

fn default_engine_ready() -> u64 {
    10
}
fn default_engine_request() -> u64 {
    30
}
fn default_viewer_ack() -> u64 {
    5
}
fn default_viewer_ack_attempts() -> u32 {
    12
}

impl Timeouts {
    pub fn engine_ready(&self) -> Duration {
        Duration::from_secs(self.engine_ready_secs)
    }

    pub fn engine_request(&self) -> Duration {
        Duration::from_secs(self.engine_request_secs)
    }

    pub fn viewer_ack(&self) -> Duration {
        Duration::from_secs(self.viewer_ack_secs)
    }
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                let content = std::fs::read_to_string(&path).map_err(|e| Error::FileRead {
                    path: path.display().to_string(),
                    error: e.to_string(),
                })?;
                return Self::parse(&content);
            }
        }
        Ok(Self::default())
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Self =
            toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))?;
        if config
            .engine
            .jar
            .as_ref()
            .is_some_and(|jar| jar.as_os_str().is_empty())
        {
            config.engine.jar = None;
        }
        if config.engine.max_port_attempts == 0 {
            return Err(Error::Config(
                "engine.max_port_attempts must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }
}

impl EngineConfig {
    /// Resolve the program and leading arguments used to launch the engine
    ///
    /// A bare program name is looked up in PATH. The jar, when configured,
    /// must exist in one of the candidate locations.
    pub fn resolve_command(&self) -> Result<(PathBuf, Vec<String>)> {
        let program = if self.program.components().count() == 1 {
            which::which(&self.program).unwrap_or_else(|_| self.program.clone())
        } else {
            self.program.clone()
        };

        let mut args = Vec::new();
        if let Some(jar) = &self.jar {
            let candidates = jar_candidates(jar);
            let found = candidates.iter().find(|path| path.exists()).ok_or_else(|| {
                let searched: Vec<String> =
                    candidates.iter().map(|p| p.display().to_string()).collect();
                Error::jar_not_found(&searched)
            })?;
            args.push("-jar".to_string());
            args.push(found.display().to_string());
        }
        args.extend(self.args.iter().cloned());

        Ok((program, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.engine.port, 8887);
        assert_eq!(config.engine.max_port_attempts, 10);
        assert_eq!(config.engine.ready_marker, "[HttpServer] Started");
        assert_eq!(config.relay.port, 5555);
        assert_eq!(config.timeouts.engine_ready_secs, 10);
        assert_eq!(config.timeouts.viewer_ack_secs, 5);
        assert_eq!(config.timeouts.viewer_ack_attempts, 12);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::parse(
            r#"
[engine]
port = 9000
jar = ""

[timeouts]
engine_ready_secs = 3
"#,
        )
        .unwrap();
        assert_eq!(config.engine.port, 9000);
        assert!(config.engine.jar.is_none());
        assert_eq!(config.engine.host, "127.0.0.1");
        assert_eq!(config.timeouts.engine_ready_secs, 3);
        assert_eq!(config.timeouts.engine_request_secs, 30);
    }

    #[test]
    fn test_engine_env_table() {
        let config = Config::parse(
            r#"
[engine.env]
JAVA_OPTS = "-Xmx512m"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.env["JAVA_OPTS"], "-Xmx512m");
        assert!(Config::default().engine.env.is_empty());
    }

    #[test]
    fn test_zero_port_attempts_rejected() {
        let err = Config::parse("[engine]\nmax_port_attempts = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_toml() {
        let err = Config::parse("[engine\nport = 1").unwrap_err();
        assert!(matches!(err, Error::ConfigParse(_)));
    }

    #[test]
    fn test_missing_jar_reports_searched_paths() {
        let engine = EngineConfig {
            jar: Some(PathBuf::from("definitely-not-here-graphwalker.jar")),
            ..Default::default()
        };
        let err = engine.resolve_command().unwrap_err();
        match err {
            Error::EngineJarNotFound { searched } => {
                assert!(searched.contains("definitely-not-here-graphwalker.jar"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_without_jar_keeps_args() {
        let engine = EngineConfig {
            program: PathBuf::from("/opt/engine/bin/engine"),
            jar: None,
            args: vec!["--quiet".to_string()],
            ..Default::default()
        };
        let (program, args) = engine.resolve_command().unwrap();
        assert_eq!(program, PathBuf::from("/opt/engine/bin/engine"));
        assert_eq!(args, vec!["--quiet".to_string()]);
    }
}
