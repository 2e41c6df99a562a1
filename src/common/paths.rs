//! Configuration and data paths
//!
//! Uses the directories crate for platform-appropriate locations:
//! - Linux: `~/.config/walker-live/` and `~/.local/share/walker-live/`
//! - macOS: `~/Library/Application Support/walker-live/`
//! - Windows: `%APPDATA%\walker-live\`

use std::io;
use std::path::PathBuf;

/// Name used for the configuration and data directories
const APP_NAME: &str = "walker-live";

/// Get the configuration directory path
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the path to the configuration file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.toml"))
}

/// Get the path to the log directory
pub fn log_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.data_dir().join("logs"))
}

/// Ensure the log directory exists
pub fn ensure_log_dir() -> io::Result<Option<PathBuf>> {
    if let Some(dir) = log_dir() {
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(Some(dir))
    } else {
        Ok(None)
    }
}

/// Candidate locations for the engine jar, in search order
///
/// A relative jar path is looked up in the working directory first, then
/// in the configuration directory. Absolute paths are used as given.
pub fn jar_candidates(jar: &std::path::Path) -> Vec<PathBuf> {
    if jar.is_absolute() {
        return vec![jar.to_path_buf()];
    }

    let mut candidates = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(jar));
    }
    if let Some(dir) = config_dir() {
        candidates.push(dir.join(jar));
    }
    candidates
}
