//! Configuration for the hostpty session driver.
//!
//! Settings are read from `~/.hostpty/config.toml`. Every key is optional:
//!
//! ```toml
//! # Program to run when none is given on the command line
//! shell = "/bin/bash"
//! args = ["-l"]
//! working_dir = "/srv/work"
//!
//! [env]
//! TERM = "xterm-256color"
//!
//! [log]
//! level = "debug"            # overridden by RUST_LOG
//! file = "/tmp/hostpty.log"  # default: ~/.hostpty/hostpty.log
//!
//! [session]
//! rows = 40                  # default: local console size
//! cols = 120
//! timeout_secs = 3600        # cancel the program after this long
//! kill_grace_ms = 2000       # hang up first, kill after this delay
//! resize_poll_ms = 250
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default program
    pub shell: Option<String>,
    /// Arguments for the default program
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the program
    pub env: BTreeMap<String, String>,
    pub log: LogConfig,
    pub session: SessionConfig,
}

/// Log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub rows: Option<u16>,
    pub cols: Option<u16>,
    pub timeout_secs: Option<u64>,
    /// Grace period between hangup and kill on cancellation
    pub kill_grace_ms: Option<u64>,
    /// How often the local console size is checked
    pub resize_poll_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rows: None,
            cols: None,
            timeout_secs: None,
            kill_grace_ms: None,
            resize_poll_ms: 250,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load() -> Self {
        if let Some(path) = Self::get_config_path() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => return config,
                    Err(e) => eprintln!("Warning: {}", e),
                }
            }
        }
        Self::default()
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
    }

    /// Program to run when the command line names none
    pub fn default_shell(&self) -> String {
        if let Some(shell) = &self.shell {
            return shell.clone();
        }
        if cfg!(windows) {
            std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
        } else {
            std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
        }
    }

    /// Log file location
    pub fn log_path(&self) -> PathBuf {
        if let Some(file) = &self.log.file {
            return file.clone();
        }
        config_dir()
            .map(|dir| dir.join("hostpty.log"))
            .unwrap_or_else(|| PathBuf::from("hostpty.log"))
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }
}

fn config_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".hostpty"))
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.shell.is_none());
        assert!(config.env.is_empty());
        assert_eq!(config.log.level, "info");
        assert_eq!(config.session.resize_poll_ms, 250);
        assert_eq!(config.session.timeout_secs, None);
    }

    #[test]
    fn test_partial_file() {
        let config: Config = toml::from_str(
            r#"
            shell = "/bin/zsh"
            args = ["-l"]

            [env]
            TERM = "xterm-256color"

            [session]
            timeout_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(config.default_shell(), "/bin/zsh");
        assert_eq!(config.args, vec!["-l"]);
        assert_eq!(config.env.get("TERM").map(String::as_str), Some("xterm-256color"));
        assert_eq!(config.session.timeout_secs, Some(60));
        assert_eq!(config.session.resize_poll_ms, 250);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[log]\nlevel = \"debug\"\nfile = \"/tmp/x.log\"").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.log_path(), PathBuf::from("/tmp/x.log"));
    }

    #[test]
    fn test_load_from_reports_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "shell = [").unwrap();
        let err = Config::load_from(file.path()).unwrap_err();
        assert!(err.starts_with("Failed to parse"), "{}", err);

        let err = Config::load_from(Path::new("/nonexistent/hostpty.toml")).unwrap_err();
        assert!(err.starts_with("Failed to read"), "{}", err);
    }
}
