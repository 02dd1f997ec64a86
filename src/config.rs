//! Optional TOML configuration file and the merge with command-line flags

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use kstrace_types::{OutputRoot, SessionConfig};

/// Defaults for the session, read from `~/.kstrace/config.toml` or `--config`.
///
/// Durations use the same syntax as `--trace-timeout` (`90s`, `1m 30s`, `0s`).
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub image: Option<String>,
    pub socket_path: Option<String>,
    pub output: Option<String>,
    pub command: Option<String>,
    #[serde(with = "humantime_serde")]
    pub trace_timeout: Option<Duration>,
    pub namespace_prefix: Option<String>,
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    pub max_parallel: Option<usize>,
}

impl FileConfig {
    pub fn default_path() -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(home.join(".kstrace").join("config.toml"))
    }

    /// Load an explicit file, or the default one if it exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// Values given on the command line; each one beats the config file
#[derive(Debug, Default)]
pub struct Overrides {
    pub image: Option<String>,
    pub socket_path: Option<String>,
    pub output: Option<String>,
    pub command: Option<String>,
    pub trace_timeout: Option<Duration>,
    pub max_parallel: Option<usize>,
}

/// Build the immutable session settings: flag, then file, then built-in default
pub fn session_config(cli: Overrides, file: FileConfig) -> Result<SessionConfig> {
    let defaults = SessionConfig::default();

    let trace_timeout = cli.trace_timeout.or(file.trace_timeout);

    let max_parallel = cli.max_parallel.or(file.max_parallel);
    if max_parallel == Some(0) {
        anyhow::bail!("max-parallel must be at least 1");
    }

    let command_template = cli.command.or(file.command).unwrap_or(defaults.command_template);
    if command_template.trim().is_empty() {
        anyhow::bail!("trace command must not be empty");
    }

    Ok(SessionConfig {
        image: cli.image.or(file.image).unwrap_or(defaults.image),
        socket_path: cli
            .socket_path
            .or(file.socket_path)
            .unwrap_or(defaults.socket_path),
        command_template,
        trace_timeout: trace_timeout.filter(|t| !t.is_zero()),
        output: cli
            .output
            .or(file.output)
            .map(|o| OutputRoot::from(o.as_str()))
            .unwrap_or(defaults.output),
        namespace_prefix: file.namespace_prefix.unwrap_or(defaults.namespace_prefix),
        ready_timeout: file.ready_timeout.unwrap_or(defaults.ready_timeout),
        poll_interval: file
            .poll_interval
            .filter(|d| !d.is_zero())
            .unwrap_or(defaults.poll_interval),
        max_parallel,
    })
}
