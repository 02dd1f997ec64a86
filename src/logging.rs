//! Log level and destination

use std::fs::OpenOptions;
use std::str::FromStr;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Parse `--log-level`
pub fn parse_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level).map_err(|_| {
        anyhow::anyhow!(
            "Unknown log level '{}'. Available options are [off, error, warn, info, debug, trace]",
            level
        )
    })
}

/// Install the global subscriber. `RUST_LOG` refines the level given on the
/// command line; `log_file` of `-` means stderr.
pub fn init(level: &str, log_file: &str) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(parse_level(level)?.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if log_file == "-" {
        builder.with_writer(std::io::stderr).try_init()
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| {
                format!("Unable to open log file '{}'. Ensure the path is valid", log_file)
            })?;
        builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
    };

    installed.map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))?;
    tracing::info!(level = %level, "Running with log level");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info").unwrap(), LevelFilter::INFO);
        assert_eq!(parse_level("DEBUG").unwrap(), LevelFilter::DEBUG);
        assert_eq!(parse_level("off").unwrap(), LevelFilter::OFF);
        assert!(parse_level("loud").is_err());
    }
}
