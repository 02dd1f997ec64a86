//! Destinations for captured trace output

use std::io;
use std::path::{Path, PathBuf};

use kstrace_k8s::BoxWriter;
use kstrace_types::OutputRoot;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("standard streams already carry output for {claimed}; cannot also write {requested}")]
    StdStreamInUse { claimed: String, requested: String },

    #[error("{0:?} cannot be used as an output file name")]
    UnsafeName(String),

    #[error("unable to open output {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Writers for one container's remote stdout and stderr
pub struct OutputSink {
    pub stdout: BoxWriter,
    pub stderr: BoxWriter,
    /// Log file both streams append to; `None` for the standard streams
    pub path: Option<PathBuf>,
}

/// Hands out sinks under one output root for the whole session.
///
/// The process's standard streams can serve a single (pod, container) pair;
/// any other pair asking for them is refused so outputs never interleave.
pub struct OutputSinks {
    root: OutputRoot,
    std_claim: Mutex<Option<(String, String)>>,
}

impl OutputSinks {
    pub fn new(root: OutputRoot) -> Self {
        Self {
            root,
            std_claim: Mutex::new(None),
        }
    }

    pub async fn resolve(&self, pod: &str, container: &str) -> Result<OutputSink, SinkError> {
        match &self.root {
            OutputRoot::Std => {
                self.claim_std(pod, container)?;
                Ok(OutputSink {
                    stdout: Box::new(tokio::io::stdout()),
                    stderr: Box::new(tokio::io::stderr()),
                    path: None,
                })
            }
            OutputRoot::Directory(dir) => open_log(dir, pod, container).await,
        }
    }

    fn claim_std(&self, pod: &str, container: &str) -> Result<(), SinkError> {
        let mut claim = self.std_claim.lock();
        match claim.as_ref() {
            Some((p, c)) if p == pod && c == container => Ok(()),
            Some((p, c)) => Err(SinkError::StdStreamInUse {
                claimed: format!("{p}/{c}"),
                requested: format!("{pod}/{container}"),
            }),
            None => {
                *claim = Some((pod.to_string(), container.to_string()));
                Ok(())
            }
        }
    }
}

/// A single path component that stays inside its parent directory
fn check_name(name: &str) -> Result<&str, SinkError> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains(std::path::MAIN_SEPARATOR)
        || name.contains('\0');

    if unsafe_name {
        Err(SinkError::UnsafeName(name.to_string()))
    } else {
        Ok(name)
    }
}

/// `<dir>/<pod>/<container>.log`, created if missing and opened for append
pub fn log_path(dir: &Path, pod: &str, container: &str) -> Result<PathBuf, SinkError> {
    Ok(dir
        .join(check_name(pod)?)
        .join(format!("{}.log", check_name(container)?)))
}

async fn open_log(dir: &Path, pod: &str, container: &str) -> Result<OutputSink, SinkError> {
    let path = log_path(dir, pod, container)?;
    let io_err = |source| SinkError::Io {
        path: path.clone(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(io_err)?;
    let stderr = file.try_clone().await.map_err(io_err)?;

    tracing::debug!(path = %path.display(), "Opened trace output file");

    Ok(OutputSink {
        stdout: Box::new(file),
        stderr: Box::new(stderr),
        path: Some(path),
    })
}
