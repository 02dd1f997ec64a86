//! Shared types for kstrace
//!
//! This crate contains data structures used across multiple kstrace crates.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// Defaults
// ============================================================================

/// Image used for companion pods; must ship `sh`, `crictl` and the trace tool
pub const DEFAULT_IMAGE: &str = "quay.io/mwasher/crictl:0.0.1";

/// Location of the CRI socket on the node
pub const DEFAULT_SOCKET_PATH: &str = "/run/crio/crio.sock";

/// Command run against every resolved container PID
pub const DEFAULT_COMMAND: &str = "strace -fp {target_pid}";

/// Directory that receives `<pod>/<container>.log` files
pub const DEFAULT_OUTPUT_DIR: &str = "strace-collection";

/// Generated-name prefix for the scratch namespace
pub const DEFAULT_NAMESPACE_PREFIX: &str = "kstrace";

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Targets
// ============================================================================

/// A container inside a target pod
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TargetContainer {
    pub name: String,
    /// Runtime-native id as reported in the pod status, e.g. `cri-o://3f2a...`.
    /// `None` until the container has been started by the kubelet.
    pub container_id: Option<String>,
}

impl TargetContainer {
    pub fn new(name: impl Into<String>, container_id: Option<String>) -> Self {
        Self {
            name: name.into(),
            container_id,
        }
    }
}

/// A pod whose containers will be traced
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TargetPod {
    pub name: String,
    pub namespace: String,
    /// Node the pod is scheduled on; the companion pod is pinned here
    pub node_name: String,
    pub containers: Vec<TargetContainer>,
}

impl TargetPod {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        node_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            node_name: node_name.into(),
            containers: Vec::new(),
        }
    }

    /// Append a container, keeping status order
    pub fn with_container(mut self, name: impl Into<String>, container_id: &str) -> Self {
        self.containers
            .push(TargetContainer::new(name, Some(container_id.to_string())));
        self
    }

    /// `namespace/name`, used in log fields and reports
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

// ============================================================================
// Session configuration
// ============================================================================

/// Where captured trace output goes
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputRoot {
    /// The process's own stdout/stderr (`-` on the command line)
    Std,
    /// `<dir>/<pod>/<container>.log`
    Directory(PathBuf),
}

impl OutputRoot {
    pub fn is_std(&self) -> bool {
        matches!(self, Self::Std)
    }
}

impl From<&str> for OutputRoot {
    fn from(s: &str) -> Self {
        if s == "-" {
            Self::Std
        } else {
            Self::Directory(PathBuf::from(s))
        }
    }
}

impl fmt::Display for OutputRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Std => f.write_str("-"),
            Self::Directory(dir) => write!(f, "{}", dir.display()),
        }
    }
}

/// Immutable settings for one trace session.
///
/// Built once at the command-line boundary and shared by every tracer.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub image: String,
    pub socket_path: String,
    pub command_template: String,
    /// `None` runs the trace command until it exits on its own
    pub trace_timeout: Option<Duration>,
    pub output: OutputRoot,
    pub namespace_prefix: String,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    /// Upper bound on concurrently running tracers; `None` means one per pod
    pub max_parallel: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            command_template: DEFAULT_COMMAND.to_string(),
            trace_timeout: None,
            output: OutputRoot::from(DEFAULT_OUTPUT_DIR),
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_parallel: None,
        }
    }
}

// ============================================================================
// Tracer lifecycle
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TracerState {
    Created,
    PodLaunched,
    PidsResolved,
    Tracing,
    Completed,
    Failed,
    Cleaned,
}

impl TracerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cleaned)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::PodLaunched => "pod-launched",
            Self::PidsResolved => "pids-resolved",
            Self::Tracing => "tracing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cleaned => "cleaned",
        }
    }
}

impl fmt::Display for TracerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Result of running the trace command against one container
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContainerTrace {
    pub container: String,
    pub pid: u32,
    /// Exit status of the remote command (after the timeout wrapper, if any)
    pub exit_code: i32,
    /// Log file, or `None` when written to the standard streams
    pub output: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PodOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Per-pod section of the session report
#[derive(Clone, Debug, Serialize)]
pub struct PodReport {
    pub pod: String,
    pub namespace: String,
    pub node: String,
    /// Name of the companion pod, once the API server assigned one
    pub tracer_pod: Option<String>,
    /// State reached before cleanup
    pub final_state: TracerState,
    pub outcome: PodOutcome,
    pub traces: Vec<ContainerTrace>,
    /// Set when the companion pod could not be deleted
    pub cleanup_warning: Option<String>,
}

impl PodReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == PodOutcome::Succeeded
    }
}

/// Aggregate result of one `kstrace` invocation
#[derive(Clone, Debug, Serialize)]
pub struct SessionReport {
    pub namespace: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per target pod, in input order
    pub pods: Vec<PodReport>,
    /// Set when the scratch namespace could not be deleted
    pub namespace_warning: Option<String>,
}

impl SessionReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &PodReport> {
        self.pods.iter().filter(|p| p.succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PodReport> {
        self.pods.iter().filter(|p| !p.succeeded())
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    /// Every resource that may need manual deletion
    pub fn leaks(&self) -> Vec<&str> {
        self.pods
            .iter()
            .filter_map(|p| p.cleanup_warning.as_deref())
            .chain(self.namespace_warning.as_deref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod_report(name: &str, outcome: PodOutcome) -> PodReport {
        PodReport {
            pod: name.to_string(),
            namespace: "default".to_string(),
            node: "node-a".to_string(),
            tracer_pod: None,
            final_state: TracerState::Cleaned,
            outcome,
            traces: Vec::new(),
            cleanup_warning: None,
        }
    }

    #[test]
    fn test_output_root_dash_is_std() {
        assert_eq!(OutputRoot::from("-"), OutputRoot::Std);
        assert_eq!(
            OutputRoot::from("traces"),
            OutputRoot::Directory(PathBuf::from("traces"))
        );
        assert_eq!(OutputRoot::Std.to_string(), "-");
    }

    #[test]
    fn test_terminal_states() {
        assert!(TracerState::Completed.is_terminal());
        assert!(TracerState::Failed.is_terminal());
        assert!(TracerState::Cleaned.is_terminal());
        assert!(!TracerState::Tracing.is_terminal());
        assert!(!TracerState::PodLaunched.is_terminal());
    }

    #[test]
    fn test_report_failures_and_leaks() {
        let mut failed = pod_report(
            "web-1",
            PodOutcome::Failed {
                reason: "probe failed".to_string(),
            },
        );
        failed.cleanup_warning = Some("pod kstrace-abc leaked".to_string());

        let report = SessionReport {
            namespace: "kstrace-xyz".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            pods: vec![pod_report("web-0", PodOutcome::Succeeded), failed],
            namespace_warning: Some("namespace kstrace-xyz leaked".to_string()),
        };

        assert!(report.has_failures());
        assert_eq!(report.succeeded().count(), 1);
        assert_eq!(report.failed().next().map(|p| p.pod.as_str()), Some("web-1"));
        assert_eq!(
            report.leaks(),
            vec!["pod kstrace-abc leaked", "namespace kstrace-xyz leaked"]
        );
    }

    #[test]
    fn test_target_pod_key_and_containers() {
        let pod = TargetPod::new("web-0", "shop", "node-a")
            .with_container("app", "cri-o://abc")
            .with_container("sidecar", "cri-o://def");
        assert_eq!(pod.key(), "shop/web-0");
        assert_eq!(pod.containers[1].name, "sidecar");
        assert_eq!(pod.containers[1].container_id.as_deref(), Some("cri-o://def"));
    }
}
