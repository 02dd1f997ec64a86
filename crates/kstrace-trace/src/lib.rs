//! Tracer lifecycle for kstrace
//!
//! A session creates one scratch namespace, launches a privileged companion
//! pod next to every target pod, resolves each target container's host PID
//! through the node's container runtime, and streams a trace command's
//! output into per-container sinks. Every companion pod and the namespace
//! are removed afterwards, including when the process is interrupted.

mod cleanup;
mod orchestrator;
mod pid;
mod sink;
mod template;
mod tracer;

pub use cleanup::{CleanupCoordinator, INTERRUPTED_EXIT_CODE, SignalGuard};
pub use orchestrator::{SessionError, TraceOrchestrator};
pub use pid::{
    ContainerPidResolver, PidError, inspect_command, parse_inspect_pid, strip_runtime_prefix,
};
pub use sink::{OutputSink, OutputSinks, SinkError, log_path};
pub use template::{TARGET_PID_PLACEHOLDER, render_command, with_timeout};
pub use tracer::{CompanionCleanup, TraceContext, TraceError, Tracer};
