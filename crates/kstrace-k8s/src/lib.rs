//! Kubernetes integration for kstrace
//!
//! This crate owns everything that talks to the API server: client setup,
//! the scratch namespace, privileged companion pods, readiness polling,
//! remote exec and workload resolution.

mod client;
mod cluster;
mod error;
mod exec;
mod namespace;
mod pod;
mod resolve;
mod wait;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use client::{DEFAULT_NAMESPACE, KubeClient};
pub use cluster::{ClusterApi, ClusterError, KubeCluster};
pub use error::CleanupError;
pub use exec::{
    AttachOptions, BoxError, BoxReader, BoxWriter, ExecChannel, ExecError, ExecRequest,
    ExecStreams, ExecTransport, KubeExecTransport, RemoteCommandExecutor, exit_code_from_status,
    shell_argv,
};
pub use namespace::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, NamespaceManager};
pub use pod::{
    SOCKET_MOUNT_PATH, TRACER_CAPABILITIES, TRACER_CONTAINER_NAME, TracerPod, TracerPodFactory,
    TracerPodOptions,
};
pub use resolve::{
    ResolveError, WorkloadKind, WorkloadRef, WorkloadResolver, label_selector, target_from_pod,
};
pub use wait::{Clock, PodReadinessWaiter, TokioClock, WaitError};
