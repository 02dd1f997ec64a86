//! Per-pod trace pipeline

use std::sync::Arc;

use kstrace_k8s::{
    CleanupError, ClusterApi, ClusterError, Clock, ExecError, ExecRequest, ExecStreams,
    ExecTransport, PodReadinessWaiter, RemoteCommandExecutor, TRACER_CONTAINER_NAME, TracerPod,
    TracerPodFactory, TracerPodOptions, WaitError,
};
use kstrace_types::{
    ContainerTrace, PodOutcome, PodReport, SessionConfig, TargetPod, TracerState,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::pid::{ContainerPidResolver, PidError};
use crate::sink::{OutputSinks, SinkError};
use crate::template::{render_command, with_timeout};

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("unable to create tracer pod: {0}")]
    Launch(#[source] ClusterError),

    #[error(transparent)]
    NotReady(#[from] WaitError),

    #[error(transparent)]
    Pids(#[from] PidError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("trace of container {container:?} failed: {source}")]
    Exec {
        container: String,
        #[source]
        source: ExecError,
    },

    #[error("trace interrupted")]
    Cancelled,
}

/// Collaborators shared by every tracer of one session
pub struct TraceContext {
    pub config: Arc<SessionConfig>,
    pub factory: TracerPodFactory,
    pub waiter: PodReadinessWaiter,
    pub resolver: ContainerPidResolver,
    pub executor: RemoteCommandExecutor,
    pub sinks: OutputSinks,
}

impl TraceContext {
    pub fn new(
        config: Arc<SessionConfig>,
        cluster: Arc<dyn ClusterApi>,
        transport: Arc<dyn ExecTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let executor = RemoteCommandExecutor::new(transport);
        Self {
            factory: TracerPodFactory::new(cluster.clone()),
            waiter: PodReadinessWaiter::new(cluster, clock, config.poll_interval),
            resolver: ContainerPidResolver::new(executor.clone()),
            executor,
            sinks: OutputSinks::new(config.output.clone()),
            config,
        }
    }
}

/// Deletes a tracer's companion pod at most once, from whichever path gets
/// there first (normal completion, failure, or the interrupt handler).
#[derive(Clone)]
pub struct CompanionCleanup {
    slot: Arc<Mutex<Option<TracerPod>>>,
    ctx: Arc<TraceContext>,
}

impl CompanionCleanup {
    pub async fn run(&self) -> Result<(), CleanupError> {
        // Taken before the await so a concurrent caller sees an empty slot
        let pod = self.slot.lock().take();
        match pod {
            Some(pod) => self.ctx.factory.delete(&pod).await,
            None => Ok(()),
        }
    }
}

/// Drives one target pod through launch, readiness, PID resolution and
/// tracing, and always ends by removing its companion pod.
pub struct Tracer {
    target: TargetPod,
    namespace: String,
    ctx: Arc<TraceContext>,
    state: TracerState,
    companion: Arc<Mutex<Option<TracerPod>>>,
    tracer_pod: Option<String>,
    pids: Vec<u32>,
    traces: Vec<ContainerTrace>,
}

impl Tracer {
    pub fn new(target: TargetPod, namespace: impl Into<String>, ctx: Arc<TraceContext>) -> Self {
        Self {
            target,
            namespace: namespace.into(),
            ctx,
            state: TracerState::Created,
            companion: Arc::new(Mutex::new(None)),
            tracer_pod: None,
            pids: Vec::new(),
            traces: Vec::new(),
        }
    }

    pub fn state(&self) -> TracerState {
        self.state
    }

    /// Host PIDs, index-aligned with the target's containers once resolved
    pub fn pids(&self) -> &[u32] {
        &self.pids
    }

    pub fn cleanup_handle(&self) -> CompanionCleanup {
        CompanionCleanup {
            slot: Arc::clone(&self.companion),
            ctx: Arc::clone(&self.ctx),
        }
    }

    /// Run the pipeline until it finishes, fails or `cancel` fires.
    ///
    /// Cancellation drops whatever is in flight, including an open exec
    /// stream; the remote process goes away with its companion pod.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), TraceError> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TraceError::Cancelled),
            result = self.pipeline() => result,
        };

        self.state = match result {
            Ok(()) => TracerState::Completed,
            Err(_) => TracerState::Failed,
        };
        result
    }

    /// Delete the companion pod if one was created. Safe to call repeatedly.
    pub async fn cleanup(&mut self) -> Result<(), CleanupError> {
        let result = self.cleanup_handle().run().await;
        self.state = TracerState::Cleaned;
        result
    }

    /// Start, clean up and summarize
    pub async fn run(mut self, cancel: &CancellationToken) -> PodReport {
        let outcome = match self.start(cancel).await {
            Ok(()) => {
                tracing::info!(pod = %self.target.key(), "Strace complete");
                PodOutcome::Succeeded
            }
            Err(e) => {
                tracing::error!(pod = %self.target.key(), state = %self.state, "{e}");
                PodOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        let final_state = self.state;
        debug_assert!(final_state.is_terminal());

        let cleanup_warning = self.cleanup().await.err().map(|e| e.to_string());

        PodReport {
            pod: self.target.name,
            namespace: self.target.namespace,
            node: self.target.node_name,
            tracer_pod: self.tracer_pod,
            final_state,
            outcome,
            traces: self.traces,
            cleanup_warning,
        }
    }

    async fn pipeline(&mut self) -> Result<(), TraceError> {
        let ctx = Arc::clone(&self.ctx);
        let config = &ctx.config;

        let companion = ctx
            .factory
            .create(
                &self.namespace,
                &TracerPodOptions {
                    node_name: &self.target.node_name,
                    image: &config.image,
                    socket_path: &config.socket_path,
                },
            )
            .await
            .map_err(TraceError::Launch)?;
        *self.companion.lock() = Some(companion.clone());
        self.tracer_pod = Some(companion.name.clone());
        self.state = TracerState::PodLaunched;

        ctx.waiter
            .wait_running(&companion.namespace, &companion.name, config.ready_timeout)
            .await?;

        self.pids = ctx
            .resolver
            .resolve(&companion, &self.target.name, &self.target.containers)
            .await?;
        self.state = TracerState::PidsResolved;

        self.state = TracerState::Tracing;
        for (container, pid) in self.target.containers.iter().zip(&self.pids) {
            let command = with_timeout(
                &render_command(&config.command_template, *pid),
                config.trace_timeout,
            );
            let mut sink = ctx.sinks.resolve(&self.target.name, &container.name).await?;

            tracing::info!(
                pod = %self.target.key(),
                container = %container.name,
                pid,
                command = %command,
                output = %sink
                    .path
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |p| p.display().to_string()),
                "Running trace"
            );

            let exit_code = ctx
                .executor
                .execute_streaming(
                    &ExecRequest {
                        namespace: &companion.namespace,
                        pod: &companion.name,
                        container: Some(TRACER_CONTAINER_NAME),
                        command: &command,
                        tty: false,
                    },
                    ExecStreams {
                        stdout: Some(&mut sink.stdout),
                        stderr: Some(&mut sink.stderr),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|source| TraceError::Exec {
                    container: container.name.clone(),
                    source,
                })?;

            if exit_code != 0 {
                tracing::warn!(
                    pod = %self.target.key(),
                    container = %container.name,
                    exit_code,
                    "Trace command exited with non-zero status"
                );
            }

            self.traces.push(ContainerTrace {
                container: container.name.clone(),
                pid: *pid,
                exit_code,
                output: sink.path,
            });
        }

        Ok(())
    }
}
