//! One trace session across many pods

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use kstrace_k8s::{ClusterApi, ClusterError, Clock, ExecTransport, NamespaceManager};
use kstrace_types::{PodOutcome, PodReport, SessionConfig, SessionReport, TargetPod, TracerState};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cleanup::CleanupCoordinator;
use crate::tracer::{CompanionCleanup, TraceContext, Tracer};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no pods to trace")]
    NoTargets,

    #[error(
        "output to standard streams needs exactly one pod with one container, got {pods} pod(s) with {containers} container(s); use a directory output instead"
    )]
    SharedStdStream { pods: usize, containers: usize },

    #[error("unable to create trace namespace: {0}")]
    Namespace(#[source] ClusterError),
}

/// Runs one tracer per target pod inside a single scratch namespace.
///
/// The namespace is created before any tracer starts, registered with the
/// cleanup coordinator ahead of every tracer, and deleted exactly once after
/// all tracers have finished.
pub struct TraceOrchestrator {
    ctx: Arc<TraceContext>,
    namespaces: Arc<NamespaceManager>,
    coordinator: Arc<CleanupCoordinator>,
}

impl TraceOrchestrator {
    pub fn new(
        config: Arc<SessionConfig>,
        cluster: Arc<dyn ClusterApi>,
        transport: Arc<dyn ExecTransport>,
        clock: Arc<dyn Clock>,
        coordinator: Arc<CleanupCoordinator>,
    ) -> Self {
        Self {
            namespaces: Arc::new(NamespaceManager::new(cluster.clone())),
            ctx: Arc::new(TraceContext::new(config, cluster, transport, clock)),
            coordinator,
        }
    }

    /// Reject sessions that cannot start
    pub fn validate(targets: &[TargetPod], config: &SessionConfig) -> Result<(), SessionError> {
        if targets.is_empty() {
            return Err(SessionError::NoTargets);
        }

        let containers: usize = targets.iter().map(|t| t.containers.len()).sum();
        if config.output.is_std() && (targets.len() > 1 || containers > 1) {
            return Err(SessionError::SharedStdStream {
                pods: targets.len(),
                containers,
            });
        }

        Ok(())
    }

    pub async fn run(&self, targets: Vec<TargetPod>) -> Result<SessionReport, SessionError> {
        let config = &self.ctx.config;
        Self::validate(&targets, config)?;

        let started_at = Utc::now();
        let namespace = self
            .namespaces
            .create_scratch_namespace(&config.namespace_prefix)
            .await
            .map_err(SessionError::Namespace)?;

        let namespace_slot = Arc::new(Mutex::new(Some(namespace.clone())));
        self.coordinator.register(format!("namespace {namespace}"), {
            let slot = namespace_slot.clone();
            let manager = self.namespaces.clone();
            move || {
                let name = slot.lock().take();
                let manager = manager.clone();
                async move {
                    match name {
                        Some(name) => manager.delete_scratch_namespace(&name).await,
                        None => Ok(()),
                    }
                }
            }
        });

        let cancel = self.coordinator.token();
        let limiter = config.max_parallel.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut cleanups: Vec<CompanionCleanup> = Vec::with_capacity(targets.len());
        let mut set = JoinSet::new();

        tracing::info!(
            namespace = %namespace,
            pods = targets.len(),
            max_parallel = ?config.max_parallel,
            "Starting trace session"
        );

        for (index, target) in targets.iter().enumerate() {
            let tracer = Tracer::new(target.clone(), namespace.clone(), self.ctx.clone());
            let cleanup = tracer.cleanup_handle();
            self.coordinator.register(format!("tracer pod for {}", target.key()), {
                let cleanup = cleanup.clone();
                move || {
                    let cleanup = cleanup.clone();
                    async move { cleanup.run().await }
                }
            });
            cleanups.push(cleanup);

            let cancel = cancel.clone();
            let limiter = limiter.clone();
            set.spawn(async move {
                let _permit = match limiter {
                    Some(limiter) => tokio::select! {
                        permit = limiter.acquire_owned() => permit.ok(),
                        _ = cancel.cancelled() => None,
                    },
                    None => None,
                };

                let report = AssertUnwindSafe(tracer.run(&cancel)).catch_unwind().await;
                (index, report)
            });
        }

        let mut reports: HashMap<usize, PodReport> = HashMap::with_capacity(targets.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, Ok(report))) => {
                    reports.insert(index, report);
                }
                Ok((index, Err(panic))) => {
                    let reason = panic_message(panic.as_ref());
                    tracing::error!(pod = %targets[index].key(), "Tracer panicked: {reason}");
                    reports.insert(index, failed_report(&targets[index], format!("tracer panicked: {reason}")));
                }
                Err(e) => {
                    tracing::error!(error = %e, "Tracer task ended abnormally");
                }
            }
        }

        // Every worker is done. Companions of workers that never reached their
        // own cleanup are removed here; the rest are already gone.
        let mut pods = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            let mut report = reports
                .remove(&index)
                .unwrap_or_else(|| failed_report(target, "tracer task was aborted".to_string()));
            if let Err(e) = cleanups[index].run().await {
                report.cleanup_warning = Some(e.to_string());
            }
            pods.push(report);
        }

        let name = namespace_slot.lock().take();
        let namespace_warning = match name {
            Some(name) => self
                .namespaces
                .delete_scratch_namespace(&name)
                .await
                .err()
                .map(|e| e.to_string()),
            None => None,
        };

        let report = SessionReport {
            namespace,
            started_at,
            finished_at: Utc::now(),
            pods,
            namespace_warning,
        };

        tracing::info!(
            succeeded = report.succeeded().count(),
            failed = report.failed().count(),
            "Trace session finished"
        );
        Ok(report)
    }
}

fn failed_report(target: &TargetPod, reason: String) -> PodReport {
    PodReport {
        pod: target.name.clone(),
        namespace: target.namespace.clone(),
        node: target.node_name.clone(),
        tracer_pod: None,
        final_state: TracerState::Failed,
        outcome: PodOutcome::Failed { reason },
        traces: Vec::new(),
        cleanup_warning: None,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
