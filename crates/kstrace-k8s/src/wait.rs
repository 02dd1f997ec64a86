//! Polling a companion pod until it runs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::cluster::ClusterApi;

/// Source of delays for polling loops.
///
/// Production code sleeps on the tokio timer; tests substitute a clock that
/// returns immediately and records the requested delays.
#[async_trait]
pub trait Clock: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error(
        "tracer pod did not start correctly within {waited:?}. review event objects from namespace {namespace:?} relating to pod {pod:?} for more information"
    )]
    Timeout {
        namespace: String,
        pod: String,
        waited: Duration,
    },

    #[error("tracer pod {pod:?} in namespace {namespace:?} reached phase {phase} without running")]
    Terminated {
        namespace: String,
        pod: String,
        phase: String,
    },
}

pub struct PodReadinessWaiter {
    api: Arc<dyn ClusterApi>,
    clock: Arc<dyn Clock>,
    interval: Duration,
}

impl PodReadinessWaiter {
    pub fn new(api: Arc<dyn ClusterApi>, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self {
            api,
            clock,
            interval,
        }
    }

    /// Poll the pod phase until it is `Running` or `timeout` has been slept away.
    ///
    /// Elapsed time is the sum of requested sleeps, so the number of polls is
    /// fixed for a given timeout and interval.
    pub async fn wait_running(
        &self,
        namespace: &str,
        pod: &str,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        let mut remaining = timeout;

        loop {
            tracing::debug!(pod = %pod, namespace = %namespace, "Waiting for tracer pod to become ready");

            match self.api.get_pod(namespace, pod).await {
                Ok(current) => {
                    let phase = current.status.and_then(|s| s.phase);
                    match phase.as_deref() {
                        Some("Running") => return Ok(()),
                        // RestartPolicy=Never: these phases are final
                        Some(p @ ("Failed" | "Succeeded")) => {
                            return Err(WaitError::Terminated {
                                namespace: namespace.to_string(),
                                pod: pod.to_string(),
                                phase: p.to_string(),
                            });
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    tracing::debug!(pod = %pod, error = %e, "Tracer pod status unavailable");
                }
            }

            if remaining.is_zero() {
                return Err(WaitError::Timeout {
                    namespace: namespace.to_string(),
                    pod: pod.to_string(),
                    waited: timeout,
                });
            }

            let step = self.interval.min(remaining);
            self.clock.sleep(step).await;
            remaining -= step;
        }
    }
}
