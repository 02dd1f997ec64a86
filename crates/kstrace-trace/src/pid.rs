//! Host PID lookup through the node's container runtime

use kstrace_k8s::{
    ExecError, ExecRequest, ExecStreams, RemoteCommandExecutor, SOCKET_MOUNT_PATH,
    TRACER_CONTAINER_NAME, TracerPod,
};
use kstrace_types::TargetContainer;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidError {
    #[error("container {container:?} has no runtime id yet; is it running?")]
    MissingContainerId { container: String },

    #[error("runtime probe for container {container:?} failed: {source}")]
    Probe {
        container: String,
        #[source]
        source: ExecError,
    },

    #[error("runtime probe for container {container:?} exited with code {code}: {stderr}")]
    ProbeExit {
        container: String,
        code: i32,
        stderr: String,
    },

    #[error("runtime probe for container {container:?} returned malformed JSON: {source}")]
    MalformedOutput {
        container: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("runtime probe for container {container:?} reported no info.pid")]
    MissingPid { container: String },

    #[error("no container pids found for pod {0:?}")]
    NoContainers(String),
}

/// Drop the `<runtime>://` scheme from a status container id
pub fn strip_runtime_prefix(container_id: &str) -> &str {
    container_id
        .split_once("://")
        .map_or(container_id, |(_, id)| id)
}

/// `crictl inspect` against the socket mounted into the companion pod
pub fn inspect_command(runtime_id: &str) -> String {
    format!("crictl --runtime-endpoint unix://{SOCKET_MOUNT_PATH} inspect {runtime_id}")
}

/// Pull `info.pid` out of `crictl inspect` output
pub fn parse_inspect_pid(container: &str, output: &[u8]) -> Result<u32, PidError> {
    let json: serde_json::Value =
        serde_json::from_slice(output).map_err(|source| PidError::MalformedOutput {
            container: container.to_string(),
            source,
        })?;

    json.pointer("/info/pid")
        .and_then(serde_json::Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
        .filter(|pid| *pid > 0)
        .ok_or_else(|| PidError::MissingPid {
            container: container.to_string(),
        })
}

/// Resolves the host PID of each target container from inside its companion pod
pub struct ContainerPidResolver {
    executor: RemoteCommandExecutor,
}

impl ContainerPidResolver {
    pub fn new(executor: RemoteCommandExecutor) -> Self {
        Self { executor }
    }

    /// One PID per container, index-aligned with `containers`.
    ///
    /// Stops at the first container that cannot be resolved; later containers
    /// are never probed.
    pub async fn resolve(
        &self,
        tracer: &TracerPod,
        pod_name: &str,
        containers: &[TargetContainer],
    ) -> Result<Vec<u32>, PidError> {
        let mut pids = Vec::with_capacity(containers.len());

        for container in containers {
            let runtime_id = container
                .container_id
                .as_deref()
                .map(strip_runtime_prefix)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| PidError::MissingContainerId {
                    container: container.name.clone(),
                })?;

            let command = inspect_command(runtime_id);
            tracing::info!(pod = %tracer.name, command = %command, "Running command inside tracer pod");

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let code = self
                .executor
                .execute_streaming(
                    &ExecRequest {
                        namespace: &tracer.namespace,
                        pod: &tracer.name,
                        container: Some(TRACER_CONTAINER_NAME),
                        command: &command,
                        tty: false,
                    },
                    ExecStreams {
                        stdout: Some(&mut stdout),
                        stderr: Some(&mut stderr),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|source| PidError::Probe {
                    container: container.name.clone(),
                    source,
                })?;

            if code != 0 {
                return Err(PidError::ProbeExit {
                    container: container.name.clone(),
                    code,
                    stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
                });
            }

            let pid = parse_inspect_pid(&container.name, &stdout)?;
            tracing::info!(container = %container.name, runtime_id = %runtime_id, pid, "Container PID found");
            pids.push(pid);
        }

        if pids.is_empty() {
            tracing::error!(pod = %pod_name, "No container PIDs found");
            return Err(PidError::NoContainers(pod_name.to_string()));
        }

        Ok(pids)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use kstrace_k8s::mock::{ExecScript, MockExecTransport};

    fn tracer() -> TracerPod {
        TracerPod {
            name: "kstrace-00002".to_string(),
            namespace: "kstrace-00001".to_string(),
            node_name: "worker-1".to_string(),
        }
    }

    fn inspect(pid: u32) -> ExecScript {
        ExecScript::exit(0).stdout(&format!(r#"{{"status":{{}},"info":{{"pid":{pid}}}}}"#))
    }

    fn resolver(transport: &Arc<MockExecTransport>) -> ContainerPidResolver {
        ContainerPidResolver::new(RemoteCommandExecutor::new(transport.clone()))
    }

    #[test]
    fn test_strip_runtime_prefix() {
        assert_eq!(strip_runtime_prefix("cri-o://abc123"), "abc123");
        assert_eq!(strip_runtime_prefix("containerd://abc123"), "abc123");
        assert_eq!(strip_runtime_prefix("docker://abc123"), "abc123");
        assert_eq!(strip_runtime_prefix("abc123"), "abc123");
    }

    #[test]
    fn test_parse_inspect_pid() {
        assert_eq!(parse_inspect_pid("app", br#"{"info":{"pid":4821}}"#).unwrap(), 4821);
        assert!(matches!(
            parse_inspect_pid("app", b"not json"),
            Err(PidError::MalformedOutput { .. })
        ));
        assert!(matches!(
            parse_inspect_pid("app", br#"{"info":{}}"#),
            Err(PidError::MissingPid { .. })
        ));
        assert!(matches!(
            parse_inspect_pid("app", br#"{"info":{"pid":"12"}}"#),
            Err(PidError::MissingPid { .. })
        ));
    }

    #[tokio::test]
    async fn test_pids_are_index_aligned() {
        let transport = Arc::new(MockExecTransport::new());
        transport.on("inspect aaa", inspect(101));
        transport.on("inspect bbb", inspect(202));

        let containers = vec![
            TargetContainer::new("app", Some("cri-o://aaa".to_string())),
            TargetContainer::new("proxy", Some("containerd://bbb".to_string())),
        ];
        let pids = resolver(&transport)
            .resolve(&tracer(), "web-0", &containers)
            .await
            .unwrap();

        assert_eq!(pids, vec![101, 202]);
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].pod, "kstrace-00002");
        assert_eq!(calls[0].container.as_deref(), Some(TRACER_CONTAINER_NAME));
        assert_eq!(
            calls[0].command(),
            "crictl --runtime-endpoint unix:///run/crio/crio.sock inspect aaa"
        );
    }

    #[tokio::test]
    async fn test_probe_failure_stops_before_next_container() {
        let transport = Arc::new(MockExecTransport::new());
        transport.on("inspect aaa", ExecScript::exit(1).stderr("container not found\n"));
        transport.on("inspect bbb", inspect(202));

        let containers = vec![
            TargetContainer::new("app", Some("cri-o://aaa".to_string())),
            TargetContainer::new("proxy", Some("cri-o://bbb".to_string())),
        ];
        let err = resolver(&transport)
            .resolve(&tracer(), "web-0", &containers)
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            PidError::ProbeExit { container, code: 1, stderr } if container == "app" && stderr == "container not found"
        ));
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_midway_discards_earlier_pids() {
        let transport = Arc::new(MockExecTransport::new());
        transport.on("inspect c0", inspect(100));
        transport.on("inspect c1", ExecScript::exit(1).stderr("no such container\n"));
        transport.on("inspect c2", inspect(300));

        let containers: Vec<_> = (0..3)
            .map(|i| TargetContainer::new(format!("c{i}"), Some(format!("cri-o://c{i}"))))
            .collect();
        let err = resolver(&transport)
            .resolve(&tracer(), "web-0", &containers)
            .await
            .unwrap_err();

        assert!(matches!(&err, PidError::ProbeExit { container, .. } if container == "c1"));
        let commands = transport.commands();
        assert_eq!(commands.len(), 2);
        assert!(!commands.iter().any(|c| c.contains("inspect c2")));
    }

    #[tokio::test]
    async fn test_transport_error_fails_resolution() {
        let transport = Arc::new(MockExecTransport::new());
        transport.on("inspect", ExecScript::connect_error("upgrade failed"));

        let containers = vec![TargetContainer::new("app", Some("cri-o://aaa".to_string()))];
        let err = resolver(&transport)
            .resolve(&tracer(), "web-0", &containers)
            .await
            .unwrap_err();
        assert!(matches!(err, PidError::Probe { .. }));
    }

    #[tokio::test]
    async fn test_unstarted_container_fails_without_probing() {
        let transport = Arc::new(MockExecTransport::new());
        let containers = vec![TargetContainer::new("app", None)];

        let err = resolver(&transport)
            .resolve(&tracer(), "web-0", &containers)
            .await
            .unwrap_err();
        assert!(matches!(err, PidError::MissingContainerId { container } if container == "app"));
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_containers_is_an_error() {
        let transport = Arc::new(MockExecTransport::new());
        let err = resolver(&transport)
            .resolve(&tracer(), "web-0", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PidError::NoContainers(pod) if pod == "web-0"));
    }
}
