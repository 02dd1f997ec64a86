//! Privileged companion ("tracer") pods

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, HostPathVolumeSource, Pod, PodSpec, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::cluster::{ClusterApi, ClusterError};
use crate::error::CleanupError;
use crate::namespace::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Where the node's runtime socket appears inside the companion container
pub const SOCKET_MOUNT_PATH: &str = "/run/crio/crio.sock";

/// Name of the single container in every companion pod
pub const TRACER_CONTAINER_NAME: &str = "kstrace";

/// Capabilities required to attach to processes of other containers
pub const TRACER_CAPABILITIES: [&str; 2] = ["SYS_ADMIN", "SYS_PTRACE"];

const SOCKET_VOLUME_NAME: &str = "runtime-socket";
const APP_LABEL: &str = "app";

/// Inputs for a companion pod spec
#[derive(Clone, Debug)]
pub struct TracerPodOptions<'a> {
    /// Must equal the target pod's node: a host PID is only meaningful there
    pub node_name: &'a str,
    pub image: &'a str,
    /// Host path of the CRI socket
    pub socket_path: &'a str,
}

/// A companion pod accepted by the API server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TracerPod {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
}

pub struct TracerPodFactory {
    api: Arc<dyn ClusterApi>,
}

impl TracerPodFactory {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Build the companion pod.
    ///
    /// The pod shares the host PID namespace so a PID reported by the runtime
    /// socket is directly addressable by the trace command run in the same pod.
    /// Its only process sleeps; all work happens through exec.
    pub fn build_spec(namespace: &str, options: &TracerPodOptions<'_>) -> Pod {
        let container = Container {
            name: TRACER_CONTAINER_NAME.to_string(),
            image: Some(options.image.to_string()),
            command: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "sleep 10000000".to_string(),
            ]),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                capabilities: Some(Capabilities {
                    add: Some(TRACER_CAPABILITIES.iter().map(|c| c.to_string()).collect()),
                    drop: None,
                }),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: SOCKET_VOLUME_NAME.to_string(),
                mount_path: SOCKET_MOUNT_PATH.to_string(),
                read_only: Some(false),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let socket_volume = Volume {
            name: SOCKET_VOLUME_NAME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: options.socket_path.to_string(),
                type_: Some("Socket".to_string()),
            }),
            ..Default::default()
        };

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("{TRACER_CONTAINER_NAME}-")),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([
                    (APP_LABEL.to_string(), TRACER_CONTAINER_NAME.to_string()),
                    (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(options.node_name.to_string()),
                restart_policy: Some("Never".to_string()),
                host_pid: Some(true),
                containers: vec![container],
                volumes: Some(vec![socket_volume]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Submit a companion pod; does not wait for it to run
    pub async fn create(
        &self,
        namespace: &str,
        options: &TracerPodOptions<'_>,
    ) -> Result<TracerPod, ClusterError> {
        let created = self
            .api
            .create_pod(namespace, &Self::build_spec(namespace, options))
            .await?;

        let name = created
            .metadata
            .name
            .ok_or_else(|| ClusterError::Invalid("tracer pod created without a name".into()))?;

        tracing::info!(
            pod = %name,
            namespace = %namespace,
            node = %options.node_name,
            "Creating privileged tracer pod"
        );

        Ok(TracerPod {
            name,
            namespace: namespace.to_string(),
            node_name: options.node_name.to_string(),
        })
    }

    /// Delete a companion pod; failure is reported as a leak
    pub async fn delete(&self, pod: &TracerPod) -> Result<(), CleanupError> {
        match self.api.delete_pod(&pod.namespace, &pod.name).await {
            Ok(()) => {
                tracing::info!(pod = %pod.name, namespace = %pod.namespace, "Tracer pod deleted");
                Ok(())
            }
            Err(source) => {
                let err = CleanupError::Pod {
                    namespace: pod.namespace.clone(),
                    name: pod.name.clone(),
                    source,
                };
                tracing::warn!(pod = %pod.name, namespace = %pod.namespace, "{err}");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCluster;

    fn options() -> TracerPodOptions<'static> {
        TracerPodOptions {
            node_name: "worker-2",
            image: "registry.local/crictl:1",
            socket_path: "/var/run/containerd/containerd.sock",
        }
    }

    #[test]
    fn test_spec_is_privileged_and_pinned() {
        let pod = TracerPodFactory::build_spec("kstrace-abcde", &options());
        let spec = pod.spec.unwrap();

        assert_eq!(spec.node_name.as_deref(), Some("worker-2"));
        assert_eq!(spec.host_pid, Some(true));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 1);

        let container = &spec.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.local/crictl:1"));
        let caps = container
            .security_context
            .as_ref()
            .and_then(|sc| sc.capabilities.as_ref())
            .and_then(|c| c.add.clone())
            .unwrap();
        assert_eq!(caps, vec!["SYS_ADMIN".to_string(), "SYS_PTRACE".to_string()]);
    }

    #[test]
    fn test_spec_mounts_socket_read_write() {
        let pod = TracerPodFactory::build_spec("kstrace-abcde", &options());
        let spec = pod.spec.unwrap();

        let volumes = spec.volumes.unwrap();
        let host_path = volumes[0].host_path.as_ref().unwrap();
        assert_eq!(host_path.path, "/var/run/containerd/containerd.sock");
        assert_eq!(host_path.type_.as_deref(), Some("Socket"));

        let mounts = spec.containers[0].volume_mounts.clone().unwrap();
        assert_eq!(mounts[0].name, volumes[0].name);
        assert_eq!(mounts[0].mount_path, SOCKET_MOUNT_PATH);
        assert_eq!(mounts[0].read_only, Some(false));
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let cluster = Arc::new(MockCluster::new());
        let factory = TracerPodFactory::new(cluster.clone());

        let pod = factory.create("kstrace-abcde", &options()).await.unwrap();
        assert!(pod.name.starts_with("kstrace-"));
        assert_eq!(pod.node_name, "worker-2");
        assert_eq!(cluster.pod_nodes(), vec![(pod.name.clone(), "worker-2".to_string())]);

        factory.delete(&pod).await.unwrap();
        assert_eq!(cluster.pod_deletes(), vec![pod.name]);
    }

    #[tokio::test]
    async fn test_delete_failure_names_the_pod() {
        let cluster = Arc::new(MockCluster::new());
        cluster.fail_pod_deletes();
        let factory = TracerPodFactory::new(cluster.clone());

        let pod = factory.create("kstrace-abcde", &options()).await.unwrap();
        let err = factory.delete(&pod).await.unwrap_err();

        assert!(err.to_string().contains(&pod.name));
        assert!(err.to_string().contains("kstrace-abcde"));
    }
}
