//! Turning workload references into the pods to trace

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Api;
use kube::api::ListParams;
use thiserror::Error;

use kstrace_types::{TargetContainer, TargetPod};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{0:?} not supported by kstrace")]
    UnsupportedKind(String),

    #[error("missing resource name in {0:?}")]
    EmptyName(String),

    #[error("failed to get {kind} {name:?} in namespace {namespace:?}: {source}")]
    Lookup {
        kind: WorkloadKind,
        name: String,
        namespace: String,
        #[source]
        source: kube::Error,
    },

    #[error("{kind} {name:?} has no pod selector")]
    NoSelector { kind: WorkloadKind, name: String },

    #[error("pod {namespace}/{name} is not scheduled on a node yet")]
    Unscheduled { namespace: String, name: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    Pod,
    Service,
    Deployment,
    DaemonSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pod => "pod",
            Self::Service => "service",
            Self::Deployment => "deployment",
            Self::DaemonSet => "daemonset",
        })
    }
}

/// `name` (a pod) or `<kind>/<name>`, as accepted by kubectl
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub name: String,
}

impl FromStr for WorkloadRef {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = match s.split_once('/') {
            Some((kind, name)) => {
                let kind = match kind.to_ascii_lowercase().as_str() {
                    "po" | "pod" | "pods" => WorkloadKind::Pod,
                    "svc" | "service" | "services" => WorkloadKind::Service,
                    "deploy" | "deployment" | "deployments" => WorkloadKind::Deployment,
                    "ds" | "daemonset" | "daemonsets" => WorkloadKind::DaemonSet,
                    _ => return Err(ResolveError::UnsupportedKind(kind.to_string())),
                };
                (kind, name)
            }
            None => (WorkloadKind::Pod, s),
        };

        if name.is_empty() {
            return Err(ResolveError::EmptyName(s.to_string()));
        }

        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

/// Build a `k=v,k=v` label selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Convert an API pod into a trace target.
///
/// Containers keep spec order; runtime ids are matched from the status by
/// container name so names and ids can never drift apart.
pub fn target_from_pod(pod: &Pod, default_namespace: &str) -> Result<TargetPod, ResolveError> {
    let name = pod.metadata.name.clone().unwrap_or_default();
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| default_namespace.to_string());

    let node_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.clone())
        .ok_or_else(|| ResolveError::Unscheduled {
            namespace: namespace.clone(),
            name: name.clone(),
        })?;

    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());

    let containers = pod
        .spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .map(|c| {
            let container_id = statuses
                .and_then(|all| all.iter().find(|cs| cs.name == c.name))
                .and_then(|cs| cs.container_id.clone());
            TargetContainer::new(c.name.clone(), container_id)
        })
        .collect();

    Ok(TargetPod {
        name,
        namespace,
        node_name,
        containers,
    })
}

/// Expands workload references into target pods via label-selector fan-out
pub struct WorkloadResolver {
    client: kube::Client,
}

impl WorkloadResolver {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    /// Resolve every reference in `namespace`, keeping input order and
    /// dropping pods already selected by an earlier reference
    pub async fn resolve(
        &self,
        namespace: &str,
        refs: &[WorkloadRef],
    ) -> Result<Vec<TargetPod>, ResolveError> {
        let mut seen = HashSet::new();
        let mut targets = Vec::new();

        for workload in refs {
            let pods = self.pods_for(namespace, workload).await?;
            tracing::info!(
                kind = %workload.kind,
                name = %workload.name,
                pods = pods.len(),
                "Resolved workload"
            );

            for pod in &pods {
                let target = target_from_pod(pod, namespace)?;
                if seen.insert(target.key()) {
                    tracing::debug!(pod = %target.key(), node = %target.node_name, "Adding pod to trace list");
                    targets.push(target);
                }
            }
        }

        Ok(targets)
    }

    async fn pods_for(&self, namespace: &str, workload: &WorkloadRef) -> Result<Vec<Pod>, ResolveError> {
        let lookup = |source| ResolveError::Lookup {
            kind: workload.kind,
            name: workload.name.clone(),
            namespace: namespace.to_string(),
            source,
        };

        let selector = match workload.kind {
            WorkloadKind::Pod => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let pod = pods.get(&workload.name).await.map_err(lookup)?;
                return Ok(vec![pod]);
            }
            WorkloadKind::Service => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
                let service = services.get(&workload.name).await.map_err(lookup)?;
                service.spec.and_then(|s| s.selector)
            }
            WorkloadKind::Deployment => {
                let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let deployment = deployments.get(&workload.name).await.map_err(lookup)?;
                deployment
                    .spec
                    .and_then(|s| s.template.metadata)
                    .and_then(|m| m.labels)
            }
            WorkloadKind::DaemonSet => {
                let daemonsets: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                let daemonset = daemonsets.get(&workload.name).await.map_err(lookup)?;
                daemonset
                    .spec
                    .and_then(|s| s.template.metadata)
                    .and_then(|m| m.labels)
            }
        };

        let selector = selector
            .filter(|labels| !labels.is_empty())
            .ok_or_else(|| ResolveError::NoSelector {
                kind: workload.kind,
                name: workload.name.clone(),
            })?;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(&label_selector(&selector)))
            .await
            .map_err(lookup)?;

        Ok(list.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, ContainerStatus, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(node: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: node.map(str::to_string),
                containers: vec![
                    Container {
                        name: "app".to_string(),
                        ..Default::default()
                    },
                    Container {
                        name: "proxy".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            status: Some(PodStatus {
                // Status order differs from spec order on purpose
                container_statuses: Some(vec![
                    ContainerStatus {
                        name: "proxy".to_string(),
                        container_id: Some("cri-o://bbb".to_string()),
                        ..Default::default()
                    },
                    ContainerStatus {
                        name: "app".to_string(),
                        container_id: Some("cri-o://aaa".to_string()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_parse_workload_refs() {
        let cases = [
            ("web-0", WorkloadKind::Pod, "web-0"),
            ("pod/web-0", WorkloadKind::Pod, "web-0"),
            ("svc/frontend", WorkloadKind::Service, "frontend"),
            ("deploy/api", WorkloadKind::Deployment, "api"),
            ("Deployment/api", WorkloadKind::Deployment, "api"),
            ("ds/node-agent", WorkloadKind::DaemonSet, "node-agent"),
        ];
        for (input, kind, name) in cases {
            let parsed: WorkloadRef = input.parse().unwrap();
            assert_eq!(parsed.kind, kind, "{input}");
            assert_eq!(parsed.name, name, "{input}");
        }
    }

    #[test]
    fn test_unsupported_kind_is_rejected() {
        let err = "statefulset/db".parse::<WorkloadRef>().unwrap_err();
        assert!(matches!(err, ResolveError::UnsupportedKind(k) if k == "statefulset"));
        assert!(matches!(
            "svc/".parse::<WorkloadRef>(),
            Err(ResolveError::EmptyName(_))
        ));
    }

    #[test]
    fn test_label_selector() {
        let labels = BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "front".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "app=web,tier=front");
    }

    #[test]
    fn test_target_from_pod_aligns_ids_by_name() {
        let target = target_from_pod(&pod(Some("worker-1")), "default").unwrap();
        assert_eq!(target.namespace, "shop");
        assert_eq!(target.node_name, "worker-1");
        assert_eq!(target.containers.len(), 2);
        assert_eq!(target.containers[0].name, "app");
        assert_eq!(target.containers[0].container_id.as_deref(), Some("cri-o://aaa"));
        assert_eq!(target.containers[1].name, "proxy");
        assert_eq!(target.containers[1].container_id.as_deref(), Some("cri-o://bbb"));
    }

    #[test]
    fn test_unscheduled_pod_is_rejected() {
        let err = target_from_pod(&pod(None), "default").unwrap_err();
        assert!(matches!(err, ResolveError::Unscheduled { name, .. } if name == "web-0"));
    }
}
