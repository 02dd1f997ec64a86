//! The slice of the Kubernetes API that a trace session mutates

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::Api;
use kube::api::{DeleteParams, PostParams};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("invalid response from the API server: {0}")]
    Invalid(String),
}

/// Namespace and pod operations needed by the tracer lifecycle.
///
/// Implemented by [`KubeCluster`] against a real API server and by the
/// in-memory mock behind the `test-utils` feature.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError>;

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError>;

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

/// [`ClusterApi`] backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace, ClusterError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        Ok(namespaces.create(&PostParams::default(), namespace).await?)
    }

    async fn delete_namespace(&self, name: &str) -> Result<(), ClusterError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        // Left = still terminating, Right = gone; both mean the request was accepted
        namespaces.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.create(&PostParams::default(), pod).await?)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(pods.get(name).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        pods.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
