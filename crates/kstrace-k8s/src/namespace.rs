//! Scratch namespace that hosts the companion pods of one session

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::cluster::{ClusterApi, ClusterError};
use crate::error::CleanupError;

/// Label marking every resource kstrace creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kstrace";

pub struct NamespaceManager {
    api: Arc<dyn ClusterApi>,
}

impl NamespaceManager {
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Namespace object with generated-name semantics (`<prefix>-xxxxx`).
    ///
    /// Labeled `<prefix>-generated-namespace` so leftovers can be garbage
    /// collected with a single label selector.
    pub fn scratch_namespace(prefix: &str) -> Namespace {
        let labels = BTreeMap::from([
            (format!("{prefix}-generated-namespace"), String::new()),
            (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        ]);

        Namespace {
            metadata: ObjectMeta {
                generate_name: Some(format!("{prefix}-")),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create the scratch namespace and return its server-assigned name
    pub async fn create_scratch_namespace(&self, prefix: &str) -> Result<String, ClusterError> {
        let created = self
            .api
            .create_namespace(&Self::scratch_namespace(prefix))
            .await?;

        let name = created
            .metadata
            .name
            .ok_or_else(|| ClusterError::Invalid("namespace created without a name".into()))?;

        tracing::info!(namespace = %name, "Namespace created");
        Ok(name)
    }

    /// Best-effort delete; a failure is returned as a leak, never raised as fatal
    pub async fn delete_scratch_namespace(&self, name: &str) -> Result<(), CleanupError> {
        match self.api.delete_namespace(name).await {
            Ok(()) => {
                tracing::info!(namespace = %name, "Namespace deleted");
                Ok(())
            }
            Err(source) => {
                let err = CleanupError::Namespace {
                    name: name.to_string(),
                    source,
                };
                tracing::warn!(namespace = %name, "{err}");
                Err(err)
            }
        }
    }
}
