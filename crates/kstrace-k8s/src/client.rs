//! Kubernetes client for kstrace

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Namespace used when the selected context does not set one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Kubernetes client wrapper
pub struct KubeClient {
    kubeconfig: Kubeconfig,
    current_context: Option<String>,
}

impl KubeClient {
    /// Create a new KubeClient by loading the kubeconfig
    pub fn new() -> Result<Self> {
        let kubeconfig =
            Kubeconfig::read().context("Failed to read kubeconfig. Is kubectl configured?")?;

        let current_context = kubeconfig.current_context.clone();

        Ok(Self {
            kubeconfig,
            current_context,
        })
    }

    /// Resolve the context to use: the requested one, or the kubeconfig's current context
    pub fn resolve_context<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str> {
        match requested {
            Some(name) => {
                if !self.kubeconfig.contexts.iter().any(|c| c.name == name) {
                    anyhow::bail!("Context '{}' not found in kubeconfig", name);
                }
                Ok(name)
            }
            None => self
                .current_context
                .as_deref()
                .context("No context given and kubeconfig has no current-context"),
        }
    }

    /// Default namespace of a context, falling back to `default`
    pub fn namespace_for_context(&self, context_name: &str) -> String {
        self.kubeconfig
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .and_then(|c| c.context.as_ref())
            .and_then(|c| c.namespace.clone())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
    }

    /// Create a kube::Client for a specific context
    pub async fn client_for_context(&self, context_name: &str) -> Result<kube::Client> {
        let config = kube::Config::from_custom_kubeconfig(
            self.kubeconfig.clone(),
            &KubeConfigOptions {
                context: Some(context_name.to_string()),
                ..Default::default()
            },
        )
        .await
        .context(format!(
            "Failed to create config for context: {}",
            context_name
        ))?;

        let client = kube::Client::try_from(config).context(format!(
            "Failed to create client for context: {}",
            context_name
        ))?;

        tracing::debug!(context = context_name, "Kubernetes client created");
        Ok(client)
    }
}
