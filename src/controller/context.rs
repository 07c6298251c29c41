//! Shared state for the Buildkit controllers

use std::sync::Arc;

use kube::Client;
use tokio_util::sync::CancellationToken;

use super::buildkit::{KubeClient, KubeClientImpl};
use super::template::{ArtifactClient, ArtifactClientImpl};
use crate::builder::TemplateLookup;
use crate::config::ControllerConfig;
use crate::Error;

/// Controller context passed to every reconcile call
///
/// The context is shared across all reconciliation calls and holds the API
/// clients as trait objects so tests can swap in mocks.
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .config(config)
///     .cancellation(token)
///     .build();
/// ```
pub struct Context {
    /// Pod and Buildkit status operations
    pub kube: Arc<dyn KubeClient>,
    /// Template reads
    pub templates: Arc<dyn TemplateLookup>,
    /// ConfigMap and BuildkitTemplate status operations
    pub artifacts: Arc<dyn ArtifactClient>,
    /// Controller settings
    pub config: ControllerConfig,
    /// Cancelled when the operator shuts down
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Fail with [`Error::Cancelled`] once shutdown was requested
    ///
    /// Called before every modifying API call so a stopping operator does not
    /// start new work.
    pub fn ensure_not_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        templates: Arc<dyn TemplateLookup>,
        artifacts: Arc<dyn ArtifactClient>,
    ) -> Self {
        Self {
            kube,
            templates,
            artifacts,
            config: ControllerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    templates: Option<Arc<dyn TemplateLookup>>,
    artifacts: Option<Arc<dyn ArtifactClient>>,
    config: ControllerConfig,
    cancel: CancellationToken,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            templates: None,
            artifacts: None,
            config: ControllerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the controller settings
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a cancellation token with the rest of the process
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the pod client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the template lookup (primarily for testing)
    pub fn template_lookup(mut self, templates: Arc<dyn TemplateLookup>) -> Self {
        self.templates = Some(templates);
        self
    }

    /// Override the artifact client (primarily for testing)
    pub fn artifact_client(mut self, artifacts: Arc<dyn ArtifactClient>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let field_manager = self.config.field_manager.clone();
        let default_client = Arc::new(KubeClientImpl::new(
            self.client.clone(),
            field_manager.clone(),
        ));

        Context {
            kube: self.kube.unwrap_or_else(|| default_client.clone()),
            templates: self.templates.unwrap_or(default_client),
            artifacts: self
                .artifacts
                .unwrap_or_else(|| Arc::new(ArtifactClientImpl::new(self.client, field_manager))),
            config: self.config,
            cancel: self.cancel,
        }
    }
}
