//! Buildkit controller implementation
//!
//! Each Buildkit instance converges on exactly one running buildkitd pod:
//! 1. discover the pods recorded in `status.resourceRefs`, dropping refs whose
//!    pod is gone
//! 2. create a pod when there is none, delete extras when there are several
//! 3. once a single pod exists, report its health and publish its endpoint
//!
//! Steps 1 and 2 are decided by [`plan_pods`] and step 3 by [`evaluate_pod`];
//! [`reconcile`] only performs the API calls those decisions ask for.
//!
//! Before creating a pod the instance is checked against its template. A
//! rejected instance is marked `InvalidSpec` and left alone until it changes.
//!
//! The published endpoint survives a cycle that only prunes extra pods, since
//! the surviving pod is the one it points at. Creating a pod or evaluating one
//! clears it until a ready pod sets it again.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::template::REASON_INVALID_SPEC;
use super::Context;
use crate::builder::{PodBuilder, TemplateLookup};
use crate::crd::{
    Buildkit, BuildkitStatus, BuildkitTemplate, Condition, ConditionStatus, ResourceKind,
    ResourceRef, CONDITION_DEPLOYED, CONDITION_READY,
};
use crate::validation;
use crate::Error;

/// Condition reason while pods are being created or deleted
pub const REASON_APPLYING_CHANGES: &str = "ApplyingChanges";
/// Condition reason for a pod in the Failed phase
pub const REASON_POD_FAILED: &str = "PodFailed";
/// Condition reason for a pod that is not running yet
pub const REASON_POD_NOT_RUNNING: &str = "PodNotRunning";
/// Condition reason for a running pod with an unready container
pub const REASON_CONTAINER_NOT_READY: &str = "ContainerNotReady";
/// Condition reason once the endpoint is published
pub const REASON_AVAILABLE: &str = "Available";

/// Trait abstracting Kubernetes client operations for Buildkit instances
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a pod, returning `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error>;

    /// Create a pod and return it as stored, including its generated name
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod; a pod that is already gone is not an error
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Patch the status of a Buildkit
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BuildkitStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
    field_manager: String,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        Ok(api.create(&params, pod).await?)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %name, "pod already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BuildkitStatus,
    ) -> Result<(), Error> {
        let api: Api<Buildkit> = Api::namespaced(self.client.clone(), namespace);

        let status_patch = serde_json::json!({
            "status": status
        });

        api.patch_status(
            name,
            &PatchParams::apply(&self.field_manager),
            &Patch::Merge(&status_patch),
        )
        .await?;

        Ok(())
    }
}

#[async_trait]
impl TemplateLookup for KubeClientImpl {
    async fn get_template(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BuildkitTemplate>, Error> {
        let api: Api<BuildkitTemplate> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

// =============================================================================
// Decisions
// =============================================================================

/// What to do about the discovered pods
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodPlan {
    /// No pod exists; build and create one
    Create,
    /// Exactly one pod exists
    Use(String),
    /// Several pods exist; keep the first discovered and delete the rest
    Prune {
        /// Pod that survives
        keep: String,
        /// Pods to delete
        delete: Vec<String>,
    },
}

/// Decide how to reach exactly one pod from the pods discovered, in discovery order
pub fn plan_pods(discovered: &[String]) -> PodPlan {
    match discovered {
        [] => PodPlan::Create,
        [only] => PodPlan::Use(only.clone()),
        [first, rest @ ..] => PodPlan::Prune {
            keep: first.clone(),
            delete: rest.to_vec(),
        },
    }
}

/// The parts of a pod's state that decide instance health
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObservedPod {
    /// Pod name
    pub name: String,
    /// Pod phase (Pending, Running, Succeeded, Failed, Unknown)
    pub phase: String,
    /// Machine-readable reason for the phase
    pub reason: String,
    /// Human-readable message for the phase
    pub message: String,
    /// Pod IP, once assigned
    pub pod_ip: Option<String>,
    /// Readiness of each container, by name
    pub containers_ready: Vec<(String, bool)>,
    /// First port of the first container
    pub port: Option<i32>,
}

impl From<&Pod> for ObservedPod {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let port = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .and_then(|c| c.ports.as_ref())
            .and_then(|p| p.first())
            .map(|p| p.container_port);

        Self {
            name: pod.name_any(),
            phase: status.and_then(|s| s.phase.clone()).unwrap_or_default(),
            reason: status.and_then(|s| s.reason.clone()).unwrap_or_default(),
            message: status.and_then(|s| s.message.clone()).unwrap_or_default(),
            pod_ip: status
                .and_then(|s| s.pod_ip.clone())
                .filter(|ip| !ip.is_empty()),
            containers_ready: status
                .and_then(|s| s.container_statuses.as_ref())
                .map(|statuses| statuses.iter().map(|c| (c.name.clone(), c.ready)).collect())
                .unwrap_or_default(),
            port,
        }
    }
}

/// Result of one reconcile cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Pods were created or deleted; look again immediately
    Applying,
    /// The pod is progressing; look again after `after`
    Requeue {
        /// Condition reason
        reason: &'static str,
        /// Condition message
        message: String,
        /// Delay before the next look
        after: Duration,
    },
    /// The pod failed, or the instance was rejected; neither recovers on its own
    Failed {
        /// Condition reason
        reason: &'static str,
        /// Condition message
        message: String,
    },
    /// The pod is ready to serve builds at `endpoint`
    Done {
        /// Published endpoint
        endpoint: String,
    },
}

impl Outcome {
    /// The controller action for this outcome
    pub fn action(&self) -> Action {
        match self {
            Self::Applying => Action::requeue(Duration::ZERO),
            Self::Requeue { after, .. } => Action::requeue(*after),
            Self::Failed { .. } | Self::Done { .. } => Action::await_change(),
        }
    }

    /// Condition status, reason and message for this outcome
    fn condition_parts(&self) -> (ConditionStatus, &'static str, String) {
        match self {
            Self::Applying => (
                ConditionStatus::False,
                REASON_APPLYING_CHANGES,
                "Applying pod changes".to_string(),
            ),
            Self::Requeue {
                reason, message, ..
            } => (ConditionStatus::False, *reason, message.clone()),
            Self::Failed { reason, message } => (ConditionStatus::False, *reason, message.clone()),
            Self::Done { .. } => (ConditionStatus::True, REASON_AVAILABLE, String::new()),
        }
    }
}

/// Judge the health of the single pod backing an instance
///
/// `backoff` is the delay before looking again at a pod that is still coming up.
pub fn evaluate_pod(pod: &ObservedPod, backoff: Duration) -> Outcome {
    if pod.phase == "Failed" {
        let cause = [pod.message.as_str(), pod.reason.as_str()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("unknown failure");
        return Outcome::Failed {
            reason: REASON_POD_FAILED,
            message: format!("Buildkit pod {} has failed: {cause}", pod.name),
        };
    }

    if pod.phase != "Running" {
        return Outcome::Requeue {
            reason: REASON_POD_NOT_RUNNING,
            message: "Buildkit pod not running".to_string(),
            after: backoff,
        };
    }

    if let Some((container, _)) = pod.containers_ready.iter().find(|(_, ready)| !ready) {
        return Outcome::Requeue {
            reason: REASON_CONTAINER_NOT_READY,
            message: format!("Buildkit pod container {container} not ready"),
            after: backoff,
        };
    }

    let Some(ip) = pod.pod_ip.as_deref() else {
        return Outcome::Requeue {
            reason: REASON_POD_NOT_RUNNING,
            message: "Buildkit pod has no IP yet".to_string(),
            after: backoff,
        };
    };

    let Some(port) = pod.port else {
        return Outcome::Failed {
            reason: REASON_POD_FAILED,
            message: format!("Buildkit pod {} exposes no container port", pod.name),
        };
    };

    Outcome::Done {
        endpoint: format_endpoint(ip, port),
    }
}

/// `tcp://<host>:<port>`, bracketing IPv6 hosts
pub fn format_endpoint(host: &str, port: i32) -> String {
    match (host.parse::<IpAddr>(), u16::try_from(port)) {
        (Ok(ip), Ok(port)) => format!("tcp://{}", SocketAddr::new(ip, port)),
        _ => format!("tcp://{host}:{port}"),
    }
}

/// Status after a cycle ending in `outcome`
///
/// The endpoint is only kept while pods are being applied; every health
/// evaluation starts from a cleared endpoint and sets it only when ready.
fn next_status(
    previous: &BuildkitStatus,
    refs: Vec<ResourceRef>,
    outcome: &Outcome,
    keep_endpoint: bool,
) -> BuildkitStatus {
    let (status, reason, message) = outcome.condition_parts();
    let endpoint = match outcome {
        Outcome::Done { endpoint } => endpoint.clone(),
        Outcome::Applying if keep_endpoint => previous.endpoint.clone(),
        _ => String::new(),
    };

    previous
        .clone()
        .resource_refs(refs)
        .endpoint(endpoint)
        .condition(Condition::new(
            CONDITION_DEPLOYED,
            status.clone(),
            reason,
            message.clone(),
        ))
        .condition(Condition::new(CONDITION_READY, status, reason, message))
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a Buildkit resource
///
/// Converges the instance on exactly one pod and reports that pod's health.
/// A missing template is returned as an error without touching the status so
/// the instance is retried once the template appears. An invalid template is
/// returned as [`Error::Validation`] and retried after the error backoff.
#[instrument(skip(buildkit, ctx), fields(buildkit = %buildkit.name_any()))]
pub async fn reconcile(buildkit: Arc<Buildkit>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = buildkit.name_any();
    let namespace = buildkit.namespace().ok_or(Error::MissingNamespace)?;
    let previous = buildkit.status.clone().unwrap_or_default();
    debug!("reconciling buildkit");

    let mut refs: Vec<ResourceRef> = previous
        .resource_refs
        .iter()
        .filter(|r| r.kind != ResourceKind::Pod)
        .cloned()
        .collect();

    let pods = discover_pods(&previous, ctx.kube.as_ref()).await?;
    let names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();

    let (outcome, keep_endpoint) = match plan_pods(&names) {
        PodPlan::Create => {
            let report = validation::validate_instance(&buildkit, ctx.templates.as_ref()).await?;
            for warning in &report.warnings {
                warn!(%warning, "buildkit spec accepted with a warning");
            }

            if report.is_valid() {
                let pod = PodBuilder::new(&buildkit, ctx.templates.as_ref())
                    .build_pod()
                    .await
                    .inspect_err(|e| error!(error = %e, "failed to build buildkit pod"))?;
                let pod = pod.to_k8s(buildkit.controller_owner_ref(&()))?;

                ctx.ensure_not_cancelled()?;
                let created = ctx.kube.create_pod(&namespace, &pod).await?;
                info!(pod = %created.name_any(), "starting buildkit instance");
                refs.push(ResourceRef::pod(&namespace, created.name_any()));
                (Outcome::Applying, false)
            } else {
                let message = report.summary();
                warn!(%message, "buildkit spec rejected");
                let outcome = Outcome::Failed {
                    reason: REASON_INVALID_SPEC,
                    message,
                };
                (outcome, false)
            }
        }
        PodPlan::Prune { keep, delete } => {
            warn!(count = names.len(), "multiple buildkit pods found, deleting extras");
            for pod in &delete {
                ctx.ensure_not_cancelled()?;
                ctx.kube.delete_pod(&namespace, pod).await?;
                info!(pod = %pod, "deleted extra buildkit pod");
            }
            refs.push(ResourceRef::pod(&namespace, keep));
            (Outcome::Applying, true)
        }
        PodPlan::Use(pod_name) => {
            refs.push(ResourceRef::pod(&namespace, &pod_name));
            let observed = pods
                .iter()
                .find(|p| p.name_any() == pod_name)
                .map(ObservedPod::from)
                .ok_or_else(|| Error::internal("planned pod missing from discovery"))?;

            let outcome = evaluate_pod(&observed, ctx.config.not_ready_backoff());
            log_outcome(&observed, &outcome);
            (outcome, false)
        }
    };

    let status = next_status(&previous, refs, &outcome, keep_endpoint);
    ctx.ensure_not_cancelled()?;
    ctx.kube.patch_status(&namespace, &name, &status).await?;

    Ok(outcome.action())
}

/// Fetch the pods referenced by the status, in reference order
///
/// A reference to a pod that no longer exists is skipped; it disappears from the
/// status on the next write.
async fn discover_pods(status: &BuildkitStatus, kube: &dyn KubeClient) -> Result<Vec<Pod>, Error> {
    let mut pods = Vec::with_capacity(1);
    for reference in status.refs_of(ResourceKind::Pod) {
        match kube.get_pod(&reference.namespace, &reference.name).await? {
            Some(pod) => pods.push(pod),
            None => warn!(
                resource = %reference,
                "managed resource not found, an external actor may have deleted it"
            ),
        }
    }
    Ok(pods)
}

fn log_outcome(pod: &ObservedPod, outcome: &Outcome) {
    match outcome {
        Outcome::Failed { message, .. } => {
            warn!(pod = %pod.name, reason = %pod.reason, %message, "buildkit pod has failed")
        }
        Outcome::Requeue { reason, .. } => {
            debug!(pod = %pod.name, phase = %pod.phase, %reason, "buildkit pod not ready yet")
        }
        Outcome::Done { endpoint } => {
            info!(pod = %pod.name, %endpoint, "buildkit instance available")
        }
        Outcome::Applying => {}
    }
}

/// Error policy for the Buildkit controller
///
/// Logs the error and requeues after the configured error backoff.
pub fn error_policy(buildkit: Arc<Buildkit>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        buildkit = %buildkit.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_backoff())
}
