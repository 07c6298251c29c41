//! BuildkitTemplate controller implementation
//!
//! A template publishes the ConfigMaps its instances mount. Each reconcile
//! applies the artifacts the template currently derives, deletes those it no
//! longer derives, and records what exists in the template status.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::Context;
use crate::artifacts::{self, ArtifactKind};
use crate::crd::{
    BuildkitTemplate, BuildkitTemplateStatus, Condition, ConditionStatus, ResourceRef,
    CONDITION_READY,
};
use crate::validation::{default_template, validate_template};
use crate::Error;

/// Condition reason for a template or instance that failed validation
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";
/// Condition reason once every artifact is published
pub const REASON_AVAILABLE: &str = "Available";

/// Trait abstracting the API calls made for templates
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactClient: Send + Sync {
    /// Server-side apply a ConfigMap, taking ownership of every field it sets
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error>;

    /// Delete a ConfigMap; one that does not exist is not an error
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Patch the status of a BuildkitTemplate
    async fn patch_template_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BuildkitTemplateStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ArtifactClientImpl {
    client: Client,
    field_manager: String,
}

impl ArtifactClientImpl {
    /// Create a new ArtifactClientImpl wrapping the given kube Client
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl ArtifactClient for ArtifactClientImpl {
    async fn apply_config_map(&self, config_map: &ConfigMap) -> Result<(), Error> {
        let namespace = config_map.namespace().ok_or(Error::MissingNamespace)?;
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);

        api.patch(
            &config_map.name_any(),
            &PatchParams::apply(&self.field_manager).force(),
            &Patch::Apply(config_map),
        )
        .await?;
        Ok(())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_template_status(
        &self,
        namespace: &str,
        name: &str,
        status: &BuildkitTemplateStatus,
    ) -> Result<(), Error> {
        let api: Api<BuildkitTemplate> = Api::namespaced(self.client.clone(), namespace);

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

/// Reconcile a BuildkitTemplate resource
///
/// An invalid template is reported through its Ready condition and left alone
/// until its spec changes; nothing is published for it.
#[instrument(skip(template, ctx), fields(template = %template.name_any()))]
pub async fn reconcile(template: Arc<BuildkitTemplate>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = template.name_any();
    let namespace = template.namespace().ok_or(Error::MissingNamespace)?;
    let previous = template.status.clone().unwrap_or_default();

    let mut defaulted = (*template).clone();
    default_template(&mut defaulted.spec);

    let validation = validate_template(&defaulted);
    if let Err(e) = validation.into_result() {
        warn!(error = %e, "buildkit template is invalid");
        let status = BuildkitTemplateStatus {
            observed_generation: template.metadata.generation,
            ..previous
        }
        .condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            REASON_INVALID_SPEC,
            e.to_string(),
        ));
        ctx.ensure_not_cancelled()?;
        ctx.artifacts
            .patch_template_status(&namespace, &name, &status)
            .await?;
        return Ok(Action::await_change());
    }

    let mut refs = Vec::new();
    for kind in ArtifactKind::ALL {
        ctx.ensure_not_cancelled()?;
        match artifacts::derive(&defaulted, kind) {
            Some(artifact) => {
                let config_map = artifact.to_config_map(template.controller_owner_ref(&()));
                ctx.artifacts.apply_config_map(&config_map).await?;
                debug!(config_map = %artifact.name, "applied buildkit artifact");
                refs.push(ResourceRef::config_map(&namespace, artifact.name));
            }
            None => {
                let stale = artifacts::artifact_name(&name, kind);
                ctx.artifacts.delete_config_map(&namespace, &stale).await?;
            }
        }
    }

    let available = ready_condition(&previous).is_some_and(Condition::is_true);
    let status = BuildkitTemplateStatus {
        resource_refs: refs,
        observed_generation: template.metadata.generation,
        ..previous
    }
    .condition(Condition::new(
        CONDITION_READY,
        ConditionStatus::True,
        REASON_AVAILABLE,
        "",
    ));

    ctx.ensure_not_cancelled()?;
    ctx.artifacts
        .patch_template_status(&namespace, &name, &status)
        .await?;
    if !available {
        info!(artifacts = status.resource_refs.len(), "buildkit template published");
    }

    Ok(Action::await_change())
}

fn ready_condition(status: &BuildkitTemplateStatus) -> Option<&Condition> {
    status.conditions.iter().find(|c| c.type_ == CONDITION_READY)
}

/// Error policy for the BuildkitTemplate controller
pub fn error_policy(template: Arc<BuildkitTemplate>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        template = %template.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_backoff())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MockTemplateLookup;
    use crate::controller::buildkit::MockKubeClient;
    use crate::crd::BuildkitTemplateSpec;
    use std::sync::{Arc as StdArc, Mutex};

    fn sample_template(spec: BuildkitTemplateSpec) -> BuildkitTemplate {
        let mut template = BuildkitTemplate::new("default", spec);
        template.metadata.namespace = Some("ci".to_string());
        template.metadata.uid = Some("uid-5678".to_string());
        template.metadata.generation = Some(3);
        template
    }

    fn full_spec() -> BuildkitTemplateSpec {
        let mut spec = BuildkitTemplateSpec {
            buildkitd_toml: "[worker.oci]\n  max-parallelism = 4\n".to_string(),
            ..Default::default()
        };
        spec.lifecycle.pre_stop_script = true;
        spec
    }

    #[derive(Clone)]
    struct StatusCapture {
        updates: StdArc<Mutex<Vec<BuildkitTemplateStatus>>>,
    }

    impl StatusCapture {
        fn new() -> Self {
            Self {
                updates: StdArc::new(Mutex::new(Vec::new())),
            }
        }

        fn record(&self, status: BuildkitTemplateStatus) {
            self.updates.lock().unwrap().push(status);
        }

        fn last(&self) -> BuildkitTemplateStatus {
            self.updates.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[derive(Clone, Default)]
    struct CallLog {
        calls: StdArc<Mutex<Vec<String>>>,
    }

    impl CallLog {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn mock_artifacts() -> (MockArtifactClient, StatusCapture, CallLog) {
        let mut mock = MockArtifactClient::new();
        let capture = StatusCapture::new();
        let log = CallLog::default();

        let capture_clone = capture.clone();
        mock.expect_patch_template_status()
            .returning(move |_, _, status| {
                capture_clone.record(status.clone());
                Ok(())
            });
        let log_clone = log.clone();
        mock.expect_apply_config_map().returning(move |cm| {
            log_clone.record(format!("apply {}", cm.name_any()));
            Ok(())
        });
        let log_clone = log.clone();
        mock.expect_delete_config_map().returning(move |_, name| {
            log_clone.record(format!("delete {name}"));
            Ok(())
        });

        (mock, capture, log)
    }

    fn context(artifacts: MockArtifactClient) -> Arc<Context> {
        Arc::new(Context::for_testing(
            Arc::new(MockKubeClient::new()),
            Arc::new(MockTemplateLookup::new()),
            Arc::new(artifacts),
        ))
    }

    /// Story: A template with config and a pre-stop hook publishes both ConfigMaps
    #[tokio::test]
    async fn story_template_publishes_all_artifacts() {
        let (mock, capture, log) = mock_artifacts();

        let action = reconcile(Arc::new(sample_template(full_spec())), context(mock))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(
            log.calls(),
            vec![
                "apply buildkit-default-toml".to_string(),
                "apply buildkit-default-scripts".to_string(),
            ]
        );

        let status = capture.last();
        assert_eq!(
            status.resource_refs,
            vec![
                ResourceRef::config_map("ci", "buildkit-default-toml"),
                ResourceRef::config_map("ci", "buildkit-default-scripts"),
            ]
        );
        assert_eq!(status.observed_generation, Some(3));
        let ready = ready_condition(&status).unwrap();
        assert!(ready.is_true());
        assert_eq!(ready.reason, REASON_AVAILABLE);
    }

    /// Story: Turning off a feature removes the ConfigMap it used to publish
    #[tokio::test]
    async fn story_artifacts_no_longer_derived_are_deleted() {
        let (mock, capture, log) = mock_artifacts();

        reconcile(
            Arc::new(sample_template(BuildkitTemplateSpec::default())),
            context(mock),
        )
        .await
        .unwrap();

        assert_eq!(
            log.calls(),
            vec![
                "delete buildkit-default-toml".to_string(),
                "delete buildkit-default-scripts".to_string(),
            ]
        );
        assert!(capture.last().resource_refs.is_empty());
    }

    #[tokio::test]
    async fn test_applied_config_map_is_owned_by_template() {
        let mut mock = MockArtifactClient::new();
        mock.expect_apply_config_map().returning(|cm| {
            let owners = cm.metadata.owner_references.clone().unwrap();
            assert_eq!(owners[0].name, "default");
            assert_eq!(owners[0].kind, "BuildkitTemplate");
            assert_eq!(owners[0].controller, Some(true));
            Ok(())
        });
        mock.expect_delete_config_map().returning(|_, _| Ok(()));
        mock.expect_patch_template_status()
            .returning(|_, _, _| Ok(()));
        let mut spec = BuildkitTemplateSpec::default();
        spec.lifecycle.pre_stop_script = true;

        reconcile(Arc::new(sample_template(spec)), context(mock))
            .await
            .unwrap();
    }

    /// Story: An invalid template is marked not ready and nothing is published
    #[tokio::test]
    async fn story_invalid_template_reports_reason() {
        let (mock, capture, log) = mock_artifacts();
        let spec = BuildkitTemplateSpec {
            buildkitd_toml: "[worker.oci".to_string(),
            ..Default::default()
        };

        let action = reconcile(Arc::new(sample_template(spec)), context(mock))
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        assert!(log.calls().is_empty());
        let ready = ready_condition(&capture.last()).cloned().unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, REASON_INVALID_SPEC);
        assert!(ready.message.contains("spec.buildkitdToml"));
    }

    #[tokio::test]
    async fn test_zero_port_is_defaulted_before_validation() {
        let (mock, capture, _log) = mock_artifacts();
        let spec = BuildkitTemplateSpec {
            port: 0,
            ..Default::default()
        };

        reconcile(Arc::new(sample_template(spec)), context(mock))
            .await
            .unwrap();

        assert!(ready_condition(&capture.last()).unwrap().is_true());
    }

    #[tokio::test]
    async fn test_apply_failure_is_returned() {
        let mut mock = MockArtifactClient::new();
        mock.expect_apply_config_map()
            .returning(|_| Err(Error::internal("apply rejected")));

        let result = reconcile(Arc::new(sample_template(full_spec())), context(mock)).await;

        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[test]
    fn test_error_policy_requeues_after_backoff() {
        let action = error_policy(
            Arc::new(sample_template(full_spec())),
            &Error::MissingNamespace,
            context(MockArtifactClient::new()),
        );

        assert_eq!(action, Action::requeue(std::time::Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_cancelled_context_publishes_nothing() {
        let ctx = context(MockArtifactClient::new());
        ctx.cancel.cancel();

        let result = reconcile(Arc::new(sample_template(full_spec())), ctx).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
